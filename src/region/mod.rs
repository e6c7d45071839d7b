//! Scoped bump allocation with reverse order destruction
//!
//! design: a `Region` starts out with a 4 KiB segment embedded in the region
//! itself and grows by asking a [`SegmentProvider`] for more. individual
//! allocations are never freed. objects placed with [`Region::create`] are
//! threaded onto a destruction chain and dropped last-in first-out when the
//! region is dropped, after which every provided segment goes back to the
//! provider

use core::cell::{Cell, RefCell, UnsafeCell};
use core::mem::MaybeUninit;
use core::panic::Location;
use core::ptr::NonNull;

use rust_alloc::boxed::Box;
use tracing::trace;

mod destructable;
mod observer;
mod profiler;
mod segment;

#[cfg(feature = "region_allocator")]
mod allocator;

#[cfg(test)]
mod tests;

use destructable::{DestructableHeader, DestructableLink, Instance};
use segment::round_to_granule;

pub use observer::{
    AllocationLog, AllocationSite, RegionKind, RegionLog, RegionObserver, RegionToken,
    SiteCollection,
};
pub use profiler::RegionProfiler;
pub use segment::{
    MemorySegment, RawAllocator, SEGMENT_ALIGNMENT, SegmentError, SegmentProvider,
    SystemSegmentProvider,
};

/// Capacity of the segment embedded in every region.
pub const INITIAL_SEGMENT_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("alignment of {0} bytes exceeds the 16 byte region granule")]
    UnsupportedAlignment(usize),
}

#[repr(C, align(16))]
struct InitialArea([MaybeUninit<u8>; INITIAL_SEGMENT_SIZE]);

struct InlineSegment {
    area: UnsafeCell<InitialArea>,
    allocated: Cell<usize>,
}

impl InlineSegment {
    fn new() -> Self {
        Self {
            area: UnsafeCell::new(InitialArea([MaybeUninit::uninit(); INITIAL_SEGMENT_SIZE])),
            allocated: Cell::new(0),
        }
    }

    fn base(&self) -> NonNull<u8> {
        // SAFETY: `UnsafeCell::get` never returns null
        unsafe { NonNull::new_unchecked(self.area.get().cast::<u8>()) }
    }

    fn remaining(&self) -> usize {
        INITIAL_SEGMENT_SIZE - self.allocated.get()
    }

    // returns the offset of the bumped range
    fn bump(&self, bytes: usize) -> usize {
        let offset = self.allocated.get();
        debug_assert!(bytes <= INITIAL_SEGMENT_SIZE - offset);
        self.allocated.set(offset + bytes);
        offset
    }
}

#[derive(Clone, Copy)]
enum Placement {
    Inline(usize),
    Segment(NonNull<u8>),
}

/// A scope bound bump allocator.
///
/// not thread safe, a region belongs to a single compilation. pointers
/// returned by [`Region::allocate`] into the inline segment are only valid
/// while the region stays where it is
pub struct Region<'p> {
    bytes_allocated: Cell<usize>,
    provider: &'p dyn SegmentProvider,
    raw_allocator: RawAllocator,
    kind: RegionKind,
    observer: Option<&'p dyn RegionObserver>,
    token: RegionToken,
    // newest provided segment, `None` while still on the inline segment
    current: RefCell<Option<Box<MemorySegment>>>,
    segment_count: Cell<usize>,
    last_destructable: Cell<Option<DestructableLink>>,
    initial: InlineSegment,
}

impl<'p> Region<'p> {
    pub fn new(provider: &'p dyn SegmentProvider, raw_allocator: RawAllocator) -> Self {
        Self {
            bytes_allocated: Cell::new(0),
            provider,
            raw_allocator,
            kind: RegionKind::Heap,
            observer: None,
            token: RegionToken::UNTRACKED,
            current: RefCell::new(None),
            segment_count: Cell::new(0),
            last_destructable: Cell::new(None),
            initial: InlineSegment::new(),
        }
    }

    /// A fresh, empty region sharing `prototype`'s provider, raw allocator,
    /// kind and observer.
    pub fn from_prototype(prototype: &Region<'p>) -> Self {
        let region = Self::new(prototype.provider, prototype.raw_allocator).with_kind(prototype.kind);
        match prototype.observer {
            Some(observer) => region.with_observer(observer),
            None => region,
        }
    }

    /// Set the kind reported to observers, call before [`Region::with_observer`].
    pub fn with_kind(mut self, kind: RegionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_observer(mut self, observer: &'p dyn RegionObserver) -> Self {
        self.token = observer.region_created(self.kind);
        self.observer = Some(observer);
        self
    }

    pub const fn initial_size() -> usize {
        INITIAL_SEGMENT_SIZE
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.get()
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn token(&self) -> RegionToken {
        self.token
    }

    pub fn raw_allocator(&self) -> RawAllocator {
        self.raw_allocator
    }

    /// Number of provider segments currently chained onto this region.
    pub fn provided_segments(&self) -> usize {
        self.segment_count.get()
    }

    /// Allocate `bytes` rounded up to the 16 byte granule.
    ///
    /// panics if the segment provider cannot supply a segment, regions have
    /// no fallback
    #[track_caller]
    pub fn allocate(&self, bytes: usize) -> NonNull<u8> {
        match self.try_allocate(bytes) {
            Ok(ptr) => ptr,
            Err(error) => panic!("region allocation of {bytes} bytes failed: {error}"),
        }
    }

    #[track_caller]
    pub fn try_allocate(&self, bytes: usize) -> Result<NonNull<u8>, RegionError> {
        let placement = self.allocate_rounded(round_to_granule(bytes), Location::caller())?;
        Ok(self.resolve(placement))
    }

    /// Allocate `bytes` with an alignment no larger than the region granule.
    #[track_caller]
    pub fn try_allocate_aligned(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, RegionError> {
        if align > SEGMENT_ALIGNMENT {
            return Err(RegionError::UnsupportedAlignment(align));
        }
        self.try_allocate(bytes)
    }

    /// Region memory is only reclaimed as a whole, this does nothing.
    pub fn deallocate(&self, _ptr: NonNull<u8>, _bytes: usize) {}

    /// Move `value` into the region.
    ///
    /// the value is dropped when the region is dropped, after every object
    /// created later and before every object created earlier
    #[track_caller]
    #[allow(clippy::mut_from_ref)]
    pub fn create<T: 'p>(&self, value: T) -> &mut T {
        const {
            assert!(
                core::mem::align_of::<Instance<T>>() <= SEGMENT_ALIGNMENT,
                "region objects cannot be aligned beyond the region granule"
            )
        };

        let size = round_to_granule(core::mem::size_of::<Instance<T>>());
        let placement = match self.allocate_rounded(size, Location::caller()) {
            Ok(placement) => placement,
            Err(error) => panic!("region allocation of {size} bytes failed: {error}"),
        };
        let instance = self.resolve(placement).cast::<Instance<T>>();

        // SAFETY: freshly bumped, granule aligned and large enough for the
        // instance
        unsafe { instance.write(Instance::new(self.last_destructable.get(), value)) };

        let link = match placement {
            Placement::Inline(offset) => DestructableLink::Inline(offset),
            Placement::Segment(ptr) => DestructableLink::Segment(ptr.cast()),
        };
        self.last_destructable.set(Some(link));

        // SAFETY: the instance lives until the region drops, which the
        // returned borrow of `self` cannot outlast
        unsafe { Instance::value_mut(instance) }
    }

    /// Drop everything in `target` and rebuild it with `prototype`'s
    /// configuration, reusing `target`'s storage.
    pub fn reset(target: &mut Region<'p>, prototype: &Region<'p>) {
        let fresh = Region::from_prototype(prototype);
        drop(core::mem::replace(target, fresh));
    }

    fn allocate_rounded(&self, rounded: usize, site: AllocationSite) -> Result<Placement, RegionError> {
        let placement = self.bump(rounded)?;
        self.bytes_allocated.set(self.bytes_allocated.get() + rounded);
        if let Some(observer) = self.observer {
            observer.region_allocated(self.token, rounded, site);
        }
        Ok(placement)
    }

    fn bump(&self, rounded: usize) -> Result<Placement, RegionError> {
        let mut current = self.current.borrow_mut();
        match current.as_deref_mut() {
            None if self.initial.remaining() >= rounded => {
                return Ok(Placement::Inline(self.initial.bump(rounded)));
            }
            Some(segment) if segment.remaining() >= rounded => {
                return Ok(Placement::Segment(segment.allocate(rounded)));
            }
            _ => {}
        }

        let segment = self.provider.request(rounded)?;
        assert!(
            segment.remaining() >= rounded,
            "segment provider returned {} bytes for a {rounded} byte request",
            segment.remaining()
        );
        let mut segment = Box::new(segment);
        if let Some(previous) = current.take() {
            segment.link(previous);
        }
        self.segment_count.set(self.segment_count.get() + 1);
        trace!(
            requested = rounded,
            segment_size = segment.size(),
            segments = self.segment_count.get(),
            "region grew"
        );

        let ptr = segment.allocate(rounded);
        *current = Some(segment);
        Ok(Placement::Segment(ptr))
    }

    fn resolve(&self, placement: Placement) -> NonNull<u8> {
        match placement {
            // SAFETY: inline offsets never exceed the inline capacity
            Placement::Inline(offset) => unsafe { self.initial.base().add(offset) },
            Placement::Segment(ptr) => ptr,
        }
    }

    fn resolve_link(&self, link: DestructableLink) -> NonNull<DestructableHeader> {
        match link {
            DestructableLink::Inline(offset) => self.resolve(Placement::Inline(offset)).cast(),
            DestructableLink::Segment(header) => header,
        }
    }
}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        let mut link = self.last_destructable.take();
        while let Some(current) = link {
            // SAFETY: every link was written by `create` and each instance is
            // destroyed exactly once, newest first
            link = unsafe { DestructableHeader::destroy(self.resolve_link(current)) };
        }

        let mut released = 0;
        let mut current = self.current.get_mut().take();
        while let Some(mut segment) = current {
            current = segment.unlink();
            self.provider.release(*segment);
            released += 1;
        }
        assert_eq!(
            released,
            self.segment_count.get(),
            "region segment chain does not lead back to the initial segment"
        );

        if let Some(observer) = self.observer {
            observer.region_destroyed(self.token, self.bytes_allocated.get());
        }
        trace!(
            bytes = self.bytes_allocated.get(),
            segments = released,
            "region dropped"
        );
    }
}

impl PartialEq for Region<'_> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl Eq for Region<'_> {}

impl core::fmt::Debug for Region<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("kind", &self.kind)
            .field("token", &self.token)
            .field("bytes_allocated", &self.bytes_allocated.get())
            .field("inline_allocated", &self.initial.allocated.get())
            .field("provided_segments", &self.segment_count.get())
            .finish()
    }
}
