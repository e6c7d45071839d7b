//! raw segments backing a region once its inline storage runs out
//!
//! a segment is only a byte range plus a high-water mark, it never frees the
//! memory it describes. that is the provider's job

use core::ptr::NonNull;

use rust_alloc::alloc::{Layout, alloc, dealloc};
use rust_alloc::boxed::Box;
use rust_alloc::vec::Vec;
use spin::Mutex;
use tracing::trace;

/// Every region allocation is rounded to, and aligned on, this many bytes.
pub const SEGMENT_ALIGNMENT: usize = 16;

const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

pub(crate) const fn round_to_granule(bytes: usize) -> usize {
    (bytes + (SEGMENT_ALIGNMENT - 1)) & !(SEGMENT_ALIGNMENT - 1)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("segment of {requested} bytes would exceed the allocation limit of {limit} bytes")]
    LimitExceeded { requested: usize, limit: usize },
    #[error("backing allocator could not supply {size} bytes")]
    OutOfMemory { size: usize },
}

/// Handle over the global allocator used for segment storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawAllocator;

impl RawAllocator {
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, SegmentError> {
        let layout = Self::layout_for(size)?;
        // SAFETY: `layout_for` never produces a zero sized layout
        let raw = unsafe { alloc(layout) };
        NonNull::new(raw).ok_or(SegmentError::OutOfMemory { size })
    }

    /// # Safety
    ///
    /// `ptr` must come from [`RawAllocator::allocate`] called with the same
    /// `size`, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        if let Ok(layout) = Self::layout_for(size) {
            // SAFETY: upheld by the caller, layout matches the allocation
            unsafe { dealloc(ptr.as_ptr(), layout) }
        }
    }

    fn layout_for(size: usize) -> Result<Layout, SegmentError> {
        Layout::from_size_align(size.max(1), SEGMENT_ALIGNMENT)
            .map_err(|_| SegmentError::OutOfMemory { size })
    }
}

/// A contiguous byte range with a bump pointer, chainable through `next`.
pub struct MemorySegment {
    base: NonNull<u8>,
    size: usize,
    allocated: usize,
    next: Option<Box<MemorySegment>>,
}

// SAFETY: a segment only describes memory, whoever holds the segment has
// exclusive use of that range
unsafe impl Send for MemorySegment {}

impl MemorySegment {
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `size` bytes for as long
    /// as the segment is in use, and aligned to [`SEGMENT_ALIGNMENT`].
    pub unsafe fn from_raw_parts(base: NonNull<u8>, size: usize) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % SEGMENT_ALIGNMENT, 0);
        Self {
            base,
            size,
            allocated: 0,
            next: None,
        }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn remaining(&self) -> usize {
        self.size - self.allocated
    }

    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        start <= addr && addr < start + self.size
    }

    /// Bump `bytes` off the segment.
    ///
    /// panics if the segment does not have `bytes` remaining
    pub fn allocate(&mut self, bytes: usize) -> NonNull<u8> {
        assert!(
            bytes <= self.remaining(),
            "segment overflow: {bytes} bytes requested, {} remaining",
            self.remaining()
        );
        // SAFETY: `allocated + bytes <= size`, so the result stays in bounds
        let ptr = unsafe { self.base.add(self.allocated) };
        self.allocated += bytes;
        ptr
    }

    /// Rewind the high-water mark, only for whole segment reuse.
    pub fn reset(&mut self) {
        self.allocated = 0;
    }

    pub fn link(&mut self, next: Box<MemorySegment>) {
        debug_assert!(self.next.is_none(), "segment already linked");
        self.next = Some(next);
    }

    pub fn unlink(&mut self) -> Option<Box<MemorySegment>> {
        self.next.take()
    }

    pub fn is_linked(&self) -> bool {
        self.next.is_some()
    }
}

impl core::fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemorySegment")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("allocated", &self.allocated)
            .field("linked", &self.next.is_some())
            .finish()
    }
}

/// Source of segments for regions that outgrow their inline storage.
pub trait SegmentProvider {
    /// Hand out a segment with at least `required_size` bytes remaining.
    fn request(&self, required_size: usize) -> Result<MemorySegment, SegmentError>;

    /// Take back a segment previously handed out by `request`.
    fn release(&self, segment: MemorySegment);

    /// Bytes of backing storage currently held by the provider.
    fn bytes_allocated(&self) -> usize;
}

#[derive(Default)]
struct ProviderState {
    bytes_allocated: usize,
    live_segments: usize,
    cached: Vec<MemorySegment>,
}

/// Default [`SegmentProvider`] carving segments out of a [`RawAllocator`].
///
/// released segments are kept and handed out again to any request they can
/// satisfy, backing memory is returned when the provider drops
pub struct SystemSegmentProvider {
    segment_size: usize,
    allocation_limit: usize,
    raw_allocator: RawAllocator,
    state: Mutex<ProviderState>,
}

impl Default for SystemSegmentProvider {
    fn default() -> Self {
        Self::new(RawAllocator)
    }
}

impl SystemSegmentProvider {
    pub fn new(raw_allocator: RawAllocator) -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            allocation_limit: usize::MAX,
            raw_allocator,
            state: Mutex::new(ProviderState::default()),
        }
    }

    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = round_to_granule(segment_size);
        self
    }

    pub fn with_allocation_limit(mut self, allocation_limit: usize) -> Self {
        self.allocation_limit = allocation_limit;
        self
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn allocation_limit(&self) -> usize {
        self.allocation_limit
    }

    pub fn raw_allocator(&self) -> RawAllocator {
        self.raw_allocator
    }

    pub fn live_segments(&self) -> usize {
        self.state.lock().live_segments
    }

    pub fn cached_segments(&self) -> usize {
        self.state.lock().cached.len()
    }
}

impl SegmentProvider for SystemSegmentProvider {
    fn request(&self, required_size: usize) -> Result<MemorySegment, SegmentError> {
        let mut state = self.state.lock();

        // best fit, so a large dedicated segment is not spent on a small request
        if let Some((index, _)) = state
            .cached
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.size() >= required_size)
            .min_by_key(|(_, segment)| segment.size())
        {
            let mut segment = state.cached.swap_remove(index);
            segment.reset();
            state.live_segments += 1;
            trace!(size = segment.size(), required_size, "reusing cached segment");
            return Ok(segment);
        }

        let size = round_to_granule(required_size).max(self.segment_size);
        let requested = state.bytes_allocated.saturating_add(size);
        if requested > self.allocation_limit {
            return Err(SegmentError::LimitExceeded {
                requested,
                limit: self.allocation_limit,
            });
        }

        let base = self.raw_allocator.allocate(size)?;
        state.bytes_allocated += size;
        state.live_segments += 1;
        trace!(size, required_size, total = state.bytes_allocated, "allocated segment");

        // SAFETY: `base` is a fresh, 16 byte aligned allocation of `size` bytes
        Ok(unsafe { MemorySegment::from_raw_parts(base, size) })
    }

    fn release(&self, mut segment: MemorySegment) {
        debug_assert!(!segment.is_linked(), "segments are released one at a time");
        segment.reset();
        let mut state = self.state.lock();
        state.live_segments -= 1;
        state.cached.push(segment);
    }

    fn bytes_allocated(&self) -> usize {
        self.state.lock().bytes_allocated
    }
}

impl Drop for SystemSegmentProvider {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug_assert_eq!(
            state.live_segments, 0,
            "segment provider dropped while regions still hold its segments"
        );
        for segment in state.cached.drain(..) {
            // SAFETY: every cached segment was allocated by `raw_allocator`
            // with exactly `segment.size()` bytes
            unsafe { self.raw_allocator.deallocate(segment.base(), segment.size()) };
        }
    }
}
