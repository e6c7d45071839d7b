use core::cell::{Cell, RefCell, UnsafeCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use rust_alloc::rc::Rc;
use rust_alloc::string::{String, ToString};
use rust_alloc::vec::Vec;

use super::{
    AllocationLog, INITIAL_SEGMENT_SIZE, MemorySegment, RawAllocator, Region, RegionError,
    RegionKind, RegionProfiler, SegmentError, SegmentProvider, SiteCollection,
    SystemSegmentProvider,
};

// records the order in which values are dropped
struct Noisy<T: Clone> {
    value: T,
    order: Rc<RefCell<Vec<T>>>,
}

impl<T: Clone> Drop for Noisy<T> {
    fn drop(&mut self) {
        self.order.borrow_mut().push(self.value.clone());
    }
}

// wraps the system provider to count traffic
struct CountingProvider {
    inner: SystemSegmentProvider,
    requests: Cell<usize>,
    releases: Cell<usize>,
}

impl CountingProvider {
    fn new(inner: SystemSegmentProvider) -> Self {
        Self {
            inner,
            requests: Cell::new(0),
            releases: Cell::new(0),
        }
    }
}

impl SegmentProvider for CountingProvider {
    fn request(&self, required_size: usize) -> Result<MemorySegment, SegmentError> {
        self.requests.set(self.requests.get() + 1);
        self.inner.request(required_size)
    }

    fn release(&self, segment: MemorySegment) {
        self.releases.set(self.releases.get() + 1);
        self.inner.release(segment);
    }

    fn bytes_allocated(&self) -> usize {
        self.inner.bytes_allocated()
    }
}

#[test]
fn create_destroys_in_reverse_order() {
    let provider = SystemSegmentProvider::default();
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let region = Region::new(&provider, RawAllocator);
        for i in 0..5 {
            let noisy = region.create(Noisy {
                value: i,
                order: order.clone(),
            });
            assert_eq!(noisy.value, i);
        }
        assert!(order.borrow().is_empty(), "nothing dies before the region");
    }

    assert_eq!(*order.borrow(), [4, 3, 2, 1, 0]);
}

#[test]
fn reverse_order_holds_across_segments() {
    let provider = CountingProvider::new(SystemSegmentProvider::default().with_segment_size(1024));
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let region = Region::new(&provider, RawAllocator);
        for i in 0..400u32 {
            region.create(Noisy {
                value: i,
                order: order.clone(),
            });
        }
        assert!(region.provided_segments() > 1);
    }

    let expected: Vec<u32> = (0..400).rev().collect();
    assert_eq!(*order.borrow(), expected);
    assert_eq!(provider.requests.get(), provider.releases.get());
}

#[test]
fn allocations_are_granule_aligned_and_counted() {
    let provider = SystemSegmentProvider::default();
    let region = Region::new(&provider, RawAllocator);

    let mut expected = 0;
    for size in [1usize, 15, 16, 17, 100, 0, 4000] {
        let ptr = region.allocate(size);
        assert_eq!(ptr.as_ptr() as usize % 16, 0, "size {size} misaligned");
        expected += (size + 15) & !15;
        assert_eq!(region.bytes_allocated(), expected);
    }
}

#[test]
fn inline_segment_is_used_before_the_provider() {
    let provider = CountingProvider::new(SystemSegmentProvider::default());

    {
        let region = Region::new(&provider, RawAllocator);
        region.allocate(INITIAL_SEGMENT_SIZE);
        assert_eq!(provider.requests.get(), 0);
        assert_eq!(region.provided_segments(), 0);

        region.allocate(1);
        assert_eq!(provider.requests.get(), 1);
        assert_eq!(region.provided_segments(), 1);
        assert_eq!(region.bytes_allocated(), INITIAL_SEGMENT_SIZE + 16);
    }

    assert_eq!(provider.releases.get(), 1);
    assert_eq!(provider.inner.live_segments(), 0);
}

#[test]
fn oversized_request_gets_a_dedicated_segment() {
    let provider = SystemSegmentProvider::default().with_segment_size(4096);
    let region = Region::new(&provider, RawAllocator);

    let ptr = region.allocate(100_000);
    // SAFETY: the whole range was just handed out
    unsafe { ptr.as_ptr().write_bytes(0xAB, 100_000) };
    assert!(provider.bytes_allocated() >= 100_000);
    assert_eq!(region.provided_segments(), 1);
}

#[test]
fn teardown_returns_every_segment() {
    let provider = CountingProvider::new(SystemSegmentProvider::default().with_segment_size(256));

    for pattern in [[16usize, 300, 16], [5000, 1, 5000], [4096, 4096, 4096]] {
        let region = Region::new(&provider, RawAllocator);
        for _ in 0..20 {
            for size in pattern {
                region.allocate(size);
            }
        }
        drop(region);
        assert_eq!(provider.requests.get(), provider.releases.get());
    }
    assert_eq!(provider.inner.live_segments(), 0);
    assert!(provider.inner.cached_segments() > 0);
}

#[test]
fn released_segments_are_reused() {
    let provider = SystemSegmentProvider::default().with_segment_size(1024);

    {
        let region = Region::new(&provider, RawAllocator);
        region.allocate(INITIAL_SEGMENT_SIZE + 512);
    }
    let after_first = provider.bytes_allocated();

    {
        let region = Region::new(&provider, RawAllocator);
        region.allocate(INITIAL_SEGMENT_SIZE + 512);
    }
    assert_eq!(provider.bytes_allocated(), after_first);
}

#[test]
fn nested_region_objects_die_with_the_nested_region() {
    let provider = SystemSegmentProvider::default();
    let order = Rc::new(RefCell::new(Vec::new()));
    let noisy = |name: &str| Noisy {
        value: name.to_string(),
        order: order.clone(),
    };

    {
        let outer = Region::new(&provider, RawAllocator);
        outer.create(noisy("outer-first"));
        let nested = outer.create(Region::from_prototype(&outer));
        nested.create(noisy("nested-first"));
        nested.create(noisy("nested-second"));
        outer.create(noisy("outer-second"));
    }

    let expected: Vec<String> = ["outer-second", "nested-second", "nested-first", "outer-first"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(*order.borrow(), expected);
}

#[test]
fn reset_drops_contents_and_starts_over() {
    let provider = CountingProvider::new(SystemSegmentProvider::default());
    let dropped = Rc::new(AtomicBool::new(false));

    struct Flag(Rc<AtomicBool>);
    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let prototype = Region::new(&provider, RawAllocator).with_kind(RegionKind::Stack);
    let mut target = Region::new(&provider, RawAllocator);
    target.create(Flag(dropped.clone()));
    target.allocate(10_000);
    assert_eq!(provider.requests.get(), 1);

    Region::reset(&mut target, &prototype);

    assert!(dropped.load(Ordering::SeqCst), "reset must drop created objects");
    assert_eq!(provider.releases.get(), 1);
    assert_eq!(target.bytes_allocated(), 0);
    assert_eq!(target.provided_segments(), 0);
    assert_eq!(target.kind(), RegionKind::Stack);

    target.create(7u64);
    assert_eq!(target.bytes_allocated(), 32);
}

#[test]
fn region_can_move_after_creating_objects() {
    let provider = SystemSegmentProvider::default();
    let order = Rc::new(RefCell::new(Vec::new()));

    let region = Region::new(&provider, RawAllocator);
    region.create(Noisy {
        value: 1,
        order: order.clone(),
    });
    region.create(Noisy {
        value: 2,
        order: order.clone(),
    });

    let moved = rust_alloc::boxed::Box::new(region);
    moved.create(Noisy {
        value: 3,
        order: order.clone(),
    });
    drop(moved);

    assert_eq!(*order.borrow(), [3, 2, 1]);
}

#[test]
fn provider_limit_is_reported() {
    let provider = SystemSegmentProvider::default().with_allocation_limit(0);
    let region = Region::new(&provider, RawAllocator);

    assert!(region.try_allocate(INITIAL_SEGMENT_SIZE).is_ok());
    let error = region.try_allocate(1).unwrap_err();
    assert!(matches!(
        error,
        RegionError::Segment(SegmentError::LimitExceeded { limit: 0, .. })
    ));
    assert_eq!(region.bytes_allocated(), INITIAL_SEGMENT_SIZE);
}

#[test]
#[should_panic(expected = "region allocation of 5000 bytes failed")]
fn exhausted_provider_is_fatal() {
    let provider = SystemSegmentProvider::default().with_allocation_limit(1024);
    let region = Region::new(&provider, RawAllocator);
    region.allocate(5000);
}

#[repr(C, align(16))]
struct ShortBuffer(UnsafeCell<[u8; 64]>);

// hands out segments smaller than asked for
struct ShortProvider(ShortBuffer);

impl SegmentProvider for ShortProvider {
    fn request(&self, _required_size: usize) -> Result<MemorySegment, SegmentError> {
        let base = NonNull::new(self.0.0.get().cast::<u8>()).unwrap();
        // SAFETY: the buffer is 16 byte aligned and outlives every region
        // using this provider
        let mut segment = unsafe { MemorySegment::from_raw_parts(base, 64) };
        segment.allocate(48);
        Ok(segment)
    }

    fn release(&self, _segment: MemorySegment) {}

    fn bytes_allocated(&self) -> usize {
        64
    }
}

#[test]
#[should_panic(expected = "segment provider returned")]
fn undersized_segment_is_fatal() {
    let provider = ShortProvider(ShortBuffer(UnsafeCell::new([0; 64])));
    let region = Region::new(&provider, RawAllocator);
    region.allocate(INITIAL_SEGMENT_SIZE + 64);
}

#[test]
fn unsupported_alignment_is_rejected() {
    let provider = SystemSegmentProvider::default();
    let region = Region::new(&provider, RawAllocator);
    assert_eq!(
        region.try_allocate_aligned(64, 64),
        Err(RegionError::UnsupportedAlignment(64))
    );
    assert!(region.try_allocate_aligned(64, 16).is_ok());
}

#[test]
fn allocation_log_records_sites_and_lifetimes() {
    let provider = SystemSegmentProvider::default();
    let log = AllocationLog::new(SiteCollection::HeapOnly);

    {
        let heap = Region::new(&provider, RawAllocator).with_observer(&log);
        log.label(heap.token(), "compile foo");
        heap.allocate(10);
        heap.allocate(10);
        heap.create(1u8);

        let stack = Region::new(&provider, RawAllocator)
            .with_kind(RegionKind::Stack)
            .with_observer(&log);
        stack.allocate(100);
        assert_eq!(log.live_regions(), 2);
    }

    let finished = log.finished();
    assert_eq!(finished.len(), 2);
    assert_eq!(log.live_regions(), 0);
    for entry in &finished {
        assert!(entry.end_time.unwrap() > entry.start_time);
    }

    let heap = finished
        .iter()
        .find(|entry| entry.label.as_deref() == Some("compile foo"))
        .unwrap();
    assert_eq!(heap.kind, RegionKind::Heap);
    assert_eq!(heap.bytes_allocated, 64);
    // two plain allocations and one create, each from its own line
    let sites = heap.sites_by_bytes();
    assert_eq!(sites.len(), 3);
    assert!(sites.iter().all(|(site, _)| site.file().ends_with("tests.rs")));
    assert_eq!(sites[0].1, 32);

    let stack = finished
        .iter()
        .find(|entry| entry.kind == RegionKind::Stack)
        .unwrap();
    assert_eq!(stack.bytes_allocated, 112);
    assert!(stack.sites.is_empty(), "stack regions are not site-collected");

    log.report();
    log.clear();
    assert!(log.finished().is_empty());
}

#[test]
fn observers_do_not_change_allocation() {
    let provider = SystemSegmentProvider::default();
    let log = AllocationLog::new(SiteCollection::All);

    let plain = Region::new(&provider, RawAllocator);
    let observed = Region::new(&provider, RawAllocator).with_observer(&log);
    for size in [3usize, 40, 5000, 17] {
        let a = plain.allocate(size);
        let b = observed.allocate(size);
        assert_eq!(a.as_ptr() as usize % 16, b.as_ptr() as usize % 16);
        assert_eq!(plain.bytes_allocated(), observed.bytes_allocated());
    }
}

#[test]
fn regions_compare_by_identity() {
    let provider = SystemSegmentProvider::default();
    let a = Region::new(&provider, RawAllocator);
    let b = Region::new(&provider, RawAllocator);
    assert_eq!(a, a);
    assert_ne!(a, b);
}

#[test]
fn profiler_measures_scope_growth() {
    let provider = SystemSegmentProvider::default();
    let region = Region::new(&provider, RawAllocator);
    region.allocate(100);

    let profiler = RegionProfiler::new(&region, "inliner");
    region.allocate(20);
    region.create([0u64; 4]);
    assert_eq!(profiler.allocated_so_far(), 32 + 64);
}

#[test]
fn deallocate_is_a_no_op() {
    let provider = SystemSegmentProvider::default();
    let region = Region::new(&provider, RawAllocator);
    let ptr = region.allocate(48);
    region.deallocate(ptr, 48);
    assert_eq!(region.bytes_allocated(), 48);
    assert_ne!(region.allocate(16), ptr);
}

#[test]
fn raw_allocator_round_trip() {
    let raw = RawAllocator;
    let ptr: NonNull<u8> = raw.allocate(128).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 16, 0);
    // SAFETY: same size as the allocation above
    unsafe { raw.deallocate(ptr, 128) };
}

#[cfg(feature = "region_allocator")]
#[test]
fn collections_allocate_from_the_region() {
    use allocator_api2::alloc::{Allocator, Layout};

    let provider = SystemSegmentProvider::default();
    let region = Region::new(&provider, RawAllocator);

    let mut values = allocator_api2::vec::Vec::new_in(&region);
    for i in 0..1000u64 {
        values.push(i);
    }
    assert_eq!(values.iter().sum::<u64>(), 999 * 1000 / 2);
    assert!(region.bytes_allocated() >= 1000 * 8);

    let handle = &region;
    let wide = Layout::from_size_align(64, 64).unwrap();
    assert!(Allocator::allocate(&handle, wide).is_err());

    let empty = Layout::from_size_align(0, 8).unwrap();
    let before = region.bytes_allocated();
    assert!(Allocator::allocate(&handle, empty).is_ok());
    assert_eq!(region.bytes_allocated(), before);
}

#[cfg(feature = "region_allocator")]
#[test]
fn moved_collection_still_reads_from_its_region() {
    use rust_alloc::boxed::Box;

    let provider = SystemSegmentProvider::default();
    let region = Region::new(&provider, RawAllocator);

    let mut values = allocator_api2::vec::Vec::with_capacity_in(4, &region);
    values.extend_from_slice(&[1u64, 2, 3, 4]);
    let moved = Box::new(values);

    // a small buffer comes out of the inline segment of the borrowed region
    let inline = region.initial.base().as_ptr() as usize;
    let buffer = moved.as_ptr() as usize;
    assert!(core::ptr::eq(*moved.allocator(), &region));
    assert!(buffer >= inline && buffer < inline + INITIAL_SEGMENT_SIZE);
    assert_eq!(moved.as_slice(), &[1, 2, 3, 4]);

    let moved_again = *moved;
    assert_eq!(moved_again.iter().sum::<u64>(), 10);
}

#[test]
fn cached_segments_are_reused_best_fit() {
    let provider = SystemSegmentProvider::default().with_segment_size(1024);

    {
        // locals drop in reverse, the large segment is cached first
        let small = Region::new(&provider, RawAllocator);
        let large = Region::new(&provider, RawAllocator);
        large.allocate(INITIAL_SEGMENT_SIZE);
        large.allocate(100_000);
        small.allocate(INITIAL_SEGMENT_SIZE);
        small.allocate(16);
    }
    assert_eq!(provider.cached_segments(), 2);
    let after_first = provider.bytes_allocated();

    {
        let region = Region::new(&provider, RawAllocator);
        region.allocate(INITIAL_SEGMENT_SIZE);
        // the 1 KiB segment serves this, the 100 000 byte one stays cached
        region.allocate(16);
        region.allocate(100_000);
        assert_eq!(region.provided_segments(), 2);
    }
    assert_eq!(provider.bytes_allocated(), after_first);
    assert_eq!(provider.cached_segments(), 2);
}
