//! Compilation-lifetime and heap memory management primitives.
//!
//! Two independent pieces live here: [`Region`], a scoped bump allocator
//! that destroys the objects created in it in reverse creation order, and
//! [`MemoryPool`], an address-ordered free-list pool servicing large object
//! and thread local heap allocation for a collector.

#![no_std]

extern crate alloc as rust_alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod pool;
pub mod region;

pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;

pub use pool::{
    Address, AllocateDescription, FreeRange, HeapFreeList, HeapRegion, MemoryPool, MemorySubSpace,
    MemoryType, PoolConfig, PoolError, PoolStats, TlhRange,
};
pub use region::{
    AllocationLog, MemorySegment, RawAllocator, Region, RegionError, RegionKind, RegionObserver,
    RegionProfiler, SegmentError, SegmentProvider, SiteCollection, SystemSegmentProvider,
};
