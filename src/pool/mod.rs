//! An address ordered free-list memory pool
//!
//! design: the pool tracks free ranges of a heap it never touches. free
//! entries are kept strictly address ordered and are coalesced whenever a
//! range is returned next to one. large object allocation is first fit,
//! sped up by a small cache of hints into the list, TLH allocation always
//! carves from the list head. when a collector asks for card aligned free
//! memory, entries are realigned lazily the first time an allocation walk
//! reaches them.
//!
//! all list state sits behind the heap lock. [`MemoryPool::lock`] hands out
//! the locked [`HeapFreeList`] for callers, such as a collector doing bulk
//! work, that want to run several operations under one acquisition

use rust_alloc::sync::Arc;
use rust_alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

mod address;
mod card;
mod free_list;
mod header;
mod hint;
mod stats;
mod subspace;


pub use address::{Address, FreeRange, HeapRegion};
pub use free_list::{HeapFreeList, RemovedFreeEntries};
pub use stats::{LargeObjectAllocateStats, PoolStats, SizeClassHistogram};
pub use subspace::{MemorySubSpace, MemoryType};

const DEFAULT_MIN_FREE_ENTRY_SIZE: usize = 512;
const DEFAULT_CARD_SIZE: usize = 512;
const DEFAULT_HINT_CAPACITY: usize = 8;
const DEFAULT_HINT_MAX_WALK: usize = 20;
const DEFAULT_PARALLEL_SWEEP_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("minimum free entry size {min_free_entry_size} is smaller than the {card_size} byte card")]
    MinimumBelowCard {
        min_free_entry_size: usize,
        card_size: usize,
    },
    #[error("card size must be non-zero")]
    ZeroCardSize,
    #[error("hint capacity must be non-zero")]
    ZeroHintCapacity,
    #[error("parallel sweep chunk size must be non-zero")]
    ZeroSweepChunkSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: &'static str,
    /// ranges below this size are never tracked as free entries
    pub min_free_entry_size: usize,
    pub card_size: usize,
    pub hint_capacity: usize,
    /// walk length after which a successful allocation records a hint
    pub hint_max_walk: usize,
    pub parallel_sweep_chunk_size: usize,
    /// record collector allocations in the large object statistics too
    pub append_collector_stats: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "address-ordered-list",
            min_free_entry_size: DEFAULT_MIN_FREE_ENTRY_SIZE,
            card_size: DEFAULT_CARD_SIZE,
            hint_capacity: DEFAULT_HINT_CAPACITY,
            hint_max_walk: DEFAULT_HINT_MAX_WALK,
            parallel_sweep_chunk_size: DEFAULT_PARALLEL_SWEEP_CHUNK_SIZE,
            append_collector_stats: false,
        }
    }
}

impl PoolConfig {
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_min_free_entry_size(mut self, min_free_entry_size: usize) -> Self {
        self.min_free_entry_size = min_free_entry_size;
        self
    }

    pub fn with_card_size(mut self, card_size: usize) -> Self {
        self.card_size = card_size;
        self
    }

    pub fn with_hint_capacity(mut self, hint_capacity: usize) -> Self {
        self.hint_capacity = hint_capacity;
        self
    }

    pub fn with_hint_max_walk(mut self, hint_max_walk: usize) -> Self {
        self.hint_max_walk = hint_max_walk;
        self
    }

    pub fn with_parallel_sweep_chunk_size(mut self, parallel_sweep_chunk_size: usize) -> Self {
        self.parallel_sweep_chunk_size = parallel_sweep_chunk_size;
        self
    }

    pub fn with_append_collector_stats(mut self, append_collector_stats: bool) -> Self {
        self.append_collector_stats = append_collector_stats;
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.card_size == 0 {
            return Err(PoolError::ZeroCardSize);
        }
        if self.min_free_entry_size < self.card_size {
            return Err(PoolError::MinimumBelowCard {
                min_free_entry_size: self.min_free_entry_size,
                card_size: self.card_size,
            });
        }
        if self.hint_capacity == 0 {
            return Err(PoolError::ZeroHintCapacity);
        }
        if self.parallel_sweep_chunk_size == 0 {
            return Err(PoolError::ZeroSweepChunkSize);
        }
        Ok(())
    }
}

/// An allocation request and what the pool made of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocateDescription {
    pub bytes: usize,
    pub tlh_allocation: bool,
    pub nursery_allocation: bool,
}

impl AllocateDescription {
    pub const fn new(bytes: usize) -> Self {
        Self {
            bytes,
            tlh_allocation: false,
            nursery_allocation: false,
        }
    }
}

/// A thread local heap carved out of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlhRange {
    pub base: Address,
    pub top: Address,
}

impl TlhRange {
    pub fn size(&self) -> usize {
        self.top - self.base
    }
}

/// A free-list pool shared between mutator threads and a collector.
pub struct MemoryPool {
    config: PoolConfig,
    heap: Mutex<HeapFreeList>,
    reset_lock: Mutex<()>,
}

impl core::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MemoryPool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            config,
            heap: Mutex::new(HeapFreeList::new(config)),
            reset_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire the heap lock.
    ///
    /// the pool does not detect re-entrancy, calling a locking method of the
    /// same pool while holding the guard spins forever
    pub fn lock(&self) -> MutexGuard<'_, HeapFreeList> {
        self.heap.lock()
    }

    pub fn set_sub_space(&self, subspace: Arc<dyn MemorySubSpace>) {
        self.lock().set_sub_space(subspace);
    }

    pub fn allocate_object(&self, desc: &mut AllocateDescription) -> Option<Address> {
        self.lock().allocate_object(desc)
    }

    pub fn allocate_tlh(&self, desc: &mut AllocateDescription, maximum_size: usize) -> Option<TlhRange> {
        self.lock().allocate_tlh(desc, maximum_size)
    }

    pub fn collector_allocate(&self, desc: &mut AllocateDescription) -> Option<Address> {
        self.lock().collector_allocate(desc)
    }

    pub fn collector_allocate_tlh(
        &self,
        desc: &mut AllocateDescription,
        maximum_size: usize,
    ) -> Option<TlhRange> {
        self.lock().collector_allocate_tlh(desc, maximum_size)
    }

    pub fn expand_with_range(&self, size: usize, low: Address, high: Address, can_coalesce: bool) {
        self.lock().expand_with_range(size, low, high, can_coalesce);
    }

    pub fn contract_with_range(&self, size: usize, low: Address, high: Address) -> Option<Address> {
        self.lock().contract_with_range(size, low, high)
    }

    pub fn add_free_entries(&self, ranges: &[FreeRange]) {
        self.lock().add_free_entries(ranges);
    }

    pub fn recycle_heap_chunk(&self, base: Address, top: Address) -> bool {
        self.lock().recycle_heap_chunk(base, top)
    }

    pub fn remove_free_entries_within_range(
        &self,
        low: Address,
        high: Address,
        minimum_size: usize,
    ) -> Option<RemovedFreeEntries> {
        self.lock()
            .remove_free_entries_within_range(low, high, minimum_size)
    }

    pub fn find_address_after_free_size(&self, size_required: usize, minimum_size: usize) -> Option<Address> {
        self.lock()
            .find_address_after_free_size(size_required, minimum_size)
    }

    pub fn find_free_entry_ending_at(&self, addr: Address) -> Option<Address> {
        self.lock().find_free_entry_ending_at(addr)
    }

    pub fn find_free_entry_top_starting_at(&self, addr: Address) -> Option<Address> {
        self.lock().find_free_entry_top_starting_at(addr)
    }

    pub fn available_contraction_size_for_range_ending_at(
        &self,
        alloc_bytes: usize,
        low: Address,
        high: Address,
    ) -> usize {
        self.lock()
            .available_contraction_size_for_range_ending_at(alloc_bytes, low, high)
    }

    pub fn first_free_starting_address(&self) -> Option<Address> {
        self.lock().first_free_starting_address()
    }

    pub fn next_free_starting_address(&self, current: Address) -> Option<Address> {
        self.lock().next_free_starting_address(current)
    }

    pub fn free_entries(&self) -> Vec<FreeRange> {
        self.lock().free_entries()
    }

    pub fn move_heap(&self, src_base: Address, src_top: Address, dst_base: Address) {
        self.lock().move_heap(src_base, src_top, dst_base);
    }

    /// Empty the pool. Takes the reset lock and then the heap lock.
    pub fn reset(&self) {
        let _reset = self.reset_lock.lock();
        self.lock().reset();
    }

    /// Replace the contents of the pool with one free entry spanning
    /// `region`.
    pub fn rebuild_free_list_in_region(&self, region: HeapRegion) -> Option<Address> {
        let _reset = self.reset_lock.lock();
        self.lock().rebuild_in_region(region)
    }

    pub fn request_card_alignment(&self) -> usize {
        self.lock().request_card_alignment()
    }

    pub fn alignment_toggled(&self, enabled: bool) {
        self.lock().alignment_toggled(enabled);
    }

    pub fn free_memory_size(&self) -> usize {
        self.lock().free_memory_size()
    }

    pub fn free_entry_count(&self) -> usize {
        self.lock().free_entry_count()
    }

    pub fn largest_free_entry(&self) -> usize {
        self.lock().largest_free_entry()
    }

    pub fn current_largest_free(&self) -> usize {
        self.lock().current_largest_free()
    }

    pub fn current_free_memory_size(&self) -> usize {
        self.lock().current_free_memory_size()
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats()
    }

    pub fn large_object_stats(&self) -> LargeObjectAllocateStats {
        self.lock().large_object_stats().clone()
    }

    pub fn recalculate_statistics(&self) {
        self.lock().recalculate_statistics();
    }

    pub fn is_valid_list_ordering(&self) -> bool {
        self.lock().is_valid_list_ordering()
    }

    pub fn is_memory_pool_valid(&self, post_collect: bool) -> bool {
        self.lock().is_memory_pool_valid(post_collect)
    }

    pub fn print_current_free_list(&self, area: &str) {
        self.lock().print_current_free_list(area);
    }
}
