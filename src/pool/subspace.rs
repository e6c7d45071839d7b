use super::{Address, HeapFreeList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    New,
    Old,
}

/// The owner of the heap memory a pool tracks.
///
/// the pool calls back into its subspace when it runs dry and whenever a
/// range drops off the free list without being handed out
pub trait MemorySubSpace: Send + Sync {
    fn type_flags(&self) -> MemoryType;

    /// Try to add at least `size` bytes of free memory to `pool`, which is
    /// already locked. The allocation is retried for as long as this
    /// returns true.
    fn replenish_pool_for_allocate(&self, pool: &mut HeapFreeList, size: usize) -> bool {
        let _ = (pool, size);
        false
    }

    /// Low address of the first heap region of the subspace.
    fn first_region_low_address(&self) -> Option<Address>;

    /// `[low, high)` is no longer free memory the pool tracks, the subspace
    /// may fill it with a hole.
    fn abandon_heap_chunk(&self, low: Address, high: Address) {
        let _ = (low, high);
    }
}
