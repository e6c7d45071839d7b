//! The address ordered free list behind a [`MemoryPool`](super::MemoryPool).
//!
//! every method here assumes the caller holds the heap lock, which is what
//! `&mut HeapFreeList` expresses. the list itself is a chain of
//! [`FreeHeader`]s keyed by entry address, strictly increasing and never
//! overlapping. `free_memory_size` and `free_entry_count` always describe
//! exactly what is on the chain.

use rust_alloc::sync::Arc;
use rust_alloc::vec::Vec;
use tracing::{debug, trace, warn};

use super::card::{self, CardCursor, ParallelGcAlignment};
use super::header::{FreeHeader, FreeHeaderTable};
use super::hint::AllocateHints;
use super::stats::{LargeObjectAllocateStats, PoolStats};
use super::{
    Address, AllocateDescription, FreeRange, HeapRegion, MemorySubSpace, MemoryType, PoolConfig,
    TlhRange,
};

/// Free memory extracted by
/// [`HeapFreeList::remove_free_entries_within_range`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovedFreeEntries {
    /// address ordered pieces of at least the requested minimum size
    pub entries: Vec<FreeRange>,
    /// total bytes of `entries`
    pub memory_size: usize,
    pub count: usize,
}

pub struct HeapFreeList {
    config: PoolConfig,
    headers: FreeHeaderTable,
    head: Option<Address>,
    free_memory_size: usize,
    free_entry_count: usize,
    largest_free_entry: usize,
    hints: AllocateHints,
    card_cursor: CardCursor,
    adjusted_bytes_for_card_alignment: usize,
    parallel_alignment: Option<ParallelGcAlignment>,
    stats: PoolStats,
    large_object_stats: LargeObjectAllocateStats,
    subspace: Option<Arc<dyn MemorySubSpace>>,
}

impl core::fmt::Debug for HeapFreeList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapFreeList")
            .field("name", &self.config.name)
            .field("head", &self.head)
            .field("free_memory_size", &self.free_memory_size)
            .field("free_entry_count", &self.free_entry_count)
            .field("largest_free_entry", &self.largest_free_entry)
            .field("card_cursor", &self.card_cursor)
            .field("hints", &self.hints.active())
            .finish_non_exhaustive()
    }
}

impl HeapFreeList {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            hints: AllocateHints::new(config.hint_capacity),
            config,
            headers: FreeHeaderTable::default(),
            head: None,
            free_memory_size: 0,
            free_entry_count: 0,
            largest_free_entry: 0,
            card_cursor: CardCursor::End,
            adjusted_bytes_for_card_alignment: 0,
            parallel_alignment: None,
            stats: PoolStats::default(),
            large_object_stats: LargeObjectAllocateStats::default(),
            subspace: None,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn free_memory_size(&self) -> usize {
        self.free_memory_size
    }

    pub fn free_entry_count(&self) -> usize {
        self.free_entry_count
    }

    /// Largest entry as of the last sweep or failed allocation, not
    /// maintained by every mutation.
    pub fn largest_free_entry(&self) -> usize {
        self.largest_free_entry
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn large_object_stats(&self) -> &LargeObjectAllocateStats {
        &self.large_object_stats
    }

    pub fn active_hint_count(&self) -> usize {
        self.hints.active_len()
    }

    /// Bytes card realignment is still expected to discard.
    pub fn adjusted_bytes_for_card_alignment(&self) -> usize {
        self.adjusted_bytes_for_card_alignment
    }

    pub fn is_alignment_for_parallel_gc_required(&self) -> bool {
        self.parallel_alignment.is_some()
    }

    pub fn set_sub_space(&mut self, subspace: Arc<dyn MemorySubSpace>) {
        self.subspace = Some(subspace);
    }

    pub fn sub_space(&self) -> Option<&Arc<dyn MemorySubSpace>> {
        self.subspace.as_ref()
    }

    fn is_nursery(&self) -> bool {
        self.subspace
            .as_ref()
            .is_some_and(|subspace| subspace.type_flags() == MemoryType::New)
    }

    fn iter(&self) -> impl Iterator<Item = (Address, FreeHeader)> + '_ {
        core::iter::successors(self.head, |entry| self.headers.next(*entry))
            .map(|entry| (entry, self.headers.get(entry)))
    }

    /// Snapshot of every free entry in address order.
    pub fn free_entries(&self) -> Vec<FreeRange> {
        self.iter()
            .map(|(entry, header)| FreeRange::new(entry, entry + header.size))
            .collect()
    }

    // ---- allocation ----

    /// Allocate `desc.bytes` for a mutator, first fit in address order.
    pub fn allocate_object(&mut self, desc: &mut AllocateDescription) -> Option<Address> {
        let addr = self.internal_allocate(desc.bytes, true)?;
        desc.tlh_allocation = false;
        desc.nursery_allocation = self.is_nursery();
        Some(addr)
    }

    /// Allocate for the collector. Object statistics are only recorded
    /// when `append_collector_stats` is configured.
    pub fn collector_allocate(&mut self, desc: &mut AllocateDescription) -> Option<Address> {
        let addr = self.internal_allocate(desc.bytes, self.config.append_collector_stats)?;
        desc.tlh_allocation = false;
        desc.nursery_allocation = self.is_nursery();
        Some(addr)
    }

    /// Carve a TLH of at most `maximum_size` bytes off the list head.
    pub fn allocate_tlh(
        &mut self,
        desc: &mut AllocateDescription,
        maximum_size: usize,
    ) -> Option<TlhRange> {
        let tlh = self.internal_allocate_tlh(maximum_size, true)?;
        desc.tlh_allocation = true;
        desc.nursery_allocation = self.is_nursery();
        Some(tlh)
    }

    pub fn collector_allocate_tlh(
        &mut self,
        desc: &mut AllocateDescription,
        maximum_size: usize,
    ) -> Option<TlhRange> {
        let tlh = self.internal_allocate_tlh(maximum_size, self.config.append_collector_stats)?;
        desc.tlh_allocation = true;
        desc.nursery_allocation = self.is_nursery();
        Some(tlh)
    }

    fn replenish(&mut self, size: usize) -> bool {
        let Some(subspace) = self.subspace.clone() else {
            return false;
        };
        subspace.replenish_pool_for_allocate(self, size)
    }

    fn internal_allocate(&mut self, size: usize, record_object: bool) -> Option<Address> {
        loop {
            let mut current = self.head;
            let mut previous = None;
            let mut walk_count = 0;
            let mut candidate_hint_size = 0;
            let mut largest = 0;
            let mut found = None;

            let hint = self
                .hints
                .find(size, self.head)
                .filter(|hint| self.headers.contains(hint.entry));
            if let Some(hint) = hint {
                current = Some(hint.entry);
                candidate_hint_size = hint.size;
            }

            while let Some(mut entry) = current {
                if self.needs_card_alignment(entry) {
                    match self.align_cards_up_to(entry) {
                        Some(aligned) => entry = aligned,
                        None => {
                            current = self.card_cursor.first();
                            previous = self.card_cursor.prev();
                            walk_count += 1;
                            continue;
                        }
                    }
                }

                let entry_size = self.headers.size(entry);
                largest = largest.max(entry_size);
                if size <= entry_size {
                    found = Some(entry);
                    break;
                }
                candidate_hint_size = candidate_hint_size.max(entry_size);
                walk_count += 1;
                previous = Some(entry);
                current = self.headers.next(entry);
                debug_assert!(current.is_none_or(|next| next > entry));
            }

            let Some(found) = found else {
                if self.replenish(size) {
                    continue;
                }
                trace!(size, largest, walk_count, "allocation failed");
                self.largest_free_entry = largest;
                return None;
            };

            // a walk that began at a hint knows nothing about what precedes it
            if previous.is_none() && self.head != Some(found) {
                previous = self.find_previous(found);
            }

            let FreeHeader {
                size: entry_size,
                next,
            } = self.headers.get(found);
            self.large_object_stats.decrement_free_entry(entry_size);
            if walk_count >= self.config.hint_max_walk || (walk_count > 1 && hint.is_some()) {
                if let Some(previous) = previous {
                    self.hints.add(previous, candidate_hint_size);
                }
            }

            self.free_memory_size -= size;
            self.stats.alloc_count += 1;
            self.stats.alloc_bytes += size;
            self.stats.alloc_search_count += walk_count;

            let recycle_size = entry_size - size;
            let recycle = found + size;
            self.headers.remove(found);
            if self.recycle_into(recycle, recycle + recycle_size, previous, next) {
                self.update_prev_card_unaligned(next, Some(recycle));
                self.hints.update(found, recycle);
                self.large_object_stats.increment_free_entry(recycle_size);
            } else {
                self.update_prev_card_unaligned(next, previous);
                self.free_memory_size -= recycle_size;
                self.free_entry_count -= 1;
                self.stats.alloc_discarded_bytes += recycle_size;
                self.hints.remove(found);
            }

            if record_object {
                self.large_object_stats.allocate_object(size);
            }

            debug_assert!(self.is_memory_pool_valid(true));
            return Some(found);
        }
    }

    fn internal_allocate_tlh(&mut self, maximum_size: usize, record_tlh: bool) -> Option<TlhRange> {
        let minimum = self.config.min_free_entry_size;
        loop {
            let Some(mut entry) = self.head else {
                if self.replenish(minimum) {
                    continue;
                }
                // nothing left or too fragmented to matter
                self.largest_free_entry = 0;
                return None;
            };

            if self.needs_card_alignment(entry) {
                match self.align_cards_up_to(entry) {
                    Some(aligned) => entry = aligned,
                    None => continue,
                }
            }

            let FreeHeader {
                size: entry_size,
                next,
            } = self.headers.get(entry);
            self.large_object_stats.decrement_free_entry(entry_size);

            let Some(mut consumed) = self.consumed_size_for_tlh(entry, entry_size, next, maximum_size)
            else {
                continue;
            };

            // an unusable leftover goes along with the TLH unless that would
            // break the sweep chunk boundary
            let mut recycle_size = entry_size - consumed;
            if recycle_size > 0 && recycle_size < minimum && self.parallel_alignment.is_none() {
                consumed += recycle_size;
                recycle_size = 0;
            }

            self.free_memory_size -= consumed;
            self.stats.alloc_count += 1;
            self.stats.alloc_bytes += consumed;
            if record_tlh {
                self.large_object_stats.increment_tlh_alloc(consumed);
            }

            let top = entry + consumed;
            self.headers.remove(entry);
            if recycle_size > 0 {
                if self.recycle_into(top, top + recycle_size, None, next) {
                    self.update_prev_card_unaligned(next, Some(top));
                    self.hints.update(entry, top);
                    self.large_object_stats.increment_free_entry(recycle_size);
                } else {
                    self.update_prev_card_unaligned(next, None);
                    self.free_memory_size -= recycle_size;
                    self.free_entry_count -= 1;
                    self.stats.alloc_discarded_bytes += recycle_size;
                    self.hints.remove(entry);
                }
            } else {
                self.update_prev_card_unaligned(next, None);
                self.head = next;
                self.free_entry_count -= 1;
                self.hints.remove(entry);
            }

            debug_assert!(self.is_memory_pool_valid(true));
            return Some(TlhRange { base: entry, top });
        }
    }

    // `None` when parallel alignment clipped the head entry below the
    // minimum, the entry is then dropped from the list
    fn consumed_size_for_tlh(
        &mut self,
        entry: Address,
        entry_size: usize,
        next: Option<Address>,
        maximum_size: usize,
    ) -> Option<usize> {
        debug_assert!(entry_size >= self.config.min_free_entry_size);
        let consumed = maximum_size.min(entry_size);
        let Some(alignment) = self.parallel_alignment else {
            return Some(consumed);
        };

        let consumed = alignment.clip(entry, consumed);
        if consumed >= self.config.min_free_entry_size {
            return Some(consumed);
        }

        trace!(%entry, entry_size, "sweep chunk boundary leaves no usable TLH, abandoning entry");
        self.abandon(entry, entry + entry_size);
        self.free_memory_size -= entry_size;
        self.stats.alloc_discarded_bytes += entry_size;
        self.update_prev_card_unaligned(next, None);
        self.headers.remove(entry);
        self.hints.remove(entry);
        self.head = next;
        self.free_entry_count -= 1;
        None
    }

    // ---- list surgery ----

    fn link(&mut self, previous: Option<Address>, next: Option<Address>) {
        match previous {
            Some(previous) => {
                debug_assert!(next.is_none_or(|next| previous < next));
                self.headers.set_next(previous, next);
            }
            None => self.head = next,
        }
    }

    fn find_previous(&self, entry: Address) -> Option<Address> {
        let mut previous = None;
        let mut current = self.head;
        while let Some(candidate) = current {
            if candidate >= entry {
                break;
            }
            previous = Some(candidate);
            current = self.headers.next(candidate);
        }
        previous
    }

    fn abandon(&self, low: Address, high: Address) {
        if low >= high {
            return;
        }
        trace!(%low, %high, "abandoning heap chunk");
        if let Some(subspace) = &self.subspace {
            subspace.abandon_heap_chunk(low, high);
        }
    }

    // put a header on `[low, high)` if it is large enough, otherwise
    // abandon the range. does not link the entry in
    fn create_free_entry(&mut self, low: Address, high: Address, next: Option<Address>) -> bool {
        if high > low && high - low >= self.config.min_free_entry_size {
            self.headers.insert(low, high - low, next);
            true
        } else {
            self.abandon(low, high);
            false
        }
    }

    // place `[base, top)` between `previous` and `next`. on failure the two
    // neighbours are linked directly
    fn recycle_into(
        &mut self,
        base: Address,
        top: Address,
        previous: Option<Address>,
        next: Option<Address>,
    ) -> bool {
        debug_assert!(base <= top);
        debug_assert!(next.is_none_or(|next| top <= next));
        if self.create_free_entry(base, top, next) {
            self.link(previous, Some(base));
            true
        } else {
            self.link(previous, next);
            false
        }
    }

    /// Insert `[low, high)` in address order, merging with the adjacent
    /// entries when `can_coalesce` allows it. Ranges below the minimum entry
    /// size are abandoned.
    pub fn expand_with_range(&mut self, size: usize, low: Address, high: Address, can_coalesce: bool) {
        if size == 0 {
            return;
        }
        debug_assert_eq!(size, high - low);

        if size < self.config.min_free_entry_size {
            self.abandon(low, high);
            return;
        }

        let mut previous = None;
        let mut next = self.head;
        while let Some(entry) = next {
            if low < entry {
                break;
            }
            previous = Some(entry);
            next = self.headers.next(entry);
        }
        debug_assert!(previous.is_none_or(|previous| self.headers.after_end(previous) <= low));
        debug_assert!(next.is_none_or(|next| high <= next));

        if can_coalesce {
            let merge_previous = previous.filter(|previous| self.headers.after_end(*previous) == low);
            let merge_next = next.filter(|next| *next == high);
            if merge_previous.is_some() || merge_next.is_some() {
                let mut merged_size = size;
                let mut follower = next;
                let mut merges = 0;
                if let Some(old) = merge_next {
                    let header = self.headers.get(old);
                    self.headers.remove(old);
                    self.large_object_stats.decrement_free_entry(header.size);
                    merged_size += header.size;
                    follower = header.next;
                    merges += 1;
                }
                let start = match merge_previous {
                    Some(previous) => {
                        let previous_size = self.headers.size(previous);
                        self.large_object_stats.decrement_free_entry(previous_size);
                        merged_size += previous_size;
                        merges += 1;
                        previous
                    }
                    None => low,
                };

                self.headers.insert(start, merged_size, follower);
                if merge_previous.is_none() {
                    self.link(previous, Some(low));
                }
                self.free_memory_size += size;
                self.free_entry_count = self.free_entry_count + 1 - merges;
                self.large_object_stats.increment_free_entry(merged_size);
                self.largest_free_entry = self.largest_free_entry.max(merged_size);

                self.hints.update_beyond(start);
                self.update_prev_card_unaligned(follower, Some(start));
                self.note_unaligned_entry(start, merge_previous.map_or(previous, |_| None));
                debug!(%low, %high, into = %start, merged_size, "coalesced expanded range");
                debug_assert!(self.is_memory_pool_valid(true));
                return;
            }
        }

        self.headers.insert(low, size, next);
        self.link(previous, Some(low));
        self.free_memory_size += size;
        self.free_entry_count += 1;
        self.large_object_stats.increment_free_entry(size);
        self.largest_free_entry = self.largest_free_entry.max(size);

        self.hints.update_beyond(low);
        self.update_prev_card_unaligned(next, Some(low));
        self.note_unaligned_entry(low, previous);
        debug!(%low, %high, "inserted free entry");
        debug_assert!(self.is_memory_pool_valid(true));
    }

    /// Take `[low, high)` out of the single free entry that encloses it.
    ///
    /// # Panics
    ///
    /// if no free entry encloses the range
    pub fn contract_with_range(&mut self, size: usize, low: Address, high: Address) -> Option<Address> {
        if size == 0 {
            return None;
        }
        debug_assert_eq!(size, high - low);

        let mut previous = None;
        let mut current = self.head;
        while let Some(entry) = current {
            if low >= entry && high <= self.headers.after_end(entry) {
                break;
            }
            previous = Some(entry);
            current = self.headers.next(entry);
        }
        let Some(entry) = current else {
            panic!("no free entry encloses {low}..{high}");
        };

        let FreeHeader {
            size: entry_size,
            next,
        } = self.headers.get(entry);
        self.headers.remove(entry);
        self.hints.remove(entry);
        self.large_object_stats.decrement_free_entry(entry_size);

        let mut total_contract_size = size;
        let mut created = 0;
        let mut follower = next;
        let mut trailing = None;
        let mut leading = None;

        let entry_top = entry + entry_size;
        if entry_top != high {
            if self.create_free_entry(high, entry_top, follower) {
                follower = Some(high);
                trailing = Some(high);
                created += 1;
                self.large_object_stats.increment_free_entry(entry_top - high);
            } else {
                total_contract_size += entry_top - high;
            }
        }

        if entry != low {
            if self.create_free_entry(entry, low, follower) {
                follower = Some(entry);
                leading = Some(entry);
                created += 1;
                self.large_object_stats.increment_free_entry(low - entry);
            } else {
                total_contract_size += low - entry;
            }
        }

        self.link(previous, follower);
        self.free_memory_size -= total_contract_size;
        self.free_entry_count = self.free_entry_count + created - 1;

        self.update_prev_card_unaligned(next, trailing.or(leading).or(previous));
        if let Some(trailing) = trailing {
            self.note_unaligned_entry(trailing, leading.or(previous));
        }

        debug!(%low, %high, from = %entry, total_contract_size, "contracted free entry");
        debug_assert!(self.is_memory_pool_valid(true));
        Some(low)
    }

    /// Splice an address ordered batch of free ranges into the list.
    ///
    /// the batch must not overlap the list. its last range is merged with
    /// the old head when the batch lands in front of the list, otherwise
    /// its first range is merged with the preceding entry. ranges below the
    /// minimum entry size are abandoned
    pub fn add_free_entries(&mut self, ranges: &[FreeRange]) {
        let minimum = self.config.min_free_entry_size;
        let mut batch = Vec::with_capacity(ranges.len());
        for range in ranges {
            if range.size() >= minimum {
                batch.push(*range);
            } else {
                self.abandon(range.low, range.high);
            }
        }
        let (Some(first), Some(tail)) = (batch.first().copied(), batch.last().copied()) else {
            return;
        };
        debug_assert!(batch.windows(2).all(|pair| pair[0].high <= pair[1].low));

        let memory_size: usize = batch.iter().map(FreeRange::size).sum();
        let mut entry_count = batch.len();
        for (index, range) in batch.iter().enumerate() {
            let next = batch.get(index + 1).map(|next| next.low);
            self.headers.insert(range.low, range.size(), next);
            self.large_object_stats.increment_free_entry(range.size());
            self.largest_free_entry = self.largest_free_entry.max(range.size());
        }

        let previous = self.find_previous(first.low);
        let start = match previous {
            None => {
                let old_head = self.head;
                debug_assert!(old_head.is_none_or(|head| tail.high <= head));
                match old_head.filter(|head| *head == tail.high) {
                    Some(old_head) => {
                        let old = self.headers.get(old_head);
                        self.headers.remove(old_head);
                        self.large_object_stats.decrement_free_entry(old.size);
                        self.large_object_stats.decrement_free_entry(tail.size());
                        self.headers.expand(tail.low, old.size);
                        self.headers.set_next(tail.low, old.next);
                        self.large_object_stats.increment_free_entry(tail.size() + old.size);
                        self.largest_free_entry = self.largest_free_entry.max(tail.size() + old.size);
                        self.update_prev_card_unaligned(old.next, Some(tail.low));
                        entry_count -= 1;
                    }
                    None => {
                        self.headers.set_next(tail.low, old_head);
                        self.update_prev_card_unaligned(old_head, Some(tail.low));
                    }
                }
                self.head = Some(first.low);
                first.low
            }
            Some(previous) => {
                let previous_next = self.headers.next(previous);
                debug_assert!(previous_next.is_none_or(|next| tail.high <= next));
                self.headers.set_next(tail.low, previous_next);
                self.update_prev_card_unaligned(previous_next, Some(tail.low));
                if self.headers.after_end(previous) == first.low {
                    let head = self.headers.get(first.low);
                    let previous_size = self.headers.size(previous);
                    self.headers.remove(first.low);
                    self.large_object_stats.decrement_free_entry(head.size);
                    self.large_object_stats.decrement_free_entry(previous_size);
                    self.headers.expand(previous, head.size);
                    self.headers.set_next(previous, head.next);
                    self.large_object_stats.increment_free_entry(previous_size + head.size);
                    self.largest_free_entry = self.largest_free_entry.max(previous_size + head.size);
                    if tail.low == first.low {
                        self.update_prev_card_unaligned(previous_next, Some(previous));
                    }
                    entry_count -= 1;
                    previous
                } else {
                    self.headers.set_next(previous, Some(first.low));
                    first.low
                }
            }
        };

        self.free_memory_size += memory_size;
        self.free_entry_count += entry_count;

        self.hints.update_beyond(start);
        if self.card_cursor.first().is_some_and(|cursor| start < cursor) {
            let loss = self.realignment_loss_between(start, tail.low);
            self.note_unaligned_entries(start, None, loss);
        }

        debug!(entries = batch.len(), memory_size, "added free entries");
        debug_assert!(self.is_memory_pool_valid(true));
    }

    /// Return `[base, top)` to the list, coalescing on both sides.
    ///
    /// returns false when the chunk is too small to track, it is abandoned
    /// instead
    pub fn recycle_heap_chunk(&mut self, chunk_base: Address, chunk_top: Address) -> bool {
        let mut base = chunk_base;
        let mut top = chunk_top;
        let mut merged = 0;

        let mut previous = None;
        let mut current = self.head;
        let mut next_entry = None;
        while let Some(entry) = current {
            next_entry = self.headers.next(entry);
            if next_entry.is_none_or(|next| next > chunk_base) {
                break;
            }
            previous = Some(entry);
            current = next_entry;
        }

        let (prev, next) = match current {
            Some(entry) if chunk_base >= entry => {
                debug_assert!(self.headers.after_end(entry) <= chunk_base);
                let prev = if chunk_base == self.headers.after_end(entry) {
                    base = entry;
                    merged += 1;
                    previous
                } else {
                    Some(entry)
                };
                let next = match next_entry.filter(|next| *next == chunk_top) {
                    Some(following) => {
                        top = top + self.headers.size(following);
                        merged += 1;
                        self.headers.next(following)
                    }
                    None => next_entry,
                };
                (prev, next)
            }
            _ => {
                let next = match current.filter(|entry| *entry == chunk_top) {
                    Some(following) => {
                        top = top + self.headers.size(following);
                        merged += 1;
                        next_entry
                    }
                    None => current,
                };
                (previous, next)
            }
        };

        if merged == 0 && chunk_top - chunk_base < self.config.min_free_entry_size {
            self.abandon(chunk_base, chunk_top);
            return false;
        }

        // drop the headers swallowed by the merge
        if base != chunk_base {
            let size = self.headers.size(base);
            self.large_object_stats.decrement_free_entry(size);
            self.headers.remove(base);
        }
        if top != chunk_top {
            let size = self.headers.size(chunk_top);
            self.large_object_stats.decrement_free_entry(size);
            self.headers.remove(chunk_top);
        }

        let recycled = self.recycle_into(base, top, prev, next);
        debug_assert!(recycled);
        if prev.is_none() || top != chunk_top {
            // a new head or a merged successor can leave hints pointing
            // at addresses the list no longer holds
            self.hints.clear();
        } else {
            self.hints.update_beyond(base);
        }

        let size = top - base;
        self.large_object_stats.increment_free_entry(size);
        self.largest_free_entry = self.largest_free_entry.max(size);
        self.free_memory_size += chunk_top - chunk_base;
        self.free_entry_count = self.free_entry_count + 1 - merged;

        self.update_prev_card_unaligned(next, Some(base));
        self.note_unaligned_entry(base, prev);

        debug_assert!(self.is_memory_pool_valid(true));
        recycled
    }

    /// Pull every free byte inside `[low, high)` off the list.
    ///
    /// entries straddling the bounds are split, pieces of at least
    /// `minimum_size` are handed back and smaller ones abandoned. `None`
    /// when no free entry intersects the range
    pub fn remove_free_entries_within_range(
        &mut self,
        low: Address,
        high: Address,
        minimum_size: usize,
    ) -> Option<RemovedFreeEntries> {
        let mut previous = None;
        let mut current = self.head;
        while let Some(entry) = current {
            if entry >= low || self.headers.after_end(entry) > low {
                break;
            }
            previous = Some(entry);
            current = self.headers.next(entry);
        }

        let entry = current.filter(|entry| *entry < high)?;

        let FreeHeader {
            size: entry_size,
            next,
        } = self.headers.get(entry);
        self.headers.remove(entry);
        self.hints.remove(entry);
        self.large_object_stats.decrement_free_entry(entry_size);

        let mut removed = RemovedFreeEntries::default();
        let mut remove_size = entry_size;
        let mut remove_count = 1;
        let mut created = 0;

        let entry_top = entry + entry_size;
        let mut base = entry;
        let mut top = entry_top;

        if entry < low {
            if self.create_free_entry(entry, low, None) {
                self.link(previous, Some(entry));
                previous = Some(entry);
                remove_size -= low - entry;
                created += 1;
                self.large_object_stats.increment_free_entry(low - entry);
            }
            base = low;
        }

        if entry_top > high {
            if self.create_free_entry(high, entry_top, None) {
                self.link(previous, Some(high));
                previous = Some(high);
                remove_size -= entry_top - high;
                created += 1;
                self.large_object_stats.increment_free_entry(entry_top - high);
            }
            top = high;
        }

        self.append_to_list(base, top, minimum_size, &mut removed);

        let mut current = next;
        let mut tail = next;
        while let Some(entry) = current.filter(|entry| self.headers.after_end(*entry) <= high) {
            let header = self.headers.get(entry);
            self.headers.remove(entry);
            self.hints.remove(entry);
            self.large_object_stats.decrement_free_entry(header.size);
            tail = header.next;
            self.append_to_list(entry, entry + header.size, minimum_size, &mut removed);
            remove_size += header.size;
            remove_count += 1;
            current = tail;
        }

        if let Some(entry) = current.filter(|entry| *entry < high) {
            let header = self.headers.get(entry);
            self.headers.remove(entry);
            self.hints.remove(entry);
            self.large_object_stats.decrement_free_entry(header.size);
            remove_size += header.size;
            remove_count += 1;
            tail = header.next;

            let entry_top = entry + header.size;
            if self.create_free_entry(high, entry_top, tail) {
                tail = Some(high);
                remove_size -= entry_top - high;
                created += 1;
                self.large_object_stats.increment_free_entry(entry_top - high);
            }
            self.append_to_list(entry, high, minimum_size, &mut removed);
        }

        self.link(previous, tail);
        self.free_memory_size -= remove_size;
        self.free_entry_count = self.free_entry_count + created - remove_count;
        self.update_prev_card_unaligned(tail, previous);

        debug!(
            %low,
            %high,
            removed_bytes = remove_size,
            returned_bytes = removed.memory_size,
            returned_entries = removed.count,
            "removed free entries within range"
        );
        debug_assert!(self.is_memory_pool_valid(true));
        Some(removed)
    }

    fn append_to_list(
        &self,
        low: Address,
        high: Address,
        minimum_size: usize,
        removed: &mut RemovedFreeEntries,
    ) {
        if high > low && high - low >= minimum_size {
            removed.entries.push(FreeRange::new(low, high));
            removed.memory_size += high - low;
            removed.count += 1;
        } else {
            self.abandon(low, high);
        }
    }

    /// Relocate the free entries starting inside `[src_base, src_top)` by
    /// `dst_base - src_base`.
    pub fn move_heap(&mut self, src_base: Address, src_top: Address, dst_base: Address) {
        let relocate = |addr: Address| {
            if addr >= src_base && addr < src_top {
                dst_base + (addr - src_base)
            } else {
                addr
            }
        };

        let moved: Vec<(Address, FreeHeader)> = self
            .iter()
            .filter(|(entry, _)| *entry >= src_base && *entry < src_top)
            .collect();
        if moved.is_empty() {
            return;
        }

        let entries: Vec<Address> = self.iter().map(|(entry, _)| entry).collect();
        for entry in entries {
            if let Some(next) = self.headers.next(entry) {
                self.headers.set_next(entry, Some(relocate(next)));
            }
        }

        for (entry, _) in &moved {
            self.headers.remove(*entry);
        }
        for (entry, header) in &moved {
            let next = header.next.map(relocate);
            self.headers.insert(relocate(*entry), header.size, next);
        }
        self.head = self.head.map(relocate);

        self.hints.clear();
        if let CardCursor::Pending { first, prev } = self.card_cursor {
            self.card_cursor = CardCursor::Pending {
                first: relocate(first),
                prev: prev.map(relocate),
            };
        }

        debug!(%src_base, %src_top, %dst_base, moved = moved.len(), "moved heap");
        debug_assert!(self.is_valid_list_ordering());
    }

    /// Empty the list and forget every statistic.
    pub fn reset(&mut self) {
        self.headers.clear();
        self.head = None;
        self.free_memory_size = 0;
        self.free_entry_count = 0;
        self.largest_free_entry = 0;
        self.hints.clear();
        self.card_cursor = CardCursor::End;
        self.adjusted_bytes_for_card_alignment = 0;
        self.stats = PoolStats::default();
        self.large_object_stats.reset();
        debug!(pool = self.config.name, "reset free list");
    }

    /// Reset and install `region` as the single free entry. Returns the new
    /// entry, `None` if the region is too small to track.
    pub fn rebuild_in_region(&mut self, region: HeapRegion) -> Option<Address> {
        self.reset();
        if !self.create_free_entry(region.low, region.high, None) {
            return None;
        }
        let size = region.size();
        self.head = Some(region.low);
        self.free_memory_size = size;
        self.free_entry_count = 1;
        self.largest_free_entry = size;
        self.large_object_stats.increment_free_entry(size);
        debug!(low = %region.low, high = %region.high, "rebuilt free list");
        Some(region.low)
    }

    // ---- lookups ----

    /// The address where `size_required` bytes of free memory, counting
    /// only entries of at least `minimum_size`, have been passed.
    pub fn find_address_after_free_size(&self, size_required: usize, minimum_size: usize) -> Option<Address> {
        let mut remaining = size_required;
        for (entry, header) in self.iter() {
            // whatever is left must still come as one usable piece
            remaining = remaining.max(minimum_size);

            if remaining >= header.size {
                if minimum_size <= header.size {
                    remaining -= header.size;
                    if remaining == 0 {
                        return Some(entry + header.size);
                    }
                }
            } else {
                if header.size - remaining < self.config.min_free_entry_size {
                    return Some(entry + header.size);
                }
                return Some(entry + remaining);
            }
        }
        None
    }

    pub fn find_free_entry_ending_at(&self, addr: Address) -> Option<Address> {
        self.iter()
            .find(|(entry, header)| *entry + header.size == addr)
            .map(|(entry, _)| entry)
    }

    pub fn find_free_entry_top_starting_at(&self, addr: Address) -> Option<Address> {
        self.iter()
            .take_while(|(entry, _)| *entry <= addr)
            .find(|(entry, _)| *entry == addr)
            .map(|(entry, header)| entry + header.size)
    }

    /// Bytes that can be given up from the free entry ending at `high`. A
    /// pending allocation of `alloc_bytes` that would fit there is assumed
    /// to land in it.
    pub fn available_contraction_size_for_range_ending_at(
        &self,
        alloc_bytes: usize,
        low: Address,
        high: Address,
    ) -> usize {
        debug_assert!(low <= high);
        let Some(entry) = self.find_free_entry_ending_at(high) else {
            return 0;
        };
        let available = self.headers.size(entry);
        if alloc_bytes != 0 && alloc_bytes <= available {
            available - alloc_bytes
        } else {
            available
        }
    }

    pub fn first_free_starting_address(&self) -> Option<Address> {
        self.head
    }

    /// # Panics
    ///
    /// if `current` does not start a free entry
    pub fn next_free_starting_address(&self, current: Address) -> Option<Address> {
        self.headers.next(current)
    }

    // ---- card alignment ----

    /// Estimate the bytes card realignment will discard across the list
    /// and arm lazy realignment at the list head when there are any.
    pub fn request_card_alignment(&mut self) -> usize {
        let card_size = self.config.card_size;
        let minimum = self.config.min_free_entry_size;
        let adjusted: usize = self
            .iter()
            .map(|(entry, header)| card::realignment_loss(entry, header.size, card_size, minimum))
            .sum();

        self.adjusted_bytes_for_card_alignment = adjusted;
        self.card_cursor = match self.head {
            Some(head) if adjusted > 0 => CardCursor::Pending {
                first: head,
                prev: None,
            },
            _ => CardCursor::End,
        };
        debug!(adjusted, "requested card alignment");
        adjusted
    }

    /// React to the parallel sweep alignment toggle. The alignment base is
    /// the low address of the subspace's first region.
    pub fn alignment_toggled(&mut self, enabled: bool) {
        if !enabled {
            self.parallel_alignment = None;
            debug!("parallel gc alignment disabled");
            return;
        }
        let base = self
            .subspace
            .as_ref()
            .and_then(|subspace| subspace.first_region_low_address());
        match base {
            Some(base) => {
                let size = self.config.parallel_sweep_chunk_size;
                self.parallel_alignment = Some(ParallelGcAlignment { base, size });
                debug!(%base, size, "parallel gc alignment enabled");
            }
            None => warn!(pool = self.config.name, "no subspace region to align TLHs against"),
        }
    }

    fn needs_card_alignment(&self, entry: Address) -> bool {
        self.adjusted_bytes_for_card_alignment > 0
            && self.card_cursor.first().is_some_and(|first| entry >= first)
    }

    fn update_prev_card_unaligned(&mut self, next: Option<Address>, prev: Option<Address>) {
        if let CardCursor::Pending { first, .. } = self.card_cursor {
            if Some(first) == next {
                self.card_cursor = CardCursor::Pending { first, prev };
            }
        }
    }

    fn note_unaligned_entry(&mut self, entry: Address, prev: Option<Address>) {
        let loss = card::realignment_loss(
            entry,
            self.headers.size(entry),
            self.config.card_size,
            self.config.min_free_entry_size,
        );
        self.note_unaligned_entries(entry, prev, loss);
    }

    // `prev` may be a guess, the cursor is resynchronised before use
    fn note_unaligned_entries(&mut self, entry: Address, prev: Option<Address>, loss: usize) {
        let CardCursor::Pending { first, .. } = self.card_cursor else {
            return;
        };
        if loss == 0 || entry >= first {
            return;
        }
        self.adjusted_bytes_for_card_alignment += loss;
        self.card_cursor = CardCursor::Pending { first: entry, prev };
    }

    fn realignment_loss_between(&self, start: Address, last: Address) -> usize {
        let card_size = self.config.card_size;
        let minimum = self.config.min_free_entry_size;
        core::iter::successors(Some(start), |entry| self.headers.next(*entry))
            .take_while(|entry| *entry <= last)
            .map(|entry| card::realignment_loss(entry, self.headers.size(entry), card_size, minimum))
            .sum()
    }

    fn repair_card_cursor(&mut self) {
        let CardCursor::Pending { first, prev } = self.card_cursor else {
            return;
        };
        let linked = match prev {
            None => self.head == Some(first),
            Some(prev) => self.headers.contains(prev) && self.headers.next(prev) == Some(first),
        };
        if linked {
            return;
        }

        let mut previous = None;
        let mut current = self.head;
        while let Some(entry) = current {
            if entry >= first {
                break;
            }
            previous = Some(entry);
            current = self.headers.next(entry);
        }
        self.card_cursor = match current {
            Some(entry) => CardCursor::Pending {
                first: entry,
                prev: previous,
            },
            None => CardCursor::End,
        };
    }

    /// Realign every pending entry up to and including `last`. Returns the
    /// entry that replaced `last`, `None` when `last` was too small to keep.
    fn align_cards_up_to(&mut self, last: Address) -> Option<Address> {
        self.repair_card_cursor();
        let CardCursor::Pending { first, prev } = self.card_cursor else {
            return Some(last);
        };

        let card_size = self.config.card_size;
        let minimum = self.config.min_free_entry_size;
        let mut current = Some(first);
        let mut previous = prev;
        let mut aligned_last = None;
        let mut lost_to_alignment = 0;

        while let Some(entry) = current.filter(|entry| *entry <= last) {
            let FreeHeader { size, next } = self.headers.get(entry);
            let end = entry + size;
            let (new_start, new_end) = card::aligned_core(entry, size, card_size);

            if new_start == entry && new_end == end {
                aligned_last = Some(entry);
                previous = Some(entry);
            } else if new_end <= new_start || new_end - new_start < minimum {
                self.headers.remove(entry);
                self.link(previous, next);
                self.abandon(entry, end);
                self.hints.remove(entry);
                self.large_object_stats.decrement_free_entry(size);
                self.free_entry_count -= 1;
                lost_to_alignment += size;
                aligned_last = None;
            } else {
                if new_start != entry {
                    self.abandon(entry, new_start);
                    self.hints.update(entry, new_start);
                }
                if new_end != end {
                    self.abandon(new_end, end);
                }
                let new_size = new_end - new_start;
                self.headers.remove(entry);
                self.headers.insert(new_start, new_size, next);
                self.link(previous, Some(new_start));
                self.large_object_stats.decrement_free_entry(size);
                self.large_object_stats.increment_free_entry(new_size);
                lost_to_alignment += size - new_size;
                previous = Some(new_start);
                aligned_last = Some(new_start);
            }
            current = next;
        }

        if lost_to_alignment > 0 {
            self.adjusted_bytes_for_card_alignment = self
                .adjusted_bytes_for_card_alignment
                .saturating_sub(lost_to_alignment);
            self.free_memory_size -= lost_to_alignment;
            self.stats.dark_matter_bytes += lost_to_alignment;
        }

        self.card_cursor = match current {
            Some(first) => CardCursor::Pending {
                first,
                prev: previous,
            },
            None => CardCursor::End,
        };
        trace!(%last, lost_to_alignment, cursor = ?self.card_cursor, "card alignment progressed");
        aligned_last
    }

    // ---- validation ----

    pub fn is_valid_list_ordering(&self) -> bool {
        self.iter().all(|(entry, header)| {
            header
                .next
                .is_none_or(|next| entry < next && entry + header.size <= next)
        })
    }

    /// Recompute the list totals and compare them with the running ones.
    /// `largest_free_entry` is only compared when `post_collect` is false.
    pub fn is_memory_pool_valid(&self, post_collect: bool) -> bool {
        let mut free_bytes = 0;
        let mut free_count = 0;
        let mut largest = 0;
        for (_, header) in self.iter() {
            free_bytes += header.size;
            free_count += 1;
            largest = largest.max(header.size);
        }

        free_bytes == self.free_memory_size
            && free_count == self.free_entry_count
            && free_count == self.headers.len()
            && (post_collect || largest == self.largest_free_entry)
            && self.is_valid_list_ordering()
    }

    pub fn current_largest_free(&self) -> usize {
        self.iter().map(|(_, header)| header.size).max().unwrap_or(0)
    }

    pub fn current_free_memory_size(&self) -> usize {
        let size = self.iter().map(|(_, header)| header.size).sum();
        debug_assert_eq!(size, self.free_memory_size);
        size
    }

    /// Rebuild size, count, largest entry and the free entry histogram
    /// from the list.
    pub fn recalculate_statistics(&mut self) {
        self.large_object_stats.reset_free_entries();
        let mut free_bytes = 0;
        let mut free_count = 0;
        let mut largest = 0;
        let sizes: Vec<usize> = self.iter().map(|(_, header)| header.size).collect();
        for size in sizes {
            free_bytes += size;
            free_count += 1;
            largest = largest.max(size);
            self.large_object_stats.increment_free_entry(size);
        }
        self.free_memory_size = free_bytes;
        self.free_entry_count = free_count;
        self.largest_free_entry = largest;
    }

    pub fn print_current_free_list(&self, area: &str) {
        debug!(pool = self.config.name, area, "free list analysis");
        for (entry, header) in self.iter() {
            debug!(start = %entry, end = %(entry + header.size), size = header.size, "free chunk");
        }
    }
}
