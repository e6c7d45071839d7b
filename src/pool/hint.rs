//! allocate hints
//!
//! a hint remembers a free entry reached by a long first-fit walk together
//! with the largest entry size seen before it. a later search for more than
//! that size can start its walk at the hinted entry instead of the list head.
//!
//! hints come from a fixed pool of slots threaded onto an active and an
//! inactive list, the least recently used active hint is recycled when the
//! inactive list runs dry

use rust_alloc::vec::Vec;
use tracing::trace;

use super::Address;

#[derive(Debug, Clone, Copy)]
struct AllocateHint {
    size: usize,
    entry: Address,
    lru: u64,
    next: Option<usize>,
}

/// A hint returned by [`AllocateHints::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HintMatch {
    pub(crate) entry: Address,
    pub(crate) size: usize,
}

#[derive(Debug)]
pub(crate) struct AllocateHints {
    slots: Vec<AllocateHint>,
    active: Option<usize>,
    inactive: Option<usize>,
    lru_counter: u64,
}

impl AllocateHints {
    pub(crate) fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|index| AllocateHint {
                size: 0,
                entry: Address::ZERO,
                lru: 0,
                next: (index + 1 < capacity).then_some(index + 1),
            })
            .collect();
        Self {
            slots,
            active: None,
            inactive: (capacity > 0).then_some(0),
            lru_counter: 1,
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn active_len(&self) -> usize {
        self.iter_active().count()
    }

    fn iter_active(&self) -> impl Iterator<Item = usize> + '_ {
        core::iter::successors(self.active, |index| self.slots[*index].next)
    }

    /// Snapshot of the active hints as `(entry, size)` pairs.
    pub(crate) fn active(&self) -> Vec<(Address, usize)> {
        self.iter_active()
            .map(|index| (self.slots[index].entry, self.slots[index].size))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        while let Some(index) = self.active {
            self.active = self.slots[index].next;
            self.slots[index].next = self.inactive;
            self.inactive = Some(index);
        }
        self.lru_counter = 1;
    }

    // unlink `index` from the active list, `previous` is its predecessor
    fn deactivate(&mut self, previous: Option<usize>, index: usize) -> Option<usize> {
        let next = self.slots[index].next;
        match previous {
            Some(previous) => self.slots[previous].next = next,
            None => self.active = next,
        }
        self.slots[index].next = self.inactive;
        self.inactive = Some(index);
        next
    }

    /// Record that every entry walked before `entry` is at most `lookup_size`
    /// bytes, dropping the hints the new one overrides.
    pub(crate) fn add(&mut self, entry: Address, lookup_size: usize) {
        let mut previous = None;
        let mut current = self.active;
        while let Some(index) = current {
            let hint = self.slots[index];
            let overridden = if entry < hint.entry {
                lookup_size >= hint.size
            } else if entry == hint.entry {
                if lookup_size >= hint.size {
                    // an equal or better hint already exists
                    return;
                }
                true
            } else {
                lookup_size <= hint.size
            };

            if overridden {
                current = self.deactivate(previous, index);
            } else {
                previous = Some(index);
                current = hint.next;
            }
        }

        let index = match self.inactive {
            Some(index) => {
                self.inactive = self.slots[index].next;
                self.slots[index].next = self.active;
                self.active = Some(index);
                index
            }
            None => {
                let Some(oldest) = self
                    .iter_active()
                    .min_by_key(|index| self.slots[*index].lru)
                else {
                    return;
                };
                trace!(entry = %self.slots[oldest].entry, "evicting least recently used hint");
                oldest
            }
        };

        let lru = self.next_lru();
        let slot = &mut self.slots[index];
        slot.lru = lru;
        slot.size = lookup_size;
        slot.entry = entry;
        trace!(%entry, lookup_size, "hint recorded");
    }

    /// The largest hint below `lookup_size`, after purging hints that point
    /// below the free list `head`.
    pub(crate) fn find(&mut self, lookup_size: usize, head: Option<Address>) -> Option<HintMatch> {
        let mut best: Option<usize> = None;
        let mut previous = None;
        let mut current = self.active;
        while let Some(index) = current {
            let hint = self.slots[index];
            let stale = head.is_none_or(|head| hint.entry < head);
            if stale {
                current = self.deactivate(previous, index);
                continue;
            }
            if hint.size < lookup_size && best.is_none_or(|best| hint.size > self.slots[best].size) {
                best = Some(index);
            }
            previous = Some(index);
            current = hint.next;
        }

        let index = best?;
        let lru = self.next_lru();
        let slot = &mut self.slots[index];
        slot.lru = lru;
        Some(HintMatch {
            entry: slot.entry,
            size: slot.size,
        })
    }

    /// Drop every hint pointing at `entry`.
    pub(crate) fn remove(&mut self, entry: Address) {
        let mut previous = None;
        let mut current = self.active;
        while let Some(index) = current {
            if self.slots[index].entry == entry {
                current = self.deactivate(previous, index);
            } else {
                previous = Some(index);
                current = self.slots[index].next;
            }
        }
    }

    /// Repoint every hint at `old` to `new`.
    pub(crate) fn update(&mut self, old: Address, new: Address) {
        let mut current = self.active;
        while let Some(index) = current {
            let slot = &mut self.slots[index];
            if slot.entry == old {
                slot.entry = new;
            }
            current = slot.next;
        }
    }

    /// Pull every hint beyond `entry` back to `entry`.
    pub(crate) fn update_beyond(&mut self, entry: Address) {
        let mut current = self.active;
        while let Some(index) = current {
            let slot = &mut self.slots[index];
            if slot.entry > entry {
                slot.entry = entry;
            }
            current = slot.next;
        }
    }

    fn next_lru(&mut self) -> u64 {
        let lru = self.lru_counter;
        self.lru_counter += 1;
        lru
    }
}
