//! card alignment bookkeeping
//!
//! realignment is lazy: `CardCursor` marks the first entry that may still
//! straddle a card boundary, allocation walks realign everything up to the
//! entry they are about to use and move the cursor past it

use super::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum CardCursor {
    /// no entry is waiting to be realigned
    #[default]
    End,
    /// `first` and every entry after it may be unaligned. `prev` is the
    /// entry linked before `first`, `None` when `first` heads the list
    Pending {
        first: Address,
        prev: Option<Address>,
    },
}

impl CardCursor {
    pub(crate) fn first(self) -> Option<Address> {
        match self {
            Self::End => None,
            Self::Pending { first, .. } => Some(first),
        }
    }

    pub(crate) fn prev(self) -> Option<Address> {
        match self {
            Self::End => None,
            Self::Pending { prev, .. } => prev,
        }
    }
}

/// The card aligned core `[start, end)` of a free entry. `end` may lie
/// below `start` when the entry sits inside a single card.
pub(crate) fn aligned_core(entry: Address, size: usize, card_size: usize) -> (Address, Address) {
    (entry.align_up(card_size), (entry + size).align_down(card_size))
}

/// Bytes realigning the entry would give up, the whole entry when its
/// aligned core is too small to stay on the list.
pub(crate) fn realignment_loss(entry: Address, size: usize, card_size: usize, minimum: usize) -> usize {
    let (start, end) = aligned_core(entry, size, card_size);
    if end <= start || end - start < minimum {
        size
    } else {
        size - (end - start)
    }
}

/// TLH boundaries for a parallel sweep: no TLH may cross a multiple of
/// `size` counted from `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParallelGcAlignment {
    pub(crate) base: Address,
    pub(crate) size: usize,
}

impl ParallelGcAlignment {
    /// Shrink `consumed` bytes starting at `entry` to end at the next
    /// boundary at most.
    pub(crate) fn clip(&self, entry: Address, consumed: usize) -> usize {
        assert!(
            entry >= self.base,
            "free entry {entry} lies below the alignment base {}",
            self.base
        );
        let remainder = (entry - self.base) % self.size;
        let top_boundary = entry + (self.size - remainder);
        let projected_top = entry + consumed;
        if projected_top > top_boundary {
            consumed - (projected_top - top_boundary)
        } else {
            consumed
        }
    }
}
