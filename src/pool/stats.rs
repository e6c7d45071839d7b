//! pool statistics
//!
//! `LargeObjectAllocateStats` buckets sizes into power of two classes, the
//! class of a size is its bit length

const SIZE_CLASS_COUNT: usize = usize::BITS as usize + 1;

pub(crate) fn size_class_for(size: usize) -> usize {
    (usize::BITS - size.leading_zeros()) as usize
}

/// Count and byte totals per size class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClassHistogram {
    counts: [usize; SIZE_CLASS_COUNT],
    bytes: [usize; SIZE_CLASS_COUNT],
}

impl Default for SizeClassHistogram {
    fn default() -> Self {
        Self {
            counts: [0; SIZE_CLASS_COUNT],
            bytes: [0; SIZE_CLASS_COUNT],
        }
    }
}

impl SizeClassHistogram {
    fn increment(&mut self, size: usize) {
        let class = size_class_for(size);
        self.counts[class] += 1;
        self.bytes[class] += size;
    }

    fn decrement(&mut self, size: usize) {
        let class = size_class_for(size);
        debug_assert!(self.counts[class] > 0, "no entry of {size} bytes recorded");
        self.counts[class] = self.counts[class].saturating_sub(1);
        self.bytes[class] = self.bytes[class].saturating_sub(size);
    }

    pub fn count_for_class(&self, class: usize) -> usize {
        self.counts.get(class).copied().unwrap_or(0)
    }

    /// Number of recorded sizes falling into the class of `size`.
    pub fn count_for_size(&self, size: usize) -> usize {
        self.counts[size_class_for(size)]
    }

    pub fn total_count(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.bytes.iter().sum()
    }

    fn merge(&mut self, other: &Self) {
        for class in 0..SIZE_CLASS_COUNT {
            self.counts[class] += other.counts[class];
            self.bytes[class] += other.bytes[class];
        }
    }
}

/// Size class histograms of free entries and of object and TLH allocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LargeObjectAllocateStats {
    free_entries: SizeClassHistogram,
    objects: SizeClassHistogram,
    tlhs: SizeClassHistogram,
}

impl LargeObjectAllocateStats {
    pub fn increment_free_entry(&mut self, size: usize) {
        if size > 0 {
            self.free_entries.increment(size);
        }
    }

    pub fn decrement_free_entry(&mut self, size: usize) {
        if size > 0 {
            self.free_entries.decrement(size);
        }
    }

    pub fn allocate_object(&mut self, size: usize) {
        self.objects.increment(size);
    }

    pub fn increment_tlh_alloc(&mut self, size: usize) {
        self.tlhs.increment(size);
    }

    pub fn free_entries(&self) -> &SizeClassHistogram {
        &self.free_entries
    }

    pub fn objects(&self) -> &SizeClassHistogram {
        &self.objects
    }

    pub fn tlhs(&self) -> &SizeClassHistogram {
        &self.tlhs
    }

    pub fn free_entry_count_for_class(&self, class: usize) -> usize {
        self.free_entries.count_for_class(class)
    }

    pub fn total_free_entry_bytes(&self) -> usize {
        self.free_entries.total_bytes()
    }

    pub fn reset_free_entries(&mut self) {
        self.free_entries = SizeClassHistogram::default();
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn merge(&mut self, other: &Self) {
        self.free_entries.merge(&other.free_entries);
        self.objects.merge(&other.objects);
        self.tlhs.merge(&other.tlhs);
    }
}

/// Allocation counters of a pool, only mutated under the heap lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub alloc_count: usize,
    pub alloc_bytes: usize,
    /// free entries stepped over by first-fit walks
    pub alloc_search_count: usize,
    /// remainders too small to keep on the list
    pub alloc_discarded_bytes: usize,
    /// bytes lost to card realignment
    pub dark_matter_bytes: usize,
}
