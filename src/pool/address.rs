use core::fmt;
use core::ops::{Add, Sub};

/// A heap address managed by a [`MemoryPool`](super::MemoryPool).
///
/// the pool only does arithmetic on addresses, it never dereferences them
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    pub const ZERO: Self = Self(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Bytes between `lower` and `self`.
    pub const fn distance_from(self, lower: Address) -> usize {
        debug_assert!(lower.0 <= self.0);
        self.0 - lower.0
    }

    /// Round up to a multiple of `unit`.
    pub const fn align_up(self, unit: usize) -> Self {
        Self(self.0.div_ceil(unit) * unit)
    }

    /// Round down to a multiple of `unit`.
    pub const fn align_down(self, unit: usize) -> Self {
        Self(self.0 - self.0 % unit)
    }

    pub const fn is_aligned_to(self, unit: usize) -> bool {
        self.0 % unit == 0
    }
}

impl Add<usize> for Address {
    type Output = Address;

    fn add(self, bytes: usize) -> Address {
        self.offset(bytes)
    }
}

impl Sub<Address> for Address {
    type Output = usize;

    fn sub(self, lower: Address) -> usize {
        self.distance_from(lower)
    }
}

impl From<usize> for Address {
    fn from(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A half open `[low, high)` address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRegion {
    pub low: Address,
    pub high: Address,
}

impl HeapRegion {
    pub const fn new(low: Address, high: Address) -> Self {
        Self { low, high }
    }

    pub fn size(&self) -> usize {
        self.high - self.low
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.low <= addr && addr < self.high
    }
}

/// A free range handed into or out of the pool.
pub type FreeRange = HeapRegion;
