use serde::{Deserialize, Serialize};

use super::macros::impl_ops;

impl_ops!(GuestAddress, u32, "Guest Memory Address");
impl_ops!(ResourceHandle, u64, "Device Resource Handle");

impl GuestAddress {
    /// Rounds the address down to a multiple of `alignment`.
    ///
    /// `alignment` must be a power of two.
    pub fn align_down(self, alignment: u32) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self(self.0 & !(alignment - 1))
    }

    /// Checks if the address is a multiple of `alignment`.
    pub fn is_aligned(self, alignment: u32) -> bool {
        debug_assert!(alignment.is_power_of_two());
        self.0 & (alignment - 1) == 0
    }
}

/// Rounds `value` up to a multiple of `alignment`.
///
/// The result is computed in 64 bits so that ranges ending at the top of the
/// 32-bit guest address space do not wrap.
pub fn align_up(value: u64, alignment: u32) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    let mask = u64::from(alignment) - 1;
    (value + mask) & !mask
}

/// A half-open byte range `[start, start + size)` in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    /// First byte of the range.
    pub start: GuestAddress,

    /// Length of the range in bytes.
    pub size: u32,
}

impl AddressRange {
    /// Creates a new range.
    pub fn new(start: GuestAddress, size: u32) -> Self {
        Self { start, size }
    }

    /// Creates a range from its (exclusive) end.
    ///
    /// Returns `None` if the range would not fit the 32-bit address space.
    pub fn from_bounds(start: GuestAddress, end: u64) -> Option<Self> {
        let size = end.checked_sub(u64::from(start.0))?;
        Some(Self {
            start,
            size: u32::try_from(size).ok()?,
        })
    }

    /// Returns the exclusive end of the range.
    pub fn end(&self) -> u64 {
        u64::from(self.start.0) + u64::from(self.size)
    }

    /// Checks if the two ranges share at least one byte.
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        u64::from(self.start.0) < other.end() && self.end() > u64::from(other.start.0)
    }

    /// Checks if `other` lies entirely within this range.
    pub fn contains(&self, other: &AddressRange) -> bool {
        self.start <= other.start && self.end() >= other.end()
    }

    /// Checks if the given address lies within this range.
    pub fn contains_address(&self, address: GuestAddress) -> bool {
        self.start <= address && u64::from(address.0) < self.end()
    }

    /// Returns the smallest range aligned to `page_size` covering this one.
    ///
    /// Returns `None` if the aligned range would not fit the 32-bit address
    /// space.
    pub fn page_aligned(&self, page_size: u32) -> Option<Self> {
        let start = self.start.align_down(page_size);
        Self::from_bounds(start, align_up(self.end(), page_size))
    }

    /// Returns the smallest range covering both ranges.
    pub fn union(&self, other: &AddressRange) -> Option<Self> {
        let start = self.start.min(other.start);
        Self::from_bounds(start, self.end().max(other.end()))
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}, 0x{:08x})", self.start, self.end())
    }
}
