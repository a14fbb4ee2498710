//! Logical addresses for the hybrid log and the read cache.
//!
//! An address is a 48-bit monotonically increasing position in one of the
//! two record rings. Bit 47 (the read-cache bit) selects which ring the
//! address resolves against; the low 47 bits are the linear position within
//! that ring. `Address::INVALID` (zero) terminates every hash chain.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// A 48-bit logical address into one of the record rings.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Address(u64);

impl Address {
    /// The invalid address. No live record is ever placed at zero; both
    /// rings begin allocation at [`Address::FIRST_VALID`].
    pub const INVALID: Self = Self(0);

    /// Total number of address bits.
    pub const ADDRESS_BITS: u32 = 48;

    /// Mask covering the full 48-bit address, read-cache bit included.
    pub const ADDRESS_MASK: u64 = (1 << Self::ADDRESS_BITS) - 1;

    /// The read-cache bit (bit 47) selecting the ring.
    pub const READ_CACHE_BIT: u64 = 1 << (Self::ADDRESS_BITS - 1);

    /// Largest in-ring position (47 usable bits).
    pub const MAX_ADDRESS: u64 = Self::READ_CACHE_BIT - 1;

    /// First address handed out by a ring. Keeps zero reserved for
    /// [`Address::INVALID`] and leaves a dead cache line at the ring start.
    pub const FIRST_VALID: Self = Self(64);

    /// Create an address from a raw control value.
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control & Self::ADDRESS_MASK)
    }

    /// Raw control value, read-cache bit included.
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Whether the read-cache bit is set.
    #[inline]
    pub const fn in_read_cache(&self) -> bool {
        (self.0 & Self::READ_CACHE_BIT) != 0
    }

    /// The in-ring position, read-cache bit stripped.
    #[inline]
    pub const fn without_read_cache_bit(&self) -> Self {
        Self(self.0 & !Self::READ_CACHE_BIT)
    }

    /// The same position tagged as a read-cache address.
    #[inline]
    pub const fn with_read_cache_bit(&self) -> Self {
        Self(self.0 | Self::READ_CACHE_BIT)
    }

    /// Whether this is the invalid address.
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == 0
    }

    /// Whether this address refers to a record (in either ring).
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Page number for a ring with pages of `1 << page_size_bits` bytes.
    ///
    /// Only meaningful with the read-cache bit stripped.
    #[inline]
    pub const fn page(&self, page_size_bits: u32) -> u64 {
        self.0 >> page_size_bits
    }

    /// Offset within the page for a ring with pages of
    /// `1 << page_size_bits` bytes.
    #[inline]
    pub const fn offset(&self, page_size_bits: u32) -> u64 {
        self.0 & ((1u64 << page_size_bits) - 1)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.in_read_cache() {
            write!(f, "Address(rc:{})", self.without_read_cache_bit().0)
        } else {
            write!(f, "Address({})", self.0)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.in_read_cache() {
            write!(f, "rc:{}", self.without_read_cache_bit().0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for Address {
    type Output = Self;

    #[inline]
    fn add(self, delta: u64) -> Self::Output {
        debug_assert!(self.0 + delta <= Self::MAX_ADDRESS || self.in_read_cache());
        Self(self.0 + delta)
    }
}

impl Sub for Address {
    type Output = u64;

    #[inline]
    fn sub(self, other: Self) -> Self::Output {
        debug_assert!(self.0 >= other.0);
        self.0 - other.0
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(control: u64) -> Self {
        Self::from_control(control)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Atomic cell holding an [`Address`].
#[repr(transparent)]
pub struct AtomicAddress {
    control: AtomicU64,
}

impl AtomicAddress {
    /// Create a new atomic address.
    #[inline]
    pub const fn new(address: Address) -> Self {
        Self {
            control: AtomicU64::new(address.0),
        }
    }

    /// Load the address.
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Address {
        Address(self.control.load(ordering))
    }

    /// Store an address.
    #[inline]
    pub fn store(&self, address: Address, ordering: AtomicOrdering) {
        self.control.store(address.0, ordering);
    }

    /// Compare and exchange.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<Address, Address> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(Address)
            .map_err(Address)
    }

    /// Monotonically advance to `new`. Returns `true` if this call moved the
    /// address forward, `false` if it was already at or past `new`.
    pub fn advance_to(&self, new: Address) -> bool {
        loop {
            let current = self.load(AtomicOrdering::Acquire);
            if new <= current {
                return false;
            }
            if self
                .compare_exchange(current, new, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

impl Default for AtomicAddress {
    fn default() -> Self {
        Self::new(Address::INVALID)
    }
}

impl fmt::Debug for AtomicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicAddress({:?})", self.load(AtomicOrdering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_is_zero() {
        assert!(Address::INVALID.is_invalid());
        assert_eq!(Address::INVALID.control(), 0);
        assert!(Address::FIRST_VALID.is_valid());
    }

    #[test]
    fn test_read_cache_bit_round_trip() {
        let addr = Address::from_control(4096);
        assert!(!addr.in_read_cache());

        let tagged = addr.with_read_cache_bit();
        assert!(tagged.in_read_cache());
        assert_eq!(tagged.without_read_cache_bit(), addr);
    }

    #[test]
    fn test_page_and_offset() {
        let addr = Address::from_control((3 << 12) | 40);
        assert_eq!(addr.page(12), 3);
        assert_eq!(addr.offset(12), 40);
    }

    #[test]
    fn test_ordering_and_arithmetic() {
        let a = Address::from_control(100);
        let b = a + 24;
        assert!(a < b);
        assert_eq!(b - a, 24);
    }

    #[test]
    fn test_atomic_advance_to() {
        let atomic = AtomicAddress::new(Address::from_control(64));
        assert!(atomic.advance_to(Address::from_control(128)));
        assert!(!atomic.advance_to(Address::from_control(100)));
        assert_eq!(
            atomic.load(AtomicOrdering::Relaxed),
            Address::from_control(128)
        );
    }
}
