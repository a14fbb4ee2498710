//! Record layout for both rings.
//!
//! Every record starts with an 8-byte [`RecordInfo`] header followed by the
//! key and the value, each padded to its natural alignment. The header packs
//! the chain link, the record state bits, and the key-lock word into a
//! single atomic u64 so that all header transitions are CAS transitions.

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::utility::{murmur3_finalize, pad_alignment};

/// Snapshot of the lock word of a record header or a lock-table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockState {
    /// Whether the exclusive lock is held.
    pub exclusive: bool,
    /// Number of shared holders.
    pub shared_count: u32,
}

impl LockState {
    /// A state with no locks held.
    pub const UNLOCKED: Self = Self {
        exclusive: false,
        shared_count: 0,
    };

    /// Whether any lock is held.
    #[inline]
    pub const fn is_locked(&self) -> bool {
        self.exclusive || self.shared_count > 0
    }

    /// Merge another state into this one (used when an evicted record's
    /// locks join an existing lock-table entry).
    #[inline]
    pub fn merge(&mut self, other: LockState) {
        self.exclusive |= other.exclusive;
        self.shared_count += other.shared_count;
    }
}

/// Record header.
///
/// Bit layout of the control word:
///
/// ```text
///  0..=47  previous address in the hash chain (bit 47 = read-cache bit)
/// 48..=53  shared lock count
///      54  exclusive lock
///      55  sealed (record is mid-transition; readers and lockers retry)
///      56  invalid (logically absent, still occupies its chain slot)
///      57  tombstone (delete marker)
///      58  modified (dirty since the last checkpoint)
/// ```
#[repr(C)]
pub struct RecordInfo {
    control: AtomicU64,
}

impl RecordInfo {
    const PREV_ADDR_MASK: u64 = (1 << 48) - 1;

    const SHARED_SHIFT: u32 = 48;
    const SHARED_COUNT_MASK: u64 = (1 << 6) - 1;
    /// Maximum number of concurrent shared holders per record.
    pub const MAX_SHARED: u32 = Self::SHARED_COUNT_MASK as u32;

    const EXCLUSIVE_BIT: u64 = 1 << 54;
    const SEALED_BIT: u64 = 1 << 55;
    const INVALID_BIT: u64 = 1 << 56;
    const TOMBSTONE_BIT: u64 = 1 << 57;
    const MODIFIED_BIT: u64 = 1 << 58;

    const LOCK_MASK: u64 = (Self::SHARED_COUNT_MASK << Self::SHARED_SHIFT) | Self::EXCLUSIVE_BIT;

    /// Create a header for a freshly appended record.
    ///
    /// New records are born modified so that a header control word is never
    /// all-zero (an all-zero word marks unused ring space).
    pub fn new(previous_address: Address, tombstone: bool) -> Self {
        let mut control =
            (previous_address.control() & Self::PREV_ADDR_MASK) | Self::MODIFIED_BIT;
        if tombstone {
            control |= Self::TOMBSTONE_BIT;
        }
        Self {
            control: AtomicU64::new(control),
        }
    }

    /// Reconstruct a header from a raw control word (disk reads).
    pub fn from_control(control: u64) -> Self {
        Self {
            control: AtomicU64::new(control),
        }
    }

    /// Reconstruct a header from flushed bytes. Lock and seal bits are
    /// transient in-memory state and are stripped on the way back in.
    pub fn from_disk(control: u64) -> Self {
        Self::from_control(control & !(Self::LOCK_MASK | Self::SEALED_BIT))
    }

    /// Raw control word.
    #[inline]
    pub fn control(&self) -> u64 {
        self.control.load(Ordering::Acquire)
    }

    /// Whether the header is all-zero, i.e. unused ring space.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.control() == 0
    }

    /// Previous record in the hash chain (may carry the read-cache bit).
    #[inline]
    pub fn previous_address(&self) -> Address {
        Address::from_control(self.control() & Self::PREV_ADDR_MASK)
    }

    /// Unconditionally rewrite the chain link, preserving all other bits.
    ///
    /// Only the eviction sweep uses this; it is the sole writer of links on
    /// records above the eviction range.
    pub fn set_previous_address(&self, addr: Address) {
        let _ = self
            .control
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some((cur & !Self::PREV_ADDR_MASK) | (addr.control() & Self::PREV_ADDR_MASK))
            });
    }

    /// CAS the chain link from `expected` to `new`. Fails if the link
    /// changed or the record has been sealed; a sealed record is leaving
    /// the chain and must not receive new splices.
    pub fn try_update_previous_address(&self, expected: Address, new: Address) -> bool {
        loop {
            let cur = self.control();
            if (cur & Self::SEALED_BIT) != 0 {
                return false;
            }
            if (cur & Self::PREV_ADDR_MASK) != (expected.control() & Self::PREV_ADDR_MASK) {
                return false;
            }
            let desired = (cur & !Self::PREV_ADDR_MASK) | (new.control() & Self::PREV_ADDR_MASK);
            match self.control.compare_exchange_weak(
                cur,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// Whether the record is logically absent.
    #[inline]
    pub fn is_invalid(&self) -> bool {
        (self.control() & Self::INVALID_BIT) != 0
    }

    /// Mark the record invalid. Invalid records stay in the chain for
    /// navigation until eviction removes them.
    #[inline]
    pub fn set_invalid(&self) {
        self.control.fetch_or(Self::INVALID_BIT, Ordering::AcqRel);
    }

    /// Whether this is a delete marker.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        (self.control() & Self::TOMBSTONE_BIT) != 0
    }

    /// Set the tombstone bit (in-place delete short circuit).
    #[inline]
    pub fn set_tombstone(&self) {
        self.control.fetch_or(Self::TOMBSTONE_BIT, Ordering::AcqRel);
    }

    /// Whether the record is mid-transition.
    #[inline]
    pub fn is_sealed(&self) -> bool {
        (self.control() & Self::SEALED_BIT) != 0
    }

    /// Try to seal the record. Returns `false` if it was already sealed.
    pub fn try_seal(&self) -> bool {
        let prev = self.control.fetch_or(Self::SEALED_BIT, Ordering::AcqRel);
        (prev & Self::SEALED_BIT) == 0
    }

    /// Clear the sealed bit (a failed transition backs out).
    #[inline]
    pub fn unseal(&self) {
        self.control.fetch_and(!Self::SEALED_BIT, Ordering::AcqRel);
    }

    /// Whether the record is dirty since the last checkpoint.
    #[inline]
    pub fn is_modified(&self) -> bool {
        (self.control() & Self::MODIFIED_BIT) != 0
    }

    /// Set the dirty bit.
    #[inline]
    pub fn set_modified(&self) {
        self.control.fetch_or(Self::MODIFIED_BIT, Ordering::AcqRel);
    }

    /// Clear the dirty bit (`ResetModifiedBit` read flag).
    #[inline]
    pub fn clear_modified(&self) {
        self.control.fetch_and(!Self::MODIFIED_BIT, Ordering::AcqRel);
    }

    /// Current lock word.
    pub fn lock_state(&self) -> LockState {
        let control = self.control();
        LockState {
            exclusive: (control & Self::EXCLUSIVE_BIT) != 0,
            shared_count: ((control >> Self::SHARED_SHIFT) & Self::SHARED_COUNT_MASK) as u32,
        }
    }

    /// Try to take the exclusive lock. Fails while any lock is held or the
    /// record is sealed.
    pub fn try_lock_exclusive(&self) -> bool {
        self.control
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let locked = (cur & Self::LOCK_MASK) != 0;
                let sealed = (cur & Self::SEALED_BIT) != 0;
                if locked || sealed {
                    None
                } else {
                    Some(cur | Self::EXCLUSIVE_BIT)
                }
            })
            .is_ok()
    }

    /// Release the exclusive lock. Returns `false` if it was not held here.
    pub fn try_unlock_exclusive(&self) -> bool {
        self.control
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if (cur & Self::EXCLUSIVE_BIT) == 0 {
                    None
                } else {
                    Some(cur & !Self::EXCLUSIVE_BIT)
                }
            })
            .is_ok()
    }

    /// Try to take a shared lock. Fails while the exclusive lock is held,
    /// the record is sealed, or the shared count saturates.
    pub fn try_lock_shared(&self) -> bool {
        self.control
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let exclusive = (cur & Self::EXCLUSIVE_BIT) != 0;
                let sealed = (cur & Self::SEALED_BIT) != 0;
                let count = (cur >> Self::SHARED_SHIFT) & Self::SHARED_COUNT_MASK;
                if exclusive || sealed || count == Self::SHARED_COUNT_MASK {
                    None
                } else {
                    Some(cur + (1 << Self::SHARED_SHIFT))
                }
            })
            .is_ok()
    }

    /// Release one shared lock. Returns `false` if none was held here.
    pub fn try_unlock_shared(&self) -> bool {
        self.control
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let count = (cur >> Self::SHARED_SHIFT) & Self::SHARED_COUNT_MASK;
                if count == 0 {
                    None
                } else {
                    Some(cur - (1 << Self::SHARED_SHIFT))
                }
            })
            .is_ok()
    }

    /// Atomically clear and return the lock word. The transfer paths use
    /// this so a lock word can be moved exactly once.
    pub fn take_locks(&self) -> LockState {
        let prev = self.control.fetch_and(!Self::LOCK_MASK, Ordering::AcqRel);
        LockState {
            exclusive: (prev & Self::EXCLUSIVE_BIT) != 0,
            shared_count: ((prev >> Self::SHARED_SHIFT) & Self::SHARED_COUNT_MASK) as u32,
        }
    }

    /// Install a lock word into this header. Only used on records that are
    /// not yet published, so no holder can race the install.
    pub fn install_locks(&self, state: LockState) {
        debug_assert!(state.shared_count <= Self::MAX_SHARED);
        let mut bits = (state.shared_count as u64 & Self::SHARED_COUNT_MASK) << Self::SHARED_SHIFT;
        if state.exclusive {
            bits |= Self::EXCLUSIVE_BIT;
        }
        self.control.fetch_or(bits, Ordering::AcqRel);
    }
}

impl Clone for RecordInfo {
    fn clone(&self) -> Self {
        Self {
            control: AtomicU64::new(self.control()),
        }
    }
}

impl Default for RecordInfo {
    fn default() -> Self {
        Self {
            control: AtomicU64::new(0),
        }
    }
}

impl std::fmt::Debug for RecordInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordInfo")
            .field("previous_address", &self.previous_address())
            .field("invalid", &self.is_invalid())
            .field("tombstone", &self.is_tombstone())
            .field("sealed", &self.is_sealed())
            .field("modified", &self.is_modified())
            .field("locks", &self.lock_state())
            .finish()
    }
}

const _: () = assert!(mem::size_of::<RecordInfo>() == 8);

/// A record stored in a ring: header, then key, then value, each padded to
/// its alignment. Accessors compute field offsets from the type layout.
#[repr(C)]
pub struct Record<K, V> {
    /// Record header.
    pub header: RecordInfo,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> Record<K, V> {
    /// Offset of the key from the record start.
    #[inline]
    pub const fn key_offset() -> usize {
        pad_alignment(mem::size_of::<RecordInfo>(), mem::align_of::<K>())
    }

    /// Offset of the value from the record start.
    #[inline]
    pub const fn value_offset() -> usize {
        pad_alignment(Self::key_offset() + mem::size_of::<K>(), mem::align_of::<V>())
    }

    /// Total size of a record, padded so the next header is aligned.
    #[inline]
    pub const fn size() -> usize {
        pad_alignment(
            Self::value_offset() + mem::size_of::<V>(),
            mem::align_of::<RecordInfo>(),
        )
    }

    /// Reference to the key.
    ///
    /// # Safety
    /// The record memory must have been initialized by a ring writer.
    #[inline]
    pub unsafe fn key(&self) -> &K {
        let head = self as *const _ as *const u8;
        &*(head.add(Self::key_offset()) as *const K)
    }

    /// Reference to the value.
    ///
    /// # Safety
    /// Same as [`Record::key`].
    #[inline]
    pub unsafe fn value(&self) -> &V {
        let head = self as *const _ as *const u8;
        &*(head.add(Self::value_offset()) as *const V)
    }

    /// Mutable reference to the value (in-place updates in the mutable
    /// region only).
    ///
    /// # Safety
    /// Same as [`Record::key`], and the caller must hold the record's
    /// update rights (mutable region, not sealed).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn value_mut(&self) -> &mut V {
        let head = self as *const _ as *mut u8;
        &mut *(head.add(Self::value_offset()) as *mut V)
    }

    /// Write `key` and `value` into an uninitialized record body.
    ///
    /// # Safety
    /// `self` must point at `Self::size()` bytes of writable ring space and
    /// the body must not yet be initialized.
    pub unsafe fn write_body(&self, key: &K, value: &V)
    where
        K: Clone,
        V: Clone,
    {
        let head = self as *const _ as *mut u8;
        std::ptr::write(head.add(Self::key_offset()) as *mut K, key.clone());
        std::ptr::write(head.add(Self::value_offset()) as *mut V, value.clone());
    }

    /// Write only the key; the value stays zeroed. Tombstones never expose
    /// their value bytes.
    ///
    /// # Safety
    /// Same as [`Record::write_body`].
    pub unsafe fn write_key(&self, key: &K)
    where
        K: Clone,
    {
        let head = self as *const _ as *mut u8;
        std::ptr::write(head.add(Self::key_offset()) as *mut K, key.clone());
    }
}

impl<K, V> std::fmt::Debug for Record<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record").field("header", &self.header).finish()
    }
}

/// Keys storable in the rings. Fixed-size, cheaply clonable types.
pub trait Key: Clone + Eq + std::hash::Hash + Send + Sync + 'static {
    /// 64-bit hash of the key. Drives bucket selection and the tag.
    fn key_hash(&self) -> u64;
}

/// Values storable in the rings.
pub trait Value: Clone + Send + Sync + 'static {}

impl Key for u64 {
    #[inline]
    fn key_hash(&self) -> u64 {
        murmur3_finalize(*self)
    }
}

impl Key for i64 {
    #[inline]
    fn key_hash(&self) -> u64 {
        murmur3_finalize(*self as u64)
    }
}

impl Key for u32 {
    #[inline]
    fn key_hash(&self) -> u64 {
        murmur3_finalize(*self as u64)
    }
}

impl Value for u64 {}
impl Value for i64 {}
impl Value for u32 {}
impl Value for [u8; 8] {}
impl Value for [u8; 16] {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header_is_nonzero() {
        let info = RecordInfo::new(Address::INVALID, false);
        assert!(!info.is_null());
        assert!(info.is_modified());
        assert!(!info.is_tombstone());
    }

    #[test]
    fn test_previous_address_round_trip() {
        let prev = Address::from_control(12345).with_read_cache_bit();
        let info = RecordInfo::new(prev, false);
        assert_eq!(info.previous_address(), prev);
        assert!(info.previous_address().in_read_cache());
    }

    #[test]
    fn test_try_update_previous_address() {
        let a = Address::from_control(100);
        let b = Address::from_control(200);
        let info = RecordInfo::new(a, false);

        assert!(!info.try_update_previous_address(b, a));
        assert!(info.try_update_previous_address(a, b));
        assert_eq!(info.previous_address(), b);
    }

    #[test]
    fn test_state_bits() {
        let info = RecordInfo::new(Address::INVALID, true);
        assert!(info.is_tombstone());

        assert!(!info.is_invalid());
        info.set_invalid();
        assert!(info.is_invalid());

        assert!(info.try_seal());
        assert!(!info.try_seal());
        info.unseal();
        assert!(info.try_seal());
    }

    #[test]
    fn test_exclusive_lock() {
        let info = RecordInfo::new(Address::INVALID, false);
        assert!(info.try_lock_exclusive());
        assert!(!info.try_lock_exclusive());
        assert!(!info.try_lock_shared());
        assert!(info.try_unlock_exclusive());
        assert!(!info.try_unlock_exclusive());
    }

    #[test]
    fn test_shared_locks() {
        let info = RecordInfo::new(Address::INVALID, false);
        assert!(info.try_lock_shared());
        assert!(info.try_lock_shared());
        assert!(!info.try_lock_exclusive());
        assert_eq!(info.lock_state().shared_count, 2);

        assert!(info.try_unlock_shared());
        assert!(info.try_unlock_shared());
        assert!(!info.try_unlock_shared());
        assert!(info.try_lock_exclusive());
    }

    #[test]
    fn test_sealed_blocks_lockers() {
        let info = RecordInfo::new(Address::INVALID, false);
        assert!(info.try_seal());
        assert!(!info.try_lock_exclusive());
        assert!(!info.try_lock_shared());
        info.unseal();
        assert!(info.try_lock_shared());
    }

    #[test]
    fn test_take_and_install_locks() {
        let info = RecordInfo::new(Address::INVALID, false);
        assert!(info.try_lock_shared());
        assert!(info.try_lock_shared());

        let taken = info.take_locks();
        assert_eq!(taken.shared_count, 2);
        assert!(!taken.exclusive);
        assert!(!info.lock_state().is_locked());

        // A second take sees nothing: the word moves exactly once.
        assert!(!info.take_locks().is_locked());

        let fresh = RecordInfo::new(Address::INVALID, false);
        fresh.install_locks(taken);
        assert_eq!(fresh.lock_state().shared_count, 2);
    }

    #[test]
    fn test_record_layout_u64() {
        type R = Record<u64, u64>;
        assert_eq!(R::key_offset(), 8);
        assert_eq!(R::value_offset(), 16);
        assert_eq!(R::size(), 24);
    }
}
