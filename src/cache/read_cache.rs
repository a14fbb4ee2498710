//! The read-cache ring.
//!
//! A memory-only paged ring holding copies of records fetched from the
//! device. Cache addresses carry the read-cache bit; internally the ring
//! works on stripped linear addresses. Records here are only ever mutated
//! to set the invalid bit or the lock word; the value bytes are immutable
//! once published.

use std::marker::PhantomData;

use crate::address::Address;
use crate::allocator::{HybridLog, HybridLogConfig};
use crate::cache::ReadCacheStats;
use crate::record::{Key, LockState, Record, RecordInfo, Value};
use crate::status::OperationStatus;

/// Read cache over keys `K` and values `V`.
pub struct ReadCache<K, V>
where
    K: Key,
    V: Value,
{
    ring: HybridLog,
    stats: ReadCacheStats,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> ReadCache<K, V>
where
    K: Key,
    V: Value,
{
    /// Create a cache ring with the given sizing.
    pub fn new(config: HybridLogConfig) -> Self {
        assert!(
            Record::<K, V>::size() as u64 <= config.page_size(),
            "record larger than a cache page"
        );
        Self {
            ring: HybridLog::new(config),
            stats: ReadCacheStats::new(),
            _marker: PhantomData,
        }
    }

    /// Counters.
    pub fn stats(&self) -> &ReadCacheStats {
        &self.stats
    }

    /// Tail of the ring (stripped address).
    pub fn tail_address(&self) -> Address {
        self.ring.tail_address()
    }

    /// Head of the ring (stripped address).
    pub fn head_address(&self) -> Address {
        self.ring.head_address()
    }

    /// Safe head of the ring (stripped address).
    pub fn safe_head_address(&self) -> Address {
        self.ring.safe_head_address()
    }

    /// Whether the cache currently holds no live range.
    pub fn is_empty(&self) -> bool {
        self.ring.head_address() == self.ring.tail_address()
    }

    /// Whether `address` (stripped) is still dereferenceable.
    #[inline]
    pub fn is_resident(&self, address: Address) -> bool {
        address >= self.ring.safe_head_address() && address < self.ring.tail_address()
    }

    /// The record at a stripped cache address.
    ///
    /// # Safety
    /// `address` must be resident and the caller epoch-protected.
    #[inline]
    pub unsafe fn record_at(&self, address: Address) -> &Record<K, V> {
        debug_assert!(!address.in_read_cache());
        &*(self.ring.get(address) as *const Record<K, V>)
    }

    /// Copy a record into the cache.
    ///
    /// Writes the header with `previous_address` (the current chain head the
    /// new record will sit above), installs `locks` taken over from the lock
    /// table, and returns the new address tagged with the read-cache bit.
    /// The record is not reachable until the caller publishes it with the
    /// bucket-entry CAS.
    pub fn insert(
        &self,
        key: &K,
        value: &V,
        previous_address: Address,
        locks: LockState,
    ) -> Result<Address, OperationStatus> {
        let size = Record::<K, V>::size() as u32;
        let address = self.ring.allocate(size)?;

        // SAFETY: address was just reserved; nobody else writes this range.
        unsafe {
            let record = &*(self.ring.get(address) as *const Record<K, V>);
            record.write_body(key, value);
            let header = RecordInfo::new(previous_address, false);
            header.install_locks(locks);
            std::ptr::write(self.ring.get(address) as *mut RecordInfo, header);
        }
        self.stats.record_insert();
        Ok(address.with_read_cache_bit())
    }

    /// Stripped addresses of all records in `[from, to)`, in ascending
    /// order. Zeroed page filler after the last record of a page is skipped.
    pub fn record_addresses(&self, from: Address, to: Address) -> Vec<Address> {
        let size = Record::<K, V>::size() as u64;
        let page_size = self.ring.config().page_size();
        let mut out = Vec::new();
        let mut cursor = from.control();
        let end = to.control();

        while cursor < end {
            let offset = cursor & (page_size - 1);
            if offset + size > page_size {
                cursor = (cursor & !(page_size - 1)) + page_size;
                continue;
            }
            let addr = Address::from_control(cursor);
            // SAFETY: addr is within [from, to), which the evictor keeps
            // resident until the sweep completes.
            let record = unsafe { self.record_at(addr) };
            if record.header.is_null() {
                // Rest of the page is unused filler.
                cursor = (cursor & !(page_size - 1)) + page_size;
                continue;
            }
            out.push(addr);
            cursor += size;
        }
        out
    }

    /// Begin evicting `[head, new_head)`: mark the range unreachable for
    /// new traversals. Frame recycling waits for the epoch drain, completed
    /// by [`ReadCache::complete_eviction`].
    pub fn begin_eviction(&self, new_head: Address) -> bool {
        // The ring is memory-only; everything is trivially "flushed".
        self.ring.mark_flushed_until(self.ring.tail_address());
        self.ring.shift_read_only_address(new_head);
        self.ring.shift_head_address(new_head)
    }

    /// Recycle frames after the epoch drained.
    pub fn complete_eviction(&self, new_head: Address) {
        self.ring.complete_head_shift(new_head);
    }

    pub(crate) fn record_hit(&self) {
        self.stats.record_hit();
    }

    pub(crate) fn record_miss(&self) {
        self.stats.record_miss();
    }

    pub(crate) fn record_insert_conflict(&self) {
        self.stats.record_insert_conflict();
    }

    pub(crate) fn record_eviction(&self, records: u64, invalid: u64, lock_transfers: u64) {
        self.stats.record_eviction(records, invalid, lock_transfers);
    }
}
