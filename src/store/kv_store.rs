//! The operation engine.
//!
//! Executes Read/Upsert/RMW/Delete against the bucket chains with CAS-only
//! commit points, drives pending I/O completions, and owns the eviction
//! protocols for both rings. All expected races resolve through internal
//! retry statuses; the only blocking on a mutation path is the short
//! boundary-splice critical section shared with the read-cache evictor.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::address::Address;
use crate::allocator::{HybridLog, HybridLogConfig};
use crate::cache::ReadCache;
use crate::config::StoreSettings;
use crate::device::StorageDevice;
use crate::epoch::LightEpoch;
use crate::index::{HashBucketEntry, HashIndex, KeyHash};
use crate::locks::{LockMode, LockTable, LockTableResult};
use crate::record::{Key, LockState, Record, RecordInfo, Value};
use crate::status::{OperationStatus, Status, StatusDetail};
use crate::store::contexts::{RmwContext, UpdateDecision};
use crate::store::options::ReadOptions;
use crate::store::pending_io::{PendingIoManager, ReadCompletion};

/// Bounded retry budget for transient races before the store gives up and
/// reports itself unhealthy. Real conflicts resolve within a handful of
/// iterations.
const RETRY_LIMIT: u32 = 10_000;

/// Refresh the epoch every this many retries.
const REFRESH_INTERVAL: u32 = 64;

/// Result of a read.
#[derive(Debug, Clone)]
pub struct ReadResult<V> {
    /// Completion status.
    pub status: Status,
    /// Advanced outcome bits.
    pub detail: StatusDetail,
    /// The value snapshot, when found.
    pub value: Option<V>,
}

impl<V> ReadResult<V> {
    fn status_only(status: Status) -> Self {
        Self {
            status,
            detail: StatusDetail::NONE,
            value: None,
        }
    }
}

/// Result of an upsert, RMW, or delete.
#[derive(Debug, Clone, Copy)]
pub struct MutateResult {
    /// Completion status.
    pub status: Status,
    /// Advanced outcome bits.
    pub detail: StatusDetail,
}

impl MutateResult {
    fn status_only(status: Status) -> Self {
        Self {
            status,
            detail: StatusDetail::NONE,
        }
    }

    fn ok(detail: StatusDetail) -> Self {
        Self {
            status: Status::Ok,
            detail,
        }
    }
}

/// Output of a completed pending operation, tagged with the serial number
/// the session assigned when the operation went pending.
#[derive(Debug, Clone)]
pub struct PendingOutput<V> {
    /// Session-assigned serial of the original operation.
    pub serial: u64,
    /// Completion status.
    pub status: Status,
    /// Advanced outcome bits.
    pub detail: StatusDetail,
    /// The value snapshot for reads.
    pub value: Option<V>,
}

enum PendingKind<K: Key, V: Value> {
    Read { options: ReadOptions },
    Rmw { ctx: Box<dyn RmwContext<K, V>> },
}

struct PendingOperation<K: Key, V: Value> {
    kind: PendingKind<K, V>,
    key: K,
    hash: KeyHash,
    serial: u64,
    /// Below-head address where the in-memory traversal handed off.
    handoff: Address,
    /// Device address currently being fetched (walks the disk chain).
    address: Address,
}

/// Per-session execution state. Owned by the session and threaded through
/// the engine; the engine itself holds only shared, epoch-protected
/// structures.
pub struct ExecContext<K: Key, V: Value> {
    pub(crate) thread_id: usize,
    pub(crate) version: u32,
    pub(crate) serial: u64,
    pending: HashMap<u64, PendingOperation<K, V>>,
    outputs: Vec<PendingOutput<V>>,
}

impl<K: Key, V: Value> ExecContext<K, V> {
    pub(crate) fn new(thread_id: usize, version: u32) -> Self {
        Self {
            thread_id,
            version,
            serial: 0,
            pending: HashMap::new(),
            outputs: Vec::new(),
        }
    }

    /// Number of operations awaiting I/O completion.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drain accumulated completion outputs.
    pub fn take_outputs(&mut self) -> Vec<PendingOutput<V>> {
        std::mem::take(&mut self.outputs)
    }
}

/// What the disk resolved for a pending operation.
struct DiskOutcome<V> {
    /// The below-head address the in-memory traversal handed off at.
    address: Address,
    /// `None` when the disk chain ended in a tombstone or ran out.
    value: Option<V>,
}

struct MemoryMatch {
    address: Address,
    mutable: bool,
    tombstone: bool,
    sealed: bool,
}

/// Snapshot of one chain traversal.
struct ChainWalk {
    /// Bucket entry observed at walk start.
    entry_at_walk: HashBucketEntry,
    /// Stripped address of the lowest read-cache record, if any.
    lowest_rc: Address,
    /// First hybrid-log address behind the read-cache prefix.
    latest_hlog: Address,
    /// Stripped address of the live read-cache record for the key, if any.
    rc_match: Address,
    /// Live in-memory hybrid-log record for the key, if any.
    memory_match: Option<MemoryMatch>,
    /// Below-head continuation address when the in-memory walk ran out.
    below_head: Address,
}

impl ChainWalk {
    /// Address of the record the key currently resolves to in memory.
    fn source_address(&self) -> Address {
        if self.rc_match.is_valid() {
            self.rc_match
        } else {
            self.memory_match
                .as_ref()
                .map(|m| m.address)
                .unwrap_or(Address::INVALID)
        }
    }
}

enum WalkResult {
    Done(ChainWalk),
    Retry,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SpliceMode {
    /// CAS the bucket entry to the new hybrid-log head, dropping any
    /// read-cache prefix (upsert).
    BucketEntry,
    /// Splice at the read-cache boundary, preserving the prefix
    /// (delete/RMW/copy-to-tail).
    Boundary,
}

struct SealedSource {
    address: Address,
    in_read_cache: bool,
    locks: Option<LockState>,
}

enum LockTarget<'a> {
    Record(&'a RecordInfo),
    Table,
    Retry,
}

/// The store: hash index in front of a hybrid log and an optional read
/// cache, with the lock table for evicted keys.
pub struct SpliceKv<K, V>
where
    K: Key,
    V: Value,
{
    settings: StoreSettings,
    epoch: LightEpoch,
    index: HashIndex,
    hlog: HybridLog,
    read_cache: Option<ReadCache<K, V>>,
    lock_table: LockTable<K>,
    io: PendingIoManager,
    next_io_id: AtomicU64,
    version: AtomicU32,
    healthy: AtomicBool,
    /// Serializes hybrid-log head shifts.
    hlog_evict_mutex: Mutex<()>,
    /// Serializes read-cache sweeps with boundary splices.
    rc_chain_mutex: Mutex<()>,
    /// Completions drained by one session on behalf of another.
    stray_completions: Mutex<HashMap<u64, ReadCompletion>>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> SpliceKv<K, V>
where
    K: Key,
    V: Value,
{
    /// Create a store over `device`.
    pub fn new<D: StorageDevice>(settings: StoreSettings, device: D) -> Self {
        let hlog = HybridLog::new(HybridLogConfig {
            memory_size_bits: settings.log.memory_size_bits,
            page_size_bits: settings.log.page_size_bits,
        });
        let read_cache = settings.log.read_cache.as_ref().map(|rc| {
            ReadCache::new(HybridLogConfig {
                memory_size_bits: rc.memory_size_bits,
                page_size_bits: rc.page_size_bits,
            })
        });
        Self {
            index: HashIndex::new(settings.table_size),
            epoch: LightEpoch::new(),
            hlog,
            read_cache,
            lock_table: LockTable::new(),
            io: PendingIoManager::new(Arc::new(device)),
            next_io_id: AtomicU64::new(1),
            version: AtomicU32::new(1),
            healthy: AtomicBool::new(true),
            hlog_evict_mutex: Mutex::new(()),
            rc_chain_mutex: Mutex::new(()),
            stray_completions: Mutex::new(HashMap::new()),
            settings,
            _marker: PhantomData,
        }
    }

    /// Store settings.
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// The epoch table.
    pub fn epoch(&self) -> &LightEpoch {
        &self.epoch
    }

    /// The hybrid log.
    pub fn hlog(&self) -> &HybridLog {
        &self.hlog
    }

    /// The read cache, when configured.
    pub fn read_cache(&self) -> Option<&ReadCache<K, V>> {
        self.read_cache.as_ref()
    }

    /// The lock table.
    pub fn lock_table(&self) -> &LockTable<K> {
        &self.lock_table
    }

    /// Whether the store accepts mutations.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Current checkpoint version.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Advance the checkpoint version; in-flight operations observe the
    /// shift and refresh before retrying.
    pub fn bump_version(&self) -> u32 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn mark_unhealthy(&self, reason: &str) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            error!(target: "splicekv::store", reason, "store marked unhealthy");
        }
    }

    #[inline]
    pub(crate) fn index(&self) -> &HashIndex {
        &self.index
    }

    /// The record at an in-memory hybrid-log address.
    ///
    /// # Safety
    /// `address` must be at or above the safe head and below the tail, and
    /// the caller must be epoch-protected.
    #[inline]
    pub(crate) unsafe fn hlog_record_at(&self, address: Address) -> &Record<K, V> {
        &*(self.hlog.get(address) as *const Record<K, V>)
    }

    // ------------------------------------------------------------------
    // Chain traversal
    // ------------------------------------------------------------------

    /// Walk the chain from `entry`, classifying what is in memory for
    /// `key`. Returns `Retry` when a read-cache link left residency under
    /// us (an eviction sweep is re-pointing the chain).
    fn walk_chain(&self, key: &K, entry: HashBucketEntry) -> WalkResult {
        let mut walk = ChainWalk {
            entry_at_walk: entry,
            lowest_rc: Address::INVALID,
            latest_hlog: Address::INVALID,
            rc_match: Address::INVALID,
            memory_match: None,
            below_head: Address::INVALID,
        };

        let mut addr = entry.address();
        while addr.in_read_cache() {
            let Some(rc) = self.read_cache.as_ref() else {
                self.mark_unhealthy("read-cache bit without a read cache");
                return WalkResult::Retry;
            };
            let stripped = addr.without_read_cache_bit();
            if !rc.is_resident(stripped) {
                return WalkResult::Retry;
            }
            walk.lowest_rc = stripped;
            // SAFETY: resident and epoch-protected.
            let record = unsafe { rc.record_at(stripped) };
            if walk.rc_match.is_invalid()
                && !record.header.is_invalid()
                && unsafe { record.key() } == key
            {
                walk.rc_match = stripped;
            }
            let prev = record.header.previous_address();
            if prev.in_read_cache() && prev.without_read_cache_bit() >= stripped {
                self.mark_unhealthy("read-cache chain link does not decrease");
                return WalkResult::Retry;
            }
            addr = prev;
        }

        walk.latest_hlog = addr;

        let head = self.hlog.head_address();
        let mut h = addr;
        while h.is_valid() && h >= head {
            // SAFETY: h is in [head, tail) and we are epoch-protected.
            let record = unsafe { self.hlog_record_at(h) };
            if !record.header.is_invalid() && unsafe { record.key() } == key {
                walk.memory_match = Some(MemoryMatch {
                    address: h,
                    mutable: self.hlog.is_mutable(h),
                    tombstone: record.header.is_tombstone(),
                    sealed: record.header.is_sealed(),
                });
                break;
            }
            let prev = record.header.previous_address();
            if prev.in_read_cache() {
                self.mark_unhealthy("hybrid-log record links into the read cache");
                return WalkResult::Retry;
            }
            if prev.is_valid() && prev >= h {
                self.mark_unhealthy("chain cycle detected");
                return WalkResult::Retry;
            }
            h = prev;
        }

        if walk.memory_match.is_none()
            && h.is_valid()
            && h < head
            && h >= self.hlog.begin_address()
        {
            walk.below_head = h;
        }
        WalkResult::Done(walk)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub(crate) fn read_internal(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        options: &ReadOptions,
    ) -> ReadResult<V> {
        let hash = KeyHash::new(key.key_hash());
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > RETRY_LIMIT {
                self.mark_unhealthy("read retry budget exhausted");
                return ReadResult::status_only(Status::Corruption);
            }
            if attempt % REFRESH_INTERVAL == 0 {
                self.refresh_session(exec);
                std::thread::yield_now();
            }

            match self.read_once(exec, key, hash, options, None) {
                Ok(result) => return result,
                Err(status) if status.needs_retry() => continue,
                Err(OperationStatus::RecordOnDisk) => {
                    // read_once enqueued the I/O.
                    return ReadResult::status_only(Status::Pending);
                }
                Err(other) => return ReadResult::status_only(other.to_status()),
            }
        }
    }

    /// One traversal attempt. `disk` carries the resolved device record for
    /// completion re-entry; without it, hitting the disk region enqueues an
    /// I/O and returns `RecordOnDisk`.
    fn read_once(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        hash: KeyHash,
        options: &ReadOptions,
        disk: Option<&DiskOutcome<V>>,
    ) -> Result<ReadResult<V>, OperationStatus> {
        self.check_version(exec)?;
        let found = self.index.find_entry(hash);
        if !found.found() {
            return Ok(ReadResult::status_only(Status::NotFound));
        }

        let mut addr = found.entry.address();
        let mut walked_cache = false;

        // Read-cache prefix.
        while addr.in_read_cache() {
            let Some(rc) = self.read_cache.as_ref() else {
                self.mark_unhealthy("read-cache bit without a read cache");
                return Err(OperationStatus::RetryLater);
            };
            let stripped = addr.without_read_cache_bit();
            if !rc.is_resident(stripped) {
                return Err(OperationStatus::RetryNow);
            }
            walked_cache = true;
            // SAFETY: resident and epoch-protected.
            let record = unsafe { rc.record_at(stripped) };
            let serve = !options.disable_read_cache_reads
                && !options.copy_from_device_only
                && !record.header.is_invalid()
                && unsafe { record.key() } == key;
            if serve {
                if record.header.is_sealed() {
                    return Err(OperationStatus::RetryNow);
                }
                rc.record_hit();
                if options.reset_modified {
                    record.header.clear_modified();
                }
                return Ok(ReadResult {
                    status: Status::Ok,
                    detail: StatusDetail::NONE,
                    value: Some(unsafe { record.value() }.clone()),
                });
            }
            addr = record.header.previous_address();
        }
        if walked_cache {
            if let Some(rc) = self.read_cache.as_ref() {
                rc.record_miss();
            }
        }

        // In-memory hybrid log.
        let head = self.hlog.head_address();
        while addr.is_valid() && addr >= head {
            if options.stop_address.is_valid() && addr < options.stop_address {
                return Ok(ReadResult::status_only(Status::NotFound));
            }
            // SAFETY: addr in [head, tail), epoch-protected.
            let record = unsafe { self.hlog_record_at(addr) };
            if !record.header.is_invalid() && unsafe { record.key() } == key {
                if !options.copy_from_device_only {
                    if record.header.is_sealed() {
                        return Err(OperationStatus::RetryNow);
                    }
                    if record.header.is_tombstone() {
                        return Ok(ReadResult::status_only(Status::NotFound));
                    }
                    if options.reset_modified {
                        record.header.clear_modified();
                    }
                    return Ok(ReadResult {
                        status: Status::Ok,
                        detail: StatusDetail::NONE,
                        value: Some(unsafe { record.value() }.clone()),
                    });
                }
                // Device-only read ignores the in-memory copy.
            }
            let prev = record.header.previous_address();
            if prev.in_read_cache() {
                self.mark_unhealthy("hybrid-log record links into the read cache");
                return Err(OperationStatus::RetryLater);
            }
            addr = prev;
        }

        // Disk region.
        if addr.is_valid() && addr >= self.hlog.begin_address() {
            if options.stop_address.is_valid() && addr < options.stop_address {
                return Ok(ReadResult::status_only(Status::NotFound));
            }
            if let Some(disk) = disk {
                if disk.address != addr {
                    // The chain grew a new below-head tail; fetch again.
                    return Err(OperationStatus::RecordOnDisk);
                }
                return match &disk.value {
                    None => Ok(ReadResult::status_only(Status::NotFound)),
                    Some(value) => {
                        let detail = self.install_cold_read(exec, key, hash, value, options);
                        Ok(ReadResult {
                            status: Status::Ok,
                            detail,
                            value: Some(value.clone()),
                        })
                    }
                };
            }
            self.enqueue_read(
                exec,
                key.clone(),
                hash,
                addr,
                PendingKind::Read { options: *options },
            );
            return Err(OperationStatus::RecordOnDisk);
        }

        Ok(ReadResult::status_only(Status::NotFound))
    }

    /// Install a device-resolved value per the read options: read cache by
    /// default, hybrid-log tail under `copy_reads_to_tail`, nothing when
    /// disabled.
    fn install_cold_read(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        hash: KeyHash,
        value: &V,
        options: &ReadOptions,
    ) -> StatusDetail {
        if self.read_cache.is_some() && !options.disable_read_cache_updates {
            return self.try_copy_to_read_cache(exec, key, hash, value);
        }
        if options.copy_reads_to_tail {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                if attempt > RETRY_LIMIT {
                    return StatusDetail::NONE;
                }
                if attempt % REFRESH_INTERVAL == 0 {
                    self.refresh_session(exec);
                }
                match self.append_for_key(
                    exec,
                    key,
                    hash,
                    SpliceMode::Boundary,
                    false,
                    Some(Address::INVALID),
                    |record| {
                        // SAFETY: freshly reserved record space.
                        unsafe { record.write_body(key, value) };
                    },
                ) {
                    Ok(()) => return StatusDetail::COPIED_RECORD,
                    Err(status) if status.needs_retry() => continue,
                    Err(_) => return StatusDetail::NONE,
                }
            }
        }
        StatusDetail::NONE
    }

    /// Copy a cold value into the read cache and publish it as the new
    /// chain head. A concurrent copy of the same key wins idempotently.
    fn try_copy_to_read_cache(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        hash: KeyHash,
        value: &V,
    ) -> StatusDetail {
        let Some(rc) = self.read_cache.as_ref() else {
            return StatusDetail::NONE;
        };
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > RETRY_LIMIT {
                return StatusDetail::NONE;
            }
            if attempt % REFRESH_INTERVAL == 0 {
                self.refresh_session(exec);
                std::thread::yield_now();
            }

            let found = self.index.find_or_create_entry(hash);
            let walk = match self.walk_chain(key, found.entry) {
                WalkResult::Done(walk) => walk,
                WalkResult::Retry => continue,
            };
            // Another read already cached the key, or a mutation put a
            // newer record in memory: nothing to install.
            if walk.rc_match.is_valid() || walk.memory_match.is_some() {
                return StatusDetail::NONE;
            }

            // Take over any lock-table word before publishing.
            let lt_locks = match self.lock_table.begin_transfer(key) {
                None => None,
                Some(Ok(state)) => Some(state),
                Some(Err(())) => {
                    Backoff::new().snooze();
                    continue;
                }
            };

            let new_head = match rc.insert(
                key,
                value,
                found.entry.address(),
                lt_locks.unwrap_or(LockState::UNLOCKED),
            ) {
                Ok(addr) => addr,
                Err(_) => {
                    if lt_locks.is_some() {
                        self.lock_table.abort_transfer(key);
                    }
                    self.make_read_cache_room(exec);
                    continue;
                }
            };

            let cell = found.atomic_entry.expect("entry from find_or_create");
            if self
                .index
                .try_update_entry(cell, found.entry, new_head, hash.tag())
            {
                if lt_locks.is_some() {
                    self.lock_table.commit_transfer(key);
                }
                return StatusDetail::COPIED_TO_READ_CACHE;
            }

            // Lost the publish race; abandon our copy.
            if lt_locks.is_some() {
                self.lock_table.abort_transfer(key);
            }
            // SAFETY: our own unpublished record.
            unsafe {
                rc.record_at(new_head.without_read_cache_bit())
                    .header
                    .set_invalid();
            }
            rc.record_insert_conflict();
        }
    }

    // ------------------------------------------------------------------
    // Upsert / RMW / Delete
    // ------------------------------------------------------------------

    pub(crate) fn upsert_internal(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        value: &V,
    ) -> MutateResult {
        if !self.is_healthy() {
            return MutateResult::status_only(Status::Unhealthy);
        }
        let hash = KeyHash::new(key.key_hash());
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > RETRY_LIMIT {
                self.mark_unhealthy("upsert retry budget exhausted");
                return MutateResult::status_only(Status::Corruption);
            }
            if attempt % REFRESH_INTERVAL == 0 {
                self.refresh_session(exec);
                std::thread::yield_now();
            }
            match self.upsert_once(exec, key, hash, value) {
                Ok(result) => return result,
                Err(status) if status.needs_retry() => continue,
                Err(other) => return MutateResult::status_only(other.to_status()),
            }
        }
    }

    fn upsert_once(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        hash: KeyHash,
        value: &V,
    ) -> Result<MutateResult, OperationStatus> {
        self.check_version(exec)?;
        let found = self.index.find_or_create_entry(hash);
        let walk = match self.walk_chain(key, found.entry) {
            WalkResult::Done(walk) => walk,
            WalkResult::Retry => return Err(OperationStatus::RetryNow),
        };

        // In-place fast path: live record in the mutable region. An
        // ephemeral exclusive lock excludes concurrent in-place writers;
        // if the record is sealed or locked, fall through to the append
        // path, which carries the lock word forward.
        if let Some(m) = &walk.memory_match {
            if m.mutable && !m.tombstone && !m.sealed {
                // SAFETY: in-memory address, epoch-protected.
                let record = unsafe { self.hlog_record_at(m.address) };
                if record.header.try_lock_exclusive() {
                    if record.header.is_tombstone() {
                        record.header.try_unlock_exclusive();
                        return Err(OperationStatus::RetryNow);
                    }
                    // SAFETY: mutable-region record; the value slot may be
                    // overwritten under the ephemeral lock.
                    unsafe { *record.value_mut() = value.clone() };
                    record.header.set_modified();
                    record.header.try_unlock_exclusive();
                    self.invalidate_rc_match(&walk);
                    return Ok(MutateResult::ok(StatusDetail::IN_PLACE_UPDATED));
                }
            }
        }

        // Append at the tail and take over the bucket entry, splicing any
        // read-cache prefix out of the chain in one CAS.
        self.append_for_key(exec, key, hash, SpliceMode::BucketEntry, false, None, |record| {
            // SAFETY: freshly reserved record space.
            unsafe { record.write_body(key, value) };
        })?;
        Ok(MutateResult::ok(StatusDetail::CREATED_RECORD))
    }

    pub(crate) fn delete_internal(&self, exec: &mut ExecContext<K, V>, key: &K) -> MutateResult {
        if !self.is_healthy() {
            return MutateResult::status_only(Status::Unhealthy);
        }
        let hash = KeyHash::new(key.key_hash());
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > RETRY_LIMIT {
                self.mark_unhealthy("delete retry budget exhausted");
                return MutateResult::status_only(Status::Corruption);
            }
            if attempt % REFRESH_INTERVAL == 0 {
                self.refresh_session(exec);
                std::thread::yield_now();
            }
            match self.delete_once(exec, key, hash) {
                Ok(result) => return result,
                Err(status) if status.needs_retry() => continue,
                Err(other) => return MutateResult::status_only(other.to_status()),
            }
        }
    }

    fn delete_once(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        hash: KeyHash,
    ) -> Result<MutateResult, OperationStatus> {
        self.check_version(exec)?;
        let found = self.index.find_entry(hash);
        if !found.found() {
            return Ok(MutateResult::status_only(Status::NotFound));
        }
        let walk = match self.walk_chain(key, found.entry) {
            WalkResult::Done(walk) => walk,
            WalkResult::Retry => return Err(OperationStatus::RetryNow),
        };

        // In-place short circuit: set the tombstone bit on a live
        // mutable-region record; the chain keeps its shape.
        if let Some(m) = &walk.memory_match {
            if m.tombstone {
                return Ok(MutateResult::status_only(Status::NotFound));
            }
            if m.mutable && !m.sealed {
                // SAFETY: in-memory address, epoch-protected.
                let record = unsafe { self.hlog_record_at(m.address) };
                if record.header.try_lock_exclusive() {
                    record.header.set_tombstone();
                    record.header.set_modified();
                    record.header.try_unlock_exclusive();
                    self.invalidate_rc_match(&walk);
                    return Ok(MutateResult::ok(StatusDetail::NONE));
                }
                // Locked or sealed: append a tombstone instead.
            }
        }

        // Append a tombstone behind any read-cache prefix.
        self.append_for_key(exec, key, hash, SpliceMode::Boundary, true, None, |record| {
            // SAFETY: freshly reserved record space; tombstones carry only
            // the key.
            unsafe { record.write_key(key) };
        })?;
        Ok(MutateResult::ok(StatusDetail::CREATED_RECORD))
    }

    pub(crate) fn rmw_internal(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        mut ctx: Box<dyn RmwContext<K, V>>,
    ) -> MutateResult {
        if !self.is_healthy() {
            return MutateResult::status_only(Status::Unhealthy);
        }
        let hash = KeyHash::new(key.key_hash());
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > RETRY_LIMIT {
                self.mark_unhealthy("rmw retry budget exhausted");
                return MutateResult::status_only(Status::Corruption);
            }
            if attempt % REFRESH_INTERVAL == 0 {
                self.refresh_session(exec);
                std::thread::yield_now();
            }
            match self.rmw_once(exec, key, hash, &mut *ctx, None) {
                Ok(result) => return result,
                Err(status) if status.needs_retry() => continue,
                Err(OperationStatus::RecordOnDisk) => {
                    let address = match self.disk_handoff_address(key, hash) {
                        Some(addr) => addr,
                        None => continue,
                    };
                    self.enqueue_read(exec, key.clone(), hash, address, PendingKind::Rmw { ctx });
                    return MutateResult::status_only(Status::Pending);
                }
                Err(other) => return MutateResult::status_only(other.to_status()),
            }
        }
    }

    fn rmw_once(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        hash: KeyHash,
        ctx: &mut dyn RmwContext<K, V>,
        disk: Option<&DiskOutcome<V>>,
    ) -> Result<MutateResult, OperationStatus> {
        self.check_version(exec)?;
        let found = self.index.find_or_create_entry(hash);
        let walk = match self.walk_chain(key, found.entry) {
            WalkResult::Done(walk) => walk,
            WalkResult::Retry => return Err(OperationStatus::RetryNow),
        };

        // Resolve the current value, preferring in-memory copies.
        let source_addr = walk.source_address();
        let old_value: Option<V> = if walk.rc_match.is_valid() {
            let rc = self.read_cache.as_ref().expect("rc match implies cache");
            // SAFETY: resident, epoch-protected.
            let record = unsafe { rc.record_at(walk.rc_match) };
            if record.header.is_sealed() {
                return Err(OperationStatus::RetryNow);
            }
            Some(unsafe { record.value() }.clone())
        } else if let Some(m) = &walk.memory_match {
            if m.tombstone {
                None
            } else {
                // SAFETY: in-memory address, epoch-protected.
                let record = unsafe { self.hlog_record_at(m.address) };
                if record.header.is_sealed() {
                    return Err(OperationStatus::RetryNow);
                }

                if m.mutable {
                    // Mutable-region source: update in place under an
                    // ephemeral exclusive lock. Copying from here would
                    // race concurrent in-place writers, so contention
                    // retries instead of falling back.
                    if !record.header.try_lock_exclusive() {
                        return Err(OperationStatus::RetryNow);
                    }
                    if record.header.is_tombstone() {
                        record.header.try_unlock_exclusive();
                        return Err(OperationStatus::RetryNow);
                    }
                    // SAFETY: mutable-region record, locked.
                    let slot = unsafe { record.value_mut() };
                    match ctx.in_place_update(slot) {
                        UpdateDecision::Updated => {
                            record.header.set_modified();
                            record.header.try_unlock_exclusive();
                            self.invalidate_rc_match(&walk);
                            return Ok(MutateResult::ok(StatusDetail::IN_PLACE_UPDATED));
                        }
                        UpdateDecision::Cancel => {
                            record.header.try_unlock_exclusive();
                            return Err(OperationStatus::Canceled);
                        }
                        UpdateDecision::NeedCopy => {
                            // Snapshot the value while still holding the
                            // lock; the append below re-validates the
                            // source identity.
                            let snapshot = unsafe { record.value() }.clone();
                            record.header.try_unlock_exclusive();
                            Some(snapshot)
                        }
                    }
                } else {
                    // Immutable-region source: no in-place writers exist.
                    Some(unsafe { record.value() }.clone())
                }
            }
        } else if walk.below_head.is_valid() {
            match disk {
                Some(disk) if disk.address == walk.below_head => disk.value.clone(),
                _ => return Err(OperationStatus::RecordOnDisk),
            }
        } else {
            None
        };

        match old_value {
            Some(old) => {
                if ctx.is_expired(&old) {
                    self.append_for_key(
                        exec,
                        key,
                        hash,
                        SpliceMode::Boundary,
                        true,
                        Some(source_addr),
                        |record| {
                            // SAFETY: freshly reserved record space.
                            unsafe { record.write_key(key) };
                        },
                    )?;
                    return Ok(MutateResult::ok(
                        StatusDetail::EXPIRED.with(StatusDetail::CREATED_RECORD),
                    ));
                }
                let new_value = ctx.copy_update(&old);
                self.append_for_key(
                    exec,
                    key,
                    hash,
                    SpliceMode::Boundary,
                    false,
                    Some(source_addr),
                    |record| {
                        // SAFETY: freshly reserved record space.
                        unsafe { record.write_body(key, &new_value) };
                    },
                )?;
                Ok(MutateResult::ok(StatusDetail::COPY_UPDATED))
            }
            None => {
                let initial = ctx.initial_value();
                self.append_for_key(
                    exec,
                    key,
                    hash,
                    SpliceMode::Boundary,
                    false,
                    Some(Address::INVALID),
                    |record| {
                        // SAFETY: freshly reserved record space.
                        unsafe { record.write_body(key, &initial) };
                    },
                )?;
                Ok(MutateResult::ok(StatusDetail::CREATED_RECORD))
            }
        }
    }

    // ------------------------------------------------------------------
    // Append + splice
    // ------------------------------------------------------------------

    /// Append a record for `key` at the hybrid-log tail and splice it into
    /// the chain.
    ///
    /// `expected_source` pins the identity of the record the caller derived
    /// its input from: the splice is abandoned (and the caller retries) if
    /// the chain resolves the key differently by the time we publish.
    /// The lock word of the superseded record, or the lock table's word for
    /// the key, moves into the new record before the publishing CAS.
    fn append_for_key(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        hash: KeyHash,
        mode: SpliceMode,
        tombstone: bool,
        expected_source: Option<Address>,
        write: impl FnOnce(&Record<K, V>),
    ) -> Result<(), OperationStatus> {
        // Reserve space and fill the body before taking any latch; the
        // header's chain link lands after the walk is validated.
        let new_addr = self.allocate_hlog(exec, Record::<K, V>::size() as u32)?;
        // SAFETY: freshly reserved, zeroed record space.
        let new_record = unsafe { self.hlog_record_at(new_addr) };
        // SAFETY: header slot of our unpublished record.
        unsafe {
            std::ptr::write(
                self.hlog.get(new_addr) as *mut RecordInfo,
                RecordInfo::new(Address::INVALID, tombstone),
            );
        }
        write(new_record);

        let peek = self.index.find_or_create_entry(hash);
        // Boundary splices share a critical section with the read-cache
        // evictor: the link of a record being swept must not receive a
        // splice.
        let needs_latch =
            mode == SpliceMode::Boundary && peek.entry.address().in_read_cache();
        let _guard = if needs_latch {
            Some(self.rc_chain_mutex.lock())
        } else {
            None
        };
        // Re-resolve under the latch; the entry may have moved while we
        // waited.
        let found = if _guard.is_some() {
            self.index.find_or_create_entry(hash)
        } else {
            peek
        };

        let walk = match self.walk_chain(key, found.entry) {
            WalkResult::Done(walk) => walk,
            WalkResult::Retry => {
                new_record.header.set_invalid();
                return Err(OperationStatus::RetryNow);
            }
        };
        if mode == SpliceMode::Boundary && walk.lowest_rc.is_valid() && _guard.is_none() {
            // A prefix appeared after the unlatched peek; retry latched.
            new_record.header.set_invalid();
            return Err(OperationStatus::RetryNow);
        }
        if let Some(expected) = expected_source {
            if walk.source_address() != expected {
                new_record.header.set_invalid();
                return Err(OperationStatus::RetryNow);
            }
        }
        new_record.header.set_previous_address(walk.latest_hlog);

        let source = match self.seal_source(&walk) {
            Ok(source) => source,
            Err(status) => {
                new_record.header.set_invalid();
                return Err(status);
            }
        };
        if let Some(state) = source.locks {
            new_record.header.install_locks(state);
        }
        let lt_taken = if source.address.is_invalid() {
            match self.lock_table.begin_transfer(key) {
                None => false,
                Some(Ok(state)) => {
                    new_record.header.install_locks(state);
                    true
                }
                Some(Err(())) => {
                    self.rollback_source(&source);
                    new_record.header.set_invalid();
                    return Err(OperationStatus::RetryLater);
                }
            }
        } else {
            false
        };

        let spliced = if mode == SpliceMode::BucketEntry || walk.lowest_rc.is_invalid() {
            let cell = found.atomic_entry.expect("entry cell for publish");
            self.index
                .try_update_entry(cell, walk.entry_at_walk, new_addr, hash.tag())
        } else {
            let rc = self.read_cache.as_ref().expect("boundary implies cache");
            // SAFETY: resident (validated by the latched walk) and
            // epoch-protected.
            let boundary = unsafe { rc.record_at(walk.lowest_rc) };
            if source.address == walk.lowest_rc {
                // We sealed the boundary record ourselves; the latch
                // excludes every other writer of this link.
                if boundary.header.previous_address() == walk.latest_hlog {
                    boundary.header.set_previous_address(new_addr);
                    true
                } else {
                    false
                }
            } else {
                boundary
                    .header
                    .try_update_previous_address(walk.latest_hlog, new_addr)
            }
        };

        if spliced {
            if lt_taken {
                self.lock_table.commit_transfer(key);
            }
            self.finish_source(&source);
            self.invalidate_rc_match(&walk);
            if mode == SpliceMode::BucketEntry && walk.entry_at_walk.in_read_cache() {
                self.sweep_orphaned_prefix(&walk);
            }
            Ok(())
        } else {
            if lt_taken {
                self.lock_table.abort_transfer(key);
            }
            self.rollback_source(&source);
            new_record.header.set_invalid();
            Err(OperationStatus::RetryNow)
        }
    }

    // ------------------------------------------------------------------
    // Lock carry between records
    // ------------------------------------------------------------------

    /// Seal the record the key currently resolves to and take its lock
    /// word, so the word can move into the replacement before it
    /// publishes.
    fn seal_source(&self, walk: &ChainWalk) -> Result<SealedSource, OperationStatus> {
        if walk.rc_match.is_valid() {
            let rc = self.read_cache.as_ref().expect("rc match implies cache");
            // SAFETY: resident at walk time; epoch-protected.
            let record = unsafe { rc.record_at(walk.rc_match) };
            if !record.header.try_seal() {
                return Err(OperationStatus::RetryNow);
            }
            return Ok(SealedSource {
                address: walk.rc_match,
                in_read_cache: true,
                locks: Some(record.header.take_locks()),
            });
        }
        if let Some(m) = &walk.memory_match {
            // SAFETY: in-memory address, epoch-protected.
            let record = unsafe { self.hlog_record_at(m.address) };
            if !record.header.try_seal() {
                return Err(OperationStatus::RetryNow);
            }
            let locks = record.header.take_locks();
            if m.mutable && locks.exclusive {
                // The exclusive bit on a mutable-region record may be an
                // ephemeral in-place-writer lock, which must not move to
                // another record. Back out and wait for it to clear.
                record.header.install_locks(locks);
                record.header.unseal();
                return Err(OperationStatus::RetryNow);
            }
            return Ok(SealedSource {
                address: m.address,
                in_read_cache: false,
                locks: Some(locks),
            });
        }
        Ok(SealedSource {
            address: Address::INVALID,
            in_read_cache: false,
            locks: None,
        })
    }

    /// Publish succeeded: the source leaves the live chain. The invalid
    /// bit makes traversals skip it; the seal comes off so the record can
    /// still receive splices on its chain link while it drains out.
    fn finish_source(&self, source: &SealedSource) {
        if source.address.is_invalid() {
            return;
        }
        let header = if source.in_read_cache {
            let rc = self.read_cache.as_ref().expect("sealed rc source");
            // SAFETY: the record stayed resident while sealed under our
            // epoch protection.
            &unsafe { rc.record_at(source.address) }.header
        } else {
            // SAFETY: in-memory address, epoch-protected.
            &unsafe { self.hlog_record_at(source.address) }.header
        };
        header.set_invalid();
        header.unseal();
    }

    /// Publish failed: restore the source's lock word and unseal it.
    fn rollback_source(&self, source: &SealedSource) {
        if source.address.is_invalid() {
            return;
        }
        let header = if source.in_read_cache {
            let rc = self.read_cache.as_ref().expect("sealed rc source");
            // SAFETY: see finish_source.
            &unsafe { rc.record_at(source.address) }.header
        } else {
            // SAFETY: see finish_source.
            &unsafe { self.hlog_record_at(source.address) }.header
        };
        if let Some(state) = source.locks {
            if state.is_locked() {
                header.install_locks(state);
            }
        }
        header.unseal();
    }

    /// Mark the chain's read-cache copy of the key invalid and surrender
    /// any lock word it still holds to the lock table.
    fn invalidate_rc_match(&self, walk: &ChainWalk) {
        if walk.rc_match.is_invalid() {
            return;
        }
        let Some(rc) = self.read_cache.as_ref() else {
            return;
        };
        if !rc.is_resident(walk.rc_match) {
            return;
        }
        // SAFETY: resident, epoch-protected.
        let record = unsafe { rc.record_at(walk.rc_match) };
        record.header.set_invalid();
        let state = record.header.take_locks();
        if state.is_locked() {
            let key = unsafe { record.key() }.clone();
            self.lock_table.merge(&key, state);
        }
    }

    /// After an upsert drops a read-cache prefix from the chain, its
    /// records become unreachable before the ring evicts them; move any
    /// lock words they still hold into the lock table now.
    fn sweep_orphaned_prefix(&self, walk: &ChainWalk) {
        let Some(rc) = self.read_cache.as_ref() else {
            return;
        };
        let mut addr = walk.entry_at_walk.address();
        while addr.in_read_cache() {
            let stripped = addr.without_read_cache_bit();
            if !rc.is_resident(stripped) {
                return;
            }
            // SAFETY: resident, epoch-protected.
            let record = unsafe { rc.record_at(stripped) };
            let state = record.header.take_locks();
            if state.is_locked() {
                let key = unsafe { record.key() }.clone();
                self.lock_table.merge(&key, state);
            }
            addr = record.header.previous_address();
        }
    }

    // ------------------------------------------------------------------
    // Allocation and room-making
    // ------------------------------------------------------------------

    fn allocate_hlog(
        &self,
        exec: &mut ExecContext<K, V>,
        size: u32,
    ) -> Result<Address, OperationStatus> {
        match self.hlog.allocate(size) {
            Ok(addr) => Ok(addr),
            Err(OperationStatus::AllocateFailed) => {
                self.make_hlog_room(exec)?;
                Err(OperationStatus::AllocateFailed)
            }
            Err(other) => Err(other),
        }
    }

    /// Flush and evict the oldest resident hybrid-log page to admit a
    /// stalled allocation.
    fn make_hlog_room(&self, exec: &mut ExecContext<K, V>) -> Result<(), OperationStatus> {
        let _guard = self.hlog_evict_mutex.lock();
        let page_size = self.hlog.config().page_size();
        let head = self.hlog.head_address();
        let tail = self.hlog.tail_address();
        if head == tail {
            return Err(OperationStatus::RetryLater);
        }
        let target = Address::from_control(
            ((head.control() & !(page_size - 1)) + page_size).min(tail.control()),
        );
        self.evict_hlog_until(exec, target)
    }

    /// Make `[head, target)` device-resident: shift the read-only
    /// boundary, flush, sweep lock words, shift the head, and recycle
    /// frames after the epoch drains. Callers hold `hlog_evict_mutex`.
    fn evict_hlog_until(
        &self,
        exec: &mut ExecContext<K, V>,
        target: Address,
    ) -> Result<(), OperationStatus> {
        let head = self.hlog.head_address();
        if target <= head {
            return Ok(());
        }

        self.hlog.shift_read_only_address(target);
        if let Err(e) = self.flush_hlog_until(target) {
            warn!(target: "splicekv::store", error = %e, "page flush failed");
            self.mark_unhealthy("device write failure during flush");
            return Err(OperationStatus::RetryLater);
        }

        // Records leaving memory surrender their lock words to the table.
        self.sweep_hlog_locks(head, target);

        self.hlog.shift_head_address(target);
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            let hlog_ptr = &self.hlog as *const HybridLog as usize;
            self.epoch.bump_current_epoch(move || {
                // SAFETY: sessions hold the store alive via Arc, and the
                // epoch table drains its remaining actions before the
                // store's rings drop.
                let hlog = unsafe { &*(hlog_ptr as *const HybridLog) };
                hlog.complete_head_shift(target);
                done.store(true, Ordering::Release);
            });
        }
        // Drive the drain from this thread.
        let mut spins = 0u32;
        while !done.load(Ordering::Acquire) {
            self.epoch.refresh(exec.thread_id);
            spins += 1;
            if spins > RETRY_LIMIT {
                return Err(OperationStatus::RetryLater);
            }
            std::hint::spin_loop();
        }
        debug!(target: "splicekv::store", upto = target.control(), "hybrid-log eviction complete");
        Ok(())
    }

    fn flush_hlog_until(&self, target: Address) -> std::io::Result<()> {
        let from = self.hlog.flushed_until_address();
        if from >= target {
            return Ok(());
        }
        for span in self.hlog.spans(from, target) {
            // SAFETY: pages between the flushed boundary and the read-only
            // boundary are resident.
            let page = unsafe { self.hlog.page_slice(span.page) };
            let bytes = page[span.start as usize..(span.start + span.len) as usize].to_vec();
            self.io.write_blocking(span.offset, bytes)?;
        }
        self.hlog.mark_flushed_until(target);
        Ok(())
    }

    /// Move lock words of records in `[from, to)` into the lock table.
    fn sweep_hlog_locks(&self, from: Address, to: Address) {
        let size = Record::<K, V>::size() as u64;
        let page_size = self.hlog.config().page_size();
        let mut cursor = from.control();
        let end = to.control();
        while cursor < end {
            let offset = cursor & (page_size - 1);
            if offset + size > page_size {
                cursor = (cursor & !(page_size - 1)) + page_size;
                continue;
            }
            let addr = Address::from_control(cursor);
            // SAFETY: the range is still resident; the head has not moved.
            let record = unsafe { self.hlog_record_at(addr) };
            if record.header.is_null() {
                cursor = (cursor & !(page_size - 1)) + page_size;
                continue;
            }
            let state = record.header.take_locks();
            if state.is_locked() {
                let key = unsafe { record.key() }.clone();
                self.lock_table.merge(&key, state);
            }
            cursor += size;
        }
    }

    /// Evict enough of the read cache to admit a stalled insert (half the
    /// resident range, rounded up to a page).
    fn make_read_cache_room(&self, exec: &mut ExecContext<K, V>) {
        let Some(rc) = self.read_cache.as_ref() else {
            return;
        };
        let head = rc.head_address();
        let tail = rc.tail_address();
        if head >= tail {
            return;
        }
        let page_size = 1u64 << self.settings.read_cache_page_size_bits();
        let halfway = head.control() + (tail - head) / 2;
        let target =
            Address::from_control(((halfway & !(page_size - 1)) + page_size).min(tail.control()));
        self.evict_read_cache_until(exec, target);
    }

    // ------------------------------------------------------------------
    // Read-cache eviction (out-splicing)
    // ------------------------------------------------------------------

    /// Evict the read-cache range `[head, target)`: seal each record,
    /// rewrite the bucket entry or surviving predecessor link to the first
    /// downstream address outside the range, move lock words into the lock
    /// table, then recycle frames once the epoch drains.
    pub(crate) fn evict_read_cache_until(&self, exec: &mut ExecContext<K, V>, target: Address) {
        let Some(rc) = self.read_cache.as_ref() else {
            return;
        };
        let _guard = self.rc_chain_mutex.lock();

        let from = rc.head_address();
        let to = target.min(rc.tail_address());
        if from >= to {
            return;
        }

        // Lowest-first: links point backward, so evicting in ascending
        // order never leaves a dangling forward reference.
        let records = rc.record_addresses(from, to);
        let mut invalid = 0u64;
        let mut transfers = 0u64;
        for &addr in &records {
            // SAFETY: the range stays resident until complete_eviction.
            let record = unsafe { rc.record_at(addr) };
            // Seal first: boundary splices onto this record now fail.
            record.header.try_seal();
            if record.header.is_invalid() {
                invalid += 1;
            }
            let key = unsafe { record.key() }.clone();
            self.unsplice_rc_record(&key, from, to);
            let state = record.header.take_locks();
            if state.is_locked() {
                self.lock_table.merge(&key, state);
                transfers += 1;
            }
        }
        rc.record_eviction(records.len() as u64, invalid, transfers);

        rc.begin_eviction(to);
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            let rc_ptr = rc as *const ReadCache<K, V> as usize;
            self.epoch.bump_current_epoch(move || {
                // SAFETY: see evict_hlog_until.
                let rc = unsafe { &*(rc_ptr as *const ReadCache<K, V>) };
                rc.complete_eviction(to);
                done.store(true, Ordering::Release);
            });
        }
        let mut spins = 0u32;
        while !done.load(Ordering::Acquire) {
            self.epoch.refresh(exec.thread_id);
            spins += 1;
            if spins > RETRY_LIMIT {
                warn!(target: "splicekv::store", "read-cache frame recycle delayed by a lagging thread");
                break;
            }
            std::hint::spin_loop();
        }
        debug!(target: "splicekv::store", upto = to.control(), records = records.len(), "read-cache eviction complete");
    }

    /// Rewrite the chain for `key`'s bucket so no link points into
    /// `[from, to)`. The first caller for a chain bypasses the whole
    /// in-range segment; later callers find nothing to do.
    fn unsplice_rc_record(&self, key: &K, from: Address, to: Address) {
        let rc = self.read_cache.as_ref().expect("evicting implies cache");
        let hash = KeyHash::new(key.key_hash());
        let mut attempt = 0u32;
        'outer: loop {
            attempt += 1;
            if attempt > RETRY_LIMIT {
                self.mark_unhealthy("eviction unsplice budget exhausted");
                return;
            }
            let found = self.index.find_entry(hash);
            if !found.found() || !found.entry.address().in_read_cache() {
                return;
            }

            let mut predecessor: Option<&RecordInfo> = None;
            let mut addr = found.entry.address();
            while addr.in_read_cache() {
                let stripped = addr.without_read_cache_bit();
                if stripped >= to {
                    // Survivor above the range.
                    // SAFETY: resident, epoch-protected.
                    let record = unsafe { rc.record_at(stripped) };
                    predecessor = Some(&record.header);
                    addr = record.header.previous_address();
                    continue;
                }
                if stripped < from {
                    // Below the sweep range; an earlier sweep already
                    // repaired this chain.
                    return;
                }

                // First in-range record: walk past the whole segment.
                let mut cursor = addr;
                while cursor.in_read_cache() {
                    let cs = cursor.without_read_cache_bit();
                    if cs < from || cs >= to {
                        break;
                    }
                    // SAFETY: in-range records stay resident for the sweep.
                    let record = unsafe { rc.record_at(cs) };
                    cursor = record.header.previous_address();
                }

                match predecessor {
                    Some(header) => {
                        // Predecessors are above the range and still in
                        // memory; under the latch the sweep is the only
                        // writer of their links.
                        header.set_previous_address(cursor);
                    }
                    None => {
                        let cell = found.atomic_entry.expect("found entry");
                        if !self
                            .index
                            .try_update_entry(cell, found.entry, cursor, hash.tag())
                        {
                            continue 'outer;
                        }
                    }
                }
                return;
            }
            // No read-cache link in range on this chain.
            return;
        }
    }

    // ------------------------------------------------------------------
    // Explicit flush / evict entry points
    // ------------------------------------------------------------------

    /// Flush the hybrid log to the device and evict everything from
    /// memory; all records become device-resident.
    pub(crate) fn flush_and_evict(&self, exec: &mut ExecContext<K, V>) -> Status {
        let _guard = self.hlog_evict_mutex.lock();
        let tail = self.hlog.tail_address();
        match self.evict_hlog_until(exec, tail) {
            Ok(()) => Status::Ok,
            Err(_) => Status::IoError,
        }
    }

    /// Evict the entire read cache.
    pub(crate) fn evict_read_cache(&self, exec: &mut ExecContext<K, V>) {
        if let Some(rc) = self.read_cache.as_ref() {
            let tail = rc.tail_address();
            self.evict_read_cache_until(exec, tail);
        }
    }

    // ------------------------------------------------------------------
    // Pending I/O
    // ------------------------------------------------------------------

    fn enqueue_read(
        &self,
        exec: &mut ExecContext<K, V>,
        key: K,
        hash: KeyHash,
        address: Address,
        kind: PendingKind<K, V>,
    ) {
        let io_id = self.next_io_id.fetch_add(1, Ordering::AcqRel);
        let serial = exec.serial;
        exec.pending.insert(
            io_id,
            PendingOperation {
                kind,
                key,
                hash,
                serial,
                handoff: address,
                address,
            },
        );
        self.io
            .submit_read(io_id, address.control(), Record::<K, V>::size());
    }

    /// Drain and process completions for this session. Returns `true` when
    /// no pending operations remain.
    pub(crate) fn complete_pending(&self, exec: &mut ExecContext<K, V>, wait: bool) -> bool {
        loop {
            self.route_completions(exec);
            if exec.pending.is_empty() {
                return true;
            }
            if !wait {
                return false;
            }
            self.epoch.refresh(exec.thread_id);
            std::thread::yield_now();
        }
    }

    /// Move arrived completions into this session (stashing strangers')
    /// and process our own.
    fn route_completions(&self, exec: &mut ExecContext<K, V>) {
        let mut mine = Vec::new();
        {
            let mut stray = self.stray_completions.lock();
            for completion in self.io.drain_completions() {
                if exec.pending.contains_key(&completion.io_id) {
                    mine.push(completion);
                } else {
                    stray.insert(completion.io_id, completion);
                }
            }
            let own_ids: Vec<u64> = stray
                .keys()
                .filter(|id| exec.pending.contains_key(id))
                .copied()
                .collect();
            for id in own_ids {
                if let Some(c) = stray.remove(&id) {
                    mine.push(c);
                }
            }
        }
        for completion in mine {
            self.process_completion(exec, completion);
        }
    }

    fn process_completion(&self, exec: &mut ExecContext<K, V>, completion: ReadCompletion) {
        let Some(op) = exec.pending.remove(&completion.io_id) else {
            return;
        };
        let bytes = match completion.result {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(target: "splicekv::store", error = %e, "pending read failed");
                exec.outputs.push(PendingOutput {
                    serial: op.serial,
                    status: Status::IoError,
                    detail: StatusDetail::NONE,
                    value: None,
                });
                return;
            }
        };

        // Materialize the device record and check the key; a mismatch
        // continues the chain on the device.
        let (header, disk_key, disk_value) = Self::materialize(&bytes);
        if disk_key != op.key {
            let prev = header.previous_address();
            if prev.is_valid()
                && prev >= self.hlog.begin_address()
                && prev < self.hlog.head_address()
            {
                let io_id = self.next_io_id.fetch_add(1, Ordering::AcqRel);
                exec.pending.insert(
                    io_id,
                    PendingOperation {
                        address: prev,
                        ..op
                    },
                );
                self.io
                    .submit_read(io_id, prev.control(), Record::<K, V>::size());
                return;
            }
            self.finish_pending(exec, op, None);
            return;
        }

        let value = if header.is_tombstone() || header.is_invalid() {
            None
        } else {
            Some(disk_value)
        };
        self.finish_pending(exec, op, value);
    }

    /// Re-enter the operation with the materialized device result.
    fn finish_pending(
        &self,
        exec: &mut ExecContext<K, V>,
        op: PendingOperation<K, V>,
        value: Option<V>,
    ) {
        let disk = DiskOutcome {
            address: op.handoff,
            value,
        };
        match op.kind {
            PendingKind::Read { options } => {
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    if attempt > RETRY_LIMIT {
                        self.mark_unhealthy("pending-read retry budget exhausted");
                        exec.outputs.push(PendingOutput {
                            serial: op.serial,
                            status: Status::Corruption,
                            detail: StatusDetail::NONE,
                            value: None,
                        });
                        return;
                    }
                    if attempt % REFRESH_INTERVAL == 0 {
                        self.refresh_session(exec);
                        std::thread::yield_now();
                    }
                    match self.read_once(exec, &op.key, op.hash, &options, Some(&disk)) {
                        Ok(result) => {
                            exec.outputs.push(PendingOutput {
                                serial: op.serial,
                                status: result.status,
                                detail: result.detail,
                                value: result.value,
                            });
                            return;
                        }
                        Err(status) if status.needs_retry() => continue,
                        Err(OperationStatus::RecordOnDisk) => {
                            // The in-memory chain hands off at a different
                            // address now; chase it.
                            let address = self
                                .disk_handoff_address(&op.key, op.hash)
                                .unwrap_or(disk.address);
                            self.enqueue_read(
                                exec,
                                op.key.clone(),
                                op.hash,
                                address,
                                PendingKind::Read { options },
                            );
                            return;
                        }
                        Err(other) => {
                            exec.outputs.push(PendingOutput {
                                serial: op.serial,
                                status: other.to_status(),
                                detail: StatusDetail::NONE,
                                value: None,
                            });
                            return;
                        }
                    }
                }
            }
            PendingKind::Rmw { mut ctx } => {
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    if attempt > RETRY_LIMIT {
                        self.mark_unhealthy("pending-rmw retry budget exhausted");
                        exec.outputs.push(PendingOutput {
                            serial: op.serial,
                            status: Status::Corruption,
                            detail: StatusDetail::NONE,
                            value: None,
                        });
                        return;
                    }
                    if attempt % REFRESH_INTERVAL == 0 {
                        self.refresh_session(exec);
                        std::thread::yield_now();
                    }
                    match self.rmw_once(exec, &op.key, op.hash, &mut *ctx, Some(&disk)) {
                        Ok(result) => {
                            exec.outputs.push(PendingOutput {
                                serial: op.serial,
                                status: result.status,
                                detail: result.detail,
                                value: None,
                            });
                            return;
                        }
                        Err(status) if status.needs_retry() => continue,
                        Err(OperationStatus::RecordOnDisk) => {
                            let address = self
                                .disk_handoff_address(&op.key, op.hash)
                                .unwrap_or(disk.address);
                            self.enqueue_read(
                                exec,
                                op.key.clone(),
                                op.hash,
                                address,
                                PendingKind::Rmw { ctx },
                            );
                            return;
                        }
                        Err(other) => {
                            exec.outputs.push(PendingOutput {
                                serial: op.serial,
                                status: other.to_status(),
                                detail: StatusDetail::NONE,
                                value: None,
                            });
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Where the in-memory traversal for `key` currently hands off to the
    /// device, if anywhere.
    fn disk_handoff_address(&self, key: &K, hash: KeyHash) -> Option<Address> {
        let found = self.index.find_entry(hash);
        if !found.found() {
            return None;
        }
        match self.walk_chain(key, found.entry) {
            WalkResult::Done(walk) if walk.below_head.is_valid() => Some(walk.below_head),
            _ => None,
        }
    }

    /// Decode a device record image into header, key, and value.
    fn materialize(bytes: &[u8]) -> (RecordInfo, K, V) {
        debug_assert!(bytes.len() >= Record::<K, V>::size());
        let control = u64::from_le_bytes(bytes[0..8].try_into().expect("header bytes"));
        let header = RecordInfo::from_disk(control);
        // SAFETY: the flushed image has the in-memory record layout; the
        // reads are unaligned because the buffer carries no alignment
        // guarantee. Ownership of the image's key/value bytes transfers to
        // the returned values.
        let key = unsafe {
            std::ptr::read_unaligned(bytes.as_ptr().add(Record::<K, V>::key_offset()) as *const K)
        };
        let value = unsafe {
            std::ptr::read_unaligned(
                bytes.as_ptr().add(Record::<K, V>::value_offset()) as *const V
            )
        };
        (header, key, value)
    }

    // ------------------------------------------------------------------
    // Manual key locks
    // ------------------------------------------------------------------

    /// Acquire a key lock: on the key's live in-memory record if one
    /// exists, else in the lock table. Spins with bounded backoff.
    pub(crate) fn lock_internal(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        mode: LockMode,
    ) -> Status {
        let hash = KeyHash::new(key.key_hash());
        let backoff = Backoff::new();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > RETRY_LIMIT {
                return Status::InvalidOperation;
            }
            if attempt % REFRESH_INTERVAL == 0 {
                self.refresh_session(exec);
                std::thread::yield_now();
            }

            match self.find_lockable_record(key, hash) {
                LockTarget::Record(header) => {
                    let acquired = match mode {
                        LockMode::Exclusive => header.try_lock_exclusive(),
                        LockMode::Shared => header.try_lock_shared(),
                    };
                    if acquired {
                        return Status::Ok;
                    }
                }
                LockTarget::Table => match self.lock_table.try_lock(key, mode) {
                    LockTableResult::Ok => return Status::Ok,
                    LockTableResult::Conflict
                    | LockTableResult::Sealed
                    | LockTableResult::NotPresent => {}
                },
                LockTarget::Retry => {}
            }
            backoff.snooze();
        }
    }

    /// Release a key lock wherever its word currently lives. A release
    /// racing a transfer retries until the word lands.
    pub(crate) fn unlock_internal(
        &self,
        exec: &mut ExecContext<K, V>,
        key: &K,
        mode: LockMode,
    ) -> Status {
        let hash = KeyHash::new(key.key_hash());
        let backoff = Backoff::new();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > RETRY_LIMIT {
                return Status::InvalidOperation;
            }
            if attempt % REFRESH_INTERVAL == 0 {
                self.refresh_session(exec);
                std::thread::yield_now();
            }

            match self.find_lockable_record(key, hash) {
                LockTarget::Record(header) => {
                    let released = match mode {
                        LockMode::Exclusive => header.try_unlock_exclusive(),
                        LockMode::Shared => header.try_unlock_shared(),
                    };
                    if released {
                        return Status::Ok;
                    }
                    // The word may still be in the table (a transfer is in
                    // flight); try there before backing off.
                    if self.lock_table.unlock(key, mode) == LockTableResult::Ok {
                        return Status::Ok;
                    }
                }
                LockTarget::Table => match self.lock_table.unlock(key, mode) {
                    LockTableResult::Ok => return Status::Ok,
                    LockTableResult::Conflict => return Status::InvalidOperation,
                    LockTableResult::Sealed | LockTableResult::NotPresent => {}
                },
                LockTarget::Retry => {}
            }
            backoff.snooze();
        }
    }

    fn find_lockable_record(&self, key: &K, hash: KeyHash) -> LockTarget<'_> {
        let found = self.index.find_entry(hash);
        if !found.found() {
            return LockTarget::Table;
        }
        match self.walk_chain(key, found.entry) {
            WalkResult::Retry => LockTarget::Retry,
            WalkResult::Done(walk) => {
                if walk.rc_match.is_valid() {
                    let rc = self.read_cache.as_ref().expect("rc match implies cache");
                    // SAFETY: resident, epoch-protected.
                    let record = unsafe { rc.record_at(walk.rc_match) };
                    if record.header.is_sealed() {
                        return LockTarget::Retry;
                    }
                    return LockTarget::Record(&record.header);
                }
                if let Some(m) = &walk.memory_match {
                    // SAFETY: in-memory address, epoch-protected.
                    let record = unsafe { self.hlog_record_at(m.address) };
                    if record.header.is_sealed() {
                        return LockTarget::Retry;
                    }
                    return LockTarget::Record(&record.header);
                }
                LockTarget::Table
            }
        }
    }

    // ------------------------------------------------------------------
    // Session plumbing
    // ------------------------------------------------------------------

    fn check_version(&self, exec: &mut ExecContext<K, V>) -> Result<(), OperationStatus> {
        let current = self.version();
        if exec.version != current {
            exec.version = current;
            return Err(OperationStatus::CprShiftDetected);
        }
        Ok(())
    }

    pub(crate) fn refresh_session(&self, exec: &mut ExecContext<K, V>) {
        self.epoch.refresh(exec.thread_id);
        exec.version = self.version();
    }
}
