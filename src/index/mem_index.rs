//! In-memory hash index: a power-of-two bucket array with overflow chains.

use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::address::Address;
use crate::index::{AtomicHashBucketEntry, HashBucket, HashBucketEntry, KeyHash};
use crate::utility::is_power_of_two;

/// Result of an index lookup: the observed entry and the cell it lives in.
#[derive(Clone, Copy)]
pub struct FindResult {
    /// The entry value observed at lookup time.
    pub entry: HashBucketEntry,
    /// Pointer to the atomic cell holding the entry; `None` when not found.
    pub atomic_entry: Option<*const AtomicHashBucketEntry>,
}

impl FindResult {
    /// A lookup miss.
    pub const fn not_found() -> Self {
        Self {
            entry: HashBucketEntry::INVALID,
            atomic_entry: None,
        }
    }

    /// Whether an entry was found.
    #[inline]
    pub fn found(&self) -> bool {
        self.atomic_entry.is_some()
    }
}

/// Append-only pool of overflow buckets. Boxes give the buckets stable
/// addresses; the vector is only locked to append or resolve a slot index.
struct OverflowPool {
    buckets: Mutex<Vec<Box<HashBucket>>>,
}

impl OverflowPool {
    fn new() -> Self {
        Self {
            buckets: Mutex::new(Vec::new()),
        }
    }

    fn allocate(&self) -> usize {
        let mut buckets = self.buckets.lock();
        buckets.push(Box::new(HashBucket::new()));
        buckets.len() - 1
    }

    fn bucket_ptr(&self, slot: usize) -> Option<*const HashBucket> {
        let buckets = self.buckets.lock();
        buckets.get(slot).map(|b| &**b as *const HashBucket)
    }
}

/// The hash index. Bucket entries are CAS-only; the index itself never
/// takes a latch on the lookup or update paths.
pub struct HashIndex {
    buckets: Box<[HashBucket]>,
    overflow: OverflowPool,
}

impl HashIndex {
    /// Create an index with `table_size` buckets (must be a power of two).
    pub fn new(table_size: u64) -> Self {
        assert!(is_power_of_two(table_size), "table size must be a power of two");
        let buckets = (0..table_size).map(|_| HashBucket::new()).collect();
        Self {
            buckets,
            overflow: OverflowPool::new(),
        }
    }

    /// Number of base buckets.
    #[inline]
    pub fn size(&self) -> u64 {
        self.buckets.len() as u64
    }

    #[inline]
    fn base_bucket(&self, hash: KeyHash) -> &HashBucket {
        &self.buckets[hash.bucket_index(self.size())]
    }

    /// Find the non-tentative entry with the hash's tag, walking the
    /// overflow chain.
    pub fn find_entry(&self, hash: KeyHash) -> FindResult {
        let tag = hash.tag();
        let mut bucket_ptr: *const HashBucket = self.base_bucket(hash) as *const _;

        loop {
            // SAFETY: bucket_ptr is either a base bucket (owned by self) or
            // an overflow bucket (boxed, never freed); fields are atomic.
            let bucket = unsafe { &*bucket_ptr };

            for cell in &bucket.entries {
                let entry = cell.load(Ordering::Acquire);
                if !entry.is_unused() && !entry.is_tentative() && entry.tag() == tag {
                    return FindResult {
                        entry,
                        atomic_entry: Some(cell as *const _),
                    };
                }
            }

            match bucket.overflow.get(Ordering::Acquire) {
                Some(slot) => match self.overflow.bucket_ptr(slot) {
                    Some(p) => bucket_ptr = p,
                    None => return FindResult::not_found(),
                },
                None => return FindResult::not_found(),
            }
        }
    }

    /// Find the entry for the hash, or claim a free cell for it.
    ///
    /// A claimed cell goes through the tentative protocol: install a
    /// tentative entry, check no concurrent non-tentative entry with the
    /// same tag appeared elsewhere in the chain, then finalize. The returned
    /// entry points at `Address::INVALID` until the caller CASes in a record
    /// address.
    pub fn find_or_create_entry(&self, hash: KeyHash) -> FindResult {
        let tag = hash.tag();

        loop {
            let found = self.find_entry(hash);
            if found.found() {
                return found;
            }

            let free_cell = match self.find_free_cell(hash) {
                Some(cell) => cell,
                None => self.append_overflow_bucket(hash),
            };

            let tentative = HashBucketEntry::new(Address::INVALID, tag, true);
            // SAFETY: free_cell points into a live (base or overflow) bucket.
            let cell = unsafe { &*free_cell };
            if cell
                .compare_exchange(
                    HashBucketEntry::INVALID,
                    tentative,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            if self.has_conflicting_entry(hash, free_cell) {
                cell.store(HashBucketEntry::INVALID, Ordering::Release);
                continue;
            }

            let final_entry = HashBucketEntry::new(Address::INVALID, tag, false);
            cell.store(final_entry, Ordering::Release);
            return FindResult {
                entry: final_entry,
                atomic_entry: Some(free_cell),
            };
        }
    }

    /// CAS a bucket entry from `expected` to one pointing at `new_address`
    /// (read-cache bit carried in the address). An invalid `new_address`
    /// clears the cell.
    pub fn try_update_entry(
        &self,
        atomic_entry: *const AtomicHashBucketEntry,
        expected: HashBucketEntry,
        new_address: Address,
        tag: u16,
    ) -> bool {
        let new_entry = if new_address.is_invalid() {
            HashBucketEntry::INVALID
        } else {
            HashBucketEntry::new(new_address, tag, false)
        };
        // SAFETY: atomic_entry was produced by a lookup on this index and
        // bucket cells are never freed.
        let cell = unsafe { &*atomic_entry };
        cell.compare_exchange(expected, new_entry, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn find_free_cell(&self, hash: KeyHash) -> Option<*const AtomicHashBucketEntry> {
        let mut bucket_ptr: *const HashBucket = self.base_bucket(hash) as *const _;
        loop {
            // SAFETY: see find_entry.
            let bucket = unsafe { &*bucket_ptr };
            for cell in &bucket.entries {
                if cell.load(Ordering::Acquire).is_unused() {
                    return Some(cell as *const _);
                }
            }
            match bucket.overflow.get(Ordering::Acquire) {
                Some(slot) => bucket_ptr = self.overflow.bucket_ptr(slot)?,
                None => return None,
            }
        }
    }

    /// Append an overflow bucket at the chain tail and return its first
    /// cell. Losing the install race follows the winner's bucket instead.
    fn append_overflow_bucket(&self, hash: KeyHash) -> *const AtomicHashBucketEntry {
        let mut bucket_ptr: *const HashBucket = self.base_bucket(hash) as *const _;
        loop {
            // SAFETY: see find_entry.
            let bucket = unsafe { &*bucket_ptr };
            match bucket.overflow.get(Ordering::Acquire) {
                Some(slot) => {
                    bucket_ptr = self
                        .overflow
                        .bucket_ptr(slot)
                        .expect("overflow slot missing from pool");
                }
                None => {
                    let slot = self.overflow.allocate();
                    match bucket.overflow.try_set(slot) {
                        Ok(()) => {
                            let p = self
                                .overflow
                                .bucket_ptr(slot)
                                .expect("freshly allocated overflow slot");
                            // SAFETY: the new bucket is empty.
                            let new_bucket = unsafe { &*p };
                            return &new_bucket.entries[0] as *const _;
                        }
                        Err(winner) => {
                            // Leaked slot stays in the pool unused; rare.
                            bucket_ptr = self
                                .overflow
                                .bucket_ptr(winner)
                                .expect("winning overflow slot");
                        }
                    }
                }
            }
        }
    }

    fn has_conflicting_entry(
        &self,
        hash: KeyHash,
        our_cell: *const AtomicHashBucketEntry,
    ) -> bool {
        let tag = hash.tag();
        let mut bucket_ptr: *const HashBucket = self.base_bucket(hash) as *const _;
        loop {
            // SAFETY: see find_entry.
            let bucket = unsafe { &*bucket_ptr };
            for cell in &bucket.entries {
                let cell_ptr = cell as *const AtomicHashBucketEntry;
                if cell_ptr == our_cell {
                    continue;
                }
                let entry = cell.load(Ordering::Acquire);
                if !entry.is_unused() && !entry.is_tentative() && entry.tag() == tag {
                    return true;
                }
            }
            match bucket.overflow.get(Ordering::Acquire) {
                Some(slot) => match self.overflow.bucket_ptr(slot) {
                    Some(p) => bucket_ptr = p,
                    None => return false,
                },
                None => return false,
            }
        }
    }
}

// SAFETY: bucket cells are atomics; the overflow pool is latched.
unsafe impl Send for HashIndex {}
unsafe impl Sync for HashIndex {}
