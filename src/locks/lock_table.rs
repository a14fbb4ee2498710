//! Overflow lock table.
//!
//! Holds the lock word for keys whose only in-memory record has been
//! evicted. Fixed-fanout latched buckets: each bucket is a small map under
//! a `parking_lot` mutex held only for the duration of one state mutation.
//!
//! Transfers between the table and record headers are seal-gated: while an
//! entry is sealed, lockers and unlockers back off and retry, so a lock
//! word is authoritative in exactly one place at any instant.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::locks::LockMode;
use crate::record::{Key, LockState, RecordInfo};

const NUM_BUCKETS: usize = 64;

struct Entry {
    state: LockState,
    /// Set while the entry's lock word is being moved into a record header.
    sealed: bool,
}

/// Outcome of a lock-table mutation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTableResult {
    /// The mutation took effect.
    Ok,
    /// The key's lock state conflicts with the request.
    Conflict,
    /// The entry is mid-transfer; back off and retry.
    Sealed,
    /// No entry exists for the key.
    NotPresent,
}

/// Lock table over keys `K`.
pub struct LockTable<K: Key> {
    buckets: Box<[Mutex<HashMap<K, Entry>>]>,
}

impl<K: Key> LockTable<K> {
    /// Create an empty lock table.
    pub fn new() -> Self {
        let buckets = (0..NUM_BUCKETS)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { buckets }
    }

    #[inline]
    fn bucket(&self, key: &K) -> &Mutex<HashMap<K, Entry>> {
        let index = (key.key_hash() as usize) & (NUM_BUCKETS - 1);
        &self.buckets[index]
    }

    /// Try to acquire a lock on `key`, creating the entry if absent.
    pub fn try_lock(&self, key: &K, mode: LockMode) -> LockTableResult {
        let mut bucket = self.bucket(key).lock();
        let entry = bucket.entry(key.clone()).or_insert(Entry {
            state: LockState::UNLOCKED,
            sealed: false,
        });
        if entry.sealed {
            return LockTableResult::Sealed;
        }
        match mode {
            LockMode::Exclusive => {
                if entry.state.is_locked() {
                    LockTableResult::Conflict
                } else {
                    entry.state.exclusive = true;
                    LockTableResult::Ok
                }
            }
            LockMode::Shared => {
                if entry.state.exclusive
                    || entry.state.shared_count >= RecordInfo::MAX_SHARED
                {
                    LockTableResult::Conflict
                } else {
                    entry.state.shared_count += 1;
                    LockTableResult::Ok
                }
            }
        }
    }

    /// Release a lock on `key`. Removes the entry once its count reaches
    /// zero.
    pub fn unlock(&self, key: &K, mode: LockMode) -> LockTableResult {
        let mut bucket = self.bucket(key).lock();
        let Some(entry) = bucket.get_mut(key) else {
            return LockTableResult::NotPresent;
        };
        if entry.sealed {
            return LockTableResult::Sealed;
        }
        let result = match mode {
            LockMode::Exclusive => {
                if entry.state.exclusive {
                    entry.state.exclusive = false;
                    LockTableResult::Ok
                } else {
                    LockTableResult::Conflict
                }
            }
            LockMode::Shared => {
                if entry.state.shared_count > 0 {
                    entry.state.shared_count -= 1;
                    LockTableResult::Ok
                } else {
                    LockTableResult::Conflict
                }
            }
        };
        if result == LockTableResult::Ok && !entry.state.is_locked() {
            bucket.remove(key);
        }
        result
    }

    /// Current lock state for `key`, if an entry exists.
    pub fn try_get(&self, key: &K) -> Option<LockState> {
        let bucket = self.bucket(key).lock();
        bucket.get(key).map(|e| e.state)
    }

    /// Merge an evicted record's lock word into the table. Creates the
    /// entry if absent; adds counts if present (even mid-transfer seal:
    /// eviction is the sole writer of new counts, and merged counts must
    /// not be lost).
    pub fn merge(&self, key: &K, state: LockState) {
        if !state.is_locked() {
            return;
        }
        let mut bucket = self.bucket(key).lock();
        match bucket.get_mut(key) {
            Some(entry) => entry.state.merge(state),
            None => {
                bucket.insert(
                    key.clone(),
                    Entry {
                        state,
                        sealed: false,
                    },
                );
            }
        }
    }

    /// Begin moving the key's lock word into a record header: seal the
    /// entry and return a snapshot of its state. Returns `None` when no
    /// entry exists, `Some(Err(()))` when the entry is already mid-transfer.
    pub fn begin_transfer(&self, key: &K) -> Option<Result<LockState, ()>> {
        let mut bucket = self.bucket(key).lock();
        let entry = bucket.get_mut(key)?;
        if entry.sealed {
            return Some(Err(()));
        }
        entry.sealed = true;
        Some(Ok(entry.state))
    }

    /// The record carrying the transferred word was published; drop the
    /// entry.
    pub fn commit_transfer(&self, key: &K) {
        let mut bucket = self.bucket(key).lock();
        let removed = bucket.remove(key);
        debug_assert!(removed.map(|e| e.sealed).unwrap_or(true));
    }

    /// The publish failed; the table stays authoritative for the word.
    pub fn abort_transfer(&self, key: &K) {
        let mut bucket = self.bucket(key).lock();
        if let Some(entry) = bucket.get_mut(key) {
            entry.sealed = false;
        }
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl<K: Key> Default for LockTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_lock_cycle() {
        let table = LockTable::<u64>::new();
        assert_eq!(table.try_lock(&1, LockMode::Exclusive), LockTableResult::Ok);
        assert_eq!(
            table.try_lock(&1, LockMode::Exclusive),
            LockTableResult::Conflict
        );
        assert_eq!(
            table.try_lock(&1, LockMode::Shared),
            LockTableResult::Conflict
        );
        assert_eq!(table.unlock(&1, LockMode::Exclusive), LockTableResult::Ok);
        assert!(table.is_empty());
    }

    #[test]
    fn test_shared_lock_counts() {
        let table = LockTable::<u64>::new();
        assert_eq!(table.try_lock(&1, LockMode::Shared), LockTableResult::Ok);
        assert_eq!(table.try_lock(&1, LockMode::Shared), LockTableResult::Ok);
        assert_eq!(table.try_get(&1).unwrap().shared_count, 2);

        assert_eq!(table.unlock(&1, LockMode::Shared), LockTableResult::Ok);
        assert_eq!(table.count(), 1);
        assert_eq!(table.unlock(&1, LockMode::Shared), LockTableResult::Ok);
        assert!(table.is_empty());
    }

    #[test]
    fn test_unlock_missing_entry() {
        let table = LockTable::<u64>::new();
        assert_eq!(
            table.unlock(&9, LockMode::Shared),
            LockTableResult::NotPresent
        );
    }

    #[test]
    fn test_merge_accumulates() {
        let table = LockTable::<u64>::new();
        table.merge(
            &5,
            LockState {
                exclusive: false,
                shared_count: 2,
            },
        );
        table.merge(
            &5,
            LockState {
                exclusive: true,
                shared_count: 1,
            },
        );
        let state = table.try_get(&5).unwrap();
        assert!(state.exclusive);
        assert_eq!(state.shared_count, 3);

        // An unlocked word merges to nothing.
        table.merge(&6, LockState::UNLOCKED);
        assert_eq!(table.try_get(&6), None);
    }

    #[test]
    fn test_transfer_protocol() {
        let table = LockTable::<u64>::new();
        assert_eq!(table.try_lock(&3, LockMode::Exclusive), LockTableResult::Ok);

        let state = table.begin_transfer(&3).unwrap().unwrap();
        assert!(state.exclusive);

        // Sealed entry repels lockers and unlockers.
        assert_eq!(
            table.try_lock(&3, LockMode::Shared),
            LockTableResult::Sealed
        );
        assert_eq!(
            table.unlock(&3, LockMode::Exclusive),
            LockTableResult::Sealed
        );
        assert_eq!(table.begin_transfer(&3), Some(Err(())));

        table.commit_transfer(&3);
        assert!(table.is_empty());
    }

    #[test]
    fn test_transfer_abort_restores_entry() {
        let table = LockTable::<u64>::new();
        assert_eq!(table.try_lock(&4, LockMode::Shared), LockTableResult::Ok);

        let _ = table.begin_transfer(&4).unwrap().unwrap();
        table.abort_transfer(&4);
        assert_eq!(table.unlock(&4, LockMode::Shared), LockTableResult::Ok);
        assert!(table.is_empty());
    }
}
