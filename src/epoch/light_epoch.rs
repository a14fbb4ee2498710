//! Lightweight epoch-based protection.
//!
//! Threads enter the epoch before dereferencing shared ring pages and exit
//! (or refresh) at operation boundaries. Reclamation work is registered as
//! a drain action tagged with the epoch at which it was issued; the action
//! runs once every thread has observed a later epoch.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};
use crate::status::Status;

/// Epoch value meaning "not protected".
pub const UNPROTECTED: u64 = 0;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);
static FREE_THREAD_IDS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// Allocate a stable thread slot for epoch protection.
///
/// Returns `Status::TooManyThreads` when more than [`MAX_THREADS`] threads
/// hold slots concurrently. Pair with [`release_thread_id`].
pub fn acquire_thread_id() -> Result<usize, Status> {
    if let Some(id) = FREE_THREAD_IDS.lock().pop() {
        return Ok(id);
    }
    let id = NEXT_THREAD_ID.fetch_add(1, Ordering::AcqRel);
    if id < MAX_THREADS {
        Ok(id)
    } else {
        NEXT_THREAD_ID.fetch_sub(1, Ordering::AcqRel);
        // Another thread may have released a slot in the meantime.
        FREE_THREAD_IDS.lock().pop().ok_or(Status::TooManyThreads)
    }
}

/// Return a thread slot to the free list.
pub fn release_thread_id(id: usize) {
    FREE_THREAD_IDS.lock().push(id);
}

/// One epoch-table entry per thread slot, padded to a cache line.
#[repr(C, align(64))]
struct Entry {
    local_current_epoch: AtomicU64,
    _padding: [u8; CACHE_LINE_BYTES - 8],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_current_epoch: AtomicU64::new(UNPROTECTED),
            _padding: [0; CACHE_LINE_BYTES - 8],
        }
    }
}

struct DrainAction {
    epoch: u64,
    callback: Box<dyn FnOnce() + Send + 'static>,
}

/// The epoch table plus the deferred-action drain list.
pub struct LightEpoch {
    /// Global current epoch; starts at 1 so `UNPROTECTED` is never current.
    current: AtomicU64,
    /// Highest epoch known safe to reclaim.
    safe_to_reclaim: AtomicU64,
    table: Box<[Entry]>,
    drain_list: Mutex<Vec<DrainAction>>,
}

impl LightEpoch {
    /// Create a new epoch table.
    pub fn new() -> Self {
        let table = (0..MAX_THREADS).map(|_| Entry::new()).collect();
        Self {
            current: AtomicU64::new(1),
            safe_to_reclaim: AtomicU64::new(0),
            table,
            drain_list: Mutex::new(Vec::new()),
        }
    }

    /// Current global epoch.
    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Enter the epoch on the given thread slot. Idempotent refresh if the
    /// thread is already protected.
    #[inline]
    pub fn protect(&self, thread_id: usize) -> u64 {
        let epoch = self.current.load(Ordering::Acquire);
        self.table[thread_id]
            .local_current_epoch
            .store(epoch, Ordering::Release);
        epoch
    }

    /// Re-enter at the latest epoch and run any drain work that has become
    /// safe. Long-running operations call this at their retry boundaries.
    pub fn refresh(&self, thread_id: usize) -> u64 {
        let epoch = self.protect(thread_id);
        self.try_drain();
        epoch
    }

    /// Leave the epoch. The thread must not touch protected pages afterward.
    #[inline]
    pub fn unprotect(&self, thread_id: usize) {
        self.table[thread_id]
            .local_current_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    /// Whether the thread slot currently holds protection.
    #[inline]
    pub fn is_protected(&self, thread_id: usize) -> bool {
        self.table[thread_id]
            .local_current_epoch
            .load(Ordering::Acquire)
            != UNPROTECTED
    }

    /// Advance the global epoch and register `action` to run once every
    /// protected thread has observed the new epoch.
    pub fn bump_current_epoch(&self, action: impl FnOnce() + Send + 'static) {
        let prior = self.current.fetch_add(1, Ordering::AcqRel);
        self.drain_list.lock().push(DrainAction {
            epoch: prior,
            callback: Box::new(action),
        });
        self.try_drain();
    }

    /// Largest epoch below which no thread is still protected.
    pub fn compute_safe_epoch(&self) -> u64 {
        let current = self.current.load(Ordering::Acquire);
        let mut oldest = current;
        for entry in self.table.iter() {
            let local = entry.local_current_epoch.load(Ordering::Acquire);
            if local != UNPROTECTED && local < oldest {
                oldest = local;
            }
        }
        let safe = oldest.saturating_sub(1);
        // Monotonic: lagging recomputations must not regress it.
        let mut published = self.safe_to_reclaim.load(Ordering::Acquire);
        while safe > published {
            match self.safe_to_reclaim.compare_exchange(
                published,
                safe,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => published = actual,
            }
        }
        self.safe_to_reclaim.load(Ordering::Acquire)
    }

    /// Run all drain actions whose epoch is now safe.
    pub fn try_drain(&self) {
        let safe = self.compute_safe_epoch();
        let mut ready = Vec::new();
        {
            let mut list = self.drain_list.lock();
            if list.is_empty() {
                return;
            }
            let mut i = 0;
            while i < list.len() {
                if list[i].epoch <= safe {
                    ready.push(list.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        // Run callbacks outside the list lock; they may bump again.
        for action in ready {
            (action.callback)();
        }
    }

    /// Number of deferred actions not yet drained.
    pub fn pending_drain_count(&self) -> usize {
        self.drain_list.lock().len()
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LightEpoch {
    fn drop(&mut self) {
        // No thread can be protected once the owner drops the table; run
        // whatever reclamation is still queued so its targets are released
        // while they are still alive.
        let actions: Vec<DrainAction> = std::mem::take(&mut *self.drain_list.lock());
        for action in actions {
            (action.callback)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_protect_unprotect() {
        let epoch = LightEpoch::new();
        let tid = acquire_thread_id().unwrap();

        assert!(!epoch.is_protected(tid));
        epoch.protect(tid);
        assert!(epoch.is_protected(tid));
        epoch.unprotect(tid);
        assert!(!epoch.is_protected(tid));

        release_thread_id(tid);
    }

    #[test]
    fn test_drain_waits_for_observer() {
        let epoch = LightEpoch::new();
        let tid = acquire_thread_id().unwrap();

        epoch.protect(tid);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        epoch.bump_current_epoch(move || flag.store(true, Ordering::Release));

        // The protected thread still pins the old epoch.
        epoch.try_drain();
        assert!(!fired.load(Ordering::Acquire));

        // Refreshing releases the old epoch and the action runs.
        epoch.refresh(tid);
        assert!(fired.load(Ordering::Acquire));
        assert_eq!(epoch.pending_drain_count(), 0);

        epoch.unprotect(tid);
        release_thread_id(tid);
    }

    #[test]
    fn test_drain_runs_immediately_when_unobserved() {
        let epoch = LightEpoch::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        epoch.bump_current_epoch(move || flag.store(true, Ordering::Release));
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn test_thread_id_reuse() {
        let a = acquire_thread_id().unwrap();
        release_thread_id(a);
        let b = acquire_thread_id().unwrap();
        assert_eq!(a, b);
        release_thread_id(b);
    }
}
