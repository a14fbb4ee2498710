//! Sessions.
//!
//! A session binds a thread to an epoch slot and owns that thread's
//! pending-operation state. Sessions are not `Sync`; each thread starts
//! its own from a shared store handle.

use crate::epoch::{acquire_thread_id, release_thread_id};
use crate::locks::LockMode;
use crate::record::{Key, Value};
use crate::status::Status;
use crate::store::contexts::{ClosureRmw, RmwContext};
use crate::store::kv_store::{ExecContext, MutateResult, PendingOutput, ReadResult, SpliceKv};
use crate::store::options::ReadOptions;

/// A thread's handle for operating on a [`SpliceKv`] store.
pub struct Session<'a, K, V>
where
    K: Key,
    V: Value,
{
    store: &'a SpliceKv<K, V>,
    exec: ExecContext<K, V>,
    active: bool,
    manual_locking: bool,
}

impl<'a, K, V> Session<'a, K, V>
where
    K: Key,
    V: Value,
{
    pub(crate) fn new(store: &'a SpliceKv<K, V>) -> Result<Self, Status> {
        let thread_id = acquire_thread_id()?;
        let version = store.version();
        Ok(Self {
            store,
            exec: ExecContext::new(thread_id, version),
            active: false,
            manual_locking: false,
        })
    }

    /// The store this session operates on.
    pub fn store(&self) -> &'a SpliceKv<K, V> {
        self.store
    }

    /// Enter the epoch. Idempotent; every operation enters on demand.
    pub fn start(&mut self) {
        if !self.active {
            self.store.epoch().protect(self.exec.thread_id);
            self.active = true;
        }
    }

    /// Leave the epoch. Pending operations survive; re-entering resumes
    /// them.
    pub fn stop(&mut self) {
        if self.active {
            self.store.epoch().unprotect(self.exec.thread_id);
            self.active = false;
        }
    }

    /// Re-enter at the current epoch and run any reclamation that became
    /// safe.
    pub fn refresh(&mut self) {
        if self.active {
            self.store.refresh_session(&mut self.exec);
        }
    }

    fn begin_op(&mut self) {
        self.start();
        self.exec.serial += 1;
    }

    /// Number of this session's operations awaiting I/O.
    pub fn pending_count(&self) -> usize {
        self.exec.pending_count()
    }

    /// Read `key` with default options.
    pub fn read(&mut self, key: &K) -> ReadResult<V> {
        self.read_with_options(key, &ReadOptions::default())
    }

    /// Read `key`.
    pub fn read_with_options(&mut self, key: &K, options: &ReadOptions) -> ReadResult<V> {
        self.begin_op();
        self.store.read_internal(&mut self.exec, key, options)
    }

    /// Insert or overwrite `key`.
    pub fn upsert(&mut self, key: &K, value: &V) -> MutateResult {
        self.begin_op();
        self.store.upsert_internal(&mut self.exec, key, value)
    }

    /// Read-modify-write `key` through `ctx`.
    pub fn rmw<C>(&mut self, key: &K, ctx: C) -> MutateResult
    where
        C: RmwContext<K, V> + 'static,
    {
        self.begin_op();
        self.store.rmw_internal(&mut self.exec, key, Box::new(ctx))
    }

    /// Read-modify-write `key` with a closure; the closure sees `None`
    /// when the key does not exist.
    pub fn rmw_fn<F>(&mut self, key: &K, update: F) -> MutateResult
    where
        F: FnMut(Option<&V>) -> V + Send + 'static,
    {
        self.rmw(key, ClosureRmw::new(update))
    }

    /// Delete `key` (tombstone append, or in-place short circuit).
    pub fn delete(&mut self, key: &K) -> MutateResult {
        self.begin_op();
        self.store.delete_internal(&mut self.exec, key)
    }

    /// Drive pending I/O. With `wait`, blocks until every pending
    /// operation of this session has completed.
    pub fn complete_pending(&mut self, wait: bool) -> bool {
        self.start();
        self.store.complete_pending(&mut self.exec, wait)
    }

    /// Like [`Session::complete_pending`], returning the completed
    /// operations' outputs.
    pub fn complete_pending_with_outputs(&mut self, wait: bool) -> (bool, Vec<PendingOutput<V>>) {
        let done = self.complete_pending(wait);
        (done, self.exec.take_outputs())
    }

    /// Enter the manual-locking scope. Refused while operations are
    /// pending: lock ownership must not interleave with in-flight I/O.
    pub fn enable_manual_locking(&mut self) -> Result<(), Status> {
        if self.exec.pending_count() > 0 {
            return Err(Status::InvalidOperation);
        }
        self.manual_locking = true;
        Ok(())
    }

    /// Leave the manual-locking scope.
    pub fn disable_manual_locking(&mut self) {
        self.manual_locking = false;
    }

    /// Acquire a key lock. Requires the manual-locking scope.
    pub fn lock(&mut self, key: &K, mode: LockMode) -> Status {
        if !self.manual_locking {
            return Status::InvalidOperation;
        }
        self.start();
        self.store.lock_internal(&mut self.exec, key, mode)
    }

    /// Release a key lock. Requires the manual-locking scope.
    pub fn unlock(&mut self, key: &K, mode: LockMode) -> Status {
        if !self.manual_locking {
            return Status::InvalidOperation;
        }
        self.start();
        self.store.unlock_internal(&mut self.exec, key, mode)
    }

    /// Flush the hybrid log and evict it from memory entirely.
    pub fn flush_and_evict(&mut self) -> Status {
        self.start();
        self.store.flush_and_evict(&mut self.exec)
    }

    /// Evict the entire read cache.
    pub fn evict_read_cache(&mut self) {
        self.start();
        self.store.evict_read_cache(&mut self.exec);
    }

    /// Snapshot the chain for `hash` (see [`SpliceKv::dump_chain`]).
    pub fn dump_chain(
        &mut self,
        hash: crate::index::KeyHash,
    ) -> Result<Vec<crate::store::inspect::ChainLink<K>>, Status> {
        self.start();
        self.store.dump_chain(hash)
    }
}

impl<K, V> Drop for Session<'_, K, V>
where
    K: Key,
    V: Value,
{
    fn drop(&mut self) {
        self.stop();
        release_thread_id(self.exec.thread_id);
    }
}

impl<K, V> SpliceKv<K, V>
where
    K: Key,
    V: Value,
{
    /// Start a session bound to the calling thread.
    pub fn start_session(&self) -> Result<Session<'_, K, V>, Status> {
        Session::new(self)
    }
}
