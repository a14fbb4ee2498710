//! User callback contracts for operations.
//!
//! The engine is parameterized by these capability traits; a session picks
//! an implementation per call and the engine never changes dispatch at
//! runtime. [`ClosureRmw`] covers plain value semantics.

use crate::record::{Key, Value};

/// Outcome of an RMW update callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    /// The update was applied (or the produced value should be written).
    Updated,
    /// The callback declines an in-place update; fall back to copy-update.
    NeedCopy,
    /// Cancel the operation.
    Cancel,
}

/// Callbacks for read-modify-write.
pub trait RmwContext<K: Key, V: Value>: Send {
    /// Value to install when the key does not exist yet.
    fn initial_value(&mut self) -> V;

    /// Mutate an existing value in place (mutable region only).
    fn in_place_update(&mut self, value: &mut V) -> UpdateDecision;

    /// Produce a new value from the old one for a copy-update.
    fn copy_update(&mut self, old_value: &V) -> V;

    /// Whether the old value has expired; an expired value is replaced by a
    /// tombstone instead of being updated.
    fn is_expired(&self, _old_value: &V) -> bool {
        false
    }
}

/// RMW context wrapping a closure `Option<&old> -> new`; `None` means the
/// key does not exist yet.
pub struct ClosureRmw<V, F>
where
    F: FnMut(Option<&V>) -> V,
{
    update: F,
    _marker: std::marker::PhantomData<fn() -> V>,
}

impl<V, F> ClosureRmw<V, F>
where
    F: FnMut(Option<&V>) -> V,
{
    /// Wrap `update`.
    pub fn new(update: F) -> Self {
        Self {
            update,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<K, V, F> RmwContext<K, V> for ClosureRmw<V, F>
where
    K: Key,
    V: Value,
    F: FnMut(Option<&V>) -> V + Send,
{
    fn initial_value(&mut self) -> V {
        (self.update)(None)
    }

    fn in_place_update(&mut self, value: &mut V) -> UpdateDecision {
        *value = (self.update)(Some(&*value));
        UpdateDecision::Updated
    }

    fn copy_update(&mut self, old_value: &V) -> V {
        (self.update)(Some(old_value))
    }
}
