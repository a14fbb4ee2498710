//! The store: operation engine, sessions, callbacks, and pending I/O.

mod contexts;
mod inspect;
mod kv_store;
mod options;
mod pending_io;
mod session;

pub use contexts::{ClosureRmw, RmwContext, UpdateDecision};
pub use inspect::{ChainLink, Ring};
pub use kv_store::{ExecContext, MutateResult, PendingOutput, ReadResult, SpliceKv};
pub use options::ReadOptions;
pub use session::Session;
