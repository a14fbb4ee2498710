//! Epoch protection for safe reclamation of ring pages and bucket entries.

mod light_epoch;

pub use light_epoch::{acquire_thread_id, release_thread_id, LightEpoch, UNPROTECTED};
