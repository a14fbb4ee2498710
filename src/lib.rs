//! splicekv - a concurrent hybrid-log key-value store core
//!
//! The store keeps an append-only hybrid log (mutable tail, immutable
//! middle, device-resident cold region) behind a lock-free hash index, and
//! splices copies of cold records into the bucket chains through a second
//! in-memory ring, the read cache. Key locks survive eviction by moving
//! between record headers and an overflow lock table.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use splicekv::{MemoryDevice, SpliceKv, StoreSettings};
//!
//! let store = std::sync::Arc::new(SpliceKv::<u64, u64>::new(
//!     StoreSettings::default(),
//!     MemoryDevice::new(),
//! ));
//! let mut session = store.start_session()?;
//!
//! session.upsert(&1, &10);
//! let result = session.read(&1);
//! assert_eq!(result.value, Some(10));
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod epoch;
pub mod index;
pub mod locks;
pub mod record;
pub mod status;
pub mod store;
mod utility;

// Re-exports for convenience
pub use address::{Address, AtomicAddress};
pub use config::{LogSettings, ReadCacheSettings, StoreSettings};
pub use device::{MemoryDevice, StorageDevice};
pub use locks::LockMode;
pub use record::{Key, LockState, Record, RecordInfo, Value};
pub use status::{Status, StatusDetail};
pub use store::{ReadOptions, Session, SpliceKv};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads holding epoch slots concurrently
    pub const MAX_THREADS: usize = 96;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::config::{LogSettings, ReadCacheSettings, StoreSettings};
    pub use crate::device::MemoryDevice;
    pub use crate::locks::LockMode;
    pub use crate::record::{Key, Value};
    pub use crate::status::{Status, StatusDetail};
    pub use crate::store::{ReadOptions, Session, SpliceKv};
}
