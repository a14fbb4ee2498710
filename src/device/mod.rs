//! Storage device contract for the on-disk log region.

mod memory_device;
mod traits;

pub use memory_device::MemoryDevice;
pub use traits::{StorageDevice, SyncStorageDevice};
