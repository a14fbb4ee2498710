//! In-memory device.
//!
//! Backs the on-disk log region with a growable byte vector. Used by tests
//! and by deployments that want the full eviction/pending-I/O machinery
//! without a real disk.

use std::io;

use parking_lot::RwLock;

use crate::device::SyncStorageDevice;

/// A device holding its contents in memory.
pub struct MemoryDevice {
    bytes: RwLock<Vec<u8>>,
}

impl MemoryDevice {
    /// Create an empty device.
    pub fn new() -> Self {
        Self {
            bytes: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStorageDevice for MemoryDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = self.bytes.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past device end: {end} > {}", bytes.len()),
            ));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(buf.len())
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self.bytes.write();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        Ok(self.bytes.read().len() as u64)
    }
}
