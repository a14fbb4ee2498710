//! Device traits.
//!
//! The device is an external collaborator: an append-only paged store
//! addressed by logical offset. The async trait returns boxed futures so
//! the pending-I/O worker can drive any backend; simple backends implement
//! the sync trait and get the async surface through the blanket impl.

use std::future::Future;
use std::io;
use std::pin::Pin;

/// Boxed future alias for device operations.
pub type DeviceFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Asynchronous storage device.
pub trait StorageDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> DeviceFuture<'_, usize>;

    /// Write `buf` at `offset`.
    fn write(&self, offset: u64, buf: &[u8]) -> DeviceFuture<'_, usize>;

    /// Flush buffered writes to stable storage.
    fn flush(&self) -> DeviceFuture<'_, ()>;

    /// Current device size in bytes.
    fn size(&self) -> io::Result<u64>;
}

/// Synchronous storage device, adapted to [`StorageDevice`] below.
pub trait SyncStorageDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes at `offset`.
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` at `offset`.
    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Flush buffered writes.
    fn flush_sync(&self) -> io::Result<()>;

    /// Current device size in bytes.
    fn size_sync(&self) -> io::Result<u64>;
}

impl<T: SyncStorageDevice> StorageDevice for T {
    fn read(&self, offset: u64, buf: &mut [u8]) -> DeviceFuture<'_, usize> {
        let result = self.read_sync(offset, buf);
        Box::pin(async move { result })
    }

    fn write(&self, offset: u64, buf: &[u8]) -> DeviceFuture<'_, usize> {
        let result = self.write_sync(offset, buf);
        Box::pin(async move { result })
    }

    fn flush(&self) -> DeviceFuture<'_, ()> {
        let result = self.flush_sync();
        Box::pin(async move { result })
    }

    fn size(&self) -> io::Result<u64> {
        self.size_sync()
    }
}
