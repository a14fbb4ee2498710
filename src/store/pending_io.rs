//! Pending I/O manager.
//!
//! A background worker owns a tokio runtime and drives device futures, so
//! sessions never block inside an async context. Reads complete out of
//! band and are drained by `complete_pending`; page flushes are submitted
//! with an ack channel so flush-and-evict can wait for durability.

use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::warn;

use crate::device::StorageDevice;

#[derive(Debug)]
pub(crate) enum IoRequest {
    ReadBytes {
        io_id: u64,
        offset: u64,
        len: usize,
    },
    WriteBytes {
        offset: u64,
        bytes: Vec<u8>,
        ack: Sender<io::Result<()>>,
    },
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct ReadCompletion {
    pub io_id: u64,
    pub result: io::Result<Vec<u8>>,
}

/// Background I/O worker bound to one device.
pub(crate) struct PendingIoManager {
    tx: Sender<IoRequest>,
    rx: Receiver<ReadCompletion>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PendingIoManager {
    pub(crate) fn new<D: StorageDevice>(device: Arc<D>) -> Self {
        let (tx, req_rx) = unbounded::<IoRequest>();
        let (comp_tx, rx) = unbounded::<ReadCompletion>();

        let worker = thread::Builder::new()
            .name("splicekv-io".into())
            .spawn(move || {
                // Own runtime: callers are plain threads, not tokio tasks.
                let rt = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!(target: "splicekv::io", error = %e, "io runtime failed to start");
                        return;
                    }
                };

                while let Ok(req) = req_rx.recv() {
                    match req {
                        IoRequest::ReadBytes { io_id, offset, len } => {
                            let mut buf = vec![0u8; len];
                            let result = rt.block_on(async {
                                let n = device.read(offset, &mut buf).await?;
                                if n != len {
                                    return Err(io::Error::new(
                                        io::ErrorKind::UnexpectedEof,
                                        format!("short read: expected {len}, got {n}"),
                                    ));
                                }
                                Ok(buf)
                            });
                            let _ = comp_tx.send(ReadCompletion { io_id, result });
                        }
                        IoRequest::WriteBytes { offset, bytes, ack } => {
                            let result = rt.block_on(async {
                                let n = device.write(offset, &bytes).await?;
                                if n != bytes.len() {
                                    return Err(io::Error::new(
                                        io::ErrorKind::WriteZero,
                                        format!("short write: expected {}, got {n}", bytes.len()),
                                    ));
                                }
                                device.flush().await
                            });
                            let _ = ack.send(result);
                        }
                        IoRequest::Shutdown => break,
                    }
                }
            })
            .expect("spawn io worker");

        Self {
            tx,
            rx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Submit an asynchronous record read. The completion arrives via
    /// [`PendingIoManager::drain_completions`].
    pub(crate) fn submit_read(&self, io_id: u64, offset: u64, len: usize) -> bool {
        self.tx
            .send(IoRequest::ReadBytes { io_id, offset, len })
            .is_ok()
    }

    /// Write a page span and wait for the device to acknowledge it.
    pub(crate) fn write_blocking(&self, offset: u64, bytes: Vec<u8>) -> io::Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(IoRequest::WriteBytes {
                offset,
                bytes,
                ack: ack_tx,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "io worker gone"))?;
        ack_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "io worker gone"))?
    }

    /// Pull all completions that have arrived so far (non-blocking).
    pub(crate) fn drain_completions(&self) -> Vec<ReadCompletion> {
        let mut out = Vec::new();
        while let Ok(c) = self.rx.try_recv() {
            out.push(c);
        }
        out
    }
}

impl Drop for PendingIoManager {
    fn drop(&mut self) {
        let _ = self.tx.send(IoRequest::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    #[test]
    fn test_write_then_read_round_trip() {
        let manager = PendingIoManager::new(Arc::new(MemoryDevice::new()));
        manager.write_blocking(64, b"abcdef".to_vec()).unwrap();

        assert!(manager.submit_read(1, 64, 6));
        let completion = loop {
            let mut batch = manager.drain_completions();
            if let Some(c) = batch.pop() {
                break c;
            }
            std::thread::yield_now();
        };
        assert_eq!(completion.io_id, 1);
        assert_eq!(completion.result.unwrap(), b"abcdef");
    }

    #[test]
    fn test_read_error_is_delivered() {
        let manager = PendingIoManager::new(Arc::new(MemoryDevice::new()));
        assert!(manager.submit_read(2, 1 << 20, 16));
        let completion = loop {
            let mut batch = manager.drain_completions();
            if let Some(c) = batch.pop() {
                break c;
            }
            std::thread::yield_now();
        };
        assert_eq!(completion.io_id, 2);
        assert!(completion.result.is_err());
    }
}
