//! The hybrid log: an append-only paged ring with three regions.
//!
//! Addresses grow monotonically. `[begin, head)` lives on the device,
//! `[head, read_only)` is immutable in memory, `[read_only, tail)` is the
//! mutable in-memory region. Page frames are recycled in place once the
//! safe head has passed them, so record pointers stay valid for as long as
//! the holder is epoch-protected.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::address::{Address, AtomicAddress};
use crate::status::OperationStatus;
use crate::utility::AlignedBuffer;

/// Sizing for a hybrid log or read-cache ring.
#[derive(Debug, Clone, Copy)]
pub struct HybridLogConfig {
    /// log2 of the total in-memory budget in bytes.
    pub memory_size_bits: u32,
    /// log2 of the page size in bytes.
    pub page_size_bits: u32,
}

impl HybridLogConfig {
    /// Page size in bytes.
    #[inline]
    pub const fn page_size(&self) -> u64 {
        1 << self.page_size_bits
    }

    /// Total in-memory budget in bytes.
    #[inline]
    pub const fn memory_size(&self) -> u64 {
        1 << self.memory_size_bits
    }

    /// Number of page frames kept in memory.
    #[inline]
    pub const fn num_frames(&self) -> u64 {
        self.memory_size() / self.page_size()
    }
}

/// A byte range within one page, used when flushing to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    /// Device offset of the span start (equals the logical address).
    pub offset: u64,
    /// Page the span lives in.
    pub page: u64,
    /// Byte offset of the span within the page.
    pub start: u64,
    /// Byte length of the span.
    pub len: u64,
}

/// The paged record ring backing the hybrid log (and, with the read-cache
/// bit, the read cache).
pub struct HybridLog {
    config: HybridLogConfig,
    frames: Vec<AlignedBuffer>,
    /// Next allocation position (linear address).
    tail: AtomicU64,
    read_only: AtomicAddress,
    safe_read_only: AtomicAddress,
    head: AtomicAddress,
    safe_head: AtomicAddress,
    flushed_until: AtomicAddress,
    begin: AtomicAddress,
}

impl HybridLog {
    /// Create a ring with all page frames pre-allocated and zeroed.
    pub fn new(config: HybridLogConfig) -> Self {
        assert!(config.page_size_bits >= 6, "pages must hold a cache line");
        assert!(
            config.memory_size_bits > config.page_size_bits,
            "memory budget must exceed one page"
        );
        let page_size = config.page_size() as usize;
        let frames = (0..config.num_frames())
            .map(|_| AlignedBuffer::zeroed(page_size, page_size).expect("page frame allocation"))
            .collect();

        let start = Address::FIRST_VALID;
        Self {
            config,
            frames,
            tail: AtomicU64::new(start.control()),
            read_only: AtomicAddress::new(start),
            safe_read_only: AtomicAddress::new(start),
            head: AtomicAddress::new(start),
            safe_head: AtomicAddress::new(start),
            flushed_until: AtomicAddress::new(start),
            begin: AtomicAddress::new(start),
        }
    }

    /// Ring sizing.
    #[inline]
    pub fn config(&self) -> &HybridLogConfig {
        &self.config
    }

    /// Current tail (next allocation position).
    #[inline]
    pub fn tail_address(&self) -> Address {
        Address::from_control(self.tail.load(Ordering::Acquire))
    }

    /// Mutable-region boundary.
    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.read_only.load(Ordering::Acquire)
    }

    /// Flushed mutable-region boundary.
    #[inline]
    pub fn safe_read_only_address(&self) -> Address {
        self.safe_read_only.load(Ordering::Acquire)
    }

    /// In-memory boundary: addresses below this are on the device.
    #[inline]
    pub fn head_address(&self) -> Address {
        self.head.load(Ordering::Acquire)
    }

    /// Boundary below which page frames may be recycled.
    #[inline]
    pub fn safe_head_address(&self) -> Address {
        self.safe_head.load(Ordering::Acquire)
    }

    /// Durable boundary: addresses below this have been written out.
    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.flushed_until.load(Ordering::Acquire)
    }

    /// First logically present address.
    #[inline]
    pub fn begin_address(&self) -> Address {
        self.begin.load(Ordering::Acquire)
    }

    /// Whether `address` is in the in-place-updatable region.
    #[inline]
    pub fn is_mutable(&self, address: Address) -> bool {
        address >= self.read_only_address()
    }

    /// Whether `address` has left memory.
    #[inline]
    pub fn is_on_disk(&self, address: Address) -> bool {
        address < self.head_address()
    }

    /// Reserve `size` bytes at the tail. Records never straddle a page: an
    /// allocation that would cross skips to the next page boundary, leaving
    /// zeroed (null-header) filler that scans know to step over.
    ///
    /// Fails with `AllocateFailed` when the reservation would overrun the
    /// in-memory budget; the caller makes room and retries.
    pub fn allocate(&self, size: u32) -> Result<Address, OperationStatus> {
        let size = size as u64;
        let page_size = self.config.page_size();
        assert!(size <= page_size, "record larger than a page");

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let offset = tail & (page_size - 1);

            let start = if offset + size <= page_size {
                tail
            } else {
                (tail & !(page_size - 1)) + page_size
            };
            let new_tail = start + size;

            // Frames are reusable only below the page containing safe_head.
            let reclaim_floor =
                self.safe_head.load(Ordering::Acquire).control() & !(page_size - 1);
            if new_tail - reclaim_floor > self.config.memory_size() {
                return Err(OperationStatus::AllocateFailed);
            }

            if self
                .tail
                .compare_exchange(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Address::from_control(start));
            }
        }
    }

    /// Raw pointer to the bytes at `address`.
    ///
    /// # Safety
    /// `address` must lie in `[safe_head_page_floor, tail)` and the caller
    /// must be epoch-protected so the frame cannot be recycled underneath.
    #[inline]
    pub unsafe fn get(&self, address: Address) -> *mut u8 {
        let bits = self.config.page_size_bits;
        let frame = (address.page(bits) % self.config.num_frames()) as usize;
        self.frames[frame]
            .as_ptr()
            .add(address.offset(bits) as usize)
    }

    /// Bytes of the given page, for flushing.
    ///
    /// # Safety
    /// The page must currently be resident (between the safe-head page and
    /// the tail page).
    pub unsafe fn page_slice(&self, page: u64) -> &[u8] {
        let frame = (page % self.config.num_frames()) as usize;
        self.frames[frame].as_slice()
    }

    /// Enumerate per-page spans covering `[from, to)`.
    pub fn spans(&self, from: Address, to: Address) -> Vec<PageSpan> {
        let bits = self.config.page_size_bits;
        let page_size = self.config.page_size();
        let mut spans = Vec::new();
        let mut cursor = from.control();
        let end = to.control();
        while cursor < end {
            let page = cursor >> bits;
            let start = cursor & (page_size - 1);
            let len = (page_size - start).min(end - cursor);
            spans.push(PageSpan {
                offset: cursor,
                page,
                start,
                len,
            });
            cursor += len;
        }
        spans
    }

    /// Advance the mutable-region boundary.
    pub fn shift_read_only_address(&self, new: Address) -> bool {
        let moved = self.read_only.advance_to(new);
        if moved {
            debug!(target: "splicekv::hlog", new = new.control(), "read-only boundary shifted");
        }
        moved
    }

    /// Record that everything below `new` is durable.
    pub fn mark_flushed_until(&self, new: Address) {
        self.flushed_until.advance_to(new);
        self.safe_read_only.advance_to(new);
    }

    /// Advance the head. The caller is responsible for draining the epoch
    /// and then calling [`HybridLog::complete_head_shift`].
    pub fn shift_head_address(&self, new: Address) -> bool {
        debug_assert!(new <= self.flushed_until_address());
        let moved = self.head.advance_to(new);
        if moved {
            debug!(target: "splicekv::hlog", new = new.control(), "head shifted");
        }
        moved
    }

    /// Finish a head shift after the epoch has drained: recycle the frames
    /// of fully evicted pages, then open them for reuse by advancing the
    /// safe head.
    pub fn complete_head_shift(&self, new_head: Address) {
        let bits = self.config.page_size_bits;
        let old_safe = self.safe_head.load(Ordering::Acquire);
        let first_dead = old_safe.page(bits);
        let first_live = new_head.page(bits);
        for page in first_dead..first_live {
            let frame = (page % self.config.num_frames()) as usize;
            self.frames[frame].reset();
        }
        self.safe_head.advance_to(new_head);
    }

    /// Advance the begin address (log truncation).
    pub fn shift_begin_address(&self, new: Address) {
        self.begin.advance_to(new);
    }
}

// SAFETY: all shared mutation goes through atomics; frame recycling is
// gated by the epoch protocol described on the methods above.
unsafe impl Send for HybridLog {}
unsafe impl Sync for HybridLog {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> HybridLog {
        HybridLog::new(HybridLogConfig {
            memory_size_bits: 16, // 64 KiB
            page_size_bits: 12,   // 4 KiB pages
        })
    }

    #[test]
    fn test_initial_regions() {
        let log = test_log();
        assert_eq!(log.tail_address(), Address::FIRST_VALID);
        assert_eq!(log.head_address(), Address::FIRST_VALID);
        assert_eq!(log.read_only_address(), Address::FIRST_VALID);
        assert_eq!(log.begin_address(), Address::FIRST_VALID);
    }

    #[test]
    fn test_allocate_sequential() {
        let log = test_log();
        let a = log.allocate(24).unwrap();
        let b = log.allocate(24).unwrap();
        assert_eq!(a, Address::FIRST_VALID);
        assert_eq!(b, a + 24);
    }

    #[test]
    fn test_allocate_skips_page_boundary() {
        let log = test_log();
        // Fill most of the first page.
        let _ = log.allocate(4096 - 64 - 16).unwrap();
        let next = log.allocate(24).unwrap();
        assert_eq!(next.offset(12), 0);
        assert_eq!(next.page(12), 1);
    }

    #[test]
    fn test_allocate_fails_past_budget() {
        let log = test_log();
        // 16 frames of 4 KiB; keep allocating until the budget trips.
        let mut failed = false;
        for _ in 0..(1 << 12) {
            if log.allocate(1024).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn test_spans_cover_range() {
        let log = test_log();
        let from = Address::from_control(64);
        let to = Address::from_control(4096 + 100);
        let spans = log.spans(from, to);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].offset, 64);
        assert_eq!(spans[0].len, 4096 - 64);
        assert_eq!(spans[1].offset, 4096);
        assert_eq!(spans[1].len, 100);
        let total: u64 = spans.iter().map(|s| s.len).sum();
        assert_eq!(total, to - from);
    }

    #[test]
    fn test_region_predicates() {
        let log = test_log();
        let a = log.allocate(24).unwrap();
        assert!(log.is_mutable(a));
        assert!(!log.is_on_disk(a));

        log.shift_read_only_address(log.tail_address());
        assert!(!log.is_mutable(a));
        log.mark_flushed_until(log.tail_address());
        log.shift_head_address(log.tail_address());
        assert!(log.is_on_disk(a));
    }

    #[test]
    fn test_write_read_through_pointer() {
        let log = test_log();
        let addr = log.allocate(8).unwrap();
        unsafe {
            let p = log.get(addr);
            std::ptr::write(p as *mut u64, 0xfeed_f00d);
            assert_eq!(std::ptr::read(p as *const u64), 0xfeed_f00d);
        }
    }
}
