//! Chain inspection.
//!
//! Dumps the chain behind a bucket entry for tests and diagnostics, and
//! checks the chain invariants on the way: read-cache records strictly
//! before hybrid-log records, addresses strictly decreasing within each
//! ring. A violation is fatal and marks the store unhealthy.

use crate::address::Address;
use crate::index::KeyHash;
use crate::record::{Key, Value};
use crate::status::Status;
use crate::store::kv_store::SpliceKv;

/// Which ring a chain link resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ring {
    /// Read-cache ring.
    ReadCache,
    /// In-memory hybrid log.
    HybridLog,
    /// Device-resident hybrid log (not dereferenced).
    Disk,
}

/// One record in a dumped chain, in traversal order from the head.
#[derive(Debug, Clone)]
pub struct ChainLink<K> {
    /// Record address (read-cache bit stripped).
    pub address: Address,
    /// Ring the record lives in.
    pub ring: Ring,
    /// The record's key; `None` for device-resident links.
    pub key: Option<K>,
    /// Invalid bit.
    pub invalid: bool,
    /// Tombstone bit.
    pub tombstone: bool,
    /// Sealed bit.
    pub sealed: bool,
    /// Modified (checkpoint dirty) bit.
    pub modified: bool,
}

impl<K, V> SpliceKv<K, V>
where
    K: Key,
    V: Value,
{
    /// Dump the chain for `hash`, head first. The caller must hold an
    /// active session on the current thread (epoch protection).
    ///
    /// Stops at the first device-resident address, which is reported as a
    /// single [`Ring::Disk`] link.
    pub fn dump_chain(&self, hash: KeyHash) -> Result<Vec<ChainLink<K>>, Status> {
        let mut links = Vec::new();
        let found = self.index().find_entry(hash);
        if !found.found() {
            return Ok(links);
        }

        let mut addr = found.entry.address();
        let mut last_rc = Address::INVALID;
        let mut seen_hlog = false;

        while addr.in_read_cache() {
            if seen_hlog {
                self.mark_unhealthy("read-cache record behind a hybrid-log record");
                return Err(Status::Corruption);
            }
            let Some(rc) = self.read_cache() else {
                self.mark_unhealthy("read-cache bit without a read cache");
                return Err(Status::Corruption);
            };
            let stripped = addr.without_read_cache_bit();
            if last_rc.is_valid() && stripped >= last_rc {
                self.mark_unhealthy("read-cache chain addresses not decreasing");
                return Err(Status::Corruption);
            }
            last_rc = stripped;
            if !rc.is_resident(stripped) {
                // Mid-eviction; report what the chain shows without
                // dereferencing.
                links.push(ChainLink {
                    address: stripped,
                    ring: Ring::ReadCache,
                    key: None,
                    invalid: false,
                    tombstone: false,
                    sealed: false,
                    modified: false,
                });
                return Ok(links);
            }
            // SAFETY: resident, caller is epoch-protected.
            let record = unsafe { rc.record_at(stripped) };
            links.push(ChainLink {
                address: stripped,
                ring: Ring::ReadCache,
                key: Some(unsafe { record.key() }.clone()),
                invalid: record.header.is_invalid(),
                tombstone: record.header.is_tombstone(),
                sealed: record.header.is_sealed(),
                modified: record.header.is_modified(),
            });
            addr = record.header.previous_address();
        }

        let head = self.hlog().head_address();
        let mut last_hlog = Address::INVALID;
        while addr.is_valid() && addr >= head {
            seen_hlog = true;
            if last_hlog.is_valid() && addr >= last_hlog {
                self.mark_unhealthy("hybrid-log chain addresses not decreasing");
                return Err(Status::Corruption);
            }
            last_hlog = addr;
            // SAFETY: in [head, tail), caller is epoch-protected.
            let record = unsafe { self.hlog_record_at(addr) };
            links.push(ChainLink {
                address: addr,
                ring: Ring::HybridLog,
                key: Some(unsafe { record.key() }.clone()),
                invalid: record.header.is_invalid(),
                tombstone: record.header.is_tombstone(),
                sealed: record.header.is_sealed(),
                modified: record.header.is_modified(),
            });
            let prev = record.header.previous_address();
            if prev.in_read_cache() {
                self.mark_unhealthy("hybrid-log record links into the read cache");
                return Err(Status::Corruption);
            }
            addr = prev;
        }

        if addr.is_valid() && addr >= self.hlog().begin_address() {
            links.push(ChainLink {
                address: addr,
                ring: Ring::Disk,
                key: None,
                invalid: false,
                tombstone: false,
                sealed: false,
                modified: false,
            });
        }
        Ok(links)
    }
}
