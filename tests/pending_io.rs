//! Pending I/O paths: cold reads, read options, disk-chain continuation,
//! and RMW over device-resident records.

use std::sync::Arc;

use splicekv::{
    Address, Key, LogSettings, MemoryDevice, ReadCacheSettings, ReadOptions, SpliceKv, Status,
    StatusDetail, StoreSettings,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ChainKey(u64);

impl Key for ChainKey {
    fn key_hash(&self) -> u64 {
        self.0 % 10
    }
}

fn settings(read_cache: bool) -> StoreSettings {
    StoreSettings {
        table_size: 64,
        log: LogSettings {
            memory_size_bits: 16,
            page_size_bits: 12,
            read_cache: read_cache.then_some(ReadCacheSettings {
                memory_size_bits: 15,
                page_size_bits: 12,
            }),
        },
    }
}

fn new_store(read_cache: bool) -> Arc<SpliceKv<ChainKey, u64>> {
    Arc::new(SpliceKv::new(settings(read_cache), MemoryDevice::new()))
}

#[test]
fn test_cold_read_completes_with_cache_copy() {
    let store = new_store(true);
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(5), &500);
    assert_eq!(session.flush_and_evict(), Status::Ok);

    let result = session.read(&ChainKey(5));
    assert_eq!(result.status, Status::Pending);
    assert_eq!(session.pending_count(), 1);

    let (done, outputs) = session.complete_pending_with_outputs(true);
    assert!(done);
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].status.is_ok());
    assert_eq!(outputs[0].value, Some(500));
    assert!(outputs[0].detail.contains(StatusDetail::COPIED_TO_READ_CACHE));

    // Now warm.
    let result = session.read(&ChainKey(5));
    assert!(result.status.is_ok());
    assert_eq!(result.value, Some(500));
    assert_eq!(session.pending_count(), 0);
}

#[test]
fn test_read_missing_key_not_found_without_io() {
    let store = new_store(true);
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(5), &500);
    assert_eq!(session.flush_and_evict(), Status::Ok);

    // Same bucket, different key: the disk chain ends without a match.
    let result = session.read(&ChainKey(15));
    assert_eq!(result.status, Status::Pending);
    let (_, outputs) = session.complete_pending_with_outputs(true);
    assert_eq!(outputs[0].status, Status::NotFound);

    // A bucket that was never written resolves synchronously.
    let result = session.read(&ChainKey(6));
    assert_eq!(result.status, Status::NotFound);
    assert_eq!(session.pending_count(), 0);
}

#[test]
fn test_disk_chain_continuation_across_records() {
    let store = new_store(true);
    let mut session = store.start_session().unwrap();
    // Three bucket-0 keys; the chain head on disk is 20, the target 0.
    for k in [0u64, 10, 20] {
        session.upsert(&ChainKey(k), &(k + 1));
    }
    assert_eq!(session.flush_and_evict(), Status::Ok);

    let result = session.read(&ChainKey(0));
    assert_eq!(result.status, Status::Pending);
    let (done, outputs) = session.complete_pending_with_outputs(true);
    assert!(done);
    assert_eq!(outputs[0].value, Some(1));
}

#[test]
fn test_copy_reads_to_tail_without_read_cache() {
    let store = new_store(false);
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(9), &900);
    assert_eq!(session.flush_and_evict(), Status::Ok);

    let options = ReadOptions::new().with_copy_reads_to_tail(true);
    let result = session.read_with_options(&ChainKey(9), &options);
    assert_eq!(result.status, Status::Pending);

    let (_, outputs) = session.complete_pending_with_outputs(true);
    assert!(outputs[0].status.is_ok());
    assert!(outputs[0].detail.contains(StatusDetail::COPIED_RECORD));

    // The copy sits at the hybrid-log tail: the next read is synchronous.
    let result = session.read(&ChainKey(9));
    assert!(result.status.is_ok());
    assert_eq!(result.value, Some(900));
    assert_eq!(session.pending_count(), 0);
}

#[test]
fn test_disable_read_cache_updates_skips_install() {
    let store = new_store(true);
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(4), &400);
    assert_eq!(session.flush_and_evict(), Status::Ok);

    let options = ReadOptions::new().with_disable_read_cache_updates(true);
    let result = session.read_with_options(&ChainKey(4), &options);
    assert_eq!(result.status, Status::Pending);
    let (_, outputs) = session.complete_pending_with_outputs(true);
    assert!(outputs[0].status.is_ok());
    assert!(outputs[0].detail.is_empty());

    // Nothing was installed: the key is still cold.
    let result = session.read_with_options(&ChainKey(4), &options);
    assert_eq!(result.status, Status::Pending);
    assert!(session.complete_pending(true));
}

#[test]
fn test_disable_read_cache_reads_falls_through_to_device() {
    let store = new_store(true);
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(8), &800);
    assert_eq!(session.flush_and_evict(), Status::Ok);

    // Warm the cache (and drain the warm-up output).
    assert_eq!(session.read(&ChainKey(8)).status, Status::Pending);
    let (done, _) = session.complete_pending_with_outputs(true);
    assert!(done);
    assert!(session.read(&ChainKey(8)).status.is_ok());

    // With cache reads disabled the lookup walks past the cached copy.
    let options = ReadOptions::new()
        .with_disable_read_cache_reads(true)
        .with_disable_read_cache_updates(true);
    let result = session.read_with_options(&ChainKey(8), &options);
    assert_eq!(result.status, Status::Pending);
    let (_, outputs) = session.complete_pending_with_outputs(true);
    assert_eq!(outputs[0].value, Some(800));
}

#[test]
fn test_stop_address_bounds_traversal() {
    let store = new_store(true);
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(2), &200);
    assert_eq!(session.flush_and_evict(), Status::Ok);

    // Everything lies below the head; a cutoff at the head turns the
    // lookup into a miss instead of an I/O.
    let options = ReadOptions::new().with_stop_address(store.hlog().head_address());
    let result = session.read_with_options(&ChainKey(2), &options);
    assert_eq!(result.status, Status::NotFound);
    assert_eq!(session.pending_count(), 0);

    // A cutoff at the log start changes nothing.
    let options = ReadOptions::new().with_stop_address(Address::FIRST_VALID);
    let result = session.read_with_options(&ChainKey(2), &options);
    assert_eq!(result.status, Status::Pending);
    assert!(session.complete_pending(true));
}

#[test]
fn test_pending_rmw_copy_updates_from_device() {
    let store = new_store(true);
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(7), &700);
    assert_eq!(session.flush_and_evict(), Status::Ok);

    let result = session.rmw_fn(&ChainKey(7), |old| old.copied().unwrap_or(0) + 7);
    assert_eq!(result.status, Status::Pending);

    let (done, outputs) = session.complete_pending_with_outputs(true);
    assert!(done);
    assert!(outputs[0].status.is_ok());
    assert!(outputs[0].detail.contains(StatusDetail::COPY_UPDATED));

    let result = session.read(&ChainKey(7));
    assert!(result.status.is_ok());
    assert_eq!(result.value, Some(707));
}

#[test]
fn test_rmw_initial_value_for_missing_key() {
    let store = new_store(true);
    let mut session = store.start_session().unwrap();

    let result = session.rmw_fn(&ChainKey(1), |old| old.copied().unwrap_or(100) + 1);
    assert!(result.status.is_ok());
    assert!(result.detail.contains(StatusDetail::CREATED_RECORD));
    assert_eq!(session.read(&ChainKey(1)).value, Some(101));
}

#[test]
fn test_tombstone_on_device_resolves_not_found() {
    let store = new_store(true);
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(3), &300);
    // Push the record out of the mutable region so the delete appends a
    // tombstone instead of short-circuiting in place.
    assert_eq!(session.flush_and_evict(), Status::Ok);
    assert!(session
        .delete(&ChainKey(3))
        .detail
        .contains(StatusDetail::CREATED_RECORD));
    assert_eq!(session.flush_and_evict(), Status::Ok);

    let result = session.read(&ChainKey(3));
    assert_eq!(result.status, Status::Pending);
    let (_, outputs) = session.complete_pending_with_outputs(true);
    assert_eq!(outputs[0].status, Status::NotFound);
}

#[test]
fn test_interleaved_pending_reads_keep_serial_order() {
    let store = new_store(true);
    let mut session = store.start_session().unwrap();
    for k in 0..40u64 {
        session.upsert(&ChainKey(k), &(k * 3));
    }
    assert_eq!(session.flush_and_evict(), Status::Ok);

    for k in 0..40u64 {
        assert_eq!(session.read(&ChainKey(k)).status, Status::Pending);
    }
    let (done, mut outputs) = session.complete_pending_with_outputs(true);
    assert!(done);
    assert_eq!(outputs.len(), 40);
    outputs.sort_by_key(|o| o.serial);
    for (i, output) in outputs.iter().enumerate() {
        assert!(output.status.is_ok());
        assert_eq!(output.value, Some(i as u64 * 3), "output for key {i}");
    }
}
