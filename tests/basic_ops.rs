//! Basic operation semantics against the in-memory regions.

use std::sync::Arc;
use std::thread;

use splicekv::store::{Ring, UpdateDecision};
use splicekv::{
    Key, LogSettings, MemoryDevice, ReadCacheSettings, ReadOptions, SpliceKv, Status, StatusDetail,
    StoreSettings,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ChainKey(u64);

impl Key for ChainKey {
    fn key_hash(&self) -> u64 {
        self.0 % 10
    }
}

fn settings() -> StoreSettings {
    StoreSettings {
        table_size: 64,
        log: LogSettings {
            memory_size_bits: 16,
            page_size_bits: 12,
            read_cache: Some(ReadCacheSettings {
                memory_size_bits: 15,
                page_size_bits: 12,
            }),
        },
    }
}

fn new_store() -> Arc<SpliceKv<ChainKey, u64>> {
    Arc::new(SpliceKv::new(settings(), MemoryDevice::new()))
}

#[test]
fn test_upsert_then_read() {
    let store = new_store();
    let mut session = store.start_session().unwrap();

    let result = session.upsert(&ChainKey(1), &10);
    assert!(result.status.is_ok());
    assert!(result.detail.contains(StatusDetail::CREATED_RECORD));

    let result = session.read(&ChainKey(1));
    assert!(result.status.is_ok());
    assert_eq!(result.value, Some(10));
}

#[test]
fn test_second_upsert_updates_in_place() {
    let store = new_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&ChainKey(1), &10);
    let result = session.upsert(&ChainKey(1), &20);
    assert!(result.status.is_ok());
    assert!(result.detail.contains(StatusDetail::IN_PLACE_UPDATED));
    assert_eq!(session.read(&ChainKey(1)).value, Some(20));
}

#[test]
fn test_read_missing_key() {
    let store = new_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.read(&ChainKey(42)).status, Status::NotFound);
}

#[test]
fn test_delete_in_place_short_circuit() {
    let store = new_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&ChainKey(2), &20);
    let result = session.delete(&ChainKey(2));
    assert!(result.status.is_ok());
    // Mutable-region record: tombstone bit set in place, nothing appended.
    assert!(result.detail.is_empty());

    assert_eq!(session.read(&ChainKey(2)).status, Status::NotFound);

    // A second delete of a dead key reports not-found.
    assert_eq!(session.delete(&ChainKey(2)).status, Status::NotFound);

    // Re-inserting appends a fresh record above the tombstone.
    let result = session.upsert(&ChainKey(2), &22);
    assert!(result.detail.contains(StatusDetail::CREATED_RECORD));
    assert_eq!(session.read(&ChainKey(2)).value, Some(22));
}

#[test]
fn test_delete_missing_key() {
    let store = new_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.delete(&ChainKey(9)).status, Status::NotFound);
}

#[test]
fn test_rmw_in_place_in_mutable_region() {
    let store = new_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&ChainKey(3), &1);
    let result = session.rmw_fn(&ChainKey(3), |old| old.copied().unwrap_or(0) * 10);
    assert!(result.status.is_ok());
    assert!(result.detail.contains(StatusDetail::IN_PLACE_UPDATED));
    assert_eq!(session.read(&ChainKey(3)).value, Some(10));
}

#[test]
fn test_rmw_cancel_propagates() {
    struct Canceling;
    impl splicekv::store::RmwContext<ChainKey, u64> for Canceling {
        fn initial_value(&mut self) -> u64 {
            0
        }
        fn in_place_update(&mut self, _value: &mut u64) -> UpdateDecision {
            UpdateDecision::Cancel
        }
        fn copy_update(&mut self, old_value: &u64) -> u64 {
            *old_value
        }
    }

    let store = new_store();
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(4), &40);

    let result = session.rmw(&ChainKey(4), Canceling);
    assert_eq!(result.status, Status::Canceled);
    assert_eq!(session.read(&ChainKey(4)).value, Some(40));
}

#[test]
fn test_rmw_expiration_appends_tombstone() {
    struct ExpireAll;
    impl splicekv::store::RmwContext<ChainKey, u64> for ExpireAll {
        fn initial_value(&mut self) -> u64 {
            0
        }
        fn in_place_update(&mut self, _value: &mut u64) -> UpdateDecision {
            UpdateDecision::NeedCopy
        }
        fn copy_update(&mut self, old_value: &u64) -> u64 {
            *old_value
        }
        fn is_expired(&self, _old_value: &u64) -> bool {
            true
        }
    }

    let store = new_store();
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(5), &50);

    let result = session.rmw(&ChainKey(5), ExpireAll);
    assert!(result.status.is_ok());
    assert!(result.detail.contains(StatusDetail::EXPIRED));
    assert_eq!(session.read(&ChainKey(5)).status, Status::NotFound);
}

#[test]
fn test_reset_modified_read_flag() {
    let store = new_store();
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(6), &60);

    let links = session.dump_chain(splicekv::index::KeyHash::new(6)).unwrap();
    assert!(links[0].modified, "fresh records are dirty");

    let options = ReadOptions::new().with_reset_modified(true);
    assert!(session.read_with_options(&ChainKey(6), &options).status.is_ok());

    let links = session.dump_chain(splicekv::index::KeyHash::new(6)).unwrap();
    assert!(!links[0].modified);
}

#[test]
fn test_chain_orders_collisions_most_recent_first() {
    let store = new_store();
    let mut session = store.start_session().unwrap();
    for k in [1u64, 11, 21, 31] {
        session.upsert(&ChainKey(k), &k);
    }

    let links = session.dump_chain(splicekv::index::KeyHash::new(1)).unwrap();
    let keys: Vec<u64> = links
        .iter()
        .filter(|l| l.ring == Ring::HybridLog)
        .map(|l| l.key.as_ref().unwrap().0)
        .collect();
    assert_eq!(keys, vec![31, 21, 11, 1]);

    for k in [1u64, 11, 21, 31] {
        assert_eq!(session.read(&ChainKey(k)).value, Some(k));
    }
}

#[test]
fn test_store_without_read_cache() {
    let store: Arc<SpliceKv<ChainKey, u64>> = Arc::new(SpliceKv::new(
        StoreSettings {
            table_size: 64,
            log: LogSettings {
                memory_size_bits: 16,
                page_size_bits: 12,
                read_cache: None,
            },
        },
        MemoryDevice::new(),
    ));
    let mut session = store.start_session().unwrap();

    session.upsert(&ChainKey(1), &100);
    assert_eq!(session.read(&ChainKey(1)).value, Some(100));
    assert!(store.read_cache().is_none());

    // Cold reads still work; they just never install a cache copy.
    assert_eq!(session.flush_and_evict(), Status::Ok);
    assert_eq!(session.read(&ChainKey(1)).status, Status::Pending);
    let (_, outputs) = session.complete_pending_with_outputs(true);
    assert_eq!(outputs[0].value, Some(100));
    assert!(outputs[0].detail.is_empty());
}

#[test]
fn test_concurrent_upserts_and_reads() {
    let store = new_store();

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                let mut session = store.start_session().unwrap();
                for i in 0..200u64 {
                    let key = ChainKey(t * 1000 + i);
                    assert!(session.upsert(&key, &(key.0 * 2)).status.is_ok());
                    let result = session.read(&key);
                    assert!(result.status.is_ok());
                    assert_eq!(result.value, Some(key.0 * 2));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut session = store.start_session().unwrap();
    for t in 0..4u64 {
        for i in (0..200u64).step_by(17) {
            let key = ChainKey(t * 1000 + i);
            assert_eq!(session.read(&key).value, Some(key.0 * 2));
        }
    }
}

#[test]
fn test_linearizable_per_key_under_contention() {
    let store = new_store();
    let key = ChainKey(77);
    {
        let mut session = store.start_session().unwrap();
        session.upsert(&key, &0);
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            thread::spawn(move || {
                let mut session = store.start_session().unwrap();
                for _ in 0..250 {
                    let result =
                        session.rmw_fn(&key, |old| old.copied().unwrap_or(0) + 1);
                    assert!(result.status.is_ok());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut session = store.start_session().unwrap();
    assert_eq!(session.read(&key).value, Some(1000));
}
