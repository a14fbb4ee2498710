//! Checkpoint metadata blob: store snapshot, file round trip, rejection.

use std::fs::File;
use std::io::{BufReader, Write};
use std::sync::Arc;

use uuid::Uuid;

use splicekv::checkpoint::{CheckpointMetadata, MetadataError, SessionInfo};
use splicekv::{
    Key, LogSettings, MemoryDevice, ReadCacheSettings, SpliceKv, Status, StoreSettings,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ChainKey(u64);

impl Key for ChainKey {
    fn key_hash(&self) -> u64 {
        self.0 % 10
    }
}

fn new_store() -> Arc<SpliceKv<ChainKey, u64>> {
    Arc::new(SpliceKv::new(
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
        },
        MemoryDevice::new(),
    ))
}

#[test]
fn test_store_snapshot_reflects_addresses() {
    let store = new_store();
    let mut session = store.start_session().unwrap();
    for k in 0..50u64 {
        session.upsert(&ChainKey(k), &k);
    }
    assert_eq!(session.flush_and_evict(), Status::Ok);

    let metadata = store.checkpoint_metadata(Uuid::new_v4());
    assert_eq!(metadata.version, store.version());
    assert_eq!(metadata.next_version, store.version() + 1);
    assert_eq!(metadata.head_address, store.hlog().head_address());
    assert_eq!(metadata.begin_address, store.hlog().begin_address());
    assert_eq!(metadata.flushed_address, store.hlog().flushed_until_address());
    assert!(metadata.flushed_address >= metadata.head_address);
    assert_eq!(metadata.delta_tail_address, -1);
}

#[test]
fn test_file_round_trip() {
    let store = new_store();
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(1), &1);
    assert_eq!(session.flush_and_evict(), Status::Ok);

    let mut metadata = store.checkpoint_metadata(Uuid::new_v4());
    metadata.sessions.push(SessionInfo {
        id: 1,
        name: "primary".into(),
        until_serial: 2,
        exclusions: vec![],
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("info.dat");
    metadata.write_to(File::create(&path).unwrap()).unwrap();

    let parsed = CheckpointMetadata::read_from(BufReader::new(File::open(&path).unwrap())).unwrap();
    assert_eq!(parsed, metadata);
}

#[test]
fn test_rejects_bit_rot() {
    let store = new_store();
    let metadata = store.checkpoint_metadata(Uuid::new_v4());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("info.dat");
    metadata.write_to(File::create(&path).unwrap()).unwrap();

    // Flip the begin address (line 12) without updating the checksum.
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    lines[11] = "999999".into();
    let mut f = File::create(&path).unwrap();
    f.write_all(lines.join("\n").as_bytes()).unwrap();
    drop(f);

    let err = CheckpointMetadata::read_from(BufReader::new(File::open(&path).unwrap())).unwrap_err();
    assert!(matches!(err, MetadataError::ChecksumMismatch { .. }));
}

#[test]
fn test_version_bump_is_observed_by_sessions() {
    let store = new_store();
    let mut session = store.start_session().unwrap();
    session.upsert(&ChainKey(2), &20);

    // A version shift behaves like a checkpoint phase change: in-flight
    // sessions refresh and the next operation still completes.
    let v = store.bump_version();
    assert_eq!(store.version(), v);
    let result = session.read(&ChainKey(2));
    assert!(result.status.is_ok());
    assert_eq!(result.value, Some(20));
}
