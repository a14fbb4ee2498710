//! Checkpoint metadata.
//!
//! Only the serialized metadata blob is in scope here; the checkpoint and
//! recovery machinery around it is an external collaborator.

mod metadata;

pub use metadata::{CheckpointMetadata, MetadataError, SessionInfo, METADATA_FORMAT_VERSION};

use uuid::Uuid;

use crate::record::{Key, Value};
use crate::store::SpliceKv;

impl<K, V> SpliceKv<K, V>
where
    K: Key,
    V: Value,
{
    /// Snapshot the store's address state into a checkpoint metadata blob.
    pub fn checkpoint_metadata(&self, guid: Uuid) -> CheckpointMetadata {
        let tail = self.hlog().tail_address();
        CheckpointMetadata {
            guid,
            use_snapshot: false,
            version: self.version(),
            next_version: self.version() + 1,
            flushed_address: self.hlog().flushed_until_address(),
            start_address: tail,
            final_address: tail,
            snapshot_final_address: tail,
            head_address: self.hlog().head_address(),
            begin_address: self.hlog().begin_address(),
            delta_tail_address: -1,
            manual_locking_active: false,
            sessions: Vec::new(),
            object_log_segment_offsets: Vec::new(),
        }
    }
}
