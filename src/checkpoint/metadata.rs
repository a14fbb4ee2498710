//! Textual checkpoint metadata blob.
//!
//! Line-per-field format, fixed field order, guarded by a format version
//! and an XOR checksum over the identifying fields. Parsing rejects any
//! version or checksum mismatch.

use std::io::{self, BufRead, Write};

use uuid::Uuid;

use crate::address::Address;

/// Serialization format version accepted by this build.
pub const METADATA_FORMAT_VERSION: u32 = 4;

/// Errors from reading or writing the metadata blob.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// A field failed to parse.
    #[error("malformed field {field}: {raw}")]
    Malformed {
        /// Field name.
        field: &'static str,
        /// Raw line contents.
        raw: String,
    },
    /// The blob was written by an incompatible format version.
    #[error("format version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build writes.
        expected: u32,
        /// Version found in the blob.
        found: u32,
    },
    /// The checksum does not cover the decoded fields.
    #[error("checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// Recomputed checksum.
        expected: i64,
        /// Checksum found in the blob.
        found: i64,
    },
}

/// Per-session state carried through a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session id.
    pub id: u64,
    /// Session name (no newlines).
    pub name: String,
    /// Serial number the session had reached.
    pub until_serial: u64,
    /// Serials excluded from the checkpoint.
    pub exclusions: Vec<u64>,
}

/// The checkpoint metadata blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMetadata {
    /// Checkpoint identity.
    pub guid: Uuid,
    /// Whether a separate snapshot file backs this checkpoint.
    pub use_snapshot: bool,
    /// Version the checkpoint captured.
    pub version: u32,
    /// Version the store moves to after this checkpoint.
    pub next_version: u32,
    /// Flushed-until logical address.
    pub flushed_address: Address,
    /// Start logical address of the checkpoint.
    pub start_address: Address,
    /// Final logical address of the checkpoint.
    pub final_address: Address,
    /// Final logical address of the snapshot file.
    pub snapshot_final_address: Address,
    /// Head address at checkpoint time.
    pub head_address: Address,
    /// Begin address at checkpoint time.
    pub begin_address: Address,
    /// Delta log tail; -1 when not incremental.
    pub delta_tail_address: i64,
    /// Whether manual locking was active.
    pub manual_locking_active: bool,
    /// Session states.
    pub sessions: Vec<SessionInfo>,
    /// Object-log segment offsets.
    pub object_log_segment_offsets: Vec<u64>,
}

impl CheckpointMetadata {
    /// XOR checksum over the identifying fields: the guid halves, the
    /// version, the five address fields, and the two counts.
    pub fn checksum(&self) -> i64 {
        let guid = self.guid.as_u128();
        let guid_lo = guid as u64;
        let guid_hi = (guid >> 64) as u64;
        let mut sum = guid_lo ^ guid_hi;
        sum ^= self.version as u64;
        sum ^= self.flushed_address.control();
        sum ^= self.start_address.control();
        sum ^= self.final_address.control();
        sum ^= self.head_address.control();
        sum ^= self.begin_address.control();
        sum ^= self.sessions.len() as u64;
        sum ^= self.object_log_segment_offsets.len() as u64;
        sum as i64
    }

    /// Write the blob, line per field.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), MetadataError> {
        writeln!(w, "{METADATA_FORMAT_VERSION}")?;
        writeln!(w, "{}", self.checksum())?;
        writeln!(w, "{}", self.guid)?;
        writeln!(w, "{}", self.use_snapshot)?;
        writeln!(w, "{}", self.version)?;
        writeln!(w, "{}", self.next_version)?;
        writeln!(w, "{}", self.flushed_address.control())?;
        writeln!(w, "{}", self.start_address.control())?;
        writeln!(w, "{}", self.final_address.control())?;
        writeln!(w, "{}", self.snapshot_final_address.control())?;
        writeln!(w, "{}", self.head_address.control())?;
        writeln!(w, "{}", self.begin_address.control())?;
        writeln!(w, "{}", self.delta_tail_address)?;
        writeln!(w, "{}", self.manual_locking_active)?;
        writeln!(w, "{}", self.sessions.len())?;
        for session in &self.sessions {
            debug_assert!(!session.name.contains('\n'));
            writeln!(w, "{}", session.id)?;
            writeln!(w, "{}", session.name)?;
            writeln!(w, "{}", session.until_serial)?;
            writeln!(w, "{}", session.exclusions.len())?;
            for exclusion in &session.exclusions {
                writeln!(w, "{exclusion}")?;
            }
        }
        writeln!(w, "{}", self.object_log_segment_offsets.len())?;
        for offset in &self.object_log_segment_offsets {
            writeln!(w, "{offset}")?;
        }
        Ok(())
    }

    /// Parse a blob, rejecting version and checksum mismatches.
    pub fn read_from<R: BufRead>(r: R) -> Result<Self, MetadataError> {
        let mut lines = r.lines();
        let mut next = |field: &'static str| -> Result<String, MetadataError> {
            match lines.next() {
                Some(Ok(line)) => Ok(line),
                Some(Err(e)) => Err(MetadataError::Io(e)),
                None => Err(MetadataError::Malformed {
                    field,
                    raw: String::from("<eof>"),
                }),
            }
        };

        let format: u32 = parse(&next("format_version")?, "format_version")?;
        if format != METADATA_FORMAT_VERSION {
            return Err(MetadataError::VersionMismatch {
                expected: METADATA_FORMAT_VERSION,
                found: format,
            });
        }
        let found_checksum: i64 = parse(&next("checksum")?, "checksum")?;
        let guid: Uuid = parse(&next("guid")?, "guid")?;
        let use_snapshot: bool = parse(&next("use_snapshot")?, "use_snapshot")?;
        let version: u32 = parse(&next("version")?, "version")?;
        let next_version: u32 = parse(&next("next_version")?, "next_version")?;
        let flushed_address = parse_address(&next("flushed_address")?, "flushed_address")?;
        let start_address = parse_address(&next("start_address")?, "start_address")?;
        let final_address = parse_address(&next("final_address")?, "final_address")?;
        let snapshot_final_address =
            parse_address(&next("snapshot_final_address")?, "snapshot_final_address")?;
        let head_address = parse_address(&next("head_address")?, "head_address")?;
        let begin_address = parse_address(&next("begin_address")?, "begin_address")?;
        let delta_tail_address: i64 = parse(&next("delta_tail_address")?, "delta_tail_address")?;
        let manual_locking_active: bool =
            parse(&next("manual_locking_active")?, "manual_locking_active")?;

        let session_count: usize = parse(&next("session_count")?, "session_count")?;
        let mut sessions = Vec::with_capacity(session_count);
        for _ in 0..session_count {
            let id: u64 = parse(&next("session_id")?, "session_id")?;
            let name = next("session_name")?;
            let until_serial: u64 = parse(&next("until_serial")?, "until_serial")?;
            let exclusion_count: usize = parse(&next("exclusion_count")?, "exclusion_count")?;
            let mut exclusions = Vec::with_capacity(exclusion_count);
            for _ in 0..exclusion_count {
                exclusions.push(parse(&next("exclusion")?, "exclusion")?);
            }
            sessions.push(SessionInfo {
                id,
                name,
                until_serial,
                exclusions,
            });
        }

        let segment_count: usize = parse(&next("segment_count")?, "segment_count")?;
        let mut object_log_segment_offsets = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            object_log_segment_offsets.push(parse(&next("segment_offset")?, "segment_offset")?);
        }

        let metadata = Self {
            guid,
            use_snapshot,
            version,
            next_version,
            flushed_address,
            start_address,
            final_address,
            snapshot_final_address,
            head_address,
            begin_address,
            delta_tail_address,
            manual_locking_active,
            sessions,
            object_log_segment_offsets,
        };
        let expected = metadata.checksum();
        if expected != found_checksum {
            return Err(MetadataError::ChecksumMismatch {
                expected,
                found: found_checksum,
            });
        }
        Ok(metadata)
    }
}

fn parse<T: std::str::FromStr>(raw: &str, field: &'static str) -> Result<T, MetadataError> {
    raw.trim().parse().map_err(|_| MetadataError::Malformed {
        field,
        raw: raw.to_string(),
    })
}

fn parse_address(raw: &str, field: &'static str) -> Result<Address, MetadataError> {
    Ok(Address::from_control(parse::<u64>(raw, field)?))
}
