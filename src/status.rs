//! Operation statuses.
//!
//! [`Status`] is what sessions return to callers. [`StatusDetail`] carries
//! the advanced outcome bits (which path produced the result). The internal
//! [`OperationStatus`] drives the engine's retry loop and is never surfaced.

use std::fmt;

/// Status returned to callers by session operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// The operation completed; for reads, the key was found.
    #[default]
    Ok = 0,
    /// The key was not found (or a tombstone terminated the lookup).
    NotFound = 1,
    /// Asynchronous I/O is outstanding; drive it with `complete_pending`.
    Pending = 2,
    /// A user callback canceled the operation.
    Canceled = 3,
    /// The in-memory budget could not admit the record.
    OutOfMemory = 4,
    /// Device I/O failed.
    IoError = 5,
    /// Persistent state failed validation.
    Corruption = 6,
    /// The operation is not valid in the current session state.
    InvalidOperation = 7,
    /// The store observed a fatal invariant violation and refuses mutations.
    Unhealthy = 8,
    /// More threads than the epoch table supports.
    TooManyThreads = 9,
}

impl Status {
    /// Whether the operation completed successfully.
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Whether the operation went pending on I/O.
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }

    /// Whether the key was not found.
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Whether this status is a hard error.
    #[inline]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Status::OutOfMemory
                | Status::IoError
                | Status::Corruption
                | Status::InvalidOperation
                | Status::Unhealthy
                | Status::TooManyThreads
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::Pending => "Pending",
            Status::Canceled => "Canceled",
            Status::OutOfMemory => "OutOfMemory",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::InvalidOperation => "InvalidOperation",
            Status::Unhealthy => "Unhealthy",
            Status::TooManyThreads => "TooManyThreads",
        };
        f.write_str(s)
    }
}

/// Advanced outcome bits accompanying a [`Status`].
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusDetail(u8);

impl StatusDetail {
    /// No detail bits.
    pub const NONE: Self = Self(0);
    /// A new record was appended at the hybrid-log tail.
    pub const CREATED_RECORD: Self = Self(1);
    /// The result was copied into the read cache.
    pub const COPIED_TO_READ_CACHE: Self = Self(1 << 1);
    /// The result was copied to the hybrid-log tail (`copy_reads_to_tail`).
    pub const COPIED_RECORD: Self = Self(1 << 2);
    /// An existing mutable-region record was updated in place.
    pub const IN_PLACE_UPDATED: Self = Self(1 << 3);
    /// RMW produced a new record from an existing value.
    pub const COPY_UPDATED: Self = Self(1 << 4);
    /// RMW found the prior value expired and appended a tombstone.
    pub const EXPIRED: Self = Self(1 << 5);

    /// Whether all bits of `other` are set in `self`.
    #[inline]
    pub const fn contains(&self, other: StatusDetail) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of two detail sets.
    #[inline]
    pub const fn with(self, other: StatusDetail) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether no bits are set.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for StatusDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut emit = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(name)
        };
        if self.is_empty() {
            return f.write_str("NONE");
        }
        if self.contains(Self::CREATED_RECORD) {
            emit(f, "CREATED_RECORD")?;
        }
        if self.contains(Self::COPIED_TO_READ_CACHE) {
            emit(f, "COPIED_TO_READ_CACHE")?;
        }
        if self.contains(Self::COPIED_RECORD) {
            emit(f, "COPIED_RECORD")?;
        }
        if self.contains(Self::IN_PLACE_UPDATED) {
            emit(f, "IN_PLACE_UPDATED")?;
        }
        if self.contains(Self::COPY_UPDATED) {
            emit(f, "COPY_UPDATED")?;
        }
        if self.contains(Self::EXPIRED) {
            emit(f, "EXPIRED")?;
        }
        Ok(())
    }
}

/// Internal status driving the engine loop. Transient variants are resolved
/// by bounded retries and epoch refreshes; they never reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationStatus {
    /// Operation finished; result bits are in the output.
    Success,
    /// Key not found.
    NotFound,
    /// Small-window conflict; retry within the same epoch.
    RetryNow,
    /// Retry after refreshing the epoch.
    RetryLater,
    /// The record is below the head address; async I/O is required.
    RecordOnDisk,
    /// A checkpoint phase shift was observed; refresh the session version.
    CprShiftDetected,
    /// Tail allocation hit an unflushed page; make room and retry.
    AllocateFailed,
    /// A user callback canceled the operation.
    Canceled,
}

impl OperationStatus {
    /// Whether the engine loop should run the operation again.
    #[inline]
    pub const fn needs_retry(&self) -> bool {
        matches!(
            self,
            OperationStatus::RetryNow
                | OperationStatus::RetryLater
                | OperationStatus::CprShiftDetected
                | OperationStatus::AllocateFailed
        )
    }

    /// Terminal statuses mapped to the caller-facing [`Status`].
    pub const fn to_status(&self) -> Status {
        match self {
            OperationStatus::Success => Status::Ok,
            OperationStatus::NotFound => Status::NotFound,
            OperationStatus::RecordOnDisk => Status::Pending,
            OperationStatus::Canceled => Status::Canceled,
            OperationStatus::RetryNow
            | OperationStatus::RetryLater
            | OperationStatus::CprShiftDetected
            | OperationStatus::AllocateFailed => Status::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(Status::Ok.is_ok());
        assert!(Status::Pending.is_pending());
        assert!(Status::NotFound.is_not_found());
        assert!(Status::IoError.is_error());
        assert!(!Status::Canceled.is_error());
    }

    #[test]
    fn test_detail_bits() {
        let d = StatusDetail::CREATED_RECORD.with(StatusDetail::COPY_UPDATED);
        assert!(d.contains(StatusDetail::CREATED_RECORD));
        assert!(d.contains(StatusDetail::COPY_UPDATED));
        assert!(!d.contains(StatusDetail::COPIED_TO_READ_CACHE));
        assert!(StatusDetail::NONE.is_empty());
    }

    #[test]
    fn test_detail_debug() {
        let d = StatusDetail::COPIED_TO_READ_CACHE;
        assert_eq!(format!("{d:?}"), "COPIED_TO_READ_CACHE");
        assert_eq!(format!("{:?}", StatusDetail::NONE), "NONE");
    }

    #[test]
    fn test_operation_status_mapping() {
        assert_eq!(OperationStatus::Success.to_status(), Status::Ok);
        assert_eq!(OperationStatus::NotFound.to_status(), Status::NotFound);
        assert_eq!(OperationStatus::RecordOnDisk.to_status(), Status::Pending);
        assert_eq!(OperationStatus::Canceled.to_status(), Status::Canceled);
        assert!(OperationStatus::RetryNow.needs_retry());
        assert!(OperationStatus::AllocateFailed.needs_retry());
        assert!(!OperationStatus::RecordOnDisk.needs_retry());
    }
}
