//! Error types for the sync engine.

use cloudsync_protocol::ProtocolError;
use cloudsync_storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote could not be reached. Retried with backoff before being
    /// surfaced.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The session credential is missing, invalid or expired. Never retried;
    /// the host must supply a new token.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// The remote refused the whole request, e.g. a schema mismatch.
    #[error("remote rejected request: {0}")]
    RemoteRejected(String),

    /// The change log or a backend reached its capacity.
    #[error("storage full: {0}")]
    StorageFull(String),

    /// Persisted state failed validation. Sync stays disabled until the
    /// host resets the fault.
    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    /// The checkpoint could not be persisted. Fatal like corruption.
    #[error("checkpoint write failed: {0}")]
    CheckpointWrite(String),

    /// Other storage failure.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// A cycle is already running and the trigger policy rejects redundant
    /// triggers.
    #[error("a sync cycle is already running")]
    SyncAlreadyRunning,

    /// Sync was disabled by an earlier fatal fault.
    #[error("sync disabled after fatal fault: {0}")]
    SyncDisabled(FailureReason),

    /// The cycle was cancelled before it started applying.
    #[error("sync cancelled")]
    Cancelled,

    /// Malformed message or unexpected protocol state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The replica directory is held by another process.
    #[error("replica directory is locked by another process")]
    ReplicaLocked,
}

impl SyncError {
    /// Returns true if the transport client should retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::NetworkUnavailable(_))
    }

    /// Returns true if this error disables sync until the host intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::StorageCorruption(_) | SyncError::CheckpointWrite(_)
        )
    }

    /// Short classification shown through status queries.
    pub fn reason(&self) -> FailureReason {
        let kind = match self {
            SyncError::NetworkUnavailable(_) => FailureKind::NetworkUnavailable,
            SyncError::AuthExpired(_) => FailureKind::AuthExpired,
            SyncError::RemoteRejected(_) => FailureKind::RemoteRejected,
            SyncError::StorageFull(_) => FailureKind::StorageFull,
            SyncError::StorageCorruption(_) => FailureKind::StorageCorruption,
            SyncError::CheckpointWrite(_) => FailureKind::CheckpointWrite,
            SyncError::SyncDisabled(reason) => return reason.clone(),
            SyncError::Cancelled => FailureKind::Cancelled,
            SyncError::SyncAlreadyRunning => FailureKind::AlreadyRunning,
            SyncError::Storage(_)
            | SyncError::Protocol(_)
            | SyncError::Config(_)
            | SyncError::ReplicaLocked => FailureKind::Internal,
        };
        FailureReason {
            kind,
            message: self.to_string(),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::CapacityExceeded { .. } => SyncError::StorageFull(err.to_string()),
            StorageError::Corrupted { .. } => SyncError::StorageCorruption(err.to_string()),
            other => SyncError::Storage(other),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// Category of a cycle failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Remote unreachable after retries.
    NetworkUnavailable,
    /// Credential needs refreshing.
    AuthExpired,
    /// Remote refused the request.
    RemoteRejected,
    /// Local capacity exhausted.
    StorageFull,
    /// Persisted state is corrupt.
    StorageCorruption,
    /// Checkpoint persistence failed.
    CheckpointWrite,
    /// Cancelled by the host.
    Cancelled,
    /// Redundant trigger.
    AlreadyRunning,
    /// Anything else.
    Internal,
}

impl FailureKind {
    /// Stable lowercase name used in status strings.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NetworkUnavailable => "network_unavailable",
            FailureKind::AuthExpired => "auth_expired",
            FailureKind::RemoteRejected => "remote_rejected",
            FailureKind::StorageFull => "storage_full",
            FailureKind::StorageCorruption => "storage_corruption",
            FailureKind::CheckpointWrite => "checkpoint_write",
            FailureKind::Cancelled => "cancelled",
            FailureKind::AlreadyRunning => "already_running",
            FailureKind::Internal => "internal",
        }
    }
}

/// Why a cycle failed, as reported by `get_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    /// Category.
    pub kind: FailureKind,
    /// Full error message.
    pub message: String,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}
