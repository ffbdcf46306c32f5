//! Error types for the sync service.

use cloudsync_protocol::ErrorCode;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync service.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Token missing, invalid or expired.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Session id the service does not know, e.g. after a restart.
    #[error("unknown session: {0}")]
    UnknownSession(u64),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// Replica schema differs from the service schema.
    #[error("schema mismatch: expected {expected:#x}, got {actual:#x}")]
    SchemaMismatch {
        /// Hash the service requires.
        expected: u64,
        /// Hash the replica presented.
        actual: u64,
    },

    /// Request body could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(#[from] cloudsync_protocol::ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_))
    }

    /// Wire error category.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::NotAuthorized(_) | ServerError::UnknownSession(_) => {
                ErrorCode::AuthExpired
            }
            ServerError::InvalidRequest(_)
            | ServerError::ProtocolMismatch(_)
            | ServerError::SchemaMismatch { .. }
            | ServerError::Malformed(_) => ErrorCode::Rejected,
            ServerError::Internal(_) => ErrorCode::Unavailable,
        }
    }

    /// HTTP status for the error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServerError::Malformed(_) | ServerError::InvalidRequest(_) => 400,
            other => other.code().http_status(),
        }
    }
}
