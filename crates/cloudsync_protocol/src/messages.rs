//! Protocol messages for sync.
//!
//! A session is one handshake followed by any number of pulls and pushes.
//! Every payload is keyed by record key and version, so replaying a pull or
//! a push is harmless.

use crate::change::ChangeEntry;
use crate::codec::{byte_string, from_cbor, to_cbor};
use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{RecordKey, ReplicaId, Version};
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Handshake request.
    HandshakeRequest(HandshakeRequest),
    /// Handshake response.
    HandshakeResponse(HandshakeResponse),
    /// Pull request.
    PullRequest(PullRequest),
    /// Pull response.
    PullResponse(PullResponse),
    /// Push request.
    PushRequest(PushRequest),
    /// Push response.
    PushResponse(PushResponse),
    /// Request-level failure reported by the remote.
    Error(ErrorResponse),
}

impl SyncMessage {
    /// Returns the message type code carried in the envelope.
    #[must_use]
    pub fn type_code(&self) -> u8 {
        match self {
            Self::HandshakeRequest(_) => 1,
            Self::HandshakeResponse(_) => 2,
            Self::PullRequest(_) => 3,
            Self::PullResponse(_) => 4,
            Self::PushRequest(_) => 5,
            Self::PushResponse(_) => 6,
            Self::Error(_) => 7,
        }
    }

    /// Number of change rows the message carries.
    #[must_use]
    pub fn row_count(&self) -> u32 {
        let rows = match self {
            Self::PullResponse(r) => r.deltas.len(),
            Self::PushRequest(r) => r.entries.len(),
            _ => 0,
        };
        u32::try_from(rows).unwrap_or(u32::MAX)
    }

    /// Encodes the message and wraps it in an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the body is too large for
    /// the envelope length field.
    pub fn encode(&self, schema_hash: u64) -> ProtocolResult<Vec<u8>> {
        let body = to_cbor(self)?;
        Envelope::seal(self.type_code(), self.row_count(), schema_hash, &body)
    }

    /// Unwraps and decodes an enveloped message.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is malformed, the type code in the
    /// header disagrees with the body, or the body fails to decode.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<(Envelope, Self)> {
        let (envelope, body) = Envelope::open(bytes)?;
        let message: Self = from_cbor(body)?;
        if message.type_code() != envelope.message_type {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "header says message type {}, body is type {}",
                envelope.message_type,
                message.type_code()
            )));
        }
        Ok((envelope, message))
    }
}

/// Opens a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Replica opening the session.
    pub replica_id: ReplicaId,
    /// Sync scope (the dataset being synchronized).
    pub scope: String,
    /// Protocol version the client speaks.
    pub protocol_version: u16,
    /// Hash of the client's schema; must match the remote's.
    pub schema_hash: u64,
    /// Credential for this session.
    #[serde(with = "byte_string")]
    pub auth_token: Vec<u8>,
    /// Remote cursor from the client's checkpoint.
    pub last_cursor: u64,
}

impl HandshakeRequest {
    /// Creates a handshake at the current protocol version.
    pub fn new(
        replica_id: ReplicaId,
        scope: impl Into<String>,
        schema_hash: u64,
        auth_token: Vec<u8>,
        last_cursor: u64,
    ) -> Self {
        Self {
            replica_id,
            scope: scope.into(),
            protocol_version: PROTOCOL_VERSION,
            schema_hash,
            auth_token,
            last_cursor,
        }
    }

    /// Overrides the protocol version the request announces.
    #[must_use]
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }
}

/// Accepts a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Session id to send with later requests.
    pub session_id: u64,
    /// Remote's current head cursor.
    pub server_cursor: u64,
}

/// Asks for changes after a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Session from the handshake.
    pub session_id: u64,
    /// Return changes strictly after this cursor.
    pub cursor: u64,
    /// Maximum number of changes to return.
    pub limit: u32,
}

/// Changes after a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changes in cursor order. `seq` of each is its cursor position.
    pub deltas: Vec<ChangeEntry>,
    /// Cursor to resume from.
    pub cursor: u64,
    /// True if more changes exist past `cursor`.
    pub has_more: bool,
}

/// Sends local changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Session from the handshake.
    pub session_id: u64,
    /// Local change log entries in log order.
    pub entries: Vec<ChangeEntry>,
}

/// Why the remote refused one pushed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The remote already holds a state that beats this one.
    Stale {
        /// The version the remote holds.
        current: Version,
    },
    /// The entry failed validation on the remote.
    Invalid(String),
}

/// One entry the remote did not accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedEntry {
    /// Local log position of the entry.
    pub seq: u64,
    /// Key of the entry.
    pub key: RecordKey,
    /// Version of the entry.
    pub version: Version,
    /// Why it was rejected.
    pub reason: RejectReason,
}

/// Acknowledges a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Highest local `seq` the remote processed, accepted or rejected.
    pub acked_up_to: u64,
    /// Entries the remote refused.
    pub rejected: Vec<RejectedEntry>,
    /// Remote head cursor after the push.
    pub cursor: u64,
}

/// Error category reported by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Token missing, invalid or expired.
    AuthExpired,
    /// Request refused, e.g. schema or protocol mismatch.
    Rejected,
    /// Remote temporarily unable to serve.
    Unavailable,
}

impl ErrorCode {
    /// HTTP status the code maps to.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::AuthExpired => 401,
            Self::Rejected => 409,
            Self::Unavailable => 503,
        }
    }
}

/// Request-level failure body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Category.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorResponse {
    /// Creates an error response.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;

    fn entry(seq: u64, key: &str) -> ChangeEntry {
        ChangeEntry::put(
            key.into(),
            b"v".to_vec(),
            Version(1),
            OperationKind::Insert,
            ReplicaId::from_bytes([3; 16]),
            10,
        )
        .with_seq(seq)
    }

    #[test]
    fn pull_response_through_envelope() {
        let msg = SyncMessage::PullResponse(PullResponse {
            deltas: vec![entry(1, "a"), entry(2, "b")],
            cursor: 2,
            has_more: false,
        });

        let bytes = msg.encode(0xABCD).unwrap();
        let (envelope, decoded) = SyncMessage::decode(&bytes).unwrap();
        assert_eq!(envelope.row_count, 2);
        assert_eq!(envelope.schema_hash, 0xABCD);
        assert_eq!(envelope.message_type, 4);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn push_response_carries_rejections() {
        let msg = SyncMessage::PushResponse(PushResponse {
            acked_up_to: 9,
            rejected: vec![RejectedEntry {
                seq: 4,
                key: "k".into(),
                version: Version(2),
                reason: RejectReason::Stale {
                    current: Version(5),
                },
            }],
            cursor: 30,
        });
        let (_, decoded) = SyncMessage::decode(&msg.encode(1).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn handshake_defaults_to_current_protocol() {
        let req = HandshakeRequest::new(ReplicaId::default(), "main", 7, b"tok".to_vec(), 0);
        assert_eq!(req.protocol_version, PROTOCOL_VERSION);
        assert_eq!(SyncMessage::HandshakeRequest(req).row_count(), 0);
    }

    #[test]
    fn mismatched_type_code_is_rejected() {
        let msg = SyncMessage::PullRequest(PullRequest {
            session_id: 1,
            cursor: 0,
            limit: 10,
        });
        let mut bytes = msg.encode(0).unwrap();
        // byte 12 holds the message type
        bytes[12] = 6;
        assert!(matches!(
            SyncMessage::decode(&bytes),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn error_codes_map_to_http_status() {
        assert_eq!(ErrorCode::AuthExpired.http_status(), 401);
        assert_eq!(ErrorCode::Rejected.http_status(), 409);
        assert_eq!(ErrorCode::Unavailable.http_status(), 503);
    }
}
