//! # CloudSync Protocol
//!
//! Types shared by every CloudSync replica and the remote service.
//!
//! This crate provides:
//! - [`Record`], [`ChangeEntry`] and the key/version/replica newtypes
//! - [`ConflictResolver`]: the deterministic merge rule every replica applies
//! - Protocol messages (Handshake, Pull, Push) and their CBOR encoding
//! - The fixed-size [`Envelope`] header wrapped around every payload
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod codec;
mod conflict;
mod envelope;
mod error;
mod messages;
mod types;

pub use change::ChangeEntry;
pub use codec::{from_cbor, to_cbor};
pub use conflict::{precedence, ConflictRecord, ConflictResolver, Resolution, Versioned};
pub use envelope::{Envelope, ENVELOPE_SIGNATURE, ENVELOPE_SIZE, LIBRARY_VERSION};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ErrorCode, ErrorResponse, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse,
    PushRequest, PushResponse, RejectReason, RejectedEntry, SyncMessage, PROTOCOL_VERSION,
};
pub use types::{OperationKind, Record, RecordKey, ReplicaId, Version};
