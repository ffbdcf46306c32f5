//! Core record types.

use crate::codec::byte_string;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque record key, ordered bytewise.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(#[serde(with = "byte_string")] Vec<u8>);

impl RecordKey {
    /// Creates a key from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the key, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for RecordKey {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

impl From<Vec<u8>> for RecordKey {
    fn from(b: Vec<u8>) -> Self {
        Self(b)
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey({self})")
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => f.write_str(s),
            _ => {
                f.write_str("0x")?;
                for b in &self.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Identifier of the replica that produced a change.
///
/// Bytewise order is the tie-break when two changes carry the same version.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId([u8; 16]);

impl ReplicaId {
    /// Creates a replica id from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generates a random (UUID v4) replica id.
    #[must_use]
    pub fn generate() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Parses a hyphenated or simple UUID string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| Self(*u.as_bytes()))
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({self})")
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).hyphenated())
    }
}

/// Per-key logical version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// The version of a key that has never been written.
    pub const ZERO: Self = Self(0);

    /// Returns the next version.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Kind of mutation a change represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// First write of a key.
    Insert,
    /// Overwrite of an existing key.
    Update,
    /// Delete; leaves a tombstone.
    Delete,
}

impl OperationKind {
    /// Returns true for deletes.
    #[must_use]
    pub fn is_delete(self) -> bool {
        matches!(self, Self::Delete)
    }

    /// Stable byte tag used in logs and the C ABI.
    #[must_use]
    pub const fn to_code(self) -> u8 {
        match self {
            Self::Insert => 1,
            Self::Update => 2,
            Self::Delete => 3,
        }
    }

    /// Parses a byte tag.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Insert),
            2 => Some(Self::Update),
            3 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A keyed row of local storage.
///
/// Tombstones keep their key and version so deletes propagate during sync;
/// their value is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record key.
    pub key: RecordKey,
    /// Value bytes. Empty for tombstones.
    #[serde(with = "byte_string")]
    pub value: Vec<u8>,
    /// Logical version of this state.
    pub version: Version,
    /// True if the record was deleted.
    pub tombstone: bool,
    /// Replica that produced this state.
    pub origin: ReplicaId,
}

impl Record {
    /// Creates a live record.
    pub fn live(key: RecordKey, value: Vec<u8>, version: Version, origin: ReplicaId) -> Self {
        Self {
            key,
            value,
            version,
            tombstone: false,
            origin,
        }
    }

    /// Creates a tombstone.
    pub fn tombstone(key: RecordKey, version: Version, origin: ReplicaId) -> Self {
        Self {
            key,
            value: Vec::new(),
            version,
            tombstone: true,
            origin,
        }
    }

    /// Returns the value if the record is live.
    #[must_use]
    pub fn live_value(&self) -> Option<&[u8]> {
        (!self.tombstone).then_some(self.value.as_slice())
    }
}
