//! Change entries: the unit of replication.

use crate::codec::{byte_string, from_cbor, to_cbor};
use crate::error::ProtocolResult;
use crate::types::{OperationKind, Record, RecordKey, ReplicaId, Version};
use serde::{Deserialize, Serialize};

/// One mutation of one key.
///
/// Locally, `seq` is the change log position. In a remote delta it is the
/// remote cursor position of the change. Either way it is strictly
/// increasing and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Log or cursor position.
    pub seq: u64,
    /// Key that changed.
    pub key: RecordKey,
    /// Version of the key after this change.
    pub version: Version,
    /// Kind of mutation.
    pub kind: OperationKind,
    /// New value; empty for deletes.
    #[serde(with = "byte_string")]
    pub value: Vec<u8>,
    /// Wall clock time of the mutation on its origin, milliseconds since the
    /// Unix epoch. Informational only; never used for ordering.
    pub timestamp_ms: u64,
    /// Replica that made the change.
    pub origin: ReplicaId,
}

impl ChangeEntry {
    /// Creates a put (insert or update) entry with `seq` left at zero.
    pub fn put(
        key: RecordKey,
        value: Vec<u8>,
        version: Version,
        kind: OperationKind,
        origin: ReplicaId,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            seq: 0,
            key,
            version,
            kind,
            value,
            timestamp_ms,
            origin,
        }
    }

    /// Creates a delete entry with `seq` left at zero.
    pub fn delete(key: RecordKey, version: Version, origin: ReplicaId, timestamp_ms: u64) -> Self {
        Self {
            seq: 0,
            key,
            version,
            kind: OperationKind::Delete,
            value: Vec::new(),
            timestamp_ms,
            origin,
        }
    }

    /// Returns a copy positioned at `seq`.
    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Returns true if this entry deletes its key.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.kind.is_delete()
    }

    /// The record state this entry leaves behind.
    #[must_use]
    pub fn to_record(&self) -> Record {
        if self.is_delete() {
            Record::tombstone(self.key.clone(), self.version, self.origin)
        } else {
            Record::live(self.key.clone(), self.value.clone(), self.version, self.origin)
        }
    }

    /// Returns true if `self` and `other` describe the same key state.
    ///
    /// Two replays of one change compare equal here even when their `seq`
    /// differs.
    #[must_use]
    pub fn same_change(&self, other: &Self) -> bool {
        self.key == other.key
            && self.version == other.version
            && self.kind.is_delete() == other.kind.is_delete()
            && self.origin == other.origin
            && self.value == other.value
    }

    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a change entry.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> ReplicaId {
        ReplicaId::from_bytes([7; 16])
    }

    #[test]
    fn decode_restores_every_field() {
        let entry = ChangeEntry::put(
            "k1".into(),
            b"value".to_vec(),
            Version(3),
            OperationKind::Update,
            origin(),
            1_700_000_000_000,
        )
        .with_seq(42);

        let decoded = ChangeEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn delete_becomes_tombstone() {
        let entry = ChangeEntry::delete("k1".into(), Version(3), origin(), 0);
        let record = entry.to_record();
        assert!(record.tombstone);
        assert_eq!(record.version, Version(3));
        assert!(record.value.is_empty());
    }

    #[test]
    fn same_change_ignores_position() {
        let a = ChangeEntry::delete("k".into(), Version(1), origin(), 5).with_seq(1);
        let b = a.clone().with_seq(90);
        assert!(a.same_change(&b));

        let later = ChangeEntry::delete("k".into(), Version(2), origin(), 5);
        assert!(!a.same_change(&later));
    }
}
