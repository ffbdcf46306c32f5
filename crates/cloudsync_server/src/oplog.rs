//! Server-side change log of one scope.

use cloudsync_protocol::{
    precedence, ChangeEntry, RecordKey, RejectReason, RejectedEntry, ReplicaId, Version,
};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;

/// One page of changes after a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePage {
    /// Changes in cursor order, `seq` set to their service cursor.
    pub changes: Vec<ChangeEntry>,
    /// Cursor of the last change scanned, including filtered ones.
    pub cursor: u64,
    /// True if changes remain after `cursor`.
    pub has_more: bool,
}

/// Outcome of applying one pushed batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    /// Highest pushed `seq` processed.
    pub acked_up_to: u64,
    /// Entries accepted and given a cursor.
    pub accepted: usize,
    /// Entries refused.
    pub rejected: Vec<RejectedEntry>,
    /// Head cursor after the batch.
    pub cursor: u64,
}

struct OplogState {
    /// Accepted changes in cursor order.
    changes: Vec<ChangeEntry>,
    /// Latest accepted change per key.
    latest: HashMap<RecordKey, ChangeEntry>,
    /// Cursor of the newest change.
    head: u64,
}

/// Server-side operation log.
///
/// The oplog maintains:
/// - Accepted changes in cursor order
/// - The current head cursor
/// - The latest state of each key, for staleness checks
pub struct ServerOplog {
    state: RwLock<OplogState>,
}

impl ServerOplog {
    /// Creates a new empty oplog.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(OplogState {
                changes: Vec::new(),
                latest: HashMap::new(),
                head: 0,
            }),
        }
    }

    /// Returns the head cursor.
    pub fn cursor(&self) -> u64 {
        self.state.read().head
    }

    /// Number of changes held.
    pub fn len(&self) -> usize {
        self.state.read().changes.len()
    }

    /// Returns true if the oplog holds no changes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest accepted state of `key`.
    pub fn latest(&self, key: &RecordKey) -> Option<ChangeEntry> {
        self.state.read().latest.get(key).cloned()
    }

    /// Returns up to `limit` changes after `cursor`, skipping changes that
    /// originated at `exclude`.
    ///
    /// Skipped changes still advance the returned cursor, so a replica that
    /// only ever sees its own changes still makes progress.
    pub fn changes_since(
        &self,
        cursor: u64,
        limit: usize,
        exclude: Option<ReplicaId>,
    ) -> ChangePage {
        let state = self.state.read();
        let start = state.changes.partition_point(|c| c.seq <= cursor);

        let mut changes = Vec::new();
        let mut scanned = cursor;
        let mut has_more = false;
        for change in &state.changes[start..] {
            if Some(change.origin) == exclude {
                scanned = change.seq;
                continue;
            }
            if changes.len() == limit {
                has_more = true;
                break;
            }
            scanned = change.seq;
            changes.push(change.clone());
        }

        ChangePage {
            changes,
            cursor: scanned,
            has_more,
        }
    }

    /// Applies a pushed batch in order.
    ///
    /// An entry is refused as stale if the held state of its key beats it.
    /// An entry identical to the held state is acknowledged without a new
    /// cursor, so resending a batch is harmless.
    pub fn append(&self, entries: &[ChangeEntry]) -> AppendOutcome {
        let mut state = self.state.write();
        let mut outcome = AppendOutcome::default();

        for entry in entries {
            outcome.acked_up_to = outcome.acked_up_to.max(entry.seq);

            if let Some(reason) = validate(entry) {
                outcome.rejected.push(rejected(entry, RejectReason::Invalid(reason)));
                continue;
            }

            if let Some(current) = state.latest.get(&entry.key) {
                if current.same_change(entry) {
                    continue;
                }
                if precedence(entry, current) != Ordering::Greater {
                    let reason = RejectReason::Stale {
                        current: current.version,
                    };
                    outcome.rejected.push(rejected(entry, reason));
                    continue;
                }
            }

            state.head += 1;
            let accepted = entry.clone().with_seq(state.head);
            state.latest.insert(accepted.key.clone(), accepted.clone());
            state.changes.push(accepted);
            outcome.accepted += 1;
        }

        outcome.cursor = state.head;
        outcome
    }

    /// Drops changes superseded by a later change of the same key.
    ///
    /// Pulls from any cursor still end with the same latest states.
    /// Returns the number of changes dropped.
    pub fn compact(&self) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let before = state.changes.len();
        let latest = &state.latest;
        state
            .changes
            .retain(|c| latest.get(&c.key).is_some_and(|l| l.seq == c.seq));
        before - state.changes.len()
    }
}

impl Default for ServerOplog {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(entry: &ChangeEntry) -> Option<String> {
    if entry.key.as_bytes().is_empty() {
        return Some("empty key".into());
    }
    if entry.version == Version::ZERO {
        return Some("version must be positive".into());
    }
    if entry.is_delete() && !entry.value.is_empty() {
        return Some("delete carries a value".into());
    }
    None
}

fn rejected(entry: &ChangeEntry, reason: RejectReason) -> RejectedEntry {
    RejectedEntry {
        seq: entry.seq,
        key: entry.key.clone(),
        version: entry.version,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_protocol::OperationKind;
    use proptest::prelude::*;

    fn replica(n: u8) -> ReplicaId {
        ReplicaId::from_bytes([n; 16])
    }

    fn put(seq: u64, key: &str, version: u64, value: &[u8], origin: u8) -> ChangeEntry {
        ChangeEntry::put(
            RecordKey::from(key),
            value.to_vec(),
            Version(version),
            OperationKind::Update,
            replica(origin),
            0,
        )
        .with_seq(seq)
    }

    fn delete(seq: u64, key: &str, version: u64, origin: u8) -> ChangeEntry {
        ChangeEntry::delete(RecordKey::from(key), Version(version), replica(origin), 0).with_seq(seq)
    }

    #[test]
    fn append_assigns_cursors() {
        let oplog = ServerOplog::new();
        let outcome = oplog.append(&[put(4, "a", 1, b"x", 1), put(5, "b", 1, b"y", 1)]);

        assert_eq!(outcome.acked_up_to, 5);
        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.cursor, 2);
        assert_eq!(oplog.cursor(), 2);

        let page = oplog.changes_since(0, 10, None);
        let seqs: Vec<u64> = page.changes.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(!page.has_more);
    }

    #[test]
    fn stale_entry_rejected_with_current_version() {
        let oplog = ServerOplog::new();
        oplog.append(&[put(1, "a", 3, b"new", 1)]);

        let outcome = oplog.append(&[put(7, "a", 2, b"old", 2)]);
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.acked_up_to, 7);
        assert_eq!(
            outcome.rejected[0].reason,
            RejectReason::Stale {
                current: Version(3)
            }
        );
    }

    #[test]
    fn delete_beats_update_at_same_version() {
        let oplog = ServerOplog::new();
        oplog.append(&[put(1, "a", 3, b"x", 1)]);

        let outcome = oplog.append(&[delete(1, "a", 3, 2)]);
        assert_eq!(outcome.accepted, 1);
        assert!(oplog.latest(&RecordKey::from("a")).unwrap().is_delete());

        let outcome = oplog.append(&[put(2, "a", 3, b"y", 9)]);
        assert!(matches!(
            outcome.rejected[0].reason,
            RejectReason::Stale { .. }
        ));
    }

    #[test]
    fn resent_entry_is_idempotent() {
        let oplog = ServerOplog::new();
        let batch = [put(1, "a", 1, b"x", 1)];
        oplog.append(&batch);
        let outcome = oplog.append(&batch);

        assert_eq!(outcome.accepted, 0);
        assert!(outcome.rejected.is_empty());
        assert_eq!(outcome.acked_up_to, 1);
        assert_eq!(oplog.len(), 1);
    }

    #[test]
    fn invalid_entries_rejected() {
        let oplog = ServerOplog::new();
        let mut bad_delete = delete(3, "c", 1, 1);
        bad_delete.value = b"junk".to_vec();

        let outcome = oplog.append(&[put(1, "", 1, b"x", 1), put(2, "b", 0, b"x", 1), bad_delete]);
        assert_eq!(outcome.rejected.len(), 3);
        assert!(outcome
            .rejected
            .iter()
            .all(|r| matches!(r.reason, RejectReason::Invalid(_))));
        assert!(oplog.is_empty());
    }

    #[test]
    fn pagination() {
        let oplog = ServerOplog::new();
        let batch: Vec<_> = (1..=5).map(|i| put(i, &format!("k{i}"), 1, b"v", 1)).collect();
        oplog.append(&batch);

        let first = oplog.changes_since(0, 2, None);
        assert_eq!(first.changes.len(), 2);
        assert_eq!(first.cursor, 2);
        assert!(first.has_more);

        let second = oplog.changes_since(first.cursor, 2, None);
        assert_eq!(second.cursor, 4);
        assert!(second.has_more);

        let last = oplog.changes_since(second.cursor, 2, None);
        assert_eq!(last.changes.len(), 1);
        assert_eq!(last.cursor, 5);
        assert!(!last.has_more);
    }

    #[test]
    fn own_changes_filtered_but_cursor_advances() {
        let oplog = ServerOplog::new();
        oplog.append(&[put(1, "a", 1, b"x", 1), put(2, "b", 1, b"y", 1)]);
        oplog.append(&[put(1, "c", 1, b"z", 2)]);

        let page = oplog.changes_since(0, 10, Some(replica(1)));
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.changes[0].key, RecordKey::from("c"));
        assert_eq!(page.cursor, 3);

        let page = oplog.changes_since(0, 10, Some(replica(2)));
        assert_eq!(page.changes.len(), 2);
        assert_eq!(page.cursor, 2);
        assert!(!page.has_more);
    }

    #[test]
    fn cursor_past_head_returns_nothing() {
        let oplog = ServerOplog::new();
        oplog.append(&[put(1, "a", 1, b"x", 1)]);
        let page = oplog.changes_since(9, 10, None);
        assert!(page.changes.is_empty());
        assert_eq!(page.cursor, 9);
    }

    #[test]
    fn compact_keeps_latest_per_key() {
        let oplog = ServerOplog::new();
        oplog.append(&[put(1, "a", 1, b"1", 1)]);
        oplog.append(&[put(2, "a", 2, b"2", 1)]);
        oplog.append(&[put(3, "b", 1, b"b", 1)]);

        assert_eq!(oplog.compact(), 1);
        let page = oplog.changes_since(0, 10, None);
        assert_eq!(page.changes.len(), 2);
        assert_eq!(page.changes[0].value, b"2");
        assert_eq!(oplog.cursor(), 3);
    }

    proptest! {
        #[test]
        fn paging_sees_every_change_once(count in 0usize..40, limit in 1usize..8) {
            let oplog = ServerOplog::new();
            let batch: Vec<_> = (0..count)
                .map(|i| put(i as u64 + 1, &format!("k{i}"), 1, b"v", (i % 3) as u8))
                .collect();
            oplog.append(&batch);

            let mut cursor = 0;
            let mut seen = Vec::new();
            loop {
                let page = oplog.changes_since(cursor, limit, Some(replica(0)));
                prop_assert!(page.cursor >= cursor);
                seen.extend(page.changes.iter().map(|c| c.seq));
                cursor = page.cursor;
                if !page.has_more {
                    break;
                }
            }

            let expected: Vec<u64> = batch
                .iter()
                .zip(1u64..)
                .filter(|(e, _)| e.origin != replica(0))
                .map(|(_, cursor)| cursor)
                .collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
