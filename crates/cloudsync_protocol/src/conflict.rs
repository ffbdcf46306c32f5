//! Conflict detection and resolution.
//!
//! Every replica runs the same rule on the same pair of states, so replicas
//! converge without talking to each other. Given two states of one key:
//!
//! 1. If exactly one is a delete, the delete wins unless the update's version
//!    is strictly greater.
//! 2. Otherwise the higher version wins.
//! 3. On equal versions, the greater origin replica id wins.
//! 4. On equal origins, the greater value wins (bytewise).
//!
//! The rule orders *states*, not sides: swapping local and remote always
//! picks the same winning state.

use crate::change::ChangeEntry;
use crate::types::{Record, RecordKey, ReplicaId, Version};
use std::cmp::Ordering;

/// The facts about a key state the resolver looks at.
pub trait Versioned {
    /// Logical version.
    fn version(&self) -> Version;
    /// True for deletes and tombstones.
    fn is_delete(&self) -> bool;
    /// Replica that produced the state.
    fn origin(&self) -> ReplicaId;
    /// Value bytes, empty for deletes.
    fn value(&self) -> &[u8];
}

impl Versioned for ChangeEntry {
    fn version(&self) -> Version {
        self.version
    }
    fn is_delete(&self) -> bool {
        self.kind.is_delete()
    }
    fn origin(&self) -> ReplicaId {
        self.origin
    }
    fn value(&self) -> &[u8] {
        &self.value
    }
}

impl Versioned for Record {
    fn version(&self) -> Version {
        self.version
    }
    fn is_delete(&self) -> bool {
        self.tombstone
    }
    fn origin(&self) -> ReplicaId {
        self.origin
    }
    fn value(&self) -> &[u8] {
        &self.value
    }
}

/// Which side of a conflict survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// The local state stays. Also the outcome for identical states.
    KeepLocal,
    /// The remote state replaces the local one.
    AcceptRemote,
}

impl Resolution {
    /// Converts to a code.
    #[must_use]
    pub fn to_code(self) -> u8 {
        match self {
            Self::KeepLocal => 1,
            Self::AcceptRemote => 2,
        }
    }

    /// Converts from a code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::KeepLocal),
            2 => Some(Self::AcceptRemote),
            _ => None,
        }
    }
}

/// A divergence found during one merge pass. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    /// Key both sides changed.
    pub key: RecordKey,
    /// Latest local change for the key.
    pub local: ChangeEntry,
    /// Latest remote change for the key.
    pub remote: ChangeEntry,
    /// What the resolver decided.
    pub outcome: Resolution,
}

impl ConflictRecord {
    /// The change that survives.
    #[must_use]
    pub fn winner(&self) -> &ChangeEntry {
        match self.outcome {
            Resolution::KeepLocal => &self.local,
            Resolution::AcceptRemote => &self.remote,
        }
    }
}

/// Deterministic resolver for divergent key states.
///
/// Applies [`precedence`] only. Side-biased rules (remote always wins, local
/// always wins) would pick different states on different replicas.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Decides between a local and a remote state of the same key.
    ///
    /// Total: every pair gets an outcome.
    pub fn resolve<L: Versioned, R: Versioned>(&self, local: &L, remote: &R) -> Resolution {
        match precedence(local, remote) {
            Ordering::Less => Resolution::AcceptRemote,
            Ordering::Equal | Ordering::Greater => Resolution::KeepLocal,
        }
    }

    /// Resolves a pair of change entries and records the outcome.
    #[must_use]
    pub fn conflict(&self, local: &ChangeEntry, remote: &ChangeEntry) -> ConflictRecord {
        ConflictRecord {
            key: local.key.clone(),
            local: local.clone(),
            remote: remote.clone(),
            outcome: self.resolve(local, remote),
        }
    }
}

/// Orders two states of a key by which one should survive.
///
/// `Greater` means `a` wins. Antisymmetric: `precedence(b, a)` is always
/// `precedence(a, b).reverse()`. `Equal` only for indistinguishable states.
pub fn precedence<A: Versioned + ?Sized, B: Versioned + ?Sized>(a: &A, b: &B) -> Ordering {
    match (a.is_delete(), b.is_delete()) {
        (true, false) => {
            if b.version() > a.version() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            if a.version() > b.version() {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        _ => a
            .version()
            .cmp(&b.version())
            .then_with(|| a.origin().cmp(&b.origin()))
            .then_with(|| a.value().cmp(b.value())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;
    use proptest::prelude::*;

    const LOCAL: ReplicaId = ReplicaId::from_bytes([1; 16]);
    const REMOTE: ReplicaId = ReplicaId::from_bytes([2; 16]);

    fn update(version: u64, origin: ReplicaId, value: &[u8]) -> ChangeEntry {
        ChangeEntry::put(
            "k1".into(),
            value.to_vec(),
            Version(version),
            OperationKind::Update,
            origin,
            0,
        )
    }

    fn delete(version: u64, origin: ReplicaId) -> ChangeEntry {
        ChangeEntry::delete("k1".into(), Version(version), origin, 0)
    }

    #[test]
    fn higher_version_wins() {
        let resolver = ConflictResolver::default();
        assert_eq!(
            resolver.resolve(&update(2, LOCAL, b"a"), &update(5, REMOTE, b"b")),
            Resolution::AcceptRemote
        );
        assert_eq!(
            resolver.resolve(&update(7, LOCAL, b"a"), &update(5, REMOTE, b"b")),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn equal_version_update_loses_to_delete() {
        let resolver = ConflictResolver::default();
        let local = update(3, LOCAL, b"local value");
        let remote = delete(3, REMOTE);

        let record = resolver.conflict(&local, &remote);
        assert_eq!(record.outcome, Resolution::AcceptRemote);
        let state = record.winner().to_record();
        assert!(state.tombstone);
        assert_eq!(state.version, Version(3));
        assert!(state.value.is_empty());
    }

    #[test]
    fn delete_beats_older_update_regardless_of_origin() {
        let resolver = ConflictResolver::default();
        // Local replica id is the greater one here; deletes still dominate.
        assert_eq!(
            resolver.resolve(&update(2, REMOTE, b"x"), &delete(4, LOCAL)),
            Resolution::AcceptRemote
        );
        assert_eq!(
            resolver.resolve(&delete(3, LOCAL), &update(3, REMOTE, b"x")),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn strictly_newer_update_beats_delete() {
        let resolver = ConflictResolver::default();
        assert_eq!(
            resolver.resolve(&delete(3, LOCAL), &update(4, REMOTE, b"revived")),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn equal_versions_break_on_replica_id() {
        let resolver = ConflictResolver::default();
        assert_eq!(
            resolver.resolve(&update(3, LOCAL, b"zzz"), &update(3, REMOTE, b"aaa")),
            Resolution::AcceptRemote
        );
        assert_eq!(
            resolver.resolve(&update(3, REMOTE, b"aaa"), &update(3, LOCAL, b"zzz")),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn identical_states_keep_local() {
        let resolver = ConflictResolver::default();
        let a = update(1, LOCAL, b"same");
        assert_eq!(resolver.resolve(&a, &a.clone()), Resolution::KeepLocal);
    }

    #[test]
    fn record_and_entry_resolve_alike() {
        let resolver = ConflictResolver::default();
        let stored = delete(3, LOCAL).to_record();
        assert_eq!(
            resolver.resolve(&stored, &update(3, REMOTE, b"x")),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn each_side_picks_the_same_state() {
        let resolver = ConflictResolver::new();
        let a = update(9, LOCAL, b"a");
        let b = update(1, REMOTE, b"b");
        assert_eq!(resolver.resolve(&a, &b), Resolution::KeepLocal);
        assert_eq!(resolver.resolve(&b, &a), Resolution::AcceptRemote);
    }

    #[test]
    fn resolution_codes() {
        for r in [Resolution::KeepLocal, Resolution::AcceptRemote] {
            assert_eq!(Resolution::from_code(r.to_code()), Some(r));
        }
        assert_eq!(Resolution::from_code(0), None);
    }

    fn arb_entry() -> impl Strategy<Value = ChangeEntry> {
        (
            0u64..6,
            any::<bool>(),
            prop_oneof![Just(LOCAL), Just(REMOTE)],
            prop::collection::vec(any::<u8>(), 0..3),
        )
            .prop_map(|(version, is_delete, origin, value)| {
                if is_delete {
                    delete(version, origin)
                } else {
                    update(version, origin, &value)
                }
            })
    }

    proptest! {
        #[test]
        fn resolution_is_deterministic(a in arb_entry(), b in arb_entry()) {
            let resolver = ConflictResolver::default();
            prop_assert_eq!(resolver.resolve(&a, &b), resolver.resolve(&a, &b));
        }

        #[test]
        fn both_replicas_pick_the_same_state(a in arb_entry(), b in arb_entry()) {
            let resolver = ConflictResolver::default();
            // Replica one holds `a` locally, replica two holds `b` locally.
            let on_one = resolver.conflict(&a, &b).winner().to_record();
            let on_two = resolver.conflict(&b, &a).winner().to_record();
            prop_assert_eq!(on_one, on_two);
        }

        #[test]
        fn precedence_is_antisymmetric(a in arb_entry(), b in arb_entry()) {
            prop_assert_eq!(precedence(&a, &b), precedence(&b, &a).reverse());
        }

        #[test]
        fn winner_never_has_lower_version(a in arb_entry(), b in arb_entry()) {
            let resolver = ConflictResolver::default();
            let record = resolver.conflict(&a, &b);
            let winner = record.winner();
            let loser = if record.outcome == Resolution::KeepLocal { &b } else { &a };
            prop_assert!(winner.version >= loser.version);
        }
    }
}
