//! Merge of pending local entries with pulled remote deltas.
//!
//! Both sides are collapsed to their latest state per key first. Keys that
//! appear on both sides go through the [`ConflictResolver`]. Keys on one
//! side only pass through: remote states are applied when they beat what is
//! stored, local entries are pushed unless something stored already beats
//! them.

use crate::store::RecordStore;
use cloudsync_protocol::{
    precedence, ChangeEntry, ConflictRecord, ConflictResolver, Record, RecordKey, Resolution,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Outcome of one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    /// Remote states to write locally, in key order.
    pub apply: Vec<Record>,
    /// Local entries to push, in log order.
    pub push: Vec<ChangeEntry>,
    /// Keys changed on both sides, with the resolver's decision.
    pub conflicts: Vec<ConflictRecord>,
    /// Local entries that will not be pushed: older states of a key, echoes
    /// of remote state, and entries that lost to a remote change.
    pub superseded: usize,
}

impl MergePlan {
    /// Returns true if the pass changes nothing locally or remotely.
    pub fn is_empty(&self) -> bool {
        self.apply.is_empty() && self.push.is_empty()
    }
}

/// Builds the merge plan for `local` entries (log order) against `remote`
/// deltas (cursor order), reading current state from `store`.
pub fn plan(
    resolver: &ConflictResolver,
    store: &RecordStore,
    local: &[ChangeEntry],
    remote: &[ChangeEntry],
) -> MergePlan {
    let mut out = MergePlan::default();

    let mut latest_local: BTreeMap<&RecordKey, &ChangeEntry> = BTreeMap::new();
    for entry in local {
        if latest_local.insert(&entry.key, entry).is_some() {
            out.superseded += 1;
        }
    }

    let mut latest_remote: BTreeMap<&RecordKey, &ChangeEntry> = BTreeMap::new();
    for delta in remote {
        latest_remote
            .entry(&delta.key)
            .and_modify(|current| {
                if precedence(delta, *current) == Ordering::Greater {
                    *current = delta;
                }
            })
            .or_insert(delta);
    }

    for (key, entry) in latest_local {
        let stored = store.get(key);
        if stored.is_some_and(|s| precedence(s, entry) == Ordering::Greater) {
            // Already beaten locally, e.g. by a remote state applied after
            // the entry was written.
            out.superseded += 1;
            continue;
        }

        let Some(delta) = latest_remote.remove(key) else {
            out.push.push(entry.clone());
            continue;
        };

        if entry.same_change(delta) {
            out.superseded += 1;
            continue;
        }

        let conflict = resolver.conflict(entry, delta);
        match conflict.outcome {
            Resolution::AcceptRemote => {
                warn!(
                    key = %key,
                    local = %entry.version,
                    remote = %delta.version,
                    "conflict resolved for remote"
                );
                if beats_stored(delta, stored) {
                    out.apply.push(delta.to_record());
                }
                out.superseded += 1;
            }
            Resolution::KeepLocal => {
                warn!(
                    key = %key,
                    local = %entry.version,
                    remote = %delta.version,
                    "conflict resolved for local"
                );
                out.push.push(entry.clone());
            }
        }
        out.conflicts.push(conflict);
    }

    for (key, delta) in latest_remote {
        if beats_stored(delta, store.get(key)) {
            out.apply.push(delta.to_record());
        }
    }

    out.apply.sort_by(|a, b| a.key.cmp(&b.key));
    out.push.sort_by_key(|e| e.seq);
    debug!(
        apply = out.apply.len(),
        push = out.push.len(),
        conflicts = out.conflicts.len(),
        superseded = out.superseded,
        "merge planned"
    );
    out
}

/// Returns true if `delta` should replace `stored`.
pub(crate) fn beats_stored(delta: &ChangeEntry, stored: Option<&Record>) -> bool {
    stored.map_or(true, |s| precedence(delta, s) == Ordering::Greater)
}
