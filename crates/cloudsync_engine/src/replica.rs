//! A local replica: record store, change log and checkpoint of one scope.
//!
//! Each part sits behind its own lock. Host writes take the store lock and
//! then the change log lock, in that order, and never touch the network.
//! The sync engine only holds these locks for local steps of a cycle.

use crate::changelog::ChangeLog;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::ReplicaOptions;
use crate::dir::ReplicaDir;
use crate::error::SyncResult;
use crate::store::RecordStore;
use cloudsync_protocol::{
    precedence, ChangeEntry, OperationKind, Record, RecordKey, ReplicaId, Version,
};
use cloudsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, MutexGuard};
use std::cmp::Ordering;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// One local replica.
pub struct Replica {
    id: ReplicaId,
    store: Mutex<RecordStore>,
    changelog: Mutex<ChangeLog>,
    checkpoints: Mutex<CheckpointStore>,
    dir: Option<ReplicaDir>,
}

impl Replica {
    /// Creates an empty replica held entirely in memory.
    ///
    /// # Errors
    ///
    /// Never fails in practice; returns a result for symmetry with
    /// [`Replica::open`].
    pub fn in_memory(id: ReplicaId) -> SyncResult<Self> {
        Self::in_memory_with(id, &ReplicaOptions::default())
    }

    /// Creates an empty in-memory replica honoring `options`' limits.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`Replica::open`].
    pub fn in_memory_with(id: ReplicaId, options: &ReplicaOptions) -> SyncResult<Self> {
        let changes = match options.change_log_capacity {
            Some(capacity) => InMemoryBackend::with_capacity(capacity),
            None => InMemoryBackend::new(),
        };
        Self::with_backends(
            id,
            Box::new(InMemoryBackend::new()),
            Box::new(changes),
            Box::new(InMemoryBackend::new()),
            options,
        )
    }

    /// Builds a replica over the given backends.
    ///
    /// The checkpoint is loaded first so the change log can skip entries
    /// the checkpoint already acknowledges. Log entries newer than the
    /// store are then replayed into it, which covers a crash between the
    /// two halves of a local write.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::StorageCorruption`] if any part fails
    /// validation.
    pub fn with_backends(
        id: ReplicaId,
        records: Box<dyn StorageBackend>,
        changes: Box<dyn StorageBackend>,
        checkpoint: Box<dyn StorageBackend>,
        options: &ReplicaOptions,
    ) -> SyncResult<Self> {
        let checkpoints = CheckpointStore::open(checkpoint)?;
        let watermark = checkpoints.current().log_watermark;
        let changelog = ChangeLog::open(changes, watermark)?
            .with_max_entries(options.max_pending_entries)
            .with_sync_on_write(options.sync_on_write);
        let mut store = RecordStore::open(records)?.with_sync_on_write(options.sync_on_write);

        let replayed = store.transaction(|txn| {
            for entry in changelog.entries_since(watermark) {
                let entry = entry?;
                let newer = txn
                    .get(&entry.key)
                    .map_or(true, |stored| precedence(&entry, stored) == Ordering::Greater);
                if newer {
                    txn.put(entry.to_record());
                }
            }
            Ok(txn.staged())
        })?;
        if replayed > 0 {
            info!(replayed, "restored local writes from change log");
        }

        Ok(Self {
            id,
            store: Mutex::new(store),
            changelog: Mutex::new(changelog),
            checkpoints: Mutex::new(checkpoints),
            dir: None,
        })
    }

    /// Opens the replica stored in directory `path`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::ReplicaLocked`] if another process has
    /// the directory open, or a storage error.
    pub fn open(path: &Path, options: ReplicaOptions) -> SyncResult<Self> {
        let dir = ReplicaDir::open(path, options.create_if_missing)?;
        let id = dir.load_or_create_replica_id()?;

        let records = FileBackend::open(&dir.records_path())?;
        let changes =
            FileBackend::open(&dir.changes_path())?.with_capacity(options.change_log_capacity);
        let checkpoint = FileBackend::open(&dir.checkpoint_path())?;

        let mut replica = Self::with_backends(
            id,
            Box::new(records),
            Box::new(changes),
            Box::new(checkpoint),
            &options,
        )?;
        debug!(path = %path.display(), replica = %id, "opened replica directory");
        replica.dir = Some(dir);
        Ok(replica)
    }

    /// Identifier of this replica.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Directory the replica lives in, if it is on disk.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(ReplicaDir::path)
    }

    /// Writes `value` under `key` and records the change for push.
    ///
    /// Durable when this returns. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::StorageFull`] if the change log is at
    /// capacity. Nothing is written in that case.
    pub fn put(&self, key: impl Into<RecordKey>, value: impl Into<Vec<u8>>) -> SyncResult<Version> {
        let key = key.into();
        let value = value.into();

        let mut store = self.store.lock();
        let (version, kind) = match store.get(&key) {
            Some(current) if !current.tombstone => (current.version.next(), OperationKind::Update),
            Some(current) => (current.version.next(), OperationKind::Insert),
            None => (Version::ZERO.next(), OperationKind::Insert),
        };

        let entry = ChangeEntry::put(key.clone(), value.clone(), version, kind, self.id, now_ms());
        self.changelog.lock().append(entry)?;
        store.put(Record::live(key, value, version, self.id))?;
        Ok(version)
    }

    /// Deletes `key`, leaving a tombstone that propagates through sync.
    ///
    /// Returns the tombstone's version, or `None` if the key was absent or
    /// already deleted.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::StorageFull`] if the change log is at
    /// capacity.
    pub fn delete(&self, key: impl Into<RecordKey>) -> SyncResult<Option<Version>> {
        let key = key.into();

        let mut store = self.store.lock();
        let version = match store.get(&key) {
            Some(current) if !current.tombstone => current.version.next(),
            _ => return Ok(None),
        };

        let entry = ChangeEntry::delete(key.clone(), version, self.id, now_ms());
        self.changelog.lock().append(entry)?;
        store.put(Record::tombstone(key, version, self.id))?;
        Ok(Some(version))
    }

    /// Returns the live value of `key`.
    pub fn get(&self, key: impl Into<RecordKey>) -> Option<Vec<u8>> {
        let key = key.into();
        self.store
            .lock()
            .get(&key)
            .and_then(Record::live_value)
            .map(<[u8]>::to_vec)
    }

    /// Returns the stored state of `key`, tombstones included.
    pub fn record(&self, key: impl Into<RecordKey>) -> Option<Record> {
        let key = key.into();
        self.store.lock().get(&key).cloned()
    }

    /// All stored records in key order, tombstones included.
    pub fn records(&self) -> Vec<Record> {
        self.store.lock().iter().cloned().collect()
    }

    /// Number of local changes awaiting acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.changelog.lock().len()
    }

    /// The live checkpoint.
    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoints.lock().current()
    }

    pub(crate) fn store(&self) -> MutexGuard<'_, RecordStore> {
        self.store.lock()
    }

    pub(crate) fn changelog(&self) -> MutexGuard<'_, ChangeLog> {
        self.changelog.lock()
    }

    pub(crate) fn checkpoints(&self) -> MutexGuard<'_, CheckpointStore> {
        self.checkpoints.lock()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
