//! Local record storage with atomic batches.
//!
//! Records live in memory, keyed and ordered by [`RecordKey`], and every
//! committed transaction is persisted as one [`FrameKind::Batch`] frame.
//! A batch is all-or-nothing on replay: a torn frame is discarded whole.
//!
//! Once enough stored writes are superseded by later ones, the backend is
//! swapped for a single batch holding the current records. Tombstones are
//! kept because their versions still order later writes.

use crate::error::{SyncError, SyncResult};
use cloudsync_protocol::{from_cbor, to_cbor, Record, RecordKey, Version};
use cloudsync_storage::frame::{self, FrameKind, FrameWriter};
use cloudsync_storage::StorageBackend;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Superseded writes that make a record store eligible for compaction.
pub const DEFAULT_COMPACT_AFTER: usize = 1024;

/// Key-ordered record store.
pub struct RecordStore {
    backend: Box<dyn StorageBackend>,
    records: BTreeMap<RecordKey, Record>,
    /// Writes in the backend that a later write of the same key replaced.
    superseded: usize,
    compact_after: usize,
    sync_on_write: bool,
}

impl RecordStore {
    /// Opens the store, replaying every committed batch.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StorageCorruption`] if a frame fails validation
    /// or a batch cannot be decoded.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> SyncResult<Self> {
        let frames = frame::recover(backend.as_mut())?;
        let mut records = BTreeMap::new();
        let mut superseded = 0;

        for frame in &frames {
            if frame.kind != FrameKind::Batch {
                return Err(SyncError::StorageCorruption(format!(
                    "unexpected {:?} frame in record store at offset {}",
                    frame.kind, frame.offset
                )));
            }
            let batch: Vec<Record> = from_cbor(&frame.payload).map_err(|e| {
                SyncError::StorageCorruption(format!("batch at offset {}: {e}", frame.offset))
            })?;
            for record in batch {
                if records.insert(record.key.clone(), record).is_some() {
                    superseded += 1;
                }
            }
        }

        debug!(
            records = records.len(),
            batches = frames.len(),
            superseded,
            "opened record store"
        );
        Ok(Self {
            backend,
            records,
            superseded,
            compact_after: DEFAULT_COMPACT_AFTER,
            sync_on_write: true,
        })
    }

    /// Sets how many superseded writes trigger compaction after a commit.
    ///
    /// Compaction also waits until superseded writes outnumber live keys.
    pub fn with_compact_after(mut self, writes: usize) -> Self {
        self.compact_after = writes;
        self
    }

    /// Sets whether each commit is synced before returning.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Returns the stored state of `key`, tombstones included.
    pub fn get(&self, key: &RecordKey) -> Option<&Record> {
        self.records.get(key)
    }

    /// Returns the stored version of `key`, zero if never written.
    pub fn version_of(&self, key: &RecordKey) -> Version {
        self.records.get(key).map_or(Version::ZERO, |r| r.version)
    }

    /// Iterates over all records in key order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Number of stored keys, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Runs `f` in a transaction and commits its writes atomically.
    ///
    /// If `f` returns an error, or the batch cannot be made durable, no
    /// write is visible and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the closure's error or the storage failure.
    pub fn transaction<F, T>(&mut self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut StoreTransaction<'_>) -> SyncResult<T>,
    {
        let mut txn = StoreTransaction {
            base: &self.records,
            pending: BTreeMap::new(),
        };
        let value = f(&mut txn)?;
        let pending = txn.pending;

        if pending.is_empty() {
            return Ok(value);
        }

        let batch: Vec<&Record> = pending.values().collect();
        let payload = to_cbor(&batch)?;
        FrameWriter::new(self.backend.as_mut())
            .with_sync(self.sync_on_write)
            .append(FrameKind::Batch, &payload)?;

        let written = pending.len();
        self.superseded += pending
            .keys()
            .filter(|key| self.records.contains_key(*key))
            .count();
        self.records.extend(pending);
        debug!(written, "committed record batch");

        if self.superseded >= self.compact_after && self.superseded >= self.records.len() {
            // The batch is already durable; a failed rewrite only delays reclaiming space.
            if let Err(e) = self.compact() {
                warn!(error = %e, "record store compaction failed");
            }
        }
        Ok(value)
    }

    /// Rewrites the backend as one batch of the current records.
    ///
    /// # Errors
    ///
    /// Returns the storage failure; the old contents stay in place then.
    pub fn compact(&mut self) -> SyncResult<()> {
        let snapshot: Vec<&Record> = self.records.values().collect();
        let image = if snapshot.is_empty() {
            Vec::new()
        } else {
            frame::encode_frame(FrameKind::Batch, &to_cbor(&snapshot)?)?
        };

        let before = self.backend.size()?;
        self.backend.replace(&image)?;
        debug!(
            before,
            after = image.len(),
            dropped = self.superseded,
            "compacted record store"
        );
        self.superseded = 0;
        Ok(())
    }

    /// Writes in the backend that later writes replaced.
    pub fn superseded(&self) -> usize {
        self.superseded
    }

    /// Writes one record in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns the storage failure; the record is not visible then.
    pub fn put(&mut self, record: Record) -> SyncResult<()> {
        self.transaction(|txn| {
            txn.put(record);
            Ok(())
        })
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("records", &self.records.len())
            .finish()
    }
}

/// Uncommitted writes over a consistent view of the store.
pub struct StoreTransaction<'a> {
    base: &'a BTreeMap<RecordKey, Record>,
    pending: BTreeMap<RecordKey, Record>,
}

impl StoreTransaction<'_> {
    /// Returns the state of `key` as this transaction sees it.
    pub fn get(&self, key: &RecordKey) -> Option<&Record> {
        self.pending.get(key).or_else(|| self.base.get(key))
    }

    /// Stages a write.
    pub fn put(&mut self, record: Record) {
        self.pending.insert(record.key.clone(), record);
    }

    /// Number of staged writes.
    pub fn staged(&self) -> usize {
        self.pending.len()
    }
}
