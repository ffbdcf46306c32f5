//! Checkpoint persistence.
//!
//! Checkpoints are appended as [`FrameKind::Checkpoint`] frames and the last
//! complete frame is the live one. A checkpoint therefore becomes valid in a
//! single durable append: before the sync returns there is the old one,
//! after it the new one, and a torn append is discarded on open.
//!
//! After [`DEFAULT_HISTORY_LIMIT`] frames the history is swapped for the
//! live checkpoint alone.

use crate::error::{SyncError, SyncResult};
use cloudsync_protocol::{from_cbor, to_cbor};
use cloudsync_storage::frame::{self, FrameKind, FrameWriter};
use cloudsync_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Checkpoint frames kept before the history is compacted.
pub const DEFAULT_HISTORY_LIMIT: u64 = 64;

/// The last point at which local and remote state were known synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Remote cursor to pull from next.
    pub remote_cursor: u64,
    /// Change log seq up to which local entries are acknowledged.
    pub log_watermark: u64,
}

/// Durable home of the live checkpoint.
pub struct CheckpointStore {
    backend: Box<dyn StorageBackend>,
    current: Checkpoint,
    frames: u64,
    history_limit: u64,
}

impl CheckpointStore {
    /// Opens the store and loads the latest checkpoint.
    ///
    /// An empty store yields the zero checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StorageCorruption`] if a complete frame fails
    /// validation.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> SyncResult<Self> {
        let frames = frame::recover(backend.as_mut())?;
        let mut current = Checkpoint::default();
        let count = frames.len() as u64;

        for frame in frames {
            if frame.kind != FrameKind::Checkpoint {
                return Err(SyncError::StorageCorruption(format!(
                    "unexpected {:?} frame in checkpoint store at offset {}",
                    frame.kind, frame.offset
                )));
            }
            current = from_cbor(&frame.payload).map_err(|e| {
                SyncError::StorageCorruption(format!(
                    "checkpoint at offset {}: {e}",
                    frame.offset
                ))
            })?;
        }

        debug!(
            remote_cursor = current.remote_cursor,
            log_watermark = current.log_watermark,
            "loaded checkpoint"
        );
        Ok(Self {
            backend,
            current,
            frames: count,
            history_limit: DEFAULT_HISTORY_LIMIT,
        })
    }

    /// Sets how many frames accumulate before the history is compacted.
    pub fn with_history_limit(mut self, frames: u64) -> Self {
        self.history_limit = frames.max(1);
        self
    }

    /// Returns the live checkpoint.
    pub fn current(&self) -> Checkpoint {
        self.current
    }

    /// Makes `checkpoint` the live one. Durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CheckpointWrite`] if the frame cannot be made
    /// durable. The previous checkpoint stays live.
    pub fn commit(&mut self, checkpoint: Checkpoint) -> SyncResult<()> {
        let payload = to_cbor(&checkpoint)?;
        FrameWriter::new(self.backend.as_mut())
            .append(FrameKind::Checkpoint, &payload)
            .map_err(|e| SyncError::CheckpointWrite(e.to_string()))?;

        self.current = checkpoint;
        self.frames += 1;

        if self.frames > self.history_limit {
            // The new checkpoint is already durable in the old history.
            if let Err(e) = self.compact() {
                warn!(error = %e, "checkpoint history compaction failed");
            }
        }
        Ok(())
    }

    /// Replaces the history with the live checkpoint alone.
    ///
    /// # Errors
    ///
    /// Returns the storage failure; the old history stays in place then.
    pub fn compact(&mut self) -> SyncResult<()> {
        let image = frame::encode_frame(FrameKind::Checkpoint, &to_cbor(&self.current)?)?;
        self.backend.replace(&image)?;
        debug!(dropped = self.frames - 1, "compacted checkpoint history");
        self.frames = 1;
        Ok(())
    }

    /// Number of checkpoint frames stored, live one included.
    pub fn history_len(&self) -> u64 {
        self.frames
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("current", &self.current)
            .field("frames", &self.frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_storage::InMemoryBackend;

    #[test]
    fn empty_store_starts_at_zero() {
        let store = CheckpointStore::open(Box::new(InMemoryBackend::new())).unwrap();
        assert_eq!(store.current(), Checkpoint::default());
    }

    #[test]
    fn latest_commit_wins_after_reopen() {
        let backend = InMemoryBackend::new();
        {
            let mut store = CheckpointStore::open(Box::new(backend.clone())).unwrap();
            store
                .commit(Checkpoint {
                    remote_cursor: 5,
                    log_watermark: 2,
                })
                .unwrap();
            store
                .commit(Checkpoint {
                    remote_cursor: 9,
                    log_watermark: 4,
                })
                .unwrap();
        }

        let store = CheckpointStore::open(Box::new(backend)).unwrap();
        assert_eq!(store.current().remote_cursor, 9);
        assert_eq!(store.current().log_watermark, 4);
    }

    #[test]
    fn torn_commit_keeps_previous_checkpoint() {
        let backend = InMemoryBackend::new();
        let committed = Checkpoint {
            remote_cursor: 3,
            log_watermark: 1,
        };
        {
            let mut store = CheckpointStore::open(Box::new(backend.clone())).unwrap();
            store.commit(committed).unwrap();
        }
        let next = frame::encode_frame(
            FrameKind::Checkpoint,
            &to_cbor(&Checkpoint {
                remote_cursor: 99,
                log_watermark: 50,
            })
            .unwrap(),
        )
        .unwrap();
        let mut raw = backend.clone();
        raw.append(&next[..next.len() / 2]).unwrap();

        let store = CheckpointStore::open(Box::new(backend)).unwrap();
        assert_eq!(store.current(), committed);
    }

    #[test]
    fn failed_write_is_checkpoint_error() {
        let backend = InMemoryBackend::new();
        let mut store = CheckpointStore::open(Box::new(backend.clone())).unwrap();
        backend.fail_writes(true);

        let err = store
            .commit(Checkpoint {
                remote_cursor: 1,
                log_watermark: 1,
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::CheckpointWrite(_)));
        assert!(err.is_fatal());
        assert_eq!(store.current(), Checkpoint::default());
    }

    #[test]
    fn corrupt_frame_is_reported() {
        let backend = InMemoryBackend::new();
        {
            let mut store = CheckpointStore::open(Box::new(backend.clone())).unwrap();
            store
                .commit(Checkpoint {
                    remote_cursor: 1,
                    log_watermark: 1,
                })
                .unwrap();
        }
        backend.corrupt_byte(12);
        assert!(matches!(
            CheckpointStore::open(Box::new(backend)),
            Err(SyncError::StorageCorruption(_))
        ));
    }

    #[test]
    fn history_counts_commits() {
        let backend = InMemoryBackend::new();
        {
            let mut store = CheckpointStore::open(Box::new(backend.clone())).unwrap();
            for i in 1..=5 {
                store
                    .commit(Checkpoint {
                        remote_cursor: i,
                        log_watermark: i,
                    })
                    .unwrap();
            }
        }

        let store = CheckpointStore::open(Box::new(backend)).unwrap();
        assert_eq!(store.history_len(), 5);
        assert_eq!(store.current().remote_cursor, 5);
    }

    #[test]
    fn failed_sync_keeps_previous_checkpoint_on_reopen() {
        let backend = InMemoryBackend::new();
        let first = Checkpoint {
            remote_cursor: 4,
            log_watermark: 2,
        };
        let mut store = CheckpointStore::open(Box::new(backend.clone())).unwrap();
        store.commit(first).unwrap();

        backend.fail_syncs(true);
        let err = store
            .commit(Checkpoint {
                remote_cursor: 8,
                log_watermark: 6,
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::CheckpointWrite(_)));
        backend.fail_syncs(false);
        drop(store);

        let reopened = CheckpointStore::open(Box::new(backend)).unwrap();
        assert_eq!(reopened.current(), first);
        assert_eq!(reopened.history_len(), 1);
    }

    #[test]
    fn long_history_is_compacted_to_the_live_checkpoint() {
        let backend = InMemoryBackend::new();
        let mut store = CheckpointStore::open(Box::new(backend.clone()))
            .unwrap()
            .with_history_limit(4);
        for i in 1..=5 {
            store
                .commit(Checkpoint {
                    remote_cursor: i * 10,
                    log_watermark: i,
                })
                .unwrap();
        }
        assert_eq!(store.history_len(), 1);
        store
            .commit(Checkpoint {
                remote_cursor: 60,
                log_watermark: 6,
            })
            .unwrap();
        drop(store);

        let reopened = CheckpointStore::open(Box::new(backend)).unwrap();
        assert_eq!(reopened.history_len(), 2);
        assert_eq!(reopened.current().remote_cursor, 60);
    }
}
