//! Replica directory management.
//!
//! ```text
//! <replica_path>/
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ replica.id        # 16 raw bytes, generated on first open
//! ├─ records.log       # Record store batches
//! ├─ changes.log       # Change log
//! └─ checkpoint.log    # Checkpoint history
//! ```

use crate::error::{SyncError, SyncResult};
use cloudsync_protocol::ReplicaId;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const REPLICA_ID_TEMP: &str = "replica.id.tmp";

/// Replica id file name.
pub const REPLICA_ID_FILE: &str = "replica.id";
/// Record store file name.
pub const RECORDS_FILE: &str = "records.log";
/// Change log file name.
pub const CHANGES_FILE: &str = "changes.log";
/// Checkpoint store file name.
pub const CHECKPOINT_FILE: &str = "checkpoint.log";

/// An opened replica directory. Holds the exclusive lock while alive.
#[derive(Debug)]
pub struct ReplicaDir {
    path: PathBuf,
    _lock_file: File,
}

impl ReplicaDir {
    /// Opens or creates a replica directory and locks it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ReplicaLocked`] if another process holds the
    /// lock, or [`SyncError::Config`] if the directory is missing and
    /// `create_if_missing` is false.
    pub fn open(path: &Path, create_if_missing: bool) -> SyncResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path).map_err(io_error)?;
            } else {
                return Err(SyncError::Config(format!(
                    "replica directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(SyncError::Config(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))
            .map_err(io_error)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::ReplicaLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the record store.
    pub fn records_path(&self) -> PathBuf {
        self.path.join(RECORDS_FILE)
    }

    /// Path of the change log.
    pub fn changes_path(&self) -> PathBuf {
        self.path.join(CHANGES_FILE)
    }

    /// Path of the checkpoint store.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.path.join(CHECKPOINT_FILE)
    }

    /// Loads the replica id, generating and persisting one on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StorageCorruption`] if the stored id is not 16
    /// bytes, or a storage error if it cannot be written.
    pub fn load_or_create_replica_id(&self) -> SyncResult<ReplicaId> {
        let id_path = self.path.join(REPLICA_ID_FILE);
        if id_path.exists() {
            let bytes = fs::read(&id_path).map_err(io_error)?;
            let raw: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
                SyncError::StorageCorruption(format!(
                    "{} holds {} bytes, expected 16",
                    id_path.display(),
                    bytes.len()
                ))
            })?;
            return Ok(ReplicaId::from_bytes(raw));
        }

        let id = ReplicaId::generate();
        // Write to a temp file and rename so a crash never leaves a short id.
        let temp_path = self.path.join(REPLICA_ID_TEMP);
        {
            let mut file = File::create(&temp_path).map_err(io_error)?;
            file.write_all(id.as_bytes()).map_err(io_error)?;
            file.sync_all().map_err(io_error)?;
        }
        fs::rename(&temp_path, &id_path).map_err(io_error)?;
        Ok(id)
    }
}

/// Returns true if `path` looks like a replica directory.
pub fn is_replica_dir(path: &Path) -> bool {
    path.join(CHANGES_FILE).exists() || path.join(CHECKPOINT_FILE).exists()
}

fn io_error(err: std::io::Error) -> SyncError {
    SyncError::Storage(err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("replica");

        let dir = ReplicaDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(dir.changes_path(), path.join("changes.log"));
    }

    #[test]
    fn missing_directory_without_create_fails() {
        let temp = tempdir().unwrap();
        let result = ReplicaDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _first = ReplicaDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            ReplicaDir::open(temp.path(), true),
            Err(SyncError::ReplicaLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(ReplicaDir::open(temp.path(), true).unwrap());
        assert!(ReplicaDir::open(temp.path(), true).is_ok());
    }

    #[test]
    fn replica_id_is_stable() {
        let temp = tempdir().unwrap();
        let first = {
            let dir = ReplicaDir::open(temp.path(), true).unwrap();
            dir.load_or_create_replica_id().unwrap()
        };
        let dir = ReplicaDir::open(temp.path(), true).unwrap();
        assert_eq!(dir.load_or_create_replica_id().unwrap(), first);
    }

    #[test]
    fn short_replica_id_is_corruption() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(REPLICA_ID_FILE), b"short").unwrap();
        let dir = ReplicaDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            dir.load_or_create_replica_id(),
            Err(SyncError::StorageCorruption(_))
        ));
    }
}
