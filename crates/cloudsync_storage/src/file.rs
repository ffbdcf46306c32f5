//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A backend over a single OS file.
///
/// `flush()` hands buffered bytes to the OS; `sync()` calls
/// `File::sync_all()` so data and length are on disk. Truncation always
/// syncs, because it is used to drop torn tails and compaction must not be
/// undone by a crash.
///
/// `replace()` writes a sibling `<name>.compact` file, syncs it and renames
/// it over the original, then syncs the directory.
///
/// # Example
///
/// ```no_run
/// use cloudsync_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("changes.log")).unwrap();
/// backend.append(b"entry").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<FileState>,
    capacity: Option<u64>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens or creates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(FileState { file, size }),
            capacity: None,
        })
    }

    /// Opens or creates the file, creating parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Bounds the file at `capacity` bytes.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Option<u64>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".compact");
        self.path.with_file_name(name)
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

// NTFS journals the rename itself.
#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> io::Result<()> {
    Ok(())
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut state = self.inner.lock();
        let size = state.size;
        if offset > size || offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        state.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        state.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut state = self.inner.lock();
        let offset = state.size;
        if data.is_empty() {
            return Ok(offset);
        }

        if let Some(capacity) = self.capacity {
            let requested = data.len() as u64;
            let available = capacity.saturating_sub(offset);
            if requested > available {
                return Err(StorageError::CapacityExceeded {
                    requested,
                    available,
                });
            }
        }

        state.file.seek(SeekFrom::End(0))?;
        if let Err(err) = state.file.write_all(data) {
            // Drop whatever part of the write landed so the tail stays clean.
            let _ = state.file.set_len(offset);
            return Err(err.into());
        }
        state.size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.lock().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut state = self.inner.lock();
        if new_size > state.size {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to {new_size} bytes, file holds {}",
                    state.size
                ),
            )));
        }

        state.file.set_len(new_size)?;
        state.file.sync_all()?;
        state.size = new_size;
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        if let Some(capacity) = self.capacity {
            let requested = data.len() as u64;
            if requested > capacity {
                return Err(StorageError::CapacityExceeded {
                    requested,
                    available: capacity,
                });
            }
        }

        let temp_path = self.compact_path();
        let written = File::create(&temp_path).and_then(|mut temp| {
            temp.write_all(data)?;
            temp.sync_all()
        });
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }

        let mut state = self.inner.lock();
        fs::rename(&temp_path, &self.path)?;
        sync_directory(&self.path)?;

        state.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        state.size = data.len() as u64;
        Ok(())
    }

    fn capacity(&self) -> Option<u64> {
        self.capacity
    }
}
