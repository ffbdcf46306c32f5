//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An in-memory storage backend.
///
/// Clones share the same buffer, so a test can keep one handle, hand the
/// other to a change log, drop the log and "reopen" it from the surviving
/// handle to simulate a process restart.
///
/// Writes can be made to fail on demand with [`InMemoryBackend::fail_writes`],
/// which is how tests exercise checkpoint-write failures.
///
/// # Example
///
/// ```rust
/// use cloudsync_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let offset = backend.append(b"test data").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(backend.size().unwrap(), 9);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    capacity: Option<u64>,
    failing: Arc<AtomicBool>,
    sync_failing: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Creates a new empty, unbounded backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that refuses to grow past `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Creates a backend preloaded with `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            ..Self::default()
        }
    }

    /// Returns a copy of every byte in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Overwrites one byte in place. Test helper for corruption scenarios.
    pub fn corrupt_byte(&self, offset: usize) {
        let mut data = self.data.write();
        if let Some(byte) = data.get_mut(offset) {
            *byte ^= 0xFF;
        }
    }

    /// Makes every subsequent append, flush and sync fail until reset.
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes flush and sync fail while appends still land in the buffer.
    ///
    /// Models a write that reached the OS but was never made durable.
    pub fn fail_syncs(&self, failing: bool) {
        self.sync_failing.store(failing, Ordering::SeqCst);
    }

    fn check_durable(&self) -> StorageResult<()> {
        self.check_writable()?;
        if self.sync_failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected sync failure",
            )));
        }
        Ok(())
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        Ok(())
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut data = self.data.write();
        let offset = data.len() as u64;

        if let Some(capacity) = self.capacity {
            let requested = new_data.len() as u64;
            let available = capacity.saturating_sub(offset);
            if requested > available {
                return Err(StorageError::CapacityExceeded {
                    requested,
                    available,
                });
            }
        }

        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check_durable()
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_durable()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let current = data.len() as u64;

        if new_size > current {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot truncate to {new_size} bytes, store holds {current}"),
            )));
        }

        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, new_data: &[u8]) -> StorageResult<()> {
        self.check_durable()?;
        if let Some(capacity) = self.capacity {
            let requested = new_data.len() as u64;
            if requested > capacity {
                return Err(StorageError::CapacityExceeded {
                    requested,
                    available: capacity,
                });
            }
        }

        *self.data.write() = new_data.to_vec();
        Ok(())
    }

    fn capacity(&self) -> Option<u64> {
        self.capacity
    }
}
