//! Checksummed record framing.
//!
//! Every durable structure is a sequence of frames:
//!
//! ```text
//! ┌───────┬─────────┬──────┬────────┬─────────────┬───────┐
//! │ magic │ version │ kind │ length │   payload   │ crc32 │
//! │  (4)  │   (2)   │ (1)  │  (4)   │  (length)   │  (4)  │
//! └───────┴─────────┴──────┴────────┴─────────────┴───────┘
//! ```
//!
//! The CRC covers header and payload. Integers are little-endian.
//!
//! A frame cut short at the end of the store is a *torn tail*: the process
//! died mid-append, the write never returned, and readers treat it as end of
//! data. A complete frame that fails validation is corruption.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};

/// Magic bytes at the start of each frame.
pub const FRAME_MAGIC: [u8; 4] = *b"CSFR";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
pub const HEADER_SIZE: usize = 11;

/// Trailing checksum size.
pub const CRC_SIZE: usize = 4;

/// What a frame's payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// One change log entry.
    Entry = 1,
    /// Change log truncation marker carrying the new floor.
    Truncate = 2,
    /// A checkpoint.
    Checkpoint = 3,
    /// An atomic batch of record writes.
    Batch = 4,
}

impl FrameKind {
    /// Converts a byte to a frame kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Entry),
            2 => Some(Self::Truncate),
            3 => Some(Self::Checkpoint),
            4 => Some(Self::Batch),
            _ => None,
        }
    }

    /// Converts the kind to its byte tag.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the frame header in the store.
    pub offset: u64,
    /// Payload kind.
    pub kind: FrameKind,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Total encoded size of this frame.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        (HEADER_SIZE + self.payload.len() + CRC_SIZE) as u64
    }
}

/// Encodes one frame.
///
/// # Errors
///
/// Returns [`StorageError::PayloadTooLarge`] if the payload length does not
/// fit the 4-byte length field.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> StorageResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::PayloadTooLarge(payload.len()))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    buf.push(kind.as_byte());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Appends frames to a backend.
///
/// With syncing enabled (the default) `append` returns only after the frame
/// is flushed and synced, so a returned offset is a durable one.
pub struct FrameWriter<'a, B: StorageBackend + ?Sized> {
    backend: &'a mut B,
    sync: bool,
}

impl<'a, B: StorageBackend + ?Sized> FrameWriter<'a, B> {
    /// Creates a syncing writer over `backend`.
    pub fn new(backend: &'a mut B) -> Self {
        Self {
            backend,
            sync: true,
        }
    }

    /// Enables or disables the sync after each append.
    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Appends one frame and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, the append or the sync fails. A
    /// capacity failure writes nothing, and a failed flush or sync cuts the
    /// frame off again.
    pub fn append(&mut self, kind: FrameKind, payload: &[u8]) -> StorageResult<u64> {
        let bytes = encode_frame(kind, payload)?;
        let offset = self.backend.append(&bytes)?;
        if let Err(err) = self.persist() {
            // A frame that was not made durable must not be replayed later.
            let _ = self.backend.truncate(offset);
            return Err(err);
        }
        Ok(offset)
    }

    fn persist(&mut self) -> StorageResult<()> {
        self.backend.flush()?;
        if self.sync {
            self.backend.sync()?;
        }
        Ok(())
    }
}

/// Iterates over the frames of a backend from a starting offset.
///
/// Stops cleanly at a torn tail; [`FrameReader::torn_tail`] reports whether
/// one was seen and [`FrameReader::valid_end`] where the last complete frame
/// ends. Corruption is yielded once as an error and ends the iteration.
pub struct FrameReader<'a, B: StorageBackend + ?Sized> {
    backend: &'a B,
    size: u64,
    offset: u64,
    torn: bool,
    finished: bool,
}

impl<'a, B: StorageBackend + ?Sized> FrameReader<'a, B> {
    /// Creates a reader starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(backend: &'a B, start_offset: u64) -> StorageResult<Self> {
        let size = backend.size()?;
        Ok(Self {
            backend,
            size,
            offset: start_offset,
            torn: false,
            finished: start_offset >= size,
        })
    }

    /// Offset just past the last complete frame read so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// True if iteration stopped at an incomplete trailing frame.
    #[must_use]
    pub fn torn_tail(&self) -> bool {
        self.torn
    }

    fn corrupted(&mut self, reason: impl Into<String>) -> Option<StorageResult<Frame>> {
        self.finished = true;
        Some(Err(StorageError::Corrupted {
            offset: self.offset,
            reason: reason.into(),
        }))
    }

    fn read_next(&mut self) -> Option<StorageResult<Frame>> {
        let remaining = self.size - self.offset;
        if remaining < (HEADER_SIZE + CRC_SIZE) as u64 {
            self.torn = true;
            self.finished = true;
            return None;
        }

        let header = match self.backend.read_at(self.offset, HEADER_SIZE) {
            Ok(h) => h,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };

        if header[0..4] != FRAME_MAGIC {
            return self.corrupted("bad frame magic");
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != FRAME_VERSION {
            return self.corrupted(format!("unsupported frame version {version}"));
        }
        let Some(kind) = FrameKind::from_byte(header[6]) else {
            return self.corrupted(format!("unknown frame kind {}", header[6]));
        };
        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as u64;

        let total = HEADER_SIZE as u64 + len + CRC_SIZE as u64;
        if total > remaining {
            self.torn = true;
            self.finished = true;
            return None;
        }

        let body = match self
            .backend
            .read_at(self.offset + HEADER_SIZE as u64, len as usize + CRC_SIZE)
        {
            Ok(b) => b,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        let (payload, crc_bytes) = body.split_at(len as usize);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        let mut checked = header;
        checked.extend_from_slice(payload);
        let computed = compute_crc32(&checked);
        if stored != computed {
            return self.corrupted(format!(
                "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            ));
        }

        let frame = Frame {
            offset: self.offset,
            kind,
            payload: payload.to_vec(),
        };
        self.offset += total;
        if self.offset >= self.size {
            self.finished = true;
        }
        Some(Ok(frame))
    }
}

impl<B: StorageBackend + ?Sized> Iterator for FrameReader<'_, B> {
    type Item = StorageResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.read_next()
    }
}

/// Reads every frame and drops a torn tail from the backend.
///
/// Returns the frames in order. Used when opening a store.
///
/// # Errors
///
/// Returns the first corruption or I/O error encountered.
pub fn recover<B: StorageBackend + ?Sized>(backend: &mut B) -> StorageResult<Vec<Frame>> {
    let (frames, valid_end, torn) = {
        let mut reader = FrameReader::new(&*backend, 0)?;
        let mut frames = Vec::new();
        for frame in reader.by_ref() {
            frames.push(frame?);
        }
        (frames, reader.valid_end(), reader.torn_tail())
    };

    if torn {
        backend.truncate(valid_end)?;
    }
    Ok(frames)
}

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}
