//! # CloudSync Storage
//!
//! Append-only byte stores and the checksummed framing every durable
//! CloudSync structure is written in.
//!
//! Backends are **opaque byte stores**: they know nothing about change log
//! entries, checkpoints or records. The [`frame`] module layers a small
//! self-describing envelope on top so readers can tell a torn tail (crash
//! during append) apart from real corruption.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral replicas
//! - [`FileBackend`] - For persistent replicas using OS file APIs
//!
//! Both accept an optional byte capacity; appends past it fail with
//! [`StorageError::CapacityExceeded`] and leave the store untouched.
//!
//! ## Example
//!
//! ```rust
//! use cloudsync_storage::{FrameKind, FrameReader, FrameWriter, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! FrameWriter::new(&mut backend).append(FrameKind::Entry, b"payload").unwrap();
//!
//! let frames: Vec<_> = FrameReader::new(&backend, 0)
//!     .unwrap()
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! assert_eq!(frames[0].payload, b"payload");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
pub mod frame;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use frame::{compute_crc32, Frame, FrameKind, FrameReader, FrameWriter};
pub use memory::InMemoryBackend;
