//! Read-only frame scanning shared by the commands.
//!
//! Nothing here truncates or repairs: a torn tail is reported, not dropped.

use cloudsync_engine::{
    Checkpoint, CHANGES_FILE, CHECKPOINT_FILE, RECORDS_FILE, REPLICA_ID_FILE,
};
use cloudsync_protocol::{from_cbor, ChangeEntry, Record, ReplicaId};
use cloudsync_storage::frame::{Frame, FrameKind, FrameReader};
use cloudsync_storage::{FileBackend, StorageBackend};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

/// Frames read from one file.
#[derive(Debug, Default)]
pub struct Scan {
    /// File size in bytes.
    pub size: u64,
    /// Complete, checksum-valid frames in file order.
    pub frames: Vec<Frame>,
    /// True if the file ends in an incomplete frame.
    pub torn_tail: bool,
    /// First corruption found; frames after it are not read.
    pub corruption: Option<String>,
}

/// Scans `path`, or returns `None` if the file does not exist.
pub fn scan(path: &Path) -> Result<Option<Scan>, Box<dyn Error>> {
    if !path.exists() {
        return Ok(None);
    }

    let backend = FileBackend::open(path)?;
    let size = backend.size()?;
    let mut reader = FrameReader::new(&backend, 0)?;
    let mut frames = Vec::new();
    let mut corruption = None;

    for frame in reader.by_ref() {
        match frame {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                corruption = Some(e.to_string());
                break;
            }
        }
    }

    Ok(Some(Scan {
        size,
        frames,
        torn_tail: reader.torn_tail(),
        corruption,
    }))
}

/// Paths of the files inside a replica directory.
#[derive(Debug, Clone)]
pub struct ReplicaFiles {
    /// Directory root.
    pub root: PathBuf,
}

impl ReplicaFiles {
    /// Checks that `root` looks like a replica directory.
    pub fn locate(root: &Path) -> Result<Self, Box<dyn Error>> {
        if !cloudsync_engine::is_replica_dir(root) {
            return Err(format!("No replica found at {}", root.display()).into());
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Change log path.
    pub fn changes(&self) -> PathBuf {
        self.root.join(CHANGES_FILE)
    }

    /// Record store path.
    pub fn records(&self) -> PathBuf {
        self.root.join(RECORDS_FILE)
    }

    /// Checkpoint store path.
    pub fn checkpoint(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    /// Reads the replica id, if present.
    pub fn replica_id(&self) -> Result<Option<ReplicaId>, Box<dyn Error>> {
        let path = self.root.join(REPLICA_ID_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let raw: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("{} holds {} bytes, expected 16", path.display(), bytes.len()))?;
        Ok(Some(ReplicaId::from_bytes(raw)))
    }
}

/// The latest checkpoint in `scan`, or the zero checkpoint.
pub fn live_checkpoint(scan: Option<&Scan>) -> Result<Checkpoint, Box<dyn Error>> {
    let mut current = Checkpoint::default();
    for frame in scan.map(|s| s.frames.as_slice()).unwrap_or_default() {
        current = decode_checkpoint(frame)?;
    }
    Ok(current)
}

/// Decodes a checkpoint frame.
pub fn decode_checkpoint(frame: &Frame) -> Result<Checkpoint, String> {
    if frame.kind != FrameKind::Checkpoint {
        return Err(unexpected(frame, "checkpoint store"));
    }
    from_cbor(&frame.payload).map_err(|e| format!("checkpoint at offset {}: {e}", frame.offset))
}

/// Decodes a record store batch frame.
pub fn decode_batch(frame: &Frame) -> Result<Vec<Record>, String> {
    if frame.kind != FrameKind::Batch {
        return Err(unexpected(frame, "record store"));
    }
    from_cbor(&frame.payload).map_err(|e| format!("batch at offset {}: {e}", frame.offset))
}

/// One decoded change log frame.
#[derive(Debug)]
pub enum LogFrame {
    /// A change entry.
    Entry(ChangeEntry),
    /// A truncation marker carrying the new floor.
    Truncate(u64),
}

/// Decodes a change log frame.
pub fn decode_log_frame(frame: &Frame) -> Result<LogFrame, String> {
    match frame.kind {
        FrameKind::Entry => ChangeEntry::decode(&frame.payload)
            .map(LogFrame::Entry)
            .map_err(|e| format!("change log entry at offset {}: {e}", frame.offset)),
        FrameKind::Truncate => {
            let bytes: [u8; 8] = frame.payload.as_slice().try_into().map_err(|_| {
                format!("truncate marker at offset {} is malformed", frame.offset)
            })?;
            Ok(LogFrame::Truncate(u64::from_le_bytes(bytes)))
        }
        _ => Err(unexpected(frame, "change log")),
    }
}

fn unexpected(frame: &Frame, file: &str) -> String {
    format!(
        "unexpected {:?} frame in {file} at offset {}",
        frame.kind, frame.offset
    )
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    #[allow(clippy::cast_precision_loss)]
    let value = bytes as f64;
    if bytes < KB {
        format!("{bytes} bytes")
    } else if bytes < MB {
        format!("{:.1} KB", value / KB as f64)
    } else if bytes < GB {
        format!("{:.1} MB", value / MB as f64)
    } else {
        format!("{:.1} GB", value / GB as f64)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cloudsync_engine::{Replica, ReplicaOptions};
    use std::io::Write;
    use tempfile::TempDir;

    /// A closed replica directory holding two puts and a delete.
    pub(crate) fn sample_replica() -> TempDir {
        let dir = TempDir::new().unwrap();
        let replica = Replica::open(dir.path(), ReplicaOptions::new()).unwrap();
        replica.put("a", "1").unwrap();
        replica.put("b", "2").unwrap();
        replica.delete("a").unwrap();
        drop(replica);
        dir
    }

    #[test]
    fn missing_file_scans_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(scan(&dir.path().join("absent.log")).unwrap().is_none());
    }

    #[test]
    fn scan_reads_every_frame() {
        let dir = sample_replica();
        let files = ReplicaFiles::locate(dir.path()).unwrap();
        let changes = scan(&files.changes()).unwrap().unwrap();
        assert_eq!(changes.frames.len(), 3);
        assert!(!changes.torn_tail);
        assert!(changes.corruption.is_none());

        let entries: Vec<u64> = changes
            .frames
            .iter()
            .filter_map(|f| match decode_log_frame(f).unwrap() {
                LogFrame::Entry(e) => Some(e.seq),
                LogFrame::Truncate(_) => None,
            })
            .collect();
        assert_eq!(entries, vec![1, 2, 3]);
        assert!(files.replica_id().unwrap().is_some());
    }

    #[test]
    fn torn_tail_is_reported_and_left_in_place() {
        let dir = sample_replica();
        let files = ReplicaFiles::locate(dir.path()).unwrap();
        let path = files.changes();
        let before = scan(&path).unwrap().unwrap().size;

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"CSFR\x01").unwrap();
        drop(file);

        let scanned = scan(&path).unwrap().unwrap();
        assert!(scanned.torn_tail);
        assert_eq!(scanned.frames.len(), 3);
        assert_eq!(fs::metadata(&path).unwrap().len(), before + 5);
    }

    #[test]
    fn non_replica_directory_is_refused() {
        let dir = TempDir::new().unwrap();
        assert!(ReplicaFiles::locate(dir.path()).is_err());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
