//! Dump change log command implementation.

use super::scan::{decode_log_frame, live_checkpoint, scan, LogFrame, ReplicaFiles};
use cloudsync_protocol::OperationKind;
use serde::Serialize;
use std::error::Error;
use std::path::Path;

/// Change log entry representation for output.
#[derive(Debug, Serialize)]
pub struct LogEntryInfo {
    /// Offset of the frame in the change log file.
    pub offset: u64,
    /// Log sequence number.
    pub seq: u64,
    /// Mutation kind.
    pub kind: &'static str,
    /// Record key, text when printable.
    pub key: String,
    /// Version of the key after this change.
    pub version: u64,
    /// Replica that made the change.
    pub origin: String,
    /// Origin wall clock time in milliseconds.
    pub timestamp_ms: u64,
    /// Value size in bytes.
    pub value_size: usize,
    /// True if a checkpoint or truncation already covers this entry.
    pub acknowledged: bool,
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    since: u64,
    include_acknowledged: bool,
    format: &str,
) -> Result<(), Box<dyn Error>> {
    let entries = read_entries(path, limit, since, include_acknowledged)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries);
        }
    }

    Ok(())
}

/// Reads change log entries with seq above `since`, oldest first.
pub fn read_entries(
    path: &Path,
    limit: Option<usize>,
    since: u64,
    include_acknowledged: bool,
) -> Result<Vec<LogEntryInfo>, Box<dyn Error>> {
    let files = ReplicaFiles::locate(path)?;
    let changes = scan(&files.changes())?.ok_or("Change log file not found")?;
    let checkpoint = live_checkpoint(scan(&files.checkpoint())?.as_ref())?;

    if let Some(reason) = &changes.corruption {
        tracing::warn!(%reason, "change log is corrupt; dumping frames before it");
    }

    let mut decoded = Vec::with_capacity(changes.frames.len());
    let mut floor = checkpoint.log_watermark;
    for frame in &changes.frames {
        match decode_log_frame(frame)? {
            LogFrame::Entry(entry) => decoded.push((frame.offset, entry)),
            LogFrame::Truncate(marker) => floor = floor.max(marker),
        }
    }

    let max_entries = limit.unwrap_or(usize::MAX);
    Ok(decoded
        .into_iter()
        .filter(|(_, entry)| entry.seq > since)
        .map(|(offset, entry)| LogEntryInfo {
            offset,
            seq: entry.seq,
            kind: kind_name(entry.kind),
            key: entry.key.to_string(),
            version: entry.version.0,
            origin: entry.origin.to_string(),
            timestamp_ms: entry.timestamp_ms,
            value_size: entry.value.len(),
            acknowledged: entry.seq <= floor,
        })
        .filter(|info| include_acknowledged || !info.acknowledged)
        .take(max_entries)
        .collect())
}

fn kind_name(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Insert => "INSERT",
        OperationKind::Update => "UPDATE",
        OperationKind::Delete => "DELETE",
    }
}

fn print_text_output(entries: &[LogEntryInfo]) {
    println!("Change Log Entries ({} total)", entries.len());
    println!("=========================");
    println!();

    for entry in entries {
        print!(
            "[{:08}] seq={:<6} {:6} key={} v{}",
            entry.offset, entry.seq, entry.kind, entry.key, entry.version
        );
        if entry.kind != "DELETE" {
            print!(" value={} bytes", entry.value_size);
        }
        print!(" origin={}...", &entry.origin[..8.min(entry.origin.len())]);
        if entry.acknowledged {
            print!(" (acked)");
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::scan::tests::sample_replica;

    #[test]
    fn dumps_pending_entries_in_order() {
        let dir = sample_replica();
        let entries = read_entries(dir.path(), None, 0, false).unwrap();

        let kinds: Vec<_> = entries.iter().map(|e| (e.seq, e.kind, e.key.as_str())).collect();
        assert_eq!(
            kinds,
            vec![(1, "INSERT", "a"), (2, "INSERT", "b"), (3, "DELETE", "a")]
        );
        assert_eq!(entries[0].value_size, 1);
        assert_eq!(entries[2].value_size, 0);
        assert_eq!(entries[2].version, 2);
        assert!(entries.iter().all(|e| !e.acknowledged));
    }

    #[test]
    fn since_and_limit_narrow_the_dump() {
        let dir = sample_replica();
        let entries = read_entries(dir.path(), Some(1), 1, false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 2);
    }

    #[test]
    fn missing_replica_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(read_entries(dir.path(), None, 0, false).is_err());
    }
}
