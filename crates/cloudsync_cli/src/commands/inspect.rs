//! Inspect command implementation.

use super::scan::{
    decode_batch, decode_log_frame, format_size, live_checkpoint, scan, LogFrame, ReplicaFiles,
    Scan,
};
use cloudsync_protocol::RecordKey;
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::path::Path;

/// Replica inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Replica directory path.
    pub path: String,
    /// Replica id, if one was generated.
    pub replica_id: Option<String>,
    /// Checkpoint state.
    pub checkpoint: CheckpointInfo,
    /// Change log state.
    pub change_log: ChangeLogInfo,
    /// Record store state.
    pub records: RecordInfo,
    /// Total size of the three stores in bytes.
    pub total_size: u64,
    /// Files that end in an incomplete frame.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub torn_tails: Vec<String>,
}

/// Live checkpoint.
#[derive(Debug, Serialize)]
pub struct CheckpointInfo {
    /// Remote cursor to pull from next.
    pub remote_cursor: u64,
    /// Change log seq up to which local entries are acknowledged.
    pub log_watermark: u64,
    /// Checkpoint frames stored, live one included.
    pub history: usize,
    /// Checkpoint store size in bytes.
    pub size: u64,
}

/// Change log statistics.
#[derive(Debug, Serialize)]
pub struct ChangeLogInfo {
    /// Entry frames present in the file.
    pub stored_entries: usize,
    /// Entries not yet acknowledged.
    pub pending_entries: usize,
    /// Effective floor: the higher of the checkpoint watermark and the last
    /// truncation marker.
    pub floor: u64,
    /// Highest seq ever assigned.
    pub last_seq: u64,
    /// Change log size in bytes.
    pub size: u64,
}

/// Record store statistics.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Committed batches.
    pub batches: usize,
    /// Keys with a live value.
    pub live: usize,
    /// Keys whose latest state is a tombstone.
    pub tombstones: usize,
    /// Record store size in bytes.
    pub size: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn Error>> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects inspection data for the replica at `path`.
pub fn inspect(path: &Path) -> Result<InspectResult, Box<dyn Error>> {
    let files = ReplicaFiles::locate(path)?;
    let changes = scan(&files.changes())?;
    let records = scan(&files.records())?;
    let checkpoints = scan(&files.checkpoint())?;

    let mut torn_tails = Vec::new();
    for (name, scanned) in [
        ("changes", &changes),
        ("records", &records),
        ("checkpoint", &checkpoints),
    ] {
        if let Some(s) = scanned {
            if let Some(reason) = &s.corruption {
                return Err(format!("{name} store is corrupt ({reason}); run verify").into());
            }
            if s.torn_tail {
                torn_tails.push(name.to_string());
            }
        }
    }

    let checkpoint = live_checkpoint(checkpoints.as_ref())?;
    let change_log = analyze_changes(changes.as_ref(), checkpoint.log_watermark)?;
    let record_info = analyze_records(records.as_ref())?;

    let checkpoint_info = CheckpointInfo {
        remote_cursor: checkpoint.remote_cursor,
        log_watermark: checkpoint.log_watermark,
        history: checkpoints.as_ref().map_or(0, |s| s.frames.len()),
        size: size_of(checkpoints.as_ref()),
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        replica_id: files.replica_id()?.map(|id| id.to_string()),
        total_size: checkpoint_info.size + change_log.size + record_info.size,
        checkpoint: checkpoint_info,
        change_log,
        records: record_info,
        torn_tails,
    })
}

fn size_of(scan: Option<&Scan>) -> u64 {
    scan.map_or(0, |s| s.size)
}

fn analyze_changes(scan: Option<&Scan>, watermark: u64) -> Result<ChangeLogInfo, Box<dyn Error>> {
    let mut floor = watermark;
    let mut last_seq = watermark;
    let mut seqs = Vec::new();

    for frame in scan.map(|s| s.frames.as_slice()).unwrap_or_default() {
        match decode_log_frame(frame)? {
            LogFrame::Entry(entry) => {
                last_seq = last_seq.max(entry.seq);
                seqs.push(entry.seq);
            }
            LogFrame::Truncate(marker) => {
                floor = floor.max(marker);
                last_seq = last_seq.max(marker);
            }
        }
    }

    Ok(ChangeLogInfo {
        stored_entries: seqs.len(),
        pending_entries: seqs.iter().filter(|&&seq| seq > floor).count(),
        floor,
        last_seq,
        size: size_of(scan),
    })
}

fn analyze_records(scan: Option<&Scan>) -> Result<RecordInfo, Box<dyn Error>> {
    let frames = scan.map(|s| s.frames.as_slice()).unwrap_or_default();
    let mut latest: HashMap<RecordKey, bool> = HashMap::new();

    for frame in frames {
        for record in decode_batch(frame)? {
            latest.insert(record.key, record.tombstone);
        }
    }

    let tombstones = latest.values().filter(|&&t| t).count();
    Ok(RecordInfo {
        batches: frames.len(),
        live: latest.len() - tombstones,
        tombstones,
        size: size_of(scan),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("CloudSync Replica Inspection");
    println!("============================");
    println!();
    println!("Path:    {}", result.path);
    println!(
        "Replica: {}",
        result.replica_id.as_deref().unwrap_or("(not assigned)")
    );
    println!();
    println!("Checkpoint:");
    println!("  Remote cursor:  {}", result.checkpoint.remote_cursor);
    println!("  Log watermark:  {}", result.checkpoint.log_watermark);
    println!("  History:        {} frames", result.checkpoint.history);
    println!();
    println!("Change log:");
    println!("  Pending:        {}", result.change_log.pending_entries);
    println!("  Stored entries: {}", result.change_log.stored_entries);
    println!("  Floor:          {}", result.change_log.floor);
    println!("  Last seq:       {}", result.change_log.last_seq);
    println!();
    println!("Records:");
    println!("  Live:           {}", result.records.live);
    println!("  Tombstones:     {}", result.records.tombstones);
    println!("  Batches:        {}", result.records.batches);
    println!();
    println!("Storage:");
    println!("  Change log:     {}", format_size(result.change_log.size));
    println!("  Record store:   {}", format_size(result.records.size));
    println!("  Checkpoints:    {}", format_size(result.checkpoint.size));
    println!("  Total:          {}", format_size(result.total_size));

    if !result.torn_tails.is_empty() {
        println!();
        println!(
            "Torn tails (dropped on next open): {}",
            result.torn_tails.join(", ")
        );
    }
}
