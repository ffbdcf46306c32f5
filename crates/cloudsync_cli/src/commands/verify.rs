//! Verify command implementation.
//!
//! Checks each store without repairing it: frame checksums, frame kinds,
//! payload decoding, and the ordering rules the engine relies on
//! (increasing change log seqs and floors, a checkpoint history that
//! never moves backwards).

use super::scan::{
    decode_batch, decode_checkpoint, decode_log_frame, scan, LogFrame, ReplicaFiles, Scan,
};
use cloudsync_engine::Checkpoint;
use std::error::Error;
use std::path::Path;

/// Which stores to check.
#[derive(Debug, Clone, Copy)]
pub struct Checks {
    /// The change log.
    pub changes: bool,
    /// The record store.
    pub records: bool,
    /// The checkpoint history.
    pub checkpoint: bool,
}

impl Checks {
    /// Checks everything.
    pub fn all() -> Self {
        Self {
            changes: true,
            records: true,
            checkpoint: true,
        }
    }
}

/// Verification result for one store.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of frames checked.
    pub frames_checked: usize,
    /// Number of valid frames.
    pub valid_frames: usize,
    /// Number of corrupt frames.
    pub corrupt_frames: usize,
    /// True if the store ends in an incomplete frame.
    pub torn_tail: bool,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Returns true if no error was found. A torn tail is not an error.
    pub fn is_ok(&self) -> bool {
        self.corrupt_frames == 0 && self.errors.is_empty()
    }

    fn from_scan(scan: &Scan) -> Self {
        let mut result = Self {
            frames_checked: scan.frames.len(),
            torn_tail: scan.torn_tail,
            ..Self::default()
        };
        if let Some(reason) = &scan.corruption {
            result.frames_checked += 1;
            result.corrupt_frames += 1;
            result.errors.push(reason.clone());
        }
        result
    }

    fn check(&mut self, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => self.valid_frames += 1,
            Err(e) => {
                self.corrupt_frames += 1;
                self.errors.push(e);
            }
        }
    }
}

/// Results for every checked store, `None` where the store is absent or
/// was not requested.
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Replica id file problems.
    pub replica_id_error: Option<String>,
    /// Change log result.
    pub changes: Option<VerifyResult>,
    /// Record store result.
    pub records: Option<VerifyResult>,
    /// Checkpoint store result.
    pub checkpoint: Option<VerifyResult>,
}

impl VerifyReport {
    /// Returns true if every checked store passed.
    pub fn is_ok(&self) -> bool {
        self.replica_id_error.is_none()
            && [&self.changes, &self.records, &self.checkpoint]
                .into_iter()
                .flatten()
                .all(VerifyResult::is_ok)
    }
}

/// Runs the verify command.
pub fn run(path: &Path, checks: Checks) -> Result<(), Box<dyn Error>> {
    println!("Verifying replica at {}", path.display());
    println!();

    let report = verify(path, checks)?;

    if let Some(e) = &report.replica_id_error {
        println!("Replica id: {e}");
    }
    for (name, result, requested) in [
        ("Change log", &report.changes, checks.changes),
        ("Record store", &report.records, checks.records),
        ("Checkpoints", &report.checkpoint, checks.checkpoint),
    ] {
        match result {
            Some(result) => print_result(name, result),
            None if requested => {
                println!("{name}: file not found (this may be normal for new replicas)");
            }
            None => {}
        }
    }

    println!();
    if report.is_ok() {
        println!("✓ Replica verification passed");
        Ok(())
    } else {
        println!("✗ Replica verification failed");
        Err("Verification failed".into())
    }
}

/// Verifies the replica at `path`.
pub fn verify(path: &Path, checks: Checks) -> Result<VerifyReport, Box<dyn Error>> {
    let files = ReplicaFiles::locate(path)?;
    let mut report = VerifyReport {
        replica_id_error: files.replica_id().err().map(|e| e.to_string()),
        ..VerifyReport::default()
    };

    if checks.changes {
        report.changes = scan(&files.changes())?.map(|s| verify_changes(&s));
    }
    if checks.records {
        report.records = scan(&files.records())?.map(|s| verify_records(&s));
    }
    if checks.checkpoint {
        report.checkpoint = scan(&files.checkpoint())?.map(|s| verify_checkpoints(&s));
    }

    Ok(report)
}

fn verify_changes(scan: &Scan) -> VerifyResult {
    let mut result = VerifyResult::from_scan(scan);
    let mut last_seq = 0u64;
    let mut floor = 0u64;

    for frame in &scan.frames {
        let outcome = decode_log_frame(frame).and_then(|decoded| match decoded {
            LogFrame::Entry(entry) if entry.seq <= last_seq => Err(format!(
                "entry at offset {} has seq {} after seq {last_seq}",
                frame.offset, entry.seq
            )),
            LogFrame::Entry(entry) => {
                last_seq = entry.seq;
                Ok(())
            }
            LogFrame::Truncate(marker) if marker < floor => Err(format!(
                "truncate marker at offset {} lowers the floor from {floor} to {marker}",
                frame.offset
            )),
            LogFrame::Truncate(marker) => {
                // A drained log keeps only its marker, so later seqs
                // continue above it.
                floor = marker;
                last_seq = last_seq.max(marker);
                Ok(())
            }
        });
        result.check(outcome);
    }
    result
}

fn verify_records(scan: &Scan) -> VerifyResult {
    let mut result = VerifyResult::from_scan(scan);
    for frame in &scan.frames {
        let outcome = decode_batch(frame).and_then(|batch| {
            if batch.iter().any(|r| r.tombstone && !r.value.is_empty()) {
                return Err(format!(
                    "batch at offset {} holds a tombstone with a value",
                    frame.offset
                ));
            }
            Ok(())
        });
        result.check(outcome);
    }
    result
}

fn verify_checkpoints(scan: &Scan) -> VerifyResult {
    let mut result = VerifyResult::from_scan(scan);
    let mut previous = Checkpoint::default();

    for frame in &scan.frames {
        let outcome = decode_checkpoint(frame).and_then(|checkpoint| {
            if checkpoint.remote_cursor < previous.remote_cursor
                || checkpoint.log_watermark < previous.log_watermark
            {
                return Err(format!(
                    "checkpoint at offset {} moves backwards ({:?} after {:?})",
                    frame.offset, checkpoint, previous
                ));
            }
            previous = checkpoint;
            Ok(())
        });
        result.check(outcome);
    }
    result
}

fn print_result(name: &str, result: &VerifyResult) {
    println!("{name}:");
    println!("  Frames checked: {}", result.frames_checked);
    println!("  Valid frames:   {}", result.valid_frames);
    println!("  Corrupt frames: {}", result.corrupt_frames);
    if result.torn_tail {
        println!("  Torn tail:      yes (dropped on next open)");
    }

    if !result.errors.is_empty() {
        println!("  Errors:");
        for error in &result.errors {
            println!("    - {error}");
        }
    }
}
