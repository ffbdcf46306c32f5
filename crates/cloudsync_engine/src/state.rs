//! Sync cycle phases, per-cycle control and statistics.

use crate::checkpoint::Checkpoint;
use crate::error::{FailureReason, SyncError, SyncResult};
use cloudsync_protocol::ConflictRecord;
use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Where a sync cycle is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle running, or the cycle finished (or was cancelled).
    Idle,
    /// Fetching remote changes.
    Pulling,
    /// Resolving local against remote changes.
    Merging,
    /// Writing merged remote state locally. Not cancellable.
    Applying,
    /// Sending local changes.
    Pushing,
    /// Persisting the checkpoint and truncating the change log.
    Acknowledging,
    /// The cycle failed.
    Failed(FailureReason),
}

impl SyncState {
    /// Returns true while a cycle is in one of its working phases.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Idle | SyncState::Failed(_))
    }

    /// Returns true once the cycle can no longer be cancelled.
    pub fn is_committing(&self) -> bool {
        matches!(
            self,
            SyncState::Applying | SyncState::Pushing | SyncState::Acknowledging
        )
    }

    /// Stable lowercase phase name.
    pub fn name(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Pulling => "pulling",
            SyncState::Merging => "merging",
            SyncState::Applying => "applying",
            SyncState::Pushing => "pushing",
            SyncState::Acknowledging => "acknowledging",
            SyncState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Failed(reason) => write!(f, "failed({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug)]
struct ControlState {
    state: SyncState,
    cancel_requested: bool,
    finished: bool,
}

/// Status and cancellation of one cycle, shared between the worker running
/// it and whoever holds its handle.
///
/// Cancellation and phase transitions take the same lock, so a successful
/// [`cancel`](CycleControl::cancel) is always observed before `Applying`.
#[derive(Debug)]
pub struct CycleControl {
    inner: Mutex<ControlState>,
}

impl CycleControl {
    /// Creates control for a cycle that has not started.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ControlState {
                state: SyncState::Idle,
                cancel_requested: false,
                finished: false,
            }),
        }
    }

    /// Current phase.
    pub fn state(&self) -> SyncState {
        self.inner.lock().state.clone()
    }

    /// Returns true once the cycle has ended, however it ended.
    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Requests cancellation.
    ///
    /// Returns true if the request will take effect, i.e. the cycle has not
    /// reached `Applying` and has not finished.
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.finished || inner.state.is_committing() {
            return false;
        }
        inner.cancel_requested = true;
        true
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.lock().cancel_requested
    }

    /// Moves to `next`, failing with [`SyncError::Cancelled`] if a cancel
    /// is pending and `next` is not past the point of no return.
    pub(crate) fn enter(&self, next: SyncState) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.cancel_requested && !inner.state.is_committing() {
            return Err(SyncError::Cancelled);
        }
        inner.state = next;
        Ok(())
    }

    /// Ends the cycle in `state`.
    pub(crate) fn finish(&self, state: SyncState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.finished = true;
    }
}

impl Default for CycleControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Cumulative statistics of an engine.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that reached `Idle` successfully.
    pub cycles_completed: u64,
    /// Cycles that ended in `Failed`.
    pub cycles_failed: u64,
    /// Cycles cancelled before `Applying`.
    pub cycles_cancelled: u64,
    /// Remote deltas pulled.
    pub deltas_pulled: u64,
    /// Remote states written locally.
    pub records_applied: u64,
    /// Local entries pushed.
    pub entries_pushed: u64,
    /// Pushed entries the remote refused.
    pub entries_rejected: u64,
    /// Keys changed on both sides.
    pub conflicts: u64,
    /// Transport retries.
    pub retries: u64,
    /// When the last successful cycle ended.
    pub last_sync_time: Option<Instant>,
    /// Last failure.
    pub last_error: Option<FailureReason>,
}

/// Result of a successful sync cycle.
#[derive(Debug, Clone)]
pub struct SyncCycleResult {
    /// Remote deltas pulled.
    pub pulled: u64,
    /// Remote states written locally.
    pub applied: u64,
    /// Local entries pushed.
    pub pushed: u64,
    /// Pushed entries the remote refused; requeued for the next cycle.
    pub rejected: u64,
    /// Local entries dropped instead of pushed.
    pub superseded: u64,
    /// Conflicts found during merge, with their resolution.
    pub conflicts: Vec<ConflictRecord>,
    /// The checkpoint committed by this cycle.
    pub checkpoint: Checkpoint,
    /// Duration of the cycle.
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_before_applying_takes_effect() {
        let control = CycleControl::new();
        control.enter(SyncState::Pulling).unwrap();
        assert!(control.cancel());
        assert!(matches!(
            control.enter(SyncState::Merging),
            Err(SyncError::Cancelled)
        ));
    }

    #[test]
    fn cancel_after_applying_is_refused() {
        let control = CycleControl::new();
        control.enter(SyncState::Pulling).unwrap();
        control.enter(SyncState::Merging).unwrap();
        control.enter(SyncState::Applying).unwrap();

        assert!(!control.cancel());
        assert!(control.enter(SyncState::Pushing).is_ok());
        assert!(control.enter(SyncState::Acknowledging).is_ok());
    }

    #[test]
    fn cancel_before_start_stops_first_phase() {
        let control = CycleControl::new();
        assert!(control.cancel());
        assert!(control.enter(SyncState::Pulling).is_err());
    }

    #[test]
    fn finished_cycle_cannot_be_cancelled() {
        let control = CycleControl::new();
        control.finish(SyncState::Idle);
        assert!(control.is_finished());
        assert!(!control.cancel());
    }

    #[test]
    fn state_display() {
        assert_eq!(SyncState::Merging.to_string(), "merging");
        let failed = SyncState::Failed(SyncError::StorageFull("log".into()).reason());
        assert!(failed.to_string().starts_with("failed(storage_full: "));
        assert!(!failed.is_active());
        assert!(SyncState::Pushing.is_active());
    }
}
