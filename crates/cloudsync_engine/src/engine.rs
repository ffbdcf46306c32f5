//! The sync engine: one pull, merge, apply, push and acknowledge cycle at a
//! time over a [`Replica`].

use crate::checkpoint::Checkpoint;
use crate::client::TransportClient;
use crate::config::SyncConfig;
use crate::error::{FailureReason, SyncError, SyncResult};
use crate::merge::{self, MergePlan};
use crate::replica::Replica;
use crate::state::{CycleControl, SyncCycleResult, SyncState, SyncStats};
use crate::transport::SyncTransport;
use cloudsync_protocol::{precedence, ChangeEntry, ConflictResolver, Record};
use parking_lot::RwLock;
use std::cmp::Ordering as PrecedenceOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// The sync engine manages synchronization of one replica with a remote.
pub struct SyncEngine<T: SyncTransport> {
    config: SyncConfig,
    replica: Arc<Replica>,
    client: TransportClient<T>,
    resolver: ConflictResolver,
    running: AtomicBool,
    fault: RwLock<Option<FailureReason>>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

/// Clears the running flag when a cycle ends on any path.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Creates a new sync engine.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if `config` fails validation.
    pub fn new(config: SyncConfig, replica: Arc<Replica>, transport: T) -> SyncResult<Self> {
        config.validate()?;
        let client = TransportClient::new(transport, replica.id(), &config);
        Ok(Self {
            config,
            replica,
            client,
            resolver: ConflictResolver::default(),
            running: AtomicBool::new(false),
            fault: RwLock::new(None),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the replica being synchronized.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Returns the transport client.
    pub fn client(&self) -> &TransportClient<T> {
        &self.client
    }

    /// Replaces the auth token used for the next session.
    pub fn set_token(&self, token: impl Into<Vec<u8>>) {
        self.client.set_token(token);
    }

    /// Phase of the current cycle, or how the last one ended.
    pub fn state(&self) -> SyncState {
        self.state.read().clone()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        let mut stats = self.stats.read().clone();
        stats.retries = self.client.retries();
        stats
    }

    /// Returns true while a cycle is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The fatal fault that disabled sync, if any.
    pub fn fault(&self) -> Option<FailureReason> {
        self.fault.read().clone()
    }

    /// Re-enables sync after a fatal fault has been dealt with.
    pub fn reset_fault(&self) {
        if let Some(reason) = self.fault.write().take() {
            info!(%reason, "sync fault cleared");
        }
        if !self.is_running() {
            *self.state.write() = SyncState::Idle;
        }
    }

    /// Runs one cycle with its own control.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::run_cycle`].
    pub fn sync(&self) -> SyncResult<SyncCycleResult> {
        self.run_cycle(&CycleControl::new())
    }

    /// Runs one cycle, reporting progress through `control`.
    ///
    /// # Errors
    ///
    /// - [`SyncError::SyncAlreadyRunning`] if another cycle is in flight.
    /// - [`SyncError::SyncDisabled`] after a fatal fault.
    /// - [`SyncError::Cancelled`] if `control` was cancelled in time; the
    ///   checkpoint and change log are then unchanged.
    /// - Any transport or storage failure of the cycle. The last valid
    ///   checkpoint is kept on every failure path.
    pub fn run_cycle(&self, control: &CycleControl) -> SyncResult<SyncCycleResult> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync trigger rejected, cycle already running");
            let err = SyncError::SyncAlreadyRunning;
            control.finish(SyncState::Failed(err.reason()));
            return Err(err);
        }
        let _running = RunningGuard(&self.running);

        if let Some(reason) = self.fault() {
            let err = SyncError::SyncDisabled(reason);
            control.finish(SyncState::Failed(err.reason()));
            return Err(err);
        }

        let start = Instant::now();
        info!(replica = %self.replica.id(), scope = %self.config.scope, "sync cycle started");

        match self.cycle(control, start) {
            Ok(result) => {
                self.finish(control, SyncState::Idle);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.deltas_pulled += result.pulled;
                    stats.records_applied += result.applied;
                    stats.entries_pushed += result.pushed;
                    stats.entries_rejected += result.rejected;
                    stats.conflicts += result.conflicts.len() as u64;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                }
                info!(
                    pulled = result.pulled,
                    applied = result.applied,
                    pushed = result.pushed,
                    rejected = result.rejected,
                    conflicts = result.conflicts.len(),
                    duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
                    "sync cycle finished"
                );
                Ok(result)
            }
            Err(SyncError::Cancelled) => {
                self.finish(control, SyncState::Idle);
                self.stats.write().cycles_cancelled += 1;
                info!("sync cycle cancelled");
                Err(SyncError::Cancelled)
            }
            Err(e) => {
                let reason = e.reason();
                if e.is_fatal() {
                    error!(error = %e, "fatal sync fault, sync disabled");
                    *self.fault.write() = Some(reason.clone());
                } else {
                    warn!(error = %e, "sync cycle failed");
                }
                self.finish(control, SyncState::Failed(reason.clone()));
                {
                    let mut stats = self.stats.write();
                    stats.cycles_failed += 1;
                    stats.last_error = Some(reason);
                }
                Err(e)
            }
        }
    }

    fn cycle(&self, control: &CycleControl, start: Instant) -> SyncResult<SyncCycleResult> {
        let checkpoint = self.replica.checkpoint();

        self.enter(control, SyncState::Pulling)?;
        self.client.connect(checkpoint.remote_cursor)?;
        let pulled = self.client.pull(checkpoint.remote_cursor)?;

        self.enter(control, SyncState::Merging)?;
        let local: Vec<ChangeEntry> = self
            .replica
            .changelog()
            .entries_since(checkpoint.log_watermark)
            .collect::<SyncResult<_>>()?;
        let snapshot_seq = local
            .last()
            .map_or(checkpoint.log_watermark, |e| e.seq.max(checkpoint.log_watermark));
        let plan = {
            let store = self.replica.store();
            merge::plan(&self.resolver, &store, &local, &pulled.deltas)
        };

        self.enter(control, SyncState::Applying)?;
        let applied = self.apply(&plan.apply)?;

        self.enter(control, SyncState::Pushing)?;
        let ack = self.client.push(&plan.push)?;

        self.enter(control, SyncState::Acknowledging)?;
        let next = self.acknowledge(&checkpoint, &plan, snapshot_seq, pulled.cursor, &ack)?;

        Ok(SyncCycleResult {
            pulled: pulled.deltas.len() as u64,
            applied,
            pushed: plan.push.len() as u64,
            rejected: ack.rejected.len() as u64,
            superseded: plan.superseded as u64,
            conflicts: plan.conflicts,
            checkpoint: next,
            duration: start.elapsed(),
        })
    }

    /// Writes remote winners in one transaction. Each is checked again
    /// against the current record, since host writes may have landed after
    /// the merge.
    fn apply(&self, records: &[Record]) -> SyncResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut store = self.replica.store();
        store.transaction(|txn| {
            let mut applied = 0u64;
            for record in records {
                let wins = txn.get(&record.key).map_or(true, |current| {
                    precedence(record, current) == PrecedenceOrdering::Greater
                });
                if wins {
                    txn.put(record.clone());
                    applied += 1;
                } else {
                    debug!(key = %record.key, "remote state overtaken by local write");
                }
            }
            Ok(applied)
        })
    }

    fn acknowledge(
        &self,
        checkpoint: &Checkpoint,
        plan: &MergePlan,
        snapshot_seq: u64,
        pull_cursor: u64,
        ack: &crate::client::PushAck,
    ) -> SyncResult<Checkpoint> {
        let max_pushed = plan.push.iter().map(|e| e.seq).max();
        let watermark = match max_pushed {
            Some(max) if ack.acked_up_to < max => ack.acked_up_to.max(checkpoint.log_watermark),
            _ => snapshot_seq,
        };

        let rejected: Vec<ChangeEntry> = plan
            .push
            .iter()
            .filter(|e| e.seq <= watermark && ack.rejected.iter().any(|r| r.seq == e.seq))
            .cloned()
            .collect();
        if !rejected.is_empty() {
            let requeued = self.replica.changelog().requeue(rejected)?;
            warn!(requeued, "rejected entries queued for the next cycle");
        }

        let next = Checkpoint {
            remote_cursor: pull_cursor,
            log_watermark: watermark,
        };
        self.replica.checkpoints().commit(next)?;

        if let Err(e) = self.replica.changelog().truncate(watermark) {
            // The checkpoint watermark already hides these entries on reopen.
            warn!(error = %e, watermark, "change log truncation failed");
        }
        debug!(
            remote_cursor = next.remote_cursor,
            log_watermark = next.log_watermark,
            "checkpoint committed"
        );
        Ok(next)
    }

    fn enter(&self, control: &CycleControl, next: SyncState) -> SyncResult<()> {
        control.enter(next.clone())?;
        debug!(phase = next.name(), "sync phase");
        *self.state.write() = next;
        Ok(())
    }

    fn finish(&self, control: &CycleControl, state: SyncState) {
        *self.state.write() = state.clone();
        control.finish(state);
    }
}

impl<T: SyncTransport> std::fmt::Debug for SyncEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("scope", &self.config.scope)
            .field("replica", &self.replica.id())
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
