//! # CloudSync Engine
//!
//! Local replica state and the sync state machine for CloudSync.
//!
//! This crate provides:
//! - The durable change log of local mutations awaiting push
//! - The checkpoint store and the local record store
//! - A transport client with authentication, pagination and retry
//! - An HTTP transport over a host-supplied client
//! - The sync engine that drives pull, merge, apply, push and acknowledge
//!
//! ## Cycle
//!
//! ```text
//! Idle -> Pulling -> Merging -> Applying -> Pushing -> Acknowledging -> Idle
//!            \          \          \           \            \
//!             +----------+----------+-----------+------------+--> Failed
//! ```
//!
//! ## Key Invariants
//!
//! - At most one cycle runs per engine
//! - Stored versions never decrease
//! - The checkpoint only moves in `Acknowledging`, in one durable append
//! - The change log never yields an entry at or below the checkpoint watermark
//! - Local writes never wait on the network

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod changelog;
mod checkpoint;
mod client;
mod config;
mod dir;
mod engine;
mod error;
mod http;
mod merge;
mod replica;
mod state;
mod store;
mod transport;

pub use changelog::{ChangeLog, Entries};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use client::{PullBatch, PushAck, Session, TransportClient};
pub use config::{ReplicaOptions, RetryConfig, SyncConfig, TriggerPolicy};
pub use dir::{
    is_replica_dir, ReplicaDir, CHANGES_FILE, CHECKPOINT_FILE, RECORDS_FILE, REPLICA_ID_FILE,
};
pub use engine::SyncEngine;
pub use error::{FailureKind, FailureReason, SyncError, SyncResult};
pub use http::{
    error_for_status, HttpClient, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer,
};
pub use merge::{plan as plan_merge, MergePlan};
pub use replica::Replica;
pub use state::{CycleControl, SyncCycleResult, SyncState, SyncStats};
pub use store::{RecordStore, StoreTransaction};
pub use transport::{MockCall, MockFailure, MockTransport, SyncTransport};
