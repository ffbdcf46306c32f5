//! # CloudSync Server
//!
//! Reference sync service for CloudSync replicas.
//!
//! This crate provides:
//! - Handshake, pull and push handlers and their HTTP binding
//! - A per-scope server oplog with staleness checks
//! - Token authentication (HMAC-SHA256)
//!
//! # Architecture
//!
//! The service holds, per scope:
//! - Every accepted change in cursor order
//! - The latest state of each key
//!
//! A push is accepted entry by entry: an entry whose key already holds a
//! state that beats it, under the same precedence rule every replica
//! uses, is returned as stale. Pulls never return a replica's own changes.
//!
//! # Authentication
//!
//! Authentication is optional:
//!
//! ```rust
//! use cloudsync_protocol::ReplicaId;
//! use cloudsync_server::{ServerConfig, SyncServer};
//!
//! let server = SyncServer::new(ServerConfig::default().with_auth(b"secret".to_vec()));
//! let token = server.issue_token(ReplicaId::generate(), "notes").unwrap();
//! assert_eq!(token.len(), 112);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod oplog;
mod server;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, ReplicaSession, RequestHandler};
pub use oplog::{AppendOutcome, ChangePage, ServerOplog};
pub use server::SyncServer;
