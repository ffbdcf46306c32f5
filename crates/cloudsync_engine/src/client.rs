//! Session-owning client over a [`SyncTransport`].
//!
//! Adds what the raw transport leaves out: the auth token, handshakes,
//! pull pagination, push batching and retry with backoff.

use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use cloudsync_protocol::{
    ChangeEntry, HandshakeRequest, PullRequest, PushRequest, RejectedEntry, ReplicaId,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// An open session with the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    /// Id issued by the remote.
    pub id: u64,
    /// Remote head cursor at handshake time.
    pub server_cursor: u64,
}

/// Remote changes fetched by [`TransportClient::pull`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullBatch {
    /// Deltas in cursor order.
    pub deltas: Vec<ChangeEntry>,
    /// Cursor after the last delta.
    pub cursor: u64,
}

/// Acknowledgment of a whole push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushAck {
    /// Highest local seq the remote processed.
    pub acked_up_to: u64,
    /// Entries the remote refused.
    pub rejected: Vec<RejectedEntry>,
    /// Remote head cursor after the push.
    pub cursor: u64,
}

/// The transport client.
pub struct TransportClient<T: SyncTransport> {
    transport: T,
    replica_id: ReplicaId,
    scope: String,
    protocol_version: u16,
    schema_hash: u64,
    pull_batch_size: u32,
    push_batch_size: usize,
    retry: RetryConfig,
    token: RwLock<Vec<u8>>,
    session: Mutex<Option<Session>>,
    retries: AtomicU64,
}

impl<T: SyncTransport> TransportClient<T> {
    /// Creates a client for `replica_id` using the settings in `config`.
    pub fn new(transport: T, replica_id: ReplicaId, config: &SyncConfig) -> Self {
        let token = config
            .auth_token
            .as_deref()
            .map(|t| t.as_bytes().to_vec())
            .unwrap_or_default();
        Self {
            transport,
            replica_id,
            scope: config.scope.clone(),
            protocol_version: config.protocol_version,
            schema_hash: config.schema_hash,
            pull_batch_size: config.pull_batch_size.max(1),
            push_batch_size: usize::try_from(config.push_batch_size.max(1)).unwrap_or(usize::MAX),
            retry: config.retry.clone(),
            token: RwLock::new(token),
            session: Mutex::new(None),
            retries: AtomicU64::new(0),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Replaces the auth token. The next request opens a new session.
    pub fn set_token(&self, token: impl Into<Vec<u8>>) {
        *self.token.write() = token.into();
        self.session.lock().take();
    }

    /// Total retries performed since creation.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Opens a fresh session, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AuthExpired`] if the token is refused, or the
    /// transport error after retries.
    pub fn connect(&self, last_cursor: u64) -> SyncResult<Session> {
        let request = HandshakeRequest::new(
            self.replica_id,
            self.scope.clone(),
            self.schema_hash,
            self.token.read().clone(),
            last_cursor,
        )
        .with_protocol_version(self.protocol_version);
        let response = self.with_retry("handshake", || self.transport.handshake(&request))?;
        let session = Session {
            id: response.session_id,
            server_cursor: response.server_cursor,
        };
        debug!(
            session = session.id,
            server_cursor = session.server_cursor,
            "session opened"
        );
        *self.session.lock() = Some(session);
        Ok(session)
    }

    /// Drops the current session.
    pub fn disconnect(&self) {
        self.session.lock().take();
    }

    /// Fetches every remote change after `since_cursor`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NetworkUnavailable`] once retries are
    /// exhausted, or [`SyncError::AuthExpired`] / [`SyncError::RemoteRejected`]
    /// immediately.
    pub fn pull(&self, since_cursor: u64) -> SyncResult<PullBatch> {
        let session = self.session_or_connect(since_cursor)?;
        let mut batch = PullBatch {
            deltas: Vec::new(),
            cursor: since_cursor,
        };

        loop {
            let request = PullRequest {
                session_id: session.id,
                cursor: batch.cursor,
                limit: self.pull_batch_size,
            };
            let response = self
                .with_retry("pull", || self.transport.pull(&request))
                .inspect_err(|e| self.drop_session_on_auth(e))?;

            if response.cursor < batch.cursor {
                return Err(SyncError::Protocol(format!(
                    "remote cursor moved backwards from {} to {}",
                    batch.cursor, response.cursor
                )));
            }
            let progressed = response.cursor > batch.cursor;
            batch.cursor = response.cursor;
            batch.deltas.extend(response.deltas);

            if !response.has_more {
                break;
            }
            if !progressed {
                return Err(SyncError::Protocol(
                    "remote reported more changes without advancing its cursor".into(),
                ));
            }
        }

        debug!(
            deltas = batch.deltas.len(),
            cursor = batch.cursor,
            "pull finished"
        );
        Ok(batch)
    }

    /// Sends `entries` in batches of the configured size.
    ///
    /// Stops after a batch the remote acknowledged only in part, so the
    /// returned `acked_up_to` always covers a contiguous prefix.
    ///
    /// # Errors
    ///
    /// Returns the first batch failure. Earlier batches may already have
    /// been applied remotely; replaying them is harmless.
    pub fn push(&self, entries: &[ChangeEntry]) -> SyncResult<PushAck> {
        let mut ack = PushAck::default();
        if entries.is_empty() {
            return Ok(ack);
        }
        let session = self.session_or_connect(0)?;

        for chunk in entries.chunks(self.push_batch_size) {
            let request = PushRequest {
                session_id: session.id,
                entries: chunk.to_vec(),
            };
            let response = self
                .with_retry("push", || self.transport.push(&request))
                .inspect_err(|e| self.drop_session_on_auth(e))?;

            for rejected in &response.rejected {
                warn!(
                    seq = rejected.seq,
                    key = %rejected.key,
                    version = %rejected.version,
                    reason = ?rejected.reason,
                    "remote rejected entry"
                );
            }
            ack.acked_up_to = ack.acked_up_to.max(response.acked_up_to);
            ack.cursor = ack.cursor.max(response.cursor);
            ack.rejected.extend(response.rejected);

            // Later batches would acknowledge past the gap this one left.
            let chunk_max = chunk.iter().map(|e| e.seq).max().unwrap_or(0);
            if response.acked_up_to < chunk_max {
                debug!(
                    acked_up_to = response.acked_up_to,
                    batch_end = chunk_max,
                    "remote acknowledged part of a batch, holding back the rest"
                );
                break;
            }
        }

        debug!(
            pushed = entries.len(),
            acked_up_to = ack.acked_up_to,
            rejected = ack.rejected.len(),
            "push finished"
        );
        Ok(ack)
    }

    fn session_or_connect(&self, last_cursor: u64) -> SyncResult<Session> {
        let existing = *self.session.lock();
        match existing {
            Some(session) => Ok(session),
            None => self.connect(last_cursor),
        }
    }

    fn drop_session_on_auth(&self, err: &SyncError) {
        if matches!(err, SyncError::AuthExpired(_)) {
            self.disconnect();
        }
    }

    fn with_retry<R>(&self, op: &str, mut call: impl FnMut() -> SyncResult<R>) -> SyncResult<R> {
        let mut attempt = 0;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        op,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "retrying request"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T: SyncTransport> std::fmt::Debug for TransportClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("replica_id", &self.replica_id)
            .field("scope", &self.scope)
            .field("session", &*self.session.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockCall, MockFailure, MockTransport};
    use cloudsync_protocol::{OperationKind, PullResponse, PushResponse, RejectReason, Version};
    use std::sync::Arc;
    use std::time::Duration;

    const ID: ReplicaId = ReplicaId::from_bytes([5; 16]);

    fn config() -> SyncConfig {
        SyncConfig::new("main", "mock://")
            .with_auth_token("secret")
            .with_pull_batch_size(2)
            .with_push_batch_size(2)
            .with_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(1))
                    .with_jitter(false),
            )
    }

    fn entry(seq: u64, key: &str) -> ChangeEntry {
        ChangeEntry::put(
            key.into(),
            b"v".to_vec(),
            Version(1),
            OperationKind::Insert,
            ID,
            0,
        )
        .with_seq(seq)
    }

    fn client() -> (Arc<MockTransport>, TransportClient<Arc<MockTransport>>) {
        let mock = Arc::new(MockTransport::new());
        let client = TransportClient::new(Arc::clone(&mock), ID, &config());
        (mock, client)
    }

    #[test]
    fn handshake_carries_token_and_scope() {
        let (mock, client) = client();
        client.connect(12).unwrap();

        let sent = &mock.handshakes()[0];
        assert_eq!(sent.auth_token, b"secret");
        assert_eq!(sent.scope, "main");
        assert_eq!(sent.last_cursor, 12);
        assert_eq!(sent.replica_id, ID);
        assert_eq!(sent.protocol_version, cloudsync_protocol::PROTOCOL_VERSION);
    }

    #[test]
    fn handshake_announces_configured_version() {
        let mock = Arc::new(MockTransport::new());
        let mut config = config();
        config.protocol_version = 0;
        let client = TransportClient::new(Arc::clone(&mock), ID, &config);
        client.connect(0).unwrap();
        assert_eq!(mock.handshakes()[0].protocol_version, 0);
    }

    #[test]
    fn pull_follows_pages() {
        let (mock, client) = client();
        mock.queue_pull(PullResponse {
            deltas: vec![entry(1, "a"), entry(2, "b")],
            cursor: 2,
            has_more: true,
        });
        mock.queue_pull(PullResponse {
            deltas: vec![entry(3, "c")],
            cursor: 3,
            has_more: false,
        });

        let batch = client.pull(0).unwrap();
        assert_eq!(batch.deltas.len(), 3);
        assert_eq!(batch.cursor, 3);
        let cursors: Vec<_> = mock.pull_requests().iter().map(|r| r.cursor).collect();
        assert_eq!(cursors, vec![0, 2]);
    }

    #[test]
    fn pull_rejects_cursor_regression() {
        let (mock, client) = client();
        mock.queue_pull(PullResponse {
            deltas: Vec::new(),
            cursor: 1,
            has_more: false,
        });
        assert!(matches!(client.pull(5), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn network_errors_are_retried() {
        let (mock, client) = client();
        mock.fail_next(MockCall::Pull, MockFailure::Network);
        mock.fail_next(MockCall::Pull, MockFailure::Network);

        assert!(client.pull(0).is_ok());
        assert_eq!(client.retries(), 2);
    }

    #[test]
    fn retries_are_bounded() {
        let (mock, client) = client();
        for _ in 0..3 {
            mock.fail_next(MockCall::Pull, MockFailure::Network);
        }
        assert!(matches!(
            client.pull(0),
            Err(SyncError::NetworkUnavailable(_))
        ));
        assert_eq!(mock.pull_requests().len(), 3);
    }

    #[test]
    fn auth_expired_is_not_retried() {
        let (mock, client) = client();
        client.connect(0).unwrap();
        mock.fail_next(MockCall::Pull, MockFailure::Auth);

        assert!(matches!(client.pull(0), Err(SyncError::AuthExpired(_))));
        assert_eq!(mock.pull_requests().len(), 1);
        assert_eq!(client.retries(), 0);

        // New token, new session.
        client.set_token("fresh");
        client.pull(0).unwrap();
        let handshakes = mock.handshakes();
        assert_eq!(handshakes.len(), 2);
        assert_eq!(handshakes[1].auth_token, b"fresh");
    }

    #[test]
    fn push_is_batched() {
        let (mock, client) = client();
        let entries: Vec<_> = (1..=5).map(|i| entry(i, &format!("k{i}"))).collect();

        let ack = client.push(&entries).unwrap();
        assert_eq!(ack.acked_up_to, 5);
        let sizes: Vec<_> = mock
            .push_requests()
            .iter()
            .map(|r| r.entries.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn push_collects_rejections() {
        let (mock, client) = client();
        mock.queue_push(PushResponse {
            acked_up_to: 2,
            rejected: vec![RejectedEntry {
                seq: 2,
                key: "b".into(),
                version: Version(1),
                reason: RejectReason::Stale {
                    current: Version(4),
                },
            }],
            cursor: 9,
        });

        let ack = client.push(&[entry(1, "a"), entry(2, "b")]).unwrap();
        assert_eq!(ack.rejected.len(), 1);
        assert_eq!(ack.cursor, 9);
    }

    #[test]
    fn partial_ack_holds_back_later_batches() {
        let (mock, client) = client();
        mock.queue_push(PushResponse {
            acked_up_to: 2,
            rejected: Vec::new(),
            cursor: 2,
        });
        mock.queue_push(PushResponse {
            acked_up_to: 3,
            rejected: Vec::new(),
            cursor: 3,
        });
        let entries: Vec<_> = (1..=6).map(|i| entry(i, &format!("k{i}"))).collect();

        let ack = client.push(&entries).unwrap();
        assert_eq!(ack.acked_up_to, 3);
        assert_eq!(ack.cursor, 3);
        assert_eq!(mock.push_requests().len(), 2);
    }

    #[test]
    fn empty_push_sends_nothing() {
        let (mock, client) = client();
        assert_eq!(client.push(&[]).unwrap(), PushAck::default());
        assert!(mock.handshakes().is_empty());
    }
}
