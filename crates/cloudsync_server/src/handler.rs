//! Request handlers for sync endpoints.

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::oplog::ServerOplog;
use cloudsync_protocol::{
    HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest, PushResponse,
    ReplicaId, PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A session opened by a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSession {
    /// Replica that opened the session.
    pub replica: ReplicaId,
    /// Scope the session is bound to.
    pub scope: String,
}

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    validator: Option<TokenValidator>,
    scopes: RwLock<HashMap<String, Arc<ServerOplog>>>,
    sessions: RwLock<HashMap<u64, ReplicaSession>>,
    next_session: AtomicU64,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig) -> Self {
        let validator = config.auth.clone().map(TokenValidator::new);
        Self {
            config,
            validator,
            scopes: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Token validator, if authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    /// Oplog of `scope`, if any replica has opened it.
    pub fn oplog(&self, scope: &str) -> Option<Arc<ServerOplog>> {
        self.scopes.read().get(scope).cloned()
    }

    /// Oplog of `scope`, created empty if missing.
    pub fn oplog_or_create(&self, scope: &str) -> Arc<ServerOplog> {
        if let Some(oplog) = self.oplog(scope) {
            return oplog;
        }
        Arc::clone(
            self.scopes
                .write()
                .entry(scope.to_string())
                .or_insert_with(|| Arc::new(ServerOplog::new())),
        )
    }

    /// Looks up a session.
    pub fn session(&self, session_id: u64) -> Option<ReplicaSession> {
        self.sessions.read().get(&session_id).cloned()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn open_session(&self, replica: ReplicaId, scope: &str) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.sessions.write().insert(
            id,
            ReplicaSession {
                replica,
                scope: scope.to_string(),
            },
        );
        id
    }

    fn resolve(&self, session_id: u64) -> ServerResult<(ReplicaSession, Arc<ServerOplog>)> {
        let session = self
            .session(session_id)
            .ok_or(ServerError::UnknownSession(session_id))?;
        let oplog = self.oplog_or_create(&session.scope);
        Ok((session, oplog))
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a handshake request.
    ///
    /// # Errors
    ///
    /// Fails on a protocol or schema mismatch, an empty scope, or a token
    /// the validator refuses.
    pub fn handle_handshake(&self, request: &HandshakeRequest) -> ServerResult<HandshakeResponse> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::ProtocolMismatch(format!(
                "unsupported protocol version {}, expected {PROTOCOL_VERSION}",
                request.protocol_version
            )));
        }

        if let Some(expected) = self.context.config.schema_hash {
            if request.schema_hash != expected {
                return Err(ServerError::SchemaMismatch {
                    expected,
                    actual: request.schema_hash,
                });
            }
        }

        if request.scope.is_empty() {
            return Err(ServerError::InvalidRequest("empty scope".into()));
        }

        if let Some(validator) = self.context.validator() {
            if let Err(e) =
                validator.validate_token(&request.auth_token, request.replica_id, &request.scope)
            {
                warn!(replica = %request.replica_id, scope = %request.scope, error = %e, "handshake refused");
                return Err(e);
            }
        }

        let oplog = self.context.oplog_or_create(&request.scope);
        let session_id = self.context.open_session(request.replica_id, &request.scope);
        info!(
            replica = %request.replica_id,
            scope = %request.scope,
            session_id,
            last_cursor = request.last_cursor,
            "session opened"
        );

        Ok(HandshakeResponse {
            session_id,
            server_cursor: oplog.cursor(),
        })
    }

    /// Handles a pull request.
    ///
    /// The limit is capped by the configured maximum. Changes the
    /// requesting replica pushed itself are not returned.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownSession`] for a session the service
    /// does not hold.
    pub fn handle_pull(&self, request: &PullRequest) -> ServerResult<PullResponse> {
        let (session, oplog) = self.context.resolve(request.session_id)?;
        let limit = request.limit.clamp(1, self.context.config.max_pull_batch.max(1));

        let page = oplog.changes_since(request.cursor, limit as usize, Some(session.replica));
        debug!(
            replica = %session.replica,
            since = request.cursor,
            cursor = page.cursor,
            count = page.changes.len(),
            has_more = page.has_more,
            "pull served"
        );

        Ok(PullResponse {
            deltas: page.changes,
            cursor: page.cursor,
            has_more: page.has_more,
        })
    }

    /// Handles a push request.
    ///
    /// # Errors
    ///
    /// Fails for an unknown session or a batch over the configured maximum.
    pub fn handle_push(&self, request: &PushRequest) -> ServerResult<PushResponse> {
        let (session, oplog) = self.context.resolve(request.session_id)?;

        let max = self.context.config.max_push_batch as usize;
        if request.entries.len() > max {
            return Err(ServerError::InvalidRequest(format!(
                "too many entries: {} > {max}",
                request.entries.len()
            )));
        }

        let outcome = oplog.append(&request.entries);
        debug!(
            replica = %session.replica,
            accepted = outcome.accepted,
            rejected = outcome.rejected.len(),
            cursor = outcome.cursor,
            "push applied"
        );

        Ok(PushResponse {
            acked_up_to: outcome.acked_up_to,
            rejected: outcome.rejected,
            cursor: outcome.cursor,
        })
    }
}
