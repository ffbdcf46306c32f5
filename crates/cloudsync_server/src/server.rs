//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::oplog::ServerOplog;
use cloudsync_protocol::{
    ErrorResponse, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, ReplicaId, SyncMessage,
};
use std::sync::Arc;
use tracing::warn;

const PATH_PREFIX: &str = "/v1/cloudsync/";

/// The sync server.
///
/// Holds one oplog per scope and answers handshake, pull and push
/// requests. [`handle_post`](SyncServer::handle_post) serves the HTTP
/// binding: enveloped request bodies in, status and enveloped bodies out.
///
/// # Example
///
/// ```
/// use cloudsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// assert_eq!(server.cursor("notes"), 0);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a new sync server.
    pub fn new(config: ServerConfig) -> Self {
        let context = Arc::new(HandlerContext::new(config));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self { handler, context }
    }

    /// Handles a handshake request.
    ///
    /// # Errors
    ///
    /// See [`RequestHandler::handle_handshake`].
    pub fn handle_handshake(&self, request: &HandshakeRequest) -> ServerResult<HandshakeResponse> {
        self.handler.handle_handshake(request)
    }

    /// Handles a pull request.
    ///
    /// # Errors
    ///
    /// See [`RequestHandler::handle_pull`].
    pub fn handle_pull(&self, request: &PullRequest) -> ServerResult<PullResponse> {
        self.handler.handle_pull(request)
    }

    /// Handles a push request.
    ///
    /// # Errors
    ///
    /// See [`RequestHandler::handle_push`].
    pub fn handle_push(&self, request: &PushRequest) -> ServerResult<PushResponse> {
        self.handler.handle_push(request)
    }

    /// Handles a sync message (dispatches to appropriate handler).
    ///
    /// # Errors
    ///
    /// Fails for response-type messages and whatever the handler reports.
    pub fn handle_message(&self, message: &SyncMessage) -> ServerResult<SyncMessage> {
        match message {
            SyncMessage::HandshakeRequest(req) => self
                .handle_handshake(req)
                .map(SyncMessage::HandshakeResponse),
            SyncMessage::PullRequest(req) => self.handle_pull(req).map(SyncMessage::PullResponse),
            SyncMessage::PushRequest(req) => self.handle_push(req).map(SyncMessage::PushResponse),
            other => Err(ServerError::InvalidRequest(format!(
                "unexpected message type {}",
                other.type_code()
            ))),
        }
    }

    /// Serves `POST /v1/cloudsync/{scope}/{handshake|pull|push}`.
    ///
    /// Returns the HTTP status and an enveloped response body. Failures
    /// carry an [`ErrorResponse`] body.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> (u16, Vec<u8>) {
        let schema_hash = self.context.config.schema_hash.unwrap_or(0);
        let (status, message) = match self.dispatch(path, body) {
            Ok(message) => (200, message),
            Err(e) => {
                warn!(path, error = %e, "request failed");
                (
                    e.http_status(),
                    SyncMessage::Error(ErrorResponse::new(e.code(), e.to_string())),
                )
            }
        };

        match message.encode(schema_hash) {
            Ok(bytes) => (status, bytes),
            Err(e) => {
                warn!(path, error = %e, "failed to encode response");
                (500, Vec::new())
            }
        }
    }

    fn dispatch(&self, path: &str, body: &[u8]) -> ServerResult<SyncMessage> {
        let (scope, endpoint) = path
            .strip_prefix(PATH_PREFIX)
            .and_then(|rest| rest.split_once('/'))
            .filter(|(scope, endpoint)| !scope.is_empty() && !endpoint.contains('/'))
            .ok_or_else(|| ServerError::InvalidRequest(format!("unknown path {path}")))?;

        let (_, message) = SyncMessage::decode(body)?;
        let expected = match &message {
            SyncMessage::HandshakeRequest(req) => {
                if req.scope != scope {
                    return Err(ServerError::InvalidRequest(format!(
                        "handshake for scope {} sent to {scope}",
                        req.scope
                    )));
                }
                "handshake"
            }
            SyncMessage::PullRequest(req) => {
                self.check_session_scope(req.session_id, scope)?;
                "pull"
            }
            SyncMessage::PushRequest(req) => {
                self.check_session_scope(req.session_id, scope)?;
                "push"
            }
            _ => "",
        };
        if endpoint != expected {
            return Err(ServerError::InvalidRequest(format!(
                "message type {} not accepted at {endpoint}",
                message.type_code()
            )));
        }

        self.handle_message(&message)
    }

    fn check_session_scope(&self, session_id: u64, scope: &str) -> ServerResult<()> {
        match self.context.session(session_id) {
            Some(session) if session.scope == scope => Ok(()),
            Some(session) => Err(ServerError::InvalidRequest(format!(
                "session {session_id} belongs to scope {}",
                session.scope
            ))),
            None => Err(ServerError::UnknownSession(session_id)),
        }
    }

    /// Issues a token for `replica` in `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidRequest`] if authentication is off.
    pub fn issue_token(&self, replica: ReplicaId, scope: &str) -> ServerResult<String> {
        self.context
            .validator()
            .ok_or_else(|| ServerError::InvalidRequest("authentication disabled".into()))?
            .create_token(replica, scope)
    }

    /// Oplog of `scope`, if any replica has opened it.
    pub fn oplog(&self, scope: &str) -> Option<Arc<ServerOplog>> {
        self.context.oplog(scope)
    }

    /// Returns the head cursor of `scope`.
    pub fn cursor(&self, scope: &str) -> u64 {
        self.oplog(scope).map_or(0, |oplog| oplog.cursor())
    }

    /// Returns the number of changes held for `scope`.
    pub fn change_count(&self, scope: &str) -> usize {
        self.oplog(scope).map_or(0, |oplog| oplog.len())
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.context.session_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_protocol::{ChangeEntry, ErrorCode, OperationKind, RecordKey, Version};

    fn replica(n: u8) -> ReplicaId {
        ReplicaId::from_bytes([n; 16])
    }

    fn entry(seq: u64, key: &str) -> ChangeEntry {
        ChangeEntry::put(
            RecordKey::from(key),
            vec![0x42],
            Version(1),
            OperationKind::Insert,
            replica(1),
            0,
        )
        .with_seq(seq)
    }

    fn post(server: &SyncServer, path: &str, message: SyncMessage) -> (u16, SyncMessage) {
        let (status, body) = server.handle_post(path, &message.encode(0).unwrap());
        (status, SyncMessage::decode(&body).unwrap().1)
    }

    #[test]
    fn server_lifecycle() {
        let server = SyncServer::new(ServerConfig::default());
        assert_eq!(server.cursor("notes"), 0);
        assert_eq!(server.change_count("notes"), 0);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn full_sync_flow() {
        let server = SyncServer::new(ServerConfig::default());

        let handshake = HandshakeRequest::new(replica(1), "notes", 0, Vec::new(), 0);
        let session_id = server.handle_handshake(&handshake).unwrap().session_id;

        let pull = PullRequest {
            session_id,
            cursor: 0,
            limit: 10,
        };
        assert!(server.handle_pull(&pull).unwrap().deltas.is_empty());

        let push = PushRequest {
            session_id,
            entries: vec![entry(1, "a"), entry(2, "b")],
        };
        let response = server.handle_push(&push).unwrap();
        assert_eq!(response.cursor, 2);
        assert_eq!(server.cursor("notes"), 2);
        assert_eq!(server.change_count("notes"), 2);
    }

    #[test]
    fn http_binding_round_trip() {
        let server = SyncServer::new(ServerConfig::default());
        let (status, response) = post(
            &server,
            "/v1/cloudsync/notes/handshake",
            SyncMessage::HandshakeRequest(HandshakeRequest::new(
                replica(1),
                "notes",
                0,
                Vec::new(),
                0,
            )),
        );
        assert_eq!(status, 200);
        let SyncMessage::HandshakeResponse(handshake) = response else {
            panic!("expected handshake response, got {response:?}");
        };

        let (status, response) = post(
            &server,
            "/v1/cloudsync/notes/push",
            SyncMessage::PushRequest(PushRequest {
                session_id: handshake.session_id,
                entries: vec![entry(1, "a")],
            }),
        );
        assert_eq!(status, 200);
        assert!(matches!(response, SyncMessage::PushResponse(r) if r.acked_up_to == 1));
    }

    #[test]
    fn http_errors_carry_code_and_status() {
        let server = SyncServer::new(ServerConfig::new().with_auth(b"secret".to_vec()));
        let (status, response) = post(
            &server,
            "/v1/cloudsync/notes/handshake",
            SyncMessage::HandshakeRequest(HandshakeRequest::new(
                replica(1),
                "notes",
                0,
                b"bad".to_vec(),
                0,
            )),
        );
        assert_eq!(status, 401);
        assert!(matches!(
            response,
            SyncMessage::Error(ErrorResponse {
                code: ErrorCode::AuthExpired,
                ..
            })
        ));
    }

    #[test]
    fn http_rejects_wrong_endpoint_and_scope() {
        let server = SyncServer::new(ServerConfig::default());
        let handshake = SyncMessage::HandshakeRequest(HandshakeRequest::new(
            replica(1),
            "notes",
            0,
            Vec::new(),
            0,
        ));

        let (status, _) = post(&server, "/v1/cloudsync/notes/pull", handshake.clone());
        assert_eq!(status, 400);
        let (status, _) = post(&server, "/v1/cloudsync/other/handshake", handshake.clone());
        assert_eq!(status, 400);
        let (status, _) = post(&server, "/v2/notes/handshake", handshake);
        assert_eq!(status, 400);
    }

    #[test]
    fn http_garbage_body() {
        let server = SyncServer::new(ServerConfig::default());
        let (status, body) = server.handle_post("/v1/cloudsync/notes/pull", b"not an envelope");
        assert_eq!(status, 400);
        assert!(matches!(
            SyncMessage::decode(&body).unwrap().1,
            SyncMessage::Error(_)
        ));
    }

    #[test]
    fn issued_token_opens_session() {
        let server = SyncServer::new(ServerConfig::new().with_auth(b"secret".to_vec()));
        let token = server.issue_token(replica(1), "notes").unwrap();
        let request = HandshakeRequest::new(replica(1), "notes", 0, token.into_bytes(), 0);
        assert!(server.handle_handshake(&request).is_ok());
        assert_eq!(server.session_count(), 1);

        let open = SyncServer::new(ServerConfig::default());
        assert!(open.issue_token(replica(1), "notes").is_err());
    }
}
