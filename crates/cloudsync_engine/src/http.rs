//! HTTP transport implementation.
//!
//! The HTTP client itself is abstracted via a trait so the host can supply
//! its own networking stack. Every request and response body is a
//! [`SyncMessage`] in its envelope.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use cloudsync_protocol::{
    ErrorCode, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, SyncMessage,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Timeout used until [`HttpTransport::with_timeout`] sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request, giving up after `timeout`.
    ///
    /// `Err` means no response was received at all, a timeout included.
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// HTTP-based sync transport.
///
/// Requests go to `{base_url}/v1/cloudsync/{scope}/{handshake|pull|push}`.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    scope: String,
    schema_hash: u64,
    timeout: Duration,
    client: C,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, scope: impl Into<String>, client: C) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            scope: scope.into(),
            schema_hash: 0,
            timeout: DEFAULT_TIMEOUT,
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the schema hash stamped on request envelopes.
    pub fn with_schema_hash(mut self, hash: u64) -> Self {
        self.schema_hash = hash;
        self
    }

    /// Sets the per-request timeout passed to the client.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the URL for `endpoint`.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/v1/cloudsync/{}/{}", self.base_url, self.scope, endpoint)
    }

    /// The underlying HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn exchange(&self, endpoint: &str, message: SyncMessage) -> SyncResult<SyncMessage> {
        if !self.is_connected() {
            return Err(SyncError::NetworkUnavailable("transport closed".into()));
        }

        let body = message.encode(self.schema_hash)?;
        let url = self.endpoint_url(endpoint);
        let response = match self.client.post(&url, body, self.timeout) {
            Ok(response) => response,
            Err(e) => {
                *self.last_error.write() = Some(e.clone());
                return Err(SyncError::NetworkUnavailable(e));
            }
        };

        let decoded = SyncMessage::decode(&response.body).map(|(_, message)| message);
        let result = match (response.status, decoded) {
            (_, Ok(SyncMessage::Error(err))) => Err(error_for_code(err.code, err.message)),
            (200..=299, Ok(message)) => Ok(message),
            (200..=299, Err(e)) => Err(SyncError::Protocol(format!(
                "failed to decode {endpoint} response: {e}"
            ))),
            (status, _) => Err(error_for_status(status)),
        };

        match &result {
            Ok(_) => *self.last_error.write() = None,
            Err(e) => *self.last_error.write() = Some(e.to_string()),
        }
        result
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn handshake(&self, request: &HandshakeRequest) -> SyncResult<HandshakeResponse> {
        match self.exchange("handshake", SyncMessage::HandshakeRequest(request.clone()))? {
            SyncMessage::HandshakeResponse(response) => Ok(response),
            other => Err(unexpected("handshake", &other)),
        }
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        match self.exchange("pull", SyncMessage::PullRequest(request.clone()))? {
            SyncMessage::PullResponse(response) => Ok(response),
            other => Err(unexpected("pull", &other)),
        }
    }

    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        match self.exchange("push", SyncMessage::PushRequest(request.clone()))? {
            SyncMessage::PushResponse(response) => Ok(response),
            other => Err(unexpected("push", &other)),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn unexpected(endpoint: &str, message: &SyncMessage) -> SyncError {
    SyncError::Protocol(format!(
        "unexpected message type {} in {endpoint} response",
        message.type_code()
    ))
}

fn error_for_code(code: ErrorCode, message: String) -> SyncError {
    match code {
        ErrorCode::AuthExpired => SyncError::AuthExpired(message),
        ErrorCode::Rejected => SyncError::RemoteRejected(message),
        ErrorCode::Unavailable => SyncError::NetworkUnavailable(message),
    }
}

/// Maps an HTTP status without a readable error body.
pub fn error_for_status(status: u16) -> SyncError {
    let message = format!("HTTP {status}");
    match status {
        401 | 403 => SyncError::AuthExpired(message),
        409 | 422 => SyncError::RemoteRejected(message),
        408 | 429 | 500..=599 => SyncError::NetworkUnavailable(message),
        _ => SyncError::Protocol(message),
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request to `path` and returns status and body.
    fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse;
}

/// An HTTP client that routes requests directly to an in-process server.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    healthy: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            healthy: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the network.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// The wrapped server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    // In-process calls cannot hang on the network.
    fn post(&self, url: &str, body: Vec<u8>, _timeout: Duration) -> Result<HttpResponse, String> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        let path = url.find("/v1/").map_or(url, |i| &url[i..]);
        Ok(self.server.handle_post(path, &body))
    }
}
