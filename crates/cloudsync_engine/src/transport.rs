//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use cloudsync_protocol::{
    HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest, PushResponse,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport carries protocol messages to the remote service.
///
/// Implementations block the calling thread for the duration of a request.
pub trait SyncTransport: Send + Sync {
    /// Opens a session.
    fn handshake(&self, request: &HandshakeRequest) -> SyncResult<HandshakeResponse>;

    /// Pulls changes after a cursor.
    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Pushes local changes.
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

impl<T: SyncTransport + ?Sized> SyncTransport for std::sync::Arc<T> {
    fn handshake(&self, request: &HandshakeRequest) -> SyncResult<HandshakeResponse> {
        (**self).handshake(request)
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        (**self).pull(request)
    }

    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        (**self).push(request)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn close(&self) -> SyncResult<()> {
        (**self).close()
    }
}

/// Which request a scripted [`MockTransport`] failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    /// Handshake.
    Handshake,
    /// Pull.
    Pull,
    /// Push.
    Push,
}

/// A failure a [`MockTransport`] can be told to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// `SyncError::NetworkUnavailable`.
    Network,
    /// `SyncError::AuthExpired`.
    Auth,
    /// `SyncError::RemoteRejected`.
    Rejected,
}

impl MockFailure {
    fn to_error(&self, call: MockCall) -> SyncError {
        let message = format!("scripted {call:?} failure");
        match self {
            MockFailure::Network => SyncError::NetworkUnavailable(message),
            MockFailure::Auth => SyncError::AuthExpired(message),
            MockFailure::Rejected => SyncError::RemoteRejected(message),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    handshake: Option<HandshakeResponse>,
    pulls: VecDeque<PullResponse>,
    pushes: VecDeque<PushResponse>,
    failures: VecDeque<(MockCall, MockFailure)>,
    handshakes: Vec<HandshakeRequest>,
    pull_requests: Vec<PullRequest>,
    push_requests: Vec<PushRequest>,
}

/// A mock transport for testing.
///
/// Without scripting it accepts a session at cursor 0, returns empty pulls
/// and acknowledges every push in full. Scripted responses and failures are
/// consumed in order.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Sets the handshake response.
    pub fn set_handshake_response(&self, response: HandshakeResponse) {
        self.state.lock().handshake = Some(response);
    }

    /// Queues a pull response.
    pub fn queue_pull(&self, response: PullResponse) {
        self.state.lock().pulls.push_back(response);
    }

    /// Queues a push response.
    pub fn queue_push(&self, response: PushResponse) {
        self.state.lock().pushes.push_back(response);
    }

    /// Makes the next `call` fail with `failure`.
    pub fn fail_next(&self, call: MockCall, failure: MockFailure) {
        self.state.lock().failures.push_back((call, failure));
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Handshakes received so far.
    pub fn handshakes(&self) -> Vec<HandshakeRequest> {
        self.state.lock().handshakes.clone()
    }

    /// Pull requests received so far.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.state.lock().pull_requests.clone()
    }

    /// Push requests received so far.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.state.lock().push_requests.clone()
    }

    fn take_failure(state: &mut MockState, call: MockCall) -> SyncResult<()> {
        if let Some(pos) = state.failures.iter().position(|(c, _)| *c == call) {
            if let Some((_, failure)) = state.failures.remove(pos) {
                return Err(failure.to_error(call));
            }
        }
        Ok(())
    }

    fn check_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NetworkUnavailable("mock transport disconnected".into()))
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for MockTransport {
    fn handshake(&self, request: &HandshakeRequest) -> SyncResult<HandshakeResponse> {
        self.check_connected()?;
        let mut state = self.state.lock();
        state.handshakes.push(request.clone());
        Self::take_failure(&mut state, MockCall::Handshake)?;
        Ok(state.handshake.clone().unwrap_or(HandshakeResponse {
            session_id: 1,
            server_cursor: request.last_cursor,
        }))
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.check_connected()?;
        let mut state = self.state.lock();
        state.pull_requests.push(request.clone());
        Self::take_failure(&mut state, MockCall::Pull)?;
        Ok(state.pulls.pop_front().unwrap_or(PullResponse {
            deltas: Vec::new(),
            cursor: request.cursor,
            has_more: false,
        }))
    }

    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.check_connected()?;
        let mut state = self.state.lock();
        state.push_requests.push(request.clone());
        Self::take_failure(&mut state, MockCall::Push)?;
        if let Some(response) = state.pushes.pop_front() {
            return Ok(response);
        }
        Ok(PushResponse {
            acked_up_to: request.entries.iter().map(|e| e.seq).max().unwrap_or(0),
            rejected: Vec::new(),
            cursor: 0,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_protocol::ReplicaId;

    fn handshake() -> HandshakeRequest {
        HandshakeRequest::new(ReplicaId::from_bytes([1; 16]), "main", 0, b"t".to_vec(), 7)
    }

    #[test]
    fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.handshake(&handshake()),
            Err(SyncError::NetworkUnavailable(_))
        ));
    }

    #[test]
    fn default_responses() {
        let transport = MockTransport::new();
        let session = transport.handshake(&handshake()).unwrap();
        assert_eq!(session.server_cursor, 7);

        let pulled = transport
            .pull(&PullRequest {
                session_id: session.session_id,
                cursor: 7,
                limit: 10,
            })
            .unwrap();
        assert!(pulled.deltas.is_empty());
        assert_eq!(pulled.cursor, 7);
        assert_eq!(transport.pull_requests().len(), 1);
    }

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let transport = MockTransport::new();
        transport.fail_next(MockCall::Pull, MockFailure::Network);
        transport.fail_next(MockCall::Handshake, MockFailure::Auth);

        assert!(matches!(
            transport.handshake(&handshake()),
            Err(SyncError::AuthExpired(_))
        ));
        assert!(transport.handshake(&handshake()).is_ok());

        let request = PullRequest {
            session_id: 1,
            cursor: 0,
            limit: 1,
        };
        assert!(matches!(
            transport.pull(&request),
            Err(SyncError::NetworkUnavailable(_))
        ));
        assert!(transport.pull(&request).is_ok());
        assert_eq!(transport.handshakes().len(), 2);
    }
}
