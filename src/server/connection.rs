//! Connection state machine and ownership guard.
//!
//! A [`Connection`] owns its socket and is owned by exactly one handler task.
//! The registry only knows it by id. Dropping a `Connection` (normal return,
//! error, or task abort) releases the socket and deregisters it.

use crate::apps::AppError;
use crate::protocol::FrameError;
use crate::server::registry::{ConnectionId, ConnectionRegistry};
use chrono::{DateTime, Utc};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{trace, warn};

/// Current state of a connection.
///
/// The cycle is `ReadingLength -> ReadingPayload -> Dispatching ->
/// WritingResponse -> ReadingLength`. Any state may move to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted and registered, no bytes read yet.
    Accepted,
    /// Waiting for (or part-way through) the 4-byte length prefix.
    ReadingLength,
    /// Reading the payload announced by the prefix.
    ReadingPayload,
    /// Application callback is running.
    Dispatching,
    /// Writing the response frame.
    WritingResponse,
    /// Terminal.
    Closed,
}

impl ConnState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Accepted, ReadingLength)
                | (ReadingLength, ReadingPayload)
                | (ReadingPayload, Dispatching)
                | (Dispatching, WritingResponse)
                | (WritingResponse, ReadingLength)
        ) || (next == Closed && self != Closed)
    }
}

/// Errors that end a single connection.
///
/// None of these propagate past the connection's own task.
#[derive(Debug)]
pub enum ConnectionError {
    /// Malformed frame from the peer
    Protocol(FrameError),
    /// Socket error
    Io(io::Error),
    /// Application callback failed
    Application(AppError),
    /// Closed by shutdown
    Cancelled,
}

impl ConnectionError {
    /// Whether this error should be reported as a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, ConnectionError::Cancelled)
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectionError::Application(e) => write!(f, "Application error: {}", e),
            ConnectionError::Cancelled => write!(f, "Cancelled by shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Protocol(e) => Some(e),
            ConnectionError::Io(e) => Some(e),
            ConnectionError::Application(e) => Some(e.as_ref()),
            ConnectionError::Cancelled => None,
        }
    }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// A single client connection.
pub struct Connection<S = TcpStream> {
    id: ConnectionId,
    remote: SocketAddr,
    created_at: DateTime<Utc>,
    state: ConnState,
    stream: S,
    registry: Arc<ConnectionRegistry>,
}

impl<S> Connection<S> {
    /// Register a freshly accepted stream.
    pub fn open(stream: S, remote: SocketAddr, registry: Arc<ConnectionRegistry>) -> Self {
        let created_at = Utc::now();
        let id = registry.register(remote, created_at);
        Self {
            id,
            remote,
            created_at,
            state: ConnState::Accepted,
            stream,
            registry,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Move to `next`.
    pub fn transition(&mut self, next: ConnState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(conn = %self.id, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    /// Mark the connection closed. Idempotent.
    pub fn close(&mut self) {
        if self.state != ConnState::Closed {
            self.transition(ConnState::Closed);
        }
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        if self.state != ConnState::Closed {
            // Only reachable when the handler task was aborted
            let age_ms = (Utc::now() - self.created_at).num_milliseconds();
            if self.state == ConnState::WritingResponse {
                warn!(
                    conn = %self.id,
                    peer = %self.remote,
                    age_ms,
                    "Connection force-closed mid-write, response truncated"
                );
            } else {
                warn!(
                    conn = %self.id,
                    peer = %self.remote,
                    state = ?self.state,
                    age_ms,
                    "Connection force-closed"
                );
            }
            self.state = ConnState::Closed;
        }
        self.registry.deregister(self.id);
    }
}
