//! Per-connection relay
//!
//! A [`ConnectionRelay`] owns one local endpoint and the tunnel session opened
//! for it. It moves local bytes into the session; the opposite direction is
//! written straight into the endpoint by the session through the sink
//! registered at open time.
//!
//! ```text
//!   OPEN ──recv() == EOF──► LOCAL_EOF ──wait_for_all_sent()──► CLOSED
//!    │                          │                                 ▲
//!    └── error / cancelled ─────┴─────────────────────────────────┘
//! ```
//!
//! Whatever path leads to `CLOSED`, the session and the endpoint are each
//! closed exactly once.

use bytes::Bytes;
use iap_tunnel_proto::{TargetDescriptor, MAX_DATA_FRAME_SIZE};
use iap_tunnel_session::{SessionError, SessionFactory, TokenProvider, TunnelSession};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::LocalEndpoint;

/// Relay state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Open,
    LocalEof,
    Closed,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::Open => write!(f, "OPEN"),
            RelayState::LocalEof => write!(f, "LOCAL_EOF"),
            RelayState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// How a relay ended
#[derive(Debug)]
pub enum RelayOutcome {
    /// Local EOF reached and the session was drained
    Completed { flushed: bool },
    /// Reading from the local endpoint failed
    LocalError(io::Error),
    /// The session rejected data or the half-close
    SessionFailed(SessionError),
    /// No session could be opened for this connection
    SessionUnavailable(SessionError),
    /// Shutdown was requested before the relay finished
    Cancelled,
}

impl RelayOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RelayOutcome::Completed { .. })
    }
}

/// Summary returned by [`ConnectionRelay::run`]
#[derive(Debug)]
pub struct RelayReport {
    pub peer: String,
    pub outcome: RelayOutcome,
    /// Bytes handed to the session
    pub bytes_sent: u64,
    /// `Closed` after a clean finish, otherwise the state that was interrupted
    pub last_state: RelayState,
}

/// Relays one local endpoint over one tunnel session
pub struct ConnectionRelay {
    target: TargetDescriptor,
    factory: Arc<dyn SessionFactory>,
    tokens: Arc<dyn TokenProvider>,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl ConnectionRelay {
    pub fn new(
        target: TargetDescriptor,
        factory: Arc<dyn SessionFactory>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            target,
            factory,
            tokens,
            chunk_size: MAX_DATA_FRAME_SIZE,
            cancel: CancellationToken::new(),
        }
    }

    /// Largest chunk handed to `send`, capped at the frame limit
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(1, MAX_DATA_FRAME_SIZE);
        self
    }

    /// Token whose cancellation forces the relay to close
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until EOF, error or cancellation, then close both ends
    pub async fn run<E: LocalEndpoint>(self, mut endpoint: E) -> RelayReport {
        let peer = endpoint.peer().to_string();
        let inbound = endpoint.inbound_sink();

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.factory.open(&self.target, self.tokens.clone(), inbound) => Some(result),
        };

        let mut session = match opened {
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                warn!(peer = %peer, target = %self.target, "Failed to open tunnel session: {}", e);
                endpoint.close().await;
                return RelayReport {
                    peer,
                    outcome: RelayOutcome::SessionUnavailable(e),
                    bytes_sent: 0,
                    last_state: RelayState::Open,
                };
            }
            None => {
                debug!(peer = %peer, "Cancelled while opening tunnel session");
                endpoint.close().await;
                return RelayReport {
                    peer,
                    outcome: RelayOutcome::Cancelled,
                    bytes_sent: 0,
                    last_state: RelayState::Open,
                };
            }
        };

        debug!(peer = %peer, target = %self.target, "Tunnel session opened");

        let mut bytes_sent = 0u64;
        let mut state = RelayState::Open;
        let outcome = self
            .pump(&mut endpoint, session.as_mut(), &mut state, &mut bytes_sent)
            .await;

        // CLOSED: session first, so its inbound side stops writing into the
        // endpoint before the endpoint goes away.
        session.close().await;
        endpoint.close().await;

        match &outcome {
            RelayOutcome::Completed { .. } => {
                info!(peer = %peer, bytes = bytes_sent, "Connection closed");
            }
            RelayOutcome::LocalError(e) => {
                warn!(
                    peer = %peer,
                    bytes = bytes_sent,
                    "Connection closed after local error: {}", e
                );
            }
            RelayOutcome::SessionFailed(e) => {
                warn!(
                    peer = %peer,
                    bytes = bytes_sent,
                    "Connection closed after tunnel error: {}", e
                );
            }
            RelayOutcome::Cancelled => {
                info!(
                    peer = %peer,
                    bytes = bytes_sent,
                    state = %state,
                    "Connection closed by shutdown"
                );
            }
            RelayOutcome::SessionUnavailable(_) => {}
        }

        RelayReport {
            peer,
            outcome,
            bytes_sent,
            last_state: state,
        }
    }

    async fn pump<E: LocalEndpoint>(
        &self,
        endpoint: &mut E,
        session: &mut dyn TunnelSession,
        state: &mut RelayState,
        bytes_sent: &mut u64,
    ) -> RelayOutcome {
        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return RelayOutcome::Cancelled,
                read = endpoint.recv(self.chunk_size) => read,
            };

            let mut chunk = match read {
                Ok(chunk) => chunk,
                Err(e) => return RelayOutcome::LocalError(e),
            };
            if chunk.is_empty() {
                break;
            }

            while !chunk.is_empty() {
                let piece: Bytes = chunk.split_to(chunk.len().min(self.chunk_size));
                let len = piece.len() as u64;
                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return RelayOutcome::Cancelled,
                    sent = session.send(piece) => sent,
                };
                if let Err(e) = sent {
                    return RelayOutcome::SessionFailed(e);
                }
                *bytes_sent += len;
            }
        }

        *state = RelayState::LocalEof;
        debug!(peer = %endpoint.peer(), bytes = *bytes_sent, "Local end finished sending");

        let half_closed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return RelayOutcome::Cancelled,
            half_closed = session.local_eof() => half_closed,
        };
        if let Err(e) = half_closed {
            return RelayOutcome::SessionFailed(e);
        }

        let flushed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return RelayOutcome::Cancelled,
            flushed = session.wait_for_all_sent() => flushed,
        };
        if !flushed {
            warn!(
                peer = %endpoint.peer(),
                "Not all data was sent before the tunnel closed; some data may have been lost"
            );
        }

        *state = RelayState::Closed;
        RelayOutcome::Completed { flushed }
    }
}
