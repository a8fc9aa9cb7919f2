//! Relay error types
//!
//! Only startup failures surface as [`RelayError`]. Failures on an
//! individual connection stay inside its relay and are reported through
//! [`crate::RelayOutcome`] and the logs.

use iap_tunnel_proto::TargetError;
use iap_tunnel_session::SessionError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Local port {port} on {host} is already in use\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Pick another port or pass port 0 for an ephemeral one")]
    LocalPortUnavailable { host: String, port: u16 },

    #[error("Unable to open a listening socket on {host}:{port}: {reason}")]
    UnableToOpenPort {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid tunnel target: {0}")]
    InvalidTarget(#[from] TargetError),

    #[error("Tunnel session could not be established: {0}")]
    SessionUnavailable(#[source] SessionError),

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Whether the error happened before any listener was opened
    pub fn is_startup_error(&self) -> bool {
        !matches!(self, RelayError::Accept(_))
    }
}
