//! Error types for tunnel sessions

use std::io;
use thiserror::Error;

/// Errors raised while opening or driving a tunnel session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Access token unavailable: {0}")]
    Token(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Session closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
