//! Tunnel session abstraction
//!
//! The relay never speaks the tunnel wire protocol itself. It drives a
//! [`TunnelSession`] obtained from a [`SessionFactory`], and receives the
//! other direction of traffic through the [`InboundSink`] it registers when
//! the session is opened.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  recv()   ┌──────────────────┐  send()    ┌──────────────┐
//! │  Local endpoint  │ ────────► │ Connection relay │ ─────────► │ TunnelSession│
//! │ (TCP or stdio)   │           └──────────────────┘            │              │
//! │                  │ ◄──────────────────────────────────────── │              │
//! └──────────────────┘        InboundSink::deliver()            └──────────────┘
//! ```
//!
//! # Lifecycle
//!
//! A session is bound to exactly one local endpoint. The relay sends every
//! chunk read from the endpoint, signals [`TunnelSession::local_eof`] once the
//! endpoint is exhausted, waits for [`TunnelSession::wait_for_all_sent`], and
//! finally calls [`TunnelSession::close`] on every exit path.

use async_trait::async_trait;
use bytes::Bytes;
use iap_tunnel_proto::TargetDescriptor;
use std::io;
use std::sync::Arc;

pub mod direct;
pub mod error;
pub mod token;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use direct::{DirectSession, DirectSessionFactory};
pub use error::{SessionError, SessionResult};
pub use token::{NoToken, StaticToken, TokenFile, TokenProvider};

/// Receiver for tunnel → local traffic
///
/// Registered with a session at open time. Sessions call it from their own
/// inbound task, so implementations must be shareable across tasks.
#[async_trait]
pub trait InboundSink: Send + Sync {
    /// Deliver bytes received from the remote side
    ///
    /// All bytes are written or an error is returned; there are no partial
    /// deliveries.
    async fn deliver(&self, data: Bytes) -> io::Result<()>;

    /// The remote side finished sending
    async fn remote_closed(&self);
}

/// One logical bidirectional tunnel bound to a remote target
#[async_trait]
pub trait TunnelSession: Send {
    /// Queue bytes for the remote side, preserving submission order
    async fn send(&mut self, data: Bytes) -> SessionResult<()>;

    /// Signal that the local side will send nothing more
    async fn local_eof(&mut self) -> SessionResult<()>;

    /// Block until queued data is flushed
    ///
    /// Returns `false` if the session gave up before everything was sent.
    async fn wait_for_all_sent(&mut self) -> bool;

    /// Tear the session down. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens tunnel sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a session to `target`
    ///
    /// The token provider is consulted once per call.
    async fn open(
        &self,
        target: &TargetDescriptor,
        tokens: Arc<dyn TokenProvider>,
        inbound: Arc<dyn InboundSink>,
    ) -> SessionResult<Box<dyn TunnelSession>>;
}
