//! Cooperative shutdown
//!
//! [`ShutdownCoordinator`] owns the process-wide cancellation token. The
//! accept loop watches it directly. Each socket-mode relay gets a token of
//! its own, recorded in the [`ConnectionRegistry`] and cancelled by
//! [`ConnectionRegistry::force_close`] once the listeners are gone. The
//! stdin relay uses [`ShutdownCoordinator::child_token`] instead.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process-wide shutdown signal
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown on Ctrl-C
    pub fn install_interrupt_handler(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => {
                        info!("Interrupt received, shutting down");
                        token.cancel();
                    }
                    Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
                },
                _ = token.cancelled() => {}
            }
        })
    }

    /// Request shutdown. Later calls have no effect.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token for one connection, cancelled with the coordinator
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

struct RegisteredConnection {
    peer: String,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Relays spawned by the accept loop
///
/// Append-only: entries stay until shutdown, where finished ones are
/// skipped. Only the accept loop touches it, so it needs no lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Vec<RegisteredConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        peer: impl Into<String>,
        handle: JoinHandle<()>,
        cancel: CancellationToken,
    ) {
        self.connections.push(RegisteredConnection {
            peer: peer.into(),
            handle,
            cancel,
        });
    }

    /// Number of connections ever registered
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Relays that have not finished yet
    pub fn active(&self) -> usize {
        self.connections
            .iter()
            .filter(|connection| !connection.handle.is_finished())
            .count()
    }

    /// Cancel every relay still running and return how many there were
    ///
    /// Does not wait for the relays to finish.
    pub fn force_close(&self) -> usize {
        let mut closed = 0;
        for connection in &self.connections {
            if connection.handle.is_finished() {
                continue;
            }
            debug!(peer = %connection.peer, "Forcing connection closed");
            connection.cancel.cancel();
            closed += 1;
        }
        closed
    }
}

/// What happened during one server run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections accepted and handed to a relay
    pub accepted: usize,
    /// Connections refused because of the connection limit
    pub rejected: usize,
    /// Relays still running when the server stopped
    pub forced_closed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        let child = coordinator.child_token();
        assert!(!coordinator.is_triggered());

        coordinator.trigger();
        coordinator.trigger();

        assert!(coordinator.is_triggered());
        assert!(child.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), coordinator.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_registered_tokens_wait_for_force_close() {
        let coordinator = ShutdownCoordinator::new();
        let mut registry = ConnectionRegistry::new();
        let stdin_token = coordinator.child_token();

        let relay_token = CancellationToken::new();
        let waiter = relay_token.clone();
        let relay = tokio::spawn(async move { waiter.cancelled().await });
        registry.register("127.0.0.1:1000", relay, relay_token.clone());

        coordinator.trigger();
        assert!(stdin_token.is_cancelled());
        assert!(!relay_token.is_cancelled());

        assert_eq!(registry.force_close(), 1);
        assert!(relay_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_interrupt_handler_exits_on_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let handler = coordinator.install_interrupt_handler();

        coordinator.trigger();
        tokio::time::timeout(Duration::from_secs(1), handler)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_force_close_skips_finished_relays() {
        let mut registry = ConnectionRegistry::new();

        let done = tokio::spawn(async {});
        let done_token = CancellationToken::new();
        registry.register("127.0.0.1:1000", done, done_token.clone());

        let pending_token = CancellationToken::new();
        let waiter = pending_token.clone();
        let pending = tokio::spawn(async move { waiter.cancelled().await });
        registry.register("127.0.0.1:1001", pending, pending_token.clone());

        // Let the first task finish.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active(), 1);
        assert_eq!(registry.force_close(), 1);
        assert!(pending_token.is_cancelled());
        assert!(!done_token.is_cancelled());
    }
}
