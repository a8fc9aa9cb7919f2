//! Socket-mode proxy server
//!
//! Accepts local TCP connections and relays each one over its own tunnel
//! session. Startup runs a connectivity smoke test before any port is
//! bound, so a tunnel that cannot be reached never shows up as a listening
//! port.

use async_trait::async_trait;
use bytes::Bytes;
use iap_tunnel_proto::TargetDescriptor;
use iap_tunnel_session::{InboundSink, SessionFactory, TokenProvider};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::endpoint::TcpEndpoint;
use crate::error::RelayError;
use crate::listener::{is_transient_accept_error, ListenerSet};
use crate::relay::ConnectionRelay;
use crate::shutdown::{ConnectionRegistry, ShutdownCoordinator, ShutdownReport};

/// Sink for the smoke-test session, which has no local endpoint
struct DiscardSink;

#[async_trait]
impl InboundSink for DiscardSink {
    async fn deliver(&self, data: Bytes) -> io::Result<()> {
        debug!(bytes = data.len(), "Discarding data received by test session");
        Ok(())
    }

    async fn remote_closed(&self) {}
}

/// Proxy server before its listeners are bound
pub struct ProxyServer {
    config: RelayConfig,
    target: TargetDescriptor,
    factory: Arc<dyn SessionFactory>,
    tokens: Arc<dyn TokenProvider>,
}

impl ProxyServer {
    pub fn new(
        config: RelayConfig,
        target: TargetDescriptor,
        factory: Arc<dyn SessionFactory>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            config,
            target,
            factory,
            tokens,
        }
    }

    /// Open and immediately close one session to prove the tunnel works
    pub async fn smoke_test(&self) -> Result<(), RelayError> {
        info!(target = %self.target, "Testing if tunnel connection works");

        let mut session = self
            .factory
            .open(&self.target, self.tokens.clone(), Arc::new(DiscardSink))
            .await
            .map_err(RelayError::SessionUnavailable)?;
        session.close().await;

        info!("Tunnel connection test passed");
        Ok(())
    }

    /// Check the target, run the smoke test (if enabled) and bind the
    /// local listeners
    pub async fn bind(self, host: &str, port: u16) -> Result<BoundProxyServer, RelayError> {
        self.target.validate()?;
        if self.config.smoke_test {
            self.smoke_test().await?;
        }

        let listeners = ListenerSet::bind(host, port).await?;

        Ok(BoundProxyServer {
            config: self.config,
            target: self.target,
            factory: self.factory,
            tokens: self.tokens,
            listeners,
        })
    }

    /// Bind, announce the port on stdout and serve until shutdown
    pub async fn start(
        self,
        host: &str,
        port: u16,
        shutdown: ShutdownCoordinator,
    ) -> Result<ShutdownReport, RelayError> {
        let server = self.bind(host, port).await?;
        println!("Listening on port [{}].", server.port());
        server.serve(shutdown).await
    }
}

/// Proxy server with its listeners bound, ready to accept
pub struct BoundProxyServer {
    config: RelayConfig,
    target: TargetDescriptor,
    factory: Arc<dyn SessionFactory>,
    tokens: Arc<dyn TokenProvider>,
    listeners: ListenerSet,
}

impl BoundProxyServer {
    pub fn port(&self) -> u16 {
        self.listeners.port()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.local_addrs()
    }

    /// Accept connections until shutdown is requested or accepting fails
    ///
    /// Relays do not watch the shutdown token themselves. On exit the
    /// listeners are closed, shutdown is triggered and every relay still
    /// running is forced closed through its own token, without being joined.
    pub async fn serve(
        mut self,
        shutdown: ShutdownCoordinator,
    ) -> Result<ShutdownReport, RelayError> {
        let cancel = shutdown.token();
        let limiter = self
            .config
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let mut registry = ConnectionRegistry::new();
        let mut report = ShutdownReport::default();
        let mut result = Ok(());

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.listeners.accept_next(self.config.accept_poll_interval) => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(Some(connection)) => connection,
                Ok(None) => continue,
                Err(e) if is_transient_accept_error(&e) => {
                    debug!("Ignoring transient accept error: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    result = Err(RelayError::Accept(e));
                    break;
                }
            };

            let permit = match &limiter {
                Some(limiter) => match limiter.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!(
                            peer = %peer,
                            "Connection limit of {} reached, closing new connection",
                            self.config.max_connections.unwrap_or_default()
                        );
                        report.rejected += 1;
                        continue;
                    }
                },
                None => None,
            };

            info!(peer = %peer, target = %self.target, "Accepted new connection");

            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
            }

            let token = CancellationToken::new();
            let relay = ConnectionRelay::new(
                self.target.clone(),
                self.factory.clone(),
                self.tokens.clone(),
            )
            .with_chunk_size(self.config.chunk_size())
            .with_cancellation(token.clone());
            let endpoint = TcpEndpoint::new(stream, peer);

            let handle = tokio::spawn(async move {
                let _permit = permit;
                relay.run(endpoint).await;
            });

            registry.register(peer.to_string(), handle, token);
            report.accepted += 1;
        }

        self.listeners.close_all();
        shutdown.trigger();

        report.forced_closed = registry.force_close();
        info!(
            "Shutting down: {} connection(s) accepted, {} still open were closed",
            report.accepted, report.forced_closed
        );

        result.map(|()| report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iap_tunnel_session::testing::{RecordingSessionFactory, SessionEvent};
    use iap_tunnel_proto::TargetError;
    use iap_tunnel_session::NoToken;
    use std::time::Duration;

    fn server(factory: &RecordingSessionFactory, config: RelayConfig) -> ProxyServer {
        ProxyServer::new(
            config,
            TargetDescriptor::new("project", "zone", "vm", 22),
            Arc::new(factory.clone()),
            Arc::new(NoToken),
        )
    }

    #[tokio::test]
    async fn test_smoke_test_opens_and_closes_one_session() {
        let factory = RecordingSessionFactory::new();

        let bound = server(&factory, RelayConfig::default())
            .bind("127.0.0.1", 0)
            .await
            .unwrap();

        assert_ne!(bound.port(), 0);
        assert_eq!(factory.open_calls(), 1);
        assert_eq!(factory.events(0), vec![SessionEvent::Close]);
    }

    #[tokio::test]
    async fn test_smoke_test_failure_binds_nothing() {
        let factory = RecordingSessionFactory::new().with_open_failure();

        let free = ListenerSet::bind("127.0.0.1", 0).await.unwrap();
        let port = free.port();
        drop(free);

        let result = server(&factory, RelayConfig::default())
            .bind("127.0.0.1", port)
            .await;
        assert!(matches!(result, Err(RelayError::SessionUnavailable(_))));

        // The port was never taken.
        let again = ListenerSet::bind("127.0.0.1", port).await.unwrap();
        assert_eq!(again.port(), port);
    }

    #[tokio::test]
    async fn test_smoke_test_can_be_disabled() {
        let factory = RecordingSessionFactory::new().with_open_failure();
        let config = RelayConfig::default().with_smoke_test(false);

        let bound = server(&factory, config).bind("127.0.0.1", 0).await;

        assert!(bound.is_ok());
        assert_eq!(factory.open_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_target_opens_no_session() {
        let factory = RecordingSessionFactory::new();
        let server = ProxyServer::new(
            RelayConfig::default(),
            TargetDescriptor::new("", "zone", "vm", 22),
            Arc::new(factory.clone()),
            Arc::new(NoToken),
        );

        let result = server.bind("127.0.0.1", 0).await;

        assert!(matches!(
            result,
            Err(RelayError::InvalidTarget(TargetError::MissingField("project")))
        ));
        assert_eq!(factory.open_calls(), 0);
    }

    #[tokio::test]
    async fn test_serve_returns_on_shutdown() {
        let factory = RecordingSessionFactory::new();
        let config = RelayConfig::default().with_smoke_test(false);
        let bound = server(&factory, config).bind("127.0.0.1", 0).await.unwrap();
        let shutdown = ShutdownCoordinator::new();

        let handle = tokio::spawn(bound.serve(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report, ShutdownReport::default());
    }
}
