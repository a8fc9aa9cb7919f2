#![allow(dead_code)]

use iap_tunnel_relay::{
    BoundProxyServer, ProxyServer, RelayConfig, RelayError, ShutdownCoordinator, ShutdownReport,
    TargetDescriptor,
};
use iap_tunnel_session::testing::RecordingSessionFactory;
use iap_tunnel_session::NoToken;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn target() -> TargetDescriptor {
    TargetDescriptor::new("test-project", "us-central1-a", "test-vm", 22)
}

pub fn relay_config() -> RelayConfig {
    RelayConfig::default()
        .with_smoke_test(false)
        .with_accept_poll_interval(Duration::from_millis(50))
}

pub async fn bind_server(
    factory: &RecordingSessionFactory,
    config: RelayConfig,
) -> BoundProxyServer {
    ProxyServer::new(config, target(), Arc::new(factory.clone()), Arc::new(NoToken))
        .bind("127.0.0.1", 0)
        .await
        .expect("server should bind an ephemeral port")
}

/// A server serving in the background
pub struct RunningServer {
    pub port: u16,
    pub shutdown: ShutdownCoordinator,
    pub handle: JoinHandle<Result<ShutdownReport, RelayError>>,
}

impl RunningServer {
    pub async fn start(factory: &RecordingSessionFactory, config: RelayConfig) -> Self {
        let server = bind_server(factory, config).await;
        let port = server.port();
        let shutdown = ShutdownCoordinator::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));
        Self {
            port,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) -> ShutdownReport {
        self.shutdown.trigger();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("server should stop promptly")
            .expect("server task should not panic")
            .expect("server should shut down cleanly")
    }
}
