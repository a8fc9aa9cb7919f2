//! Stdio-mode relay
//!
//! Runs a single [`ConnectionRelay`] over the process's own stdin and stdout
//! on the caller's task. Nothing is spawned; the call returns once stdin is
//! exhausted, the tunnel closes or shutdown is requested.

use iap_tunnel_proto::TargetDescriptor;
use iap_tunnel_session::{SessionFactory, TokenProvider};
use std::sync::Arc;
use tracing::info;

use crate::config::RelayConfig;
use crate::endpoint::LocalEndpoint;
use crate::error::RelayError;
use crate::relay::{ConnectionRelay, RelayReport};
use crate::shutdown::ShutdownCoordinator;
use crate::stdio::StdioEndpoint;

pub struct StdinRelay {
    config: RelayConfig,
    target: TargetDescriptor,
    factory: Arc<dyn SessionFactory>,
    tokens: Arc<dyn TokenProvider>,
}

impl StdinRelay {
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

    /// Relay stdin/stdout until EOF or shutdown
    pub async fn run(&self, shutdown: &ShutdownCoordinator) -> Result<RelayReport, RelayError> {
        let endpoint = StdioEndpoint::stdio(self.config.stdin_poll_interval);
        self.run_with_endpoint(endpoint, shutdown).await
    }

    /// Relay an arbitrary endpoint the way [`StdinRelay::run`] relays stdio
    ///
    /// An invalid target closes the endpoint without opening a session.
    pub async fn run_with_endpoint<E: LocalEndpoint>(
        &self,
        mut endpoint: E,
        shutdown: &ShutdownCoordinator,
    ) -> Result<RelayReport, RelayError> {
        if let Err(e) = self.target.validate() {
            endpoint.close().await;
            return Err(e.into());
        }

        info!(target = %self.target, "Relaying standard input and output");

        let report = ConnectionRelay::new(
            self.target.clone(),
            self.factory.clone(),
            self.tokens.clone(),
        )
        .with_chunk_size(self.config.chunk_size())
        .with_cancellation(shutdown.child_token())
        .run(endpoint)
        .await;
        Ok(report)
    }
}
