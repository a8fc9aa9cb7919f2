//! Local tunnel relay
//!
//! Exposes a local TCP port (or the process's own stdio) and relays every
//! local connection over its own tunnel session.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod stdin_relay;
pub mod stdio;

pub use config::RelayConfig;
pub use endpoint::{EndpointWriter, LocalEndpoint, TcpEndpoint};
pub use error::RelayError;
pub use listener::ListenerSet;
pub use relay::{ConnectionRelay, RelayOutcome, RelayReport, RelayState};
pub use server::{BoundProxyServer, ProxyServer};
pub use shutdown::{ConnectionRegistry, ShutdownCoordinator, ShutdownReport};
pub use stdin_relay::StdinRelay;
pub use stdio::{ByteSource, ReaderSource, StdinSource, StdioEndpoint};

#[cfg(unix)]
pub use stdio::PollingFdSource;

pub use iap_tunnel_proto::{TargetDescriptor, MAX_DATA_FRAME_SIZE};
