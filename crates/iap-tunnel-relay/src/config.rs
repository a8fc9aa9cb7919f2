//! Relay configuration

use iap_tunnel_proto::MAX_DATA_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long the accept loop waits for a connection before re-checking shutdown
pub const DEFAULT_ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a polling stdin read sleeps when no data is available
pub const DEFAULT_STDIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Tunables shared by the proxy server and the stdin relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Largest chunk read from a local endpoint and handed to a session
    pub max_chunk_size: usize,

    #[serde(with = "duration_millis")]
    pub accept_poll_interval: Duration,

    #[serde(with = "duration_millis")]
    pub stdin_poll_interval: Duration,

    /// Concurrent relay limit; `None` accepts without bound
    pub max_connections: Option<usize>,

    /// Open and close one throwaway session before binding any listener
    pub smoke_test: bool,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: MAX_DATA_FRAME_SIZE,
            accept_poll_interval: DEFAULT_ACCEPT_POLL_INTERVAL,
            stdin_poll_interval: DEFAULT_STDIN_POLL_INTERVAL,
            max_connections: None,
            smoke_test: true,
        }
    }
}

impl RelayConfig {
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    pub fn with_accept_poll_interval(mut self, interval: Duration) -> Self {
        self.accept_poll_interval = interval;
        self
    }

    pub fn with_stdin_poll_interval(mut self, interval: Duration) -> Self {
        self.stdin_poll_interval = interval;
        self
    }

    pub fn with_max_connections(mut self, limit: Option<usize>) -> Self {
        self.max_connections = limit;
        self
    }

    pub fn with_smoke_test(mut self, enabled: bool) -> Self {
        self.smoke_test = enabled;
        self
    }

    /// Chunk size actually used: never zero, never above the frame limit
    pub fn chunk_size(&self) -> usize {
        self.max_chunk_size.clamp(1, MAX_DATA_FRAME_SIZE)
    }
}
