//! Local listening sockets
//!
//! A host name can resolve to several addresses (`localhost` usually gives
//! both `127.0.0.1` and `::1`). [`ListenerSet`] binds one listener per
//! resolved address on a single port and accepts from whichever becomes
//! ready first.

use futures::future::select_all;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::RelayError;

const LISTEN_BACKLOG: i32 = 128;

/// Listening sockets for one host/port pair
#[derive(Debug)]
pub struct ListenerSet {
    host: String,
    port: u16,
    listeners: Vec<TcpListener>,
}

impl ListenerSet {
    /// Bind every address `host` resolves to
    ///
    /// Addresses that cannot be bound (for example `::1` on a host without
    /// IPv6) are skipped as long as one listener succeeds. If the requested
    /// port is taken on any address, nothing stays bound and
    /// [`RelayError::LocalPortUnavailable`] is returned. With port 0 the
    /// port picked for the first address is reused for the others.
    pub async fn bind(host: &str, port: u16) -> Result<Self, RelayError> {
        let mut candidates: Vec<SocketAddr> = Vec::new();
        for addr in tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| RelayError::Resolve {
                host: host.to_string(),
                source,
            })?
        {
            if !candidates.contains(&addr) {
                candidates.push(addr);
            }
        }

        let mut listeners = Vec::new();
        let mut bound_port = port;
        let mut last_error: Option<io::Error> = None;

        for mut addr in candidates {
            addr.set_port(bound_port);
            match bind_listener(addr) {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    bound_port = local.port();
                    debug!("Listening on {}", local);
                    listeners.push(listener);
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && port != 0 => {
                    // Dropping `listeners` closes anything bound so far.
                    return Err(RelayError::LocalPortUnavailable {
                        host: host.to_string(),
                        port,
                    });
                }
                Err(e) => {
                    debug!("Skipping {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        if listeners.is_empty() {
            return Err(RelayError::UnableToOpenPort {
                host: host.to_string(),
                port,
                reason: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "host resolved to no addresses".to_string()),
            });
        }

        info!(
            "Bound {} listener(s) for {}:{}",
            listeners.len(),
            host,
            bound_port
        );

        Ok(Self {
            host: host.to_string(),
            port: bound_port,
            listeners,
        })
    }

    /// Wait up to `timeout` for a connection on any listener
    ///
    /// Returns `Ok(None)` when the wait times out so the caller can re-check
    /// its shutdown state.
    pub async fn accept_next(
        &self,
        timeout: Duration,
    ) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        if self.listeners.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "all listeners are closed",
            ));
        }

        let accepts = self
            .listeners
            .iter()
            .map(|listener| Box::pin(listener.accept()));

        match tokio::time::timeout(timeout, select_all(accepts)).await {
            Err(_) => Ok(None),
            Ok((result, _, _)) => result.map(Some),
        }
    }

    /// Close every listener. Safe to call repeatedly.
    pub fn close_all(&mut self) {
        for listener in self.listeners.drain(..) {
            if let Ok(addr) = listener.local_addr() {
                debug!("Closing listener on {}", addr);
            }
        }
    }

    /// Port shared by all listeners
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Errors after which accepting can simply continue
pub fn is_transient_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    // Keep v6 listeners from claiming the v4 port as well.
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_bind_ephemeral_and_accept() {
        let listeners = ListenerSet::bind("127.0.0.1", 0).await.unwrap();
        let port = listeners.port();
        assert_ne!(port, 0);
        assert_eq!(listeners.local_addrs().len(), 1);

        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (_stream, peer) = listeners
            .accept_next(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("connection should be pending");
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let listeners = ListenerSet::bind("127.0.0.1", 0).await.unwrap();

        let started = Instant::now();
        let accepted = listeners
            .accept_next(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(accepted.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_localhost_listeners_share_port() {
        let listeners = ListenerSet::bind("localhost", 0).await.unwrap();
        let port = listeners.port();
        for addr in listeners.local_addrs() {
            assert!(addr.ip().is_loopback());
            assert_eq!(addr.port(), port);
        }
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let first = ListenerSet::bind("127.0.0.1", 0).await.unwrap();
        let port = first.port();

        match ListenerSet::bind("127.0.0.1", port).await {
            Err(RelayError::LocalPortUnavailable { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected LocalPortUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let mut listeners = ListenerSet::bind("127.0.0.1", 0).await.unwrap();
        let port = listeners.port();

        listeners.close_all();
        listeners.close_all();
        assert!(listeners.is_closed());
        assert!(listeners
            .accept_next(Duration::from_millis(10))
            .await
            .is_err());

        // The port is free again.
        let again = ListenerSet::bind("127.0.0.1", port).await.unwrap();
        assert_eq!(again.port(), port);
    }

    #[test]
    fn test_transient_errors() {
        let aborted = io::Error::new(io::ErrorKind::ConnectionAborted, "aborted");
        assert!(is_transient_accept_error(&aborted));

        let fatal = io::Error::new(io::ErrorKind::Other, "too many open files");
        assert!(!is_transient_accept_error(&fatal));
    }
}
