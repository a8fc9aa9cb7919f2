//! Direct transport
//!
//! Sessions that carry bytes verbatim over a plain TCP connection to the
//! target's data endpoint, optionally through an HTTP `CONNECT` proxy. There
//! is no framing: the relay's chunking still applies, and local EOF maps to a
//! TCP half-close.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use iap_tunnel_proto::{ProxySettings, TargetDescriptor, MAX_DATA_FRAME_SIZE};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    InboundSink, SessionError, SessionFactory, SessionResult, TokenProvider, TunnelSession,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a proxy's CONNECT response header
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Opens [`DirectSession`]s
#[derive(Debug, Clone)]
pub struct DirectSessionFactory {
    connect_timeout: Duration,
}

impl Default for DirectSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectSessionFactory {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolve the `host:port` the session dials for `target`
    ///
    /// `url_override` wins when present (`host:port` or `tcp://host:port`;
    /// a missing port falls back to the target port). Otherwise the instance
    /// name is dialed on the target port.
    pub fn endpoint_for(target: &TargetDescriptor) -> SessionResult<String> {
        let Some(url) = target.url_override.as_deref() else {
            return Ok(format!("{}:{}", target.instance, target.port));
        };

        let address = match url.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some((scheme, _)) => {
                return Err(SessionError::InvalidTarget(format!(
                    "Unsupported URL scheme '{}' in '{}'",
                    scheme, url
                )))
            }
            None => url,
        };
        let address = address.trim_end_matches('/');

        if address.is_empty() {
            return Err(SessionError::InvalidTarget(format!(
                "Empty address in URL override '{}'",
                url
            )));
        }

        let has_port = if address.starts_with('[') {
            address.contains("]:")
        } else {
            address.contains(':')
        };

        if has_port {
            Ok(address.to_string())
        } else {
            Ok(format!("{}:{}", address, target.port))
        }
    }

    async fn dial(
        &self,
        endpoint: &str,
        proxy: Option<&ProxySettings>,
    ) -> SessionResult<TcpStream> {
        let dial_addr = match proxy {
            Some(proxy) => proxy.authority(),
            None => endpoint.to_string(),
        };

        let connect = async {
            let mut stream = TcpStream::connect(&dial_addr).await.map_err(|source| {
                SessionError::ConnectionFailed {
                    address: dial_addr.clone(),
                    source,
                }
            })?;

            if let Some(proxy) = proxy {
                http_connect(&mut stream, endpoint, proxy).await?;
            }

            Ok::<_, SessionError>(stream)
        };

        tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| SessionError::ConnectionFailed {
                address: dial_addr.clone(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })?
    }
}

#[async_trait]
impl SessionFactory for DirectSessionFactory {
    async fn open(
        &self,
        target: &TargetDescriptor,
        tokens: Arc<dyn TokenProvider>,
        inbound: Arc<dyn InboundSink>,
    ) -> SessionResult<Box<dyn TunnelSession>> {
        let token = tokens.access_token().await?;
        let endpoint = Self::endpoint_for(target)?;

        debug!(
            target = %target,
            endpoint = %endpoint,
            authenticated = token.is_some(),
            via_proxy = target.proxy.is_some(),
            "Opening direct session"
        );

        let stream = self.dial(&endpoint, target.proxy.as_ref()).await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", endpoint, e);
        }

        let (read_half, write_half) = stream.into_split();
        let pump = tokio::spawn(pump_inbound(read_half, inbound, endpoint.clone()));

        info!(endpoint = %endpoint, "Direct session established");

        Ok(Box::new(DirectSession {
            endpoint,
            writer: Some(write_half),
            eof_sent: false,
            pump: Some(pump),
        }))
    }
}

/// Session backed by one TCP connection
#[derive(Debug)]
pub struct DirectSession {
    endpoint: String,
    writer: Option<OwnedWriteHalf>,
    eof_sent: bool,
    pump: Option<JoinHandle<()>>,
}

impl DirectSession {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TunnelSession for DirectSession {
    async fn send(&mut self, data: Bytes) -> SessionResult<()> {
        if self.eof_sent {
            return Err(SessionError::Closed);
        }
        let writer = self.writer.as_mut().ok_or(SessionError::Closed)?;
        writer.write_all(&data).await?;
        Ok(())
    }

    async fn local_eof(&mut self) -> SessionResult<()> {
        if self.eof_sent {
            return Ok(());
        }
        let writer = self.writer.as_mut().ok_or(SessionError::Closed)?;
        writer.flush().await?;
        writer.shutdown().await?;
        self.eof_sent = true;
        Ok(())
    }

    async fn wait_for_all_sent(&mut self) -> bool {
        match self.writer.as_mut() {
            // The write side is already shut down after local_eof, which flushed it.
            Some(_) if self.eof_sent => true,
            Some(writer) => writer.flush().await.is_ok(),
            None => false,
        }
    }

    async fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.writer.take().is_some() {
            debug!(endpoint = %self.endpoint, "Direct session closed");
        }
    }
}

impl Drop for DirectSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Copies remote bytes into the inbound sink until the remote side finishes
async fn pump_inbound(mut reader: OwnedReadHalf, inbound: Arc<dyn InboundSink>, endpoint: String) {
    let mut buffer = vec![0u8; MAX_DATA_FRAME_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!(endpoint = %endpoint, "Remote side closed");
                break;
            }
            Ok(n) => {
                if let Err(e) = inbound
                    .deliver(Bytes::copy_from_slice(&buffer[..n]))
                    .await
                {
                    debug!(endpoint = %endpoint, "Local side no longer accepts data: {}", e);
                    return;
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint, "Error reading from remote: {}", e);
                break;
            }
        }
    }
    inbound.remote_closed().await;
}

/// Perform an HTTP/1.1 `CONNECT` handshake on an open proxy connection
async fn http_connect(
    stream: &mut TcpStream,
    endpoint: &str,
    proxy: &ProxySettings,
) -> SessionResult<()> {
    let mut request = format!("CONNECT {endpoint} HTTP/1.1\r\nHost: {endpoint}\r\n");
    if let (Some(user), Some(password)) = (&proxy.username, &proxy.password) {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;

    // Byte at a time so nothing past the header is consumed.
    let mut header = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_PROXY_RESPONSE {
            return Err(SessionError::Proxy(
                "CONNECT response header too large".to_string(),
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(SessionError::Proxy(format!(
                "Proxy {} closed the connection during CONNECT",
                proxy.authority()
            )));
        }
        header.push(byte[0]);
    }

    let header = String::from_utf8_lossy(&header);
    let status_line = header.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok());

    match status {
        Some(code) if (200..300).contains(&code) => {
            debug!(proxy = %proxy.authority(), endpoint = %endpoint, "CONNECT established");
            Ok(())
        }
        _ => Err(SessionError::Proxy(format!(
            "Proxy refused CONNECT to {}: {}",
            endpoint, status_line
        ))),
    }
}
