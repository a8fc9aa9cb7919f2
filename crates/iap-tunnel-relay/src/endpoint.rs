//! Local endpoints
//!
//! A [`LocalEndpoint`] is whatever the local peer talks through: an accepted
//! TCP connection or the process's own standard streams. The relay reads from
//! it, and the tunnel session writes back into it through the
//! [`EndpointWriter`] handed out by [`LocalEndpoint::inbound_sink`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use iap_tunnel_session::InboundSink;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Socket-shaped view of a local peer
#[async_trait]
pub trait LocalEndpoint: Send {
    /// Read up to `max_bytes`, waiting until at least one byte or EOF
    ///
    /// An empty result means no more data will ever arrive; every later call
    /// returns empty as well.
    async fn recv(&mut self, max_bytes: usize) -> io::Result<Bytes>;

    /// Sink through which the session delivers tunnel → local traffic
    fn inbound_sink(&self) -> Arc<dyn InboundSink>;

    async fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    /// Release the endpoint. Never fails.
    async fn close(&mut self);

    /// Identity of the peer, for logs
    fn peer(&self) -> &str;
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared write half of a local endpoint
///
/// The session's inbound task and the owning relay both hold it. Once shut
/// down or closed, deliveries fail with `NotConnected`.
pub struct EndpointWriter {
    inner: Mutex<Option<BoxedWriter>>,
    read_closed: Option<Arc<AtomicBool>>,
}

impl EndpointWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Mutex::new(Some(Box::new(writer))),
            read_closed: None,
        }
    }

    /// Also raise `flag` when the remote side closes
    ///
    /// Used by endpoints with no peer of their own to react to a half-close,
    /// so the read loop ends together with the remote side.
    pub fn with_read_closed_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.read_closed = Some(flag);
        self
    }

    /// Write all of `data` and flush, returning the number of bytes written
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"))?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(data.len())
    }

    /// Half-close: signal EOF to the local peer
    pub async fn shutdown(&self) -> io::Result<()> {
        match self.inner.lock().await.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.shutdown().await {
            debug!("Ignoring error while closing endpoint writer: {}", e);
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

#[async_trait]
impl InboundSink for EndpointWriter {
    async fn deliver(&self, data: Bytes) -> io::Result<()> {
        self.send(&data).await.map(|_| ())
    }

    async fn remote_closed(&self) {
        if let Some(flag) = &self.read_closed {
            flag.store(true, Ordering::SeqCst);
        }
        if let Err(e) = self.shutdown().await {
            debug!("Failed to half-close local endpoint: {}", e);
        }
    }
}

/// Accepted TCP connection
pub struct TcpEndpoint {
    reader: Option<OwnedReadHalf>,
    writer: Arc<EndpointWriter>,
    peer: String,
}

impl TcpEndpoint {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Some(reader),
            writer: Arc::new(EndpointWriter::new(writer)),
            peer: peer.to_string(),
        }
    }
}

#[async_trait]
impl LocalEndpoint for TcpEndpoint {
    async fn recv(&mut self, max_bytes: usize) -> io::Result<Bytes> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Bytes::new());
        };

        let mut buffer = BytesMut::zeroed(max_bytes);
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            self.reader = None;
        }
        buffer.truncate(n);
        Ok(buffer.freeze())
    }

    fn inbound_sink(&self) -> Arc<dyn InboundSink> {
        self.writer.clone()
    }

    async fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        if matches!(how, Shutdown::Read | Shutdown::Both) {
            self.reader = None;
        }
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            self.writer.shutdown().await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.reader = None;
        self.writer.close().await;
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
