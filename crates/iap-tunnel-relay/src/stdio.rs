//! Standard streams as a local endpoint
//!
//! [`StdioEndpoint`] lets the relay treat "pipe to my own process" exactly
//! like an accepted TCP connection. Writes go to stdout and are flushed per
//! delivery. Reads go through a [`ByteSource`], of which there are two:
//!
//! - [`PollingFdSource`] (unix): the descriptor is switched to non-blocking
//!   for the duration of one read and polled, so a read stays responsive to
//!   the closed flag and to cancellation.
//! - [`ReaderSource`]: a plain async read. Used for stdin where the console
//!   cannot be read without blocking; a read already in progress cannot be
//!   interrupted, the closed flag is only seen by the next call.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use iap_tunnel_session::InboundSink;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::debug;

use crate::endpoint::{EndpointWriter, LocalEndpoint};

/// Cancellable source of bytes
#[async_trait]
pub trait ByteSource: Send {
    /// Read up to `max_bytes`; empty means end of stream
    ///
    /// Implementations return empty as soon as they observe `closed`.
    async fn read_chunk(&mut self, max_bytes: usize, closed: &AtomicBool) -> io::Result<Bytes>;
}

/// Byte source over any async reader
pub struct ReaderSource<R> {
    reader: R,
}

impl<R> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R> ByteSource for ReaderSource<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn read_chunk(&mut self, max_bytes: usize, closed: &AtomicBool) -> io::Result<Bytes> {
        if closed.load(Ordering::SeqCst) {
            return Ok(Bytes::new());
        }
        let mut buffer = BytesMut::zeroed(max_bytes);
        let n = self.reader.read(&mut buffer).await?;
        buffer.truncate(n);
        Ok(buffer.freeze())
    }
}

#[cfg(unix)]
pub use self::unix::PollingFdSource;

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::{AsRawFd, RawFd};

    /// Restores a descriptor's original status flags when dropped
    struct NonBlockingGuard {
        fd: RawFd,
        original: libc::c_int,
        changed: bool,
    }

    impl NonBlockingGuard {
        fn enable(fd: RawFd) -> io::Result<Self> {
            // SAFETY: F_GETFL only reads the status flags of an open descriptor.
            let original = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if original < 0 {
                return Err(io::Error::last_os_error());
            }
            if original & libc::O_NONBLOCK != 0 {
                return Ok(Self {
                    fd,
                    original,
                    changed: false,
                });
            }

            // SAFETY: setting O_NONBLOCK on an open descriptor.
            if unsafe { libc::fcntl(fd, libc::F_SETFL, original | libc::O_NONBLOCK) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                fd,
                original,
                changed: true,
            })
        }
    }

    impl Drop for NonBlockingGuard {
        fn drop(&mut self) {
            if self.changed {
                // SAFETY: restoring flags previously read from the same descriptor.
                unsafe {
                    libc::fcntl(self.fd, libc::F_SETFL, self.original);
                }
            }
        }
    }

    /// Non-blocking polling reader over a raw descriptor
    pub struct PollingFdSource<F> {
        handle: F,
        poll_interval: Duration,
    }

    impl<F: AsRawFd> PollingFdSource<F> {
        pub fn new(handle: F, poll_interval: Duration) -> Self {
            Self {
                handle,
                poll_interval,
            }
        }
    }

    #[async_trait]
    impl<F> ByteSource for PollingFdSource<F>
    where
        F: AsRawFd + Send,
    {
        async fn read_chunk(
            &mut self,
            max_bytes: usize,
            closed: &AtomicBool,
        ) -> io::Result<Bytes> {
            let fd = self.handle.as_raw_fd();
            let mut buffer = vec![0u8; max_bytes];

            // Dropped on every exit path, including this future being cancelled.
            let _guard = NonBlockingGuard::enable(fd)?;

            loop {
                if closed.load(Ordering::SeqCst) {
                    return Ok(Bytes::new());
                }

                // SAFETY: buffer is valid for buffer.len() writable bytes.
                let n = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
                if n >= 0 {
                    buffer.truncate(n as usize);
                    return Ok(Bytes::from(buffer));
                }

                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => tokio::time::sleep(self.poll_interval).await,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err),
                }
            }
        }
    }
}

/// Source used for the process's stdin on this platform
#[cfg(unix)]
pub type StdinSource = PollingFdSource<std::io::Stdin>;

/// Source used for the process's stdin on this platform
#[cfg(not(unix))]
pub type StdinSource = ReaderSource<tokio::io::Stdin>;

/// Duplex adapter presenting a byte source and a writer as one endpoint
pub struct StdioEndpoint<S> {
    source: S,
    read_closed: Arc<AtomicBool>,
    eof: bool,
    writer: Arc<EndpointWriter>,
}

impl StdioEndpoint<StdinSource> {
    /// Wrap the process's stdin and stdout
    pub fn stdio(poll_interval: Duration) -> Self {
        #[cfg(unix)]
        let source = PollingFdSource::new(std::io::stdin(), poll_interval);

        #[cfg(not(unix))]
        let source = {
            let _ = poll_interval;
            ReaderSource::new(tokio::io::stdin())
        };

        Self::new(source, tokio::io::stdout())
    }
}

impl<S: ByteSource> StdioEndpoint<S> {
    pub fn new<W>(source: S, sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let read_closed = Arc::new(AtomicBool::new(false));
        let writer = EndpointWriter::new(sink).with_read_closed_flag(read_closed.clone());
        Self {
            source,
            read_closed,
            eof: false,
            writer: Arc::new(writer),
        }
    }

    /// Flag that ends reading when raised
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.read_closed.clone()
    }
}

#[async_trait]
impl<S: ByteSource> LocalEndpoint for StdioEndpoint<S> {
    async fn recv(&mut self, max_bytes: usize) -> io::Result<Bytes> {
        if self.eof {
            return Ok(Bytes::new());
        }

        let data = self.source.read_chunk(max_bytes, &self.read_closed).await?;
        if data.is_empty() {
            debug!("End of input on stdin");
            self.eof = true;
            self.read_closed.store(true, Ordering::SeqCst);
        }
        Ok(data)
    }

    fn inbound_sink(&self) -> Arc<dyn InboundSink> {
        self.writer.clone()
    }

    async fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        if matches!(how, Shutdown::Read | Shutdown::Both) {
            self.read_closed.store(true, Ordering::SeqCst);
        }
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            self.writer.shutdown().await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.shutdown(Shutdown::Both).await {
            debug!("Ignoring error while closing stdio endpoint: {}", e);
        }
    }

    fn peer(&self) -> &str {
        "stdio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    type MemoryEndpoint = StdioEndpoint<ReaderSource<Cursor<Vec<u8>>>>;

    fn memory_endpoint(input: &[u8]) -> (MemoryEndpoint, tokio::io::DuplexStream) {
        let (sink, output) = tokio::io::duplex(1024);
        let endpoint = StdioEndpoint::new(ReaderSource::new(Cursor::new(input.to_vec())), sink);
        (endpoint, output)
    }

    #[tokio::test]
    async fn test_eof_is_idempotent() {
        let (mut endpoint, _output) = memory_endpoint(b"abc");

        assert_eq!(endpoint.recv(16).await.unwrap(), Bytes::from_static(b"abc"));
        for _ in 0..5 {
            assert!(endpoint.recv(16).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_recv_chunks_to_max() {
        let (mut endpoint, _output) = memory_endpoint(b"0123456789");

        let mut chunks = Vec::new();
        loop {
            let chunk = endpoint.recv(4).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            chunks.push(chunk);
        }
        assert_eq!(chunks, vec!["0123", "4567", "89"]);
    }

    #[tokio::test]
    async fn test_send_reaches_writer() {
        let (endpoint, mut output) = memory_endpoint(b"");
        let sink = endpoint.inbound_sink();

        sink.deliver(Bytes::from_static(b"response")).await.unwrap();
        sink.remote_closed().await;

        let mut written = Vec::new();
        output.read_to_end(&mut written).await.unwrap();
        assert_eq!(written, b"response");
    }

    #[tokio::test]
    async fn test_shutdown_read_ends_input() {
        let (mut endpoint, _output) = memory_endpoint(b"never read");

        endpoint.shutdown(Shutdown::Read).await.unwrap();
        assert!(endpoint.recv(16).await.unwrap().is_empty());
        assert!(endpoint.recv(16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_close_ends_input() {
        let (mut endpoint, _output) = memory_endpoint(b"pending");
        endpoint.inbound_sink().remote_closed().await;

        assert!(endpoint.recv(16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_never_fails_and_blocks_writes() {
        let (mut endpoint, _output) = memory_endpoint(b"abc");
        let sink = endpoint.inbound_sink();

        endpoint.close().await;
        endpoint.close().await;

        assert!(endpoint.recv(16).await.unwrap().is_empty());
        assert!(sink.deliver(Bytes::from_static(b"x")).await.is_err());
    }

    #[cfg(unix)]
    mod polling {
        use crate::endpoint::LocalEndpoint;
        use crate::stdio::{PollingFdSource, StdioEndpoint};
        use bytes::Bytes;
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;
        use std::sync::atomic::Ordering;
        use std::time::Duration;

        fn is_nonblocking(fd: std::os::unix::io::RawFd) -> bool {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            flags & libc::O_NONBLOCK != 0
        }

        fn polling_endpoint() -> (StdioEndpoint<PollingFdSource<UnixStream>>, UnixStream, i32) {
            let (ours, theirs) = UnixStream::pair().unwrap();
            let fd = ours.as_raw_fd();
            let source = PollingFdSource::new(ours, Duration::from_millis(1));
            (StdioEndpoint::new(source, tokio::io::sink()), theirs, fd)
        }

        #[tokio::test]
        async fn test_polling_read_and_eof() {
            let (mut endpoint, mut peer, fd) = polling_endpoint();

            peer.write_all(b"xyz").unwrap();
            assert_eq!(endpoint.recv(16).await.unwrap(), Bytes::from_static(b"xyz"));
            assert!(!is_nonblocking(fd));

            drop(peer);
            assert!(endpoint.recv(16).await.unwrap().is_empty());
            assert!(endpoint.recv(16).await.unwrap().is_empty());
            assert!(!is_nonblocking(fd));
        }

        #[tokio::test]
        async fn test_read_error_restores_flags() {
            // read(2) on a directory fails with EISDIR.
            let dir = std::fs::File::open(std::env::temp_dir()).unwrap();
            let fd = dir.as_raw_fd();
            let source = PollingFdSource::new(dir, Duration::from_millis(1));
            let mut endpoint = StdioEndpoint::new(source, tokio::io::sink());

            let err = endpoint.recv(16).await.unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EISDIR));
            assert!(!is_nonblocking(fd));
        }

        #[tokio::test]
        async fn test_closed_flag_unblocks_pending_read() {
            let (mut endpoint, _peer, _fd) = polling_endpoint();
            let flag = endpoint.closed_flag();

            let reader = tokio::spawn(async move { endpoint.recv(16).await });
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);

            let result = tokio::time::timeout(Duration::from_secs(1), reader)
                .await
                .expect("read did not observe the closed flag")
                .unwrap();
            assert!(result.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_cancelled_read_restores_flags() {
            let (mut endpoint, _peer, fd) = polling_endpoint();

            let timed_out =
                tokio::time::timeout(Duration::from_millis(20), endpoint.recv(16)).await;
            assert!(timed_out.is_err());
            assert!(!is_nonblocking(fd));
        }
    }
}
