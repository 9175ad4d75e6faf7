//! Link protocol abstraction shared by every transport adapter.
//!
//! A [`LinkProtocol`] turns a peering URL into a connected byte stream
//! ([`LinkConn`]) or into a [`LinkListener`] producing inbound streams.
//! Streams are type-erased behind [`LinkStream`] so the link manager can
//! treat a TLS-over-SOCKS connection exactly like a plain UNIX socket.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use url::Url;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Listener or connection is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Dial did not complete in time
    #[error("Connection timed out")]
    Timeout,

    /// Invalid configuration or peering URL
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No adapter for the URL scheme on this platform
    #[error("link schema unknown: {0}")]
    UnsupportedScheme(String),

    /// TLS or QUIC negotiation failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream produced by any adapter
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> LinkStream for T {}

/// Type-erased link stream
pub type BoxedStream = Box<dyn LinkStream>;

/// A connected stream plus the endpoint names it was established between.
pub struct LinkConn {
    /// The connected stream
    pub stream: BoxedStream,
    /// Local endpoint, e.g. `192.0.2.1:40123` or a socket path
    pub local: String,
    /// Remote endpoint; for proxied schemes this is the proxied target
    pub remote: String,
}

impl LinkConn {
    /// Wrap a stream with its endpoint names
    pub fn new<S: LinkStream>(stream: S, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Local endpoint without port
    #[must_use]
    pub fn local_host(&self) -> String {
        host_part(&self.local)
    }

    /// Remote endpoint without port
    #[must_use]
    pub fn remote_host(&self) -> String {
        host_part(&self.remote)
    }

    /// Local IP, when the endpoint is an IP socket
    #[must_use]
    pub fn local_ip(&self) -> Option<IpAddr> {
        parse_ip(&self.local)
    }

    /// Remote IP, when the endpoint is an IP socket
    #[must_use]
    pub fn remote_ip(&self) -> Option<IpAddr> {
        parse_ip(&self.remote)
    }
}

impl std::fmt::Debug for LinkConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkConn")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

fn parse_ip(endpoint: &str) -> Option<IpAddr> {
    if let Ok(sa) = endpoint.parse::<SocketAddr>() {
        return Some(sa.ip());
    }
    host_part(endpoint).split('%').next()?.parse().ok()
}

/// Strip a trailing `:port` from `host:port` or `[v6]:port`
#[must_use]
pub fn host_part(endpoint: &str) -> String {
    if let Ok(sa) = endpoint.parse::<SocketAddr>() {
        return sa.ip().to_string();
    }
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_string();
        }
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            host.to_string()
        }
        _ => endpoint.to_string(),
    }
}

/// Per-dial options supplied by the link manager
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Source interface to bind outbound sockets to
    pub source_interface: Option<String>,
}

/// Async link protocol trait.
///
/// One implementation exists per URL scheme. Implementations are stateless
/// with respect to the link manager and may be shared between tasks.
#[async_trait]
pub trait LinkProtocol: Send + Sync {
    /// Dial the peer named by `url`.
    ///
    /// # Arguments
    /// * `url` - Peering URL including scheme-specific query parameters
    /// * `options` - Source interface and other per-dial options
    ///
    /// # Errors
    /// Returns `TransportError` if the URL is unusable or the connection
    /// cannot be established
    async fn dial(&self, url: &Url, options: &DialOptions) -> TransportResult<LinkConn>;

    /// Start listening on the address named by `url`.
    ///
    /// # Arguments
    /// * `url` - Listen URL
    /// * `source_interface` - Interface hint, used to scope link-local binds
    ///
    /// # Errors
    /// Returns `TransportError` if binding fails
    async fn listen(
        &self,
        url: &Url,
        source_interface: Option<&str>,
    ) -> TransportResult<Box<dyn LinkListener>>;
}

/// Source of inbound connections.
///
/// Dropping the listener closes it.
#[async_trait]
pub trait LinkListener: Send {
    /// Wait for the next inbound connection.
    ///
    /// # Errors
    /// Returns `TransportError` on accept failure; the listener remains
    /// usable unless the error is [`TransportError::Closed`]
    async fn accept(&mut self) -> TransportResult<LinkConn>;

    /// The bound local address
    fn local_addr(&self) -> String;
}

/// Byte counters for one link
#[derive(Debug, Default)]
pub struct LinkCounters {
    rx: AtomicU64,
    tx: AtomicU64,
}

impl LinkCounters {
    /// Create new zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes received
    pub fn rx_bytes(&self) -> u64 {
        self.rx.load(Ordering::Relaxed)
    }

    /// Total bytes sent
    pub fn tx_bytes(&self) -> u64 {
        self.tx.load(Ordering::Relaxed)
    }

    /// Record received bytes
    pub fn record_recv(&self, bytes: usize) {
        self.rx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record sent bytes
    pub fn record_send(&self, bytes: usize) {
        self.tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Stream wrapper counting bytes in both directions
pub struct CountingStream<S> {
    inner: S,
    counters: Arc<LinkCounters>,
}

impl<S> CountingStream<S> {
    /// Wrap `inner`, reporting into `counters`
    pub fn new(inner: S, counters: Arc<LinkCounters>) -> Self {
        Self { inner, counters }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            self.counters.record_recv(buf.filled().len() - before);
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            self.counters.record_send(n);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
