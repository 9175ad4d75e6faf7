//! Plain TCP links.
//!
//! Also provides the socket helpers shared by the stream-based adapters
//! layered on top of TCP (TLS, WebSocket, SOCKS, multipath).

use crate::transport::{
    DialOptions, LinkConn, LinkListener, LinkProtocol, TransportError, TransportResult,
};
use crate::TransportConfig;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;
use url::{Host, Url};

/// `tcp://host:port`
#[derive(Debug, Clone, Default)]
pub struct TcpProtocol {
    config: TransportConfig,
}

impl TcpProtocol {
    /// Create a TCP adapter
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LinkProtocol for TcpProtocol {
    async fn dial(&self, url: &Url, options: &DialOptions) -> TransportResult<LinkConn> {
        let stream = dial_url(
            url,
            options.source_interface.as_deref(),
            self.config.dial_timeout,
        )
        .await?;
        stream_conn(stream)
    }

    async fn listen(
        &self,
        url: &Url,
        source_interface: Option<&str>,
    ) -> TransportResult<Box<dyn LinkListener>> {
        let listener = listen_url(url, source_interface, self.config.backlog).await?;
        Ok(Box::new(TcpLinkListener::from(listener)))
    }
}

/// Inbound TCP connections
pub struct TcpLinkListener {
    listener: TcpListener,
}

impl From<TcpListener> for TcpLinkListener {
    fn from(listener: TcpListener) -> Self {
        Self { listener }
    }
}

impl TcpLinkListener {
    /// Accept the next raw TCP stream
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the accept fails.
    pub async fn accept_stream(&mut self) -> TransportResult<TcpStream> {
        let (stream, _) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

#[async_trait]
impl LinkListener for TcpLinkListener {
    async fn accept(&mut self) -> TransportResult<LinkConn> {
        let stream = self.accept_stream().await?;
        stream_conn(stream)
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

pub(crate) fn stream_conn(stream: TcpStream) -> TransportResult<LinkConn> {
    let local = stream.local_addr()?.to_string();
    let remote = stream.peer_addr()?.to_string();
    Ok(LinkConn::new(stream, local, remote))
}

/// Host and port of a URL; the port is mandatory
pub(crate) fn host_port(url: &Url) -> TransportResult<(String, u16)> {
    let host = match url.host() {
        Some(Host::Domain(d)) => d.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => {
            return Err(TransportError::InvalidConfig(format!(
                "missing host in {url}"
            )));
        }
    };
    let port = url
        .port()
        .ok_or_else(|| TransportError::InvalidConfig(format!("missing port in {url}")))?;
    Ok((host, port))
}

/// Resolve `host:port` to socket addresses
pub(crate) async fn resolve(host: &str, port: u16) -> TransportResult<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(TransportError::ConnectionFailed(format!(
            "no addresses for {host}"
        )));
    }
    Ok(addrs)
}

/// Whether `ip` is a link-local unicast address
#[must_use]
pub fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Attach the interface scope to a link-local IPv6 address.
///
/// Link-local peers are only reachable through a named interface, so a
/// link-local address without one is rejected.
pub(crate) fn scope_link_local(
    addr: &mut SocketAddr,
    source_interface: Option<&str>,
) -> TransportResult<()> {
    if !is_link_local(&addr.ip()) {
        return Ok(());
    }
    let Some(name) = source_interface else {
        return Err(TransportError::InvalidConfig(format!(
            "link-local address {} requires a source interface",
            addr.ip()
        )));
    };
    if let SocketAddr::V6(v6) = addr {
        if v6.scope_id() == 0 {
            v6.set_scope_id(interface_index(name)?);
        }
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn interface_index(name: &str) -> TransportResult<u32> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| TransportError::InvalidConfig(format!("bad interface name {name:?}")))?;
    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(TransportError::InvalidConfig(format!(
            "unknown interface {name}"
        )));
    }
    Ok(index)
}

#[cfg(not(unix))]
pub(crate) fn interface_index(name: &str) -> TransportResult<u32> {
    Err(TransportError::InvalidConfig(format!(
        "interface binding unsupported for {name}"
    )))
}

/// Create an unconnected stream socket for `addr`.
///
/// `protocol` selects a non-TCP stream protocol such as SCTP or MPTCP.
pub(crate) fn new_socket(addr: &SocketAddr, protocol: Option<Protocol>) -> TransportResult<TcpSocket> {
    match protocol {
        None if addr.is_ipv4() => Ok(TcpSocket::new_v4()?),
        None => Ok(TcpSocket::new_v6()?),
        Some(protocol) => {
            let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(protocol))?;
            socket.set_nonblocking(true)?;
            Ok(TcpSocket::from_std_stream(socket.into()))
        }
    }
}

/// Connect a TCP socket to `addr`, optionally bound to an interface
pub(crate) async fn connect(
    addr: SocketAddr,
    source_interface: Option<&str>,
    timeout: Duration,
) -> TransportResult<TcpStream> {
    connect_with(addr, source_interface, timeout, None).await
}

pub(crate) async fn connect_with(
    mut addr: SocketAddr,
    source_interface: Option<&str>,
    timeout: Duration,
    protocol: Option<Protocol>,
) -> TransportResult<TcpStream> {
    scope_link_local(&mut addr, source_interface)?;
    let socket = new_socket(&addr, protocol)?;
    #[cfg(target_os = "linux")]
    if let Some(name) = source_interface {
        socket.bind_device(Some(name.as_bytes()))?;
    }
    let stream = tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)??;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Resolve a URL and connect to the first address that answers
pub(crate) async fn dial_url(
    url: &Url,
    source_interface: Option<&str>,
    timeout: Duration,
) -> TransportResult<TcpStream> {
    let (host, port) = host_port(url)?;
    dial_first(&resolve(&host, port).await?, source_interface, timeout).await
}

pub(crate) async fn dial_first(
    addrs: &[SocketAddr],
    source_interface: Option<&str>,
    timeout: Duration,
) -> TransportResult<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match connect(*addr, source_interface, timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Failed to dial {}: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| TransportError::ConnectionFailed("no addresses".into())))
}

/// Resolve the bind address named by a listen URL
pub(crate) async fn listen_addr(
    url: &Url,
    source_interface: Option<&str>,
) -> TransportResult<SocketAddr> {
    let (host, port) = host_port(url)?;
    let mut addr = resolve(&host, port).await?[0];
    scope_link_local(&mut addr, source_interface)?;
    Ok(addr)
}

/// Bind a TCP listener for a listen URL
pub(crate) async fn listen_url(
    url: &Url,
    source_interface: Option<&str>,
    backlog: u32,
) -> TransportResult<TcpListener> {
    let addr = listen_addr(url, source_interface).await?;
    bind(addr, backlog)
}

pub(crate) fn bind(addr: SocketAddr, backlog: u32) -> TransportResult<TcpListener> {
    bind_with(addr, backlog, None)
}

pub(crate) fn bind_with(
    addr: SocketAddr,
    backlog: u32,
    protocol: Option<Protocol>,
) -> TransportResult<TcpListener> {
    let socket = new_socket(&addr, protocol)?;
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
    Ok(socket.listen(backlog)?)
}
