//! VSOCK links between a VM and its host (`vsock://cid:port`), Linux only.
//!
//! The context ID may be numeric or one of the well-known names
//! `hypervisor`, `local` or `host`.

use crate::fd::{FdListener, FdStream};
use crate::transport::{
    DialOptions, LinkConn, LinkListener, LinkProtocol, TransportError, TransportResult,
};
use crate::TransportConfig;
use async_trait::async_trait;
use socket2::{Domain, SockAddr, Socket, Type};
use url::Url;

/// Well-known context IDs
const CID_HYPERVISOR: u32 = 0;
const CID_LOCAL: u32 = 1;
const CID_HOST: u32 = 2;

/// Parse `cid:port` from a VSOCK URL
///
/// # Errors
/// Returns `TransportError::InvalidConfig` for an unknown context name or
/// a missing port.
pub fn parse_vsock(url: &Url) -> TransportResult<(u32, u32)> {
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidConfig(format!("missing context id in {url}")))?;
    let cid = match host {
        "hypervisor" => CID_HYPERVISOR,
        "local" => CID_LOCAL,
        "host" => CID_HOST,
        other => other.parse().map_err(|_| {
            TransportError::InvalidConfig(format!("invalid vsock context id {other}"))
        })?,
    };
    let port = url
        .port()
        .ok_or_else(|| TransportError::InvalidConfig(format!("missing port in {url}")))?;
    Ok((cid, u32::from(port)))
}

fn describe(addr: &SockAddr) -> String {
    match addr.as_vsock_address() {
        Some((cid, port)) => format!("{cid}:{port}"),
        None => "vsock".to_string(),
    }
}

/// `vsock://cid:port`
#[derive(Debug, Clone, Default)]
pub struct VsockProtocol {
    config: TransportConfig,
}

impl VsockProtocol {
    /// Create a VSOCK adapter
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LinkProtocol for VsockProtocol {
    async fn dial(&self, url: &Url, _options: &DialOptions) -> TransportResult<LinkConn> {
        let (cid, port) = parse_vsock(url)?;
        let socket = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
        let addr = SockAddr::vsock(cid, port);
        let stream = tokio::time::timeout(self.config.dial_timeout, FdStream::connect(socket, &addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let local = stream
            .socket()
            .local_addr()
            .map(|a| describe(&a))
            .unwrap_or_default();
        Ok(LinkConn::new(stream, local, describe(&addr)))
    }

    async fn listen(
        &self,
        url: &Url,
        _source_interface: Option<&str>,
    ) -> TransportResult<Box<dyn LinkListener>> {
        let (cid, port) = parse_vsock(url)?;
        let socket = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
        let addr = SockAddr::vsock(cid, port);
        socket
            .bind(&addr)
            .map_err(|e| TransportError::BindFailed(format!("{}: {e}", describe(&addr))))?;
        socket.listen(self.config.backlog as i32)?;
        Ok(Box::new(VsockLinkListener {
            listener: FdListener::new(socket)?,
        }))
    }
}

/// Inbound VSOCK connections
pub struct VsockLinkListener {
    listener: FdListener,
}

#[async_trait]
impl LinkListener for VsockLinkListener {
    async fn accept(&mut self) -> TransportResult<LinkConn> {
        let (socket, peer) = self.listener.accept().await?;
        let stream = FdStream::from_accepted(socket)?;
        Ok(LinkConn::new(stream, self.local_addr(), describe(&peer)))
    }

    fn local_addr(&self) -> String {
        self.listener
            .socket()
            .local_addr()
            .map(|a| describe(&a))
            .unwrap_or_default()
    }
}
