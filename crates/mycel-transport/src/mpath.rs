//! Multipath links (`mpath://host1:port1/host2:port2/...`).
//!
//! Uses kernel Multipath TCP where the platform offers it, so a single
//! link can spread over several subflows. Each listed target is an
//! alternative entry point: dialling tries them in order, listening binds
//! all of them. When MPTCP sockets cannot be created the adapter falls
//! back to plain TCP.
//!
//! The source interface may be a comma-separated list; every target is
//! tried through each interface in turn.

use crate::listener::ChannelListener;
use crate::tcp::{self, TcpLinkListener};
use crate::transport::{
    DialOptions, LinkConn, LinkListener, LinkProtocol, TransportError, TransportResult,
};
use crate::TransportConfig;
use async_trait::async_trait;
use socket2::Protocol;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};
use url::Url;

#[cfg(target_os = "linux")]
const IPPROTO_MPTCP: i32 = 262;

fn mptcp() -> Option<Protocol> {
    #[cfg(target_os = "linux")]
    {
        Some(Protocol::from(IPPROTO_MPTCP))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

fn mptcp_unsupported(e: &TransportError) -> bool {
    matches!(
        e,
        TransportError::Io(io) if matches!(
            io.raw_os_error(),
            Some(libc::EPROTONOSUPPORT | libc::ENOPROTOOPT | libc::EAFNOSUPPORT)
        )
    )
}

/// All `host:port` targets named by an mpath URL
///
/// # Errors
/// Returns `TransportError::InvalidConfig` if no target is present.
pub fn targets(url: &Url) -> TransportResult<Vec<(String, u16)>> {
    let mut out = vec![tcp::host_port(url)?];
    for segment in url.path().split('/').filter(|s| !s.is_empty()) {
        let (host, port) = segment
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidConfig(format!("bad mpath target {segment}")))?;
        let port = port
            .parse()
            .map_err(|_| TransportError::InvalidConfig(format!("bad mpath port in {segment}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        out.push((host.to_string(), port));
    }
    Ok(out)
}

/// `mpath://`
#[derive(Debug, Clone, Default)]
pub struct MpathProtocol {
    config: TransportConfig,
}

impl MpathProtocol {
    /// Create a multipath adapter
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, addr: SocketAddr, sintf: Option<&str>) -> TransportResult<TcpStream> {
        if let Some(protocol) = mptcp() {
            match tcp::connect_with(addr, sintf, self.config.dial_timeout, Some(protocol)).await {
                Ok(stream) => return Ok(stream),
                // Kernel without MPTCP support
                Err(e) if mptcp_unsupported(&e) => {
                    debug!("MPTCP unavailable, using TCP to {}", addr);
                }
                Err(e) => return Err(e),
            }
        }
        tcp::connect_with(addr, sintf, self.config.dial_timeout, None).await
    }

    fn bind(&self, addr: SocketAddr) -> TransportResult<TcpListener> {
        if let Some(protocol) = mptcp() {
            match tcp::bind_with(addr, self.config.backlog, Some(protocol)) {
                Ok(listener) => return Ok(listener),
                Err(e) if mptcp_unsupported(&e) => {}
                Err(e) => return Err(e),
            }
        }
        tcp::bind(addr, self.config.backlog)
    }
}

#[async_trait]
impl LinkProtocol for MpathProtocol {
    async fn dial(&self, url: &Url, options: &DialOptions) -> TransportResult<LinkConn> {
        let interfaces: Vec<Option<&str>> = match options.source_interface.as_deref() {
            Some(list) => list.split(',').map(|s| Some(s.trim())).collect(),
            None => vec![None],
        };
        let mut last_err = None;
        for (host, port) in targets(url)? {
            let addrs = match tcp::resolve(&host, port).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!("Could not resolve mpath target {}: {}", host, e);
                    last_err = Some(e);
                    continue;
                }
            };
            for addr in addrs {
                for sintf in &interfaces {
                    match self.connect(addr, *sintf).await {
                        Ok(stream) => return tcp::stream_conn(stream),
                        Err(e) => {
                            debug!("Failed to dial mpath target {}: {}", addr, e);
                            last_err = Some(e);
                        }
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            TransportError::ConnectionFailed("no valid target hosts given".into())
        }))
    }

    async fn listen(
        &self,
        url: &Url,
        source_interface: Option<&str>,
    ) -> TransportResult<Box<dyn LinkListener>> {
        let (tx, rx) = ChannelListener::channel();
        let mut locals = Vec::new();
        let mut tasks = Vec::new();
        for (host, port) in targets(url)? {
            let mut addr = tcp::resolve(&host, port).await?[0];
            tcp::scope_link_local(&mut addr, source_interface)?;
            let mut listener = TcpLinkListener::from(self.bind(addr)?);
            locals.push(listener.local_addr());
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let accepted = listener.accept().await;
                    if tx.send(accepted).await.is_err() {
                        break;
                    }
                }
            }));
        }
        Ok(Box::new(ChannelListener::new(rx, locals.join(","), tasks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets() {
        let url = Url::parse("mpath://10.0.0.1:9000/10.0.1.1:9001/[2001:db8::1]:9002").unwrap();
        assert_eq!(
            targets(&url).unwrap(),
            vec![
                ("10.0.0.1".to_string(), 9000),
                ("10.0.1.1".to_string(), 9001),
                ("2001:db8::1".to_string(), 9002),
            ]
        );
    }

    #[test]
    fn test_targets_rejects_bad_segment() {
        let url = Url::parse("mpath://10.0.0.1:9000/nohost").unwrap();
        assert!(targets(&url).is_err());
    }

    #[tokio::test]
    async fn test_mpath_dial_listen() {
        let proto = MpathProtocol::default();
        let mut listener = proto
            .listen(&Url::parse("mpath://127.0.0.1:0").unwrap(), None)
            .await
            .unwrap();
        let bound = listener.local_addr();
        let url = Url::parse(&format!("mpath://{bound}")).unwrap();

        let dial_opts = DialOptions::default();
        let (client, server) =
            tokio::join!(proto.dial(&url, &dial_opts), listener.accept());
        assert_eq!(client.unwrap().remote, bound);
        assert!(server.is_ok());
    }
}
