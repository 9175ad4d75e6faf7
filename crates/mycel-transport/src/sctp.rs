//! SCTP links (`sctp://host:port`), Linux only.
//!
//! Uses one-to-one style SCTP sockets, which behave like stream sockets
//! once connected, so the TCP socket plumbing is reused with a different
//! protocol number.

use crate::tcp::{self, TcpLinkListener};
use crate::transport::{DialOptions, LinkConn, LinkListener, LinkProtocol, TransportResult};
use crate::TransportConfig;
use async_trait::async_trait;
use socket2::Protocol;
use tracing::debug;
use url::Url;

const IPPROTO_SCTP: i32 = 132;

fn sctp() -> Protocol {
    Protocol::from(IPPROTO_SCTP)
}

/// `sctp://host:port`
#[derive(Debug, Clone, Default)]
pub struct SctpProtocol {
    config: TransportConfig,
}

impl SctpProtocol {
    /// Create an SCTP adapter
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LinkProtocol for SctpProtocol {
    async fn dial(&self, url: &Url, options: &DialOptions) -> TransportResult<LinkConn> {
        let (host, port) = tcp::host_port(url)?;
        let mut last_err = None;
        for addr in tcp::resolve(&host, port).await? {
            match tcp::connect_with(
                addr,
                options.source_interface.as_deref(),
                self.config.dial_timeout,
                Some(sctp()),
            )
            .await
            {
                Ok(stream) => return tcp::stream_conn(stream),
                Err(e) => {
                    debug!("Failed to dial SCTP {}: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(crate::TransportError::Closed))
    }

    async fn listen(
        &self,
        url: &Url,
        source_interface: Option<&str>,
    ) -> TransportResult<Box<dyn LinkListener>> {
        let addr = tcp::listen_addr(url, source_interface).await?;
        let listener = tcp::bind_with(addr, self.config.backlog, Some(sctp()))?;
        Ok(Box::new(TcpLinkListener::from(listener)))
    }
}
