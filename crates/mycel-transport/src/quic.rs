//! QUIC links (`quic://host:port`).
//!
//! Each link is one bidirectional stream on its own QUIC connection. The
//! TLS layer reuses the node's self-signed identity with the `mycel` ALPN.

use crate::listener::ChannelListener;
use crate::tcp;
use crate::tls::{self, TlsIdentity};
use crate::transport::{
    DialOptions, LinkConn, LinkListener, LinkProtocol, TransportError, TransportResult,
};
use crate::TransportConfig;
use async_trait::async_trait;
use mycel_crypto::SigningKey;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Connection, Endpoint, EndpointConfig, RecvStream, SendStream, VarInt};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;
use url::Url;

/// ALPN protocol identifier for QUIC links
pub const ALPN: &[u8] = b"mycel";

const MAX_IDLE_MS: u32 = 60_000;
const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// `quic://host:port`
#[derive(Clone)]
pub struct QuicProtocol {
    config: TransportConfig,
    client: quinn::ClientConfig,
    server: quinn::ServerConfig,
}

impl std::fmt::Debug for QuicProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicProtocol")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(VarInt::from_u32(MAX_IDLE_MS).into()));
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    Arc::new(transport)
}

impl QuicProtocol {
    /// Create a QUIC adapter for the node identified by `key`
    ///
    /// # Errors
    /// Returns `TransportError::Tls` if the QUIC crypto configs cannot be built.
    pub fn new(config: TransportConfig, key: &SigningKey) -> TransportResult<Self> {
        let identity = TlsIdentity::new(key, &[ALPN])?;

        let client_crypto = QuicClientConfig::try_from(identity.client_config())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let mut client = quinn::ClientConfig::new(Arc::new(client_crypto));
        client.transport_config(transport_config());

        let server_crypto = QuicServerConfig::try_from(identity.server_config())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let mut server = quinn::ServerConfig::with_crypto(Arc::new(server_crypto));
        server.transport_config(transport_config());

        Ok(Self {
            config,
            client,
            server,
        })
    }
}

#[async_trait]
impl LinkProtocol for QuicProtocol {
    async fn dial(&self, url: &Url, options: &DialOptions) -> TransportResult<LinkConn> {
        let (host, port) = tcp::host_port(url)?;
        let mut remote = tcp::resolve(&host, port).await?[0];
        let source_interface = options.source_interface.as_deref();
        tcp::scope_link_local(&mut remote, source_interface)?;
        let endpoint = client_endpoint(&remote, source_interface)?;
        let server_name = tls::sni_for(url).unwrap_or_else(|| remote.ip().to_string());

        let connecting = endpoint
            .connect_with(self.client.clone(), remote, &server_name)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let connection = tokio::time::timeout(self.config.dial_timeout, connecting)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let local = endpoint.local_addr()?.to_string();
        let stream = QuicStream {
            send,
            recv,
            _connection: connection,
            _endpoint: Some(endpoint),
        };
        Ok(LinkConn::new(stream, local, remote.to_string()))
    }

    async fn listen(
        &self,
        url: &Url,
        source_interface: Option<&str>,
    ) -> TransportResult<Box<dyn LinkListener>> {
        let addr = tcp::listen_addr(url, source_interface).await?;
        let endpoint = Endpoint::server(self.server.clone(), addr)
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        let local = endpoint.local_addr()?;

        let (tx, rx) = ChannelListener::channel();
        let timeout = self.config.dial_timeout;
        let task = tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                if tx.is_closed() {
                    break;
                }
                let tx = tx.clone();
                tokio::spawn(async move {
                    let accept = async {
                        let connection = incoming.await?;
                        let (send, recv) = connection.accept_bi().await?;
                        Ok::<_, quinn::ConnectionError>((connection, send, recv))
                    };
                    match tokio::time::timeout(timeout, accept).await {
                        Ok(Ok((connection, send, recv))) => {
                            let remote = connection.remote_address().to_string();
                            let stream = QuicStream {
                                send,
                                recv,
                                _connection: connection,
                                _endpoint: None,
                            };
                            let _ = tx.send(Ok(LinkConn::new(stream, local.to_string(), remote))).await;
                        }
                        Ok(Err(e)) => debug!("QUIC accept failed: {}", e),
                        Err(_) => debug!("QUIC accept timed out"),
                    }
                });
            }
            endpoint.close(VarInt::from_u32(0), b"closed");
        });

        Ok(Box::new(ChannelListener::new(rx, local.to_string(), vec![task])))
    }
}

/// Client endpoint on an ephemeral port, bound to `source_interface` if set
fn client_endpoint(remote: &SocketAddr, source_interface: Option<&str>) -> TransportResult<Endpoint> {
    let bind: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    #[cfg(target_os = "linux")]
    if let Some(name) = source_interface {
        socket.bind_device(Some(name.as_bytes()))?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = source_interface;
    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;

    let runtime = quinn::default_runtime()
        .ok_or_else(|| io::Error::other("no async runtime found"))?;
    Ok(Endpoint::new(
        EndpointConfig::default(),
        None,
        socket.into(),
        runtime,
    )?)
}

/// One QUIC bidirectional stream presented as a byte stream.
///
/// Holds the connection (and, for dialled links, the client endpoint) so
/// they live exactly as long as the link.
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    _connection: Connection,
    _endpoint: Option<Endpoint>,
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}
