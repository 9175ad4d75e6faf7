//! WebSocket links (`ws://host:port/path`, `wss://host:port/path`).
//!
//! Link bytes travel as binary messages. Both sides must agree on the
//! `mycel-ws` subprotocol; listeners reject upgrades that do not offer it.

use crate::listener::ChannelListener;
use crate::tcp::{self, TcpLinkListener};
use crate::tls::{self, TlsIdentity};
use crate::transport::{
    DialOptions, LinkConn, LinkListener, LinkProtocol, LinkStream, TransportError,
    TransportResult,
};
use crate::TransportConfig;
use async_trait::async_trait;
use futures::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

/// WebSocket subprotocol spoken on links
pub const WS_SUBPROTOCOL: &str = "mycel-ws";

const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// `ws://` and `wss://`
#[derive(Debug, Clone)]
pub struct WsProtocol {
    config: TransportConfig,
    tls: Option<TlsIdentity>,
}

impl WsProtocol {
    /// Plain WebSocket over TCP
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config, tls: None }
    }

    /// WebSocket over TLS
    #[must_use]
    pub fn secure(config: TransportConfig, identity: TlsIdentity) -> Self {
        Self {
            config,
            tls: Some(identity),
        }
    }
}

fn offers_subprotocol(value: Option<&HeaderValue>) -> bool {
    value
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|p| p.trim() == WS_SUBPROTOCOL))
}

async fn client_handshake<S: LinkStream>(url: &Url, stream: S) -> TransportResult<WsStream<S>> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
    request
        .headers_mut()
        .insert(PROTOCOL_HEADER, HeaderValue::from_static(WS_SUBPROTOCOL));
    let (ws, response) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("websocket: {e}")))?;
    if !offers_subprotocol(response.headers().get(PROTOCOL_HEADER)) {
        return Err(TransportError::ConnectionFailed(
            "websocket: server did not accept subprotocol".into(),
        ));
    }
    Ok(WsStream::new(ws))
}

async fn server_handshake<S: LinkStream>(stream: S) -> TransportResult<WsStream<S>> {
    let check = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if !offers_subprotocol(request.headers().get(PROTOCOL_HEADER)) {
            let mut reject = ErrorResponse::new(Some("missing subprotocol".to_string()));
            *reject.status_mut() = StatusCode::BAD_REQUEST;
            return Err(reject);
        }
        response
            .headers_mut()
            .insert(PROTOCOL_HEADER, HeaderValue::from_static(WS_SUBPROTOCOL));
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, check)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("websocket: {e}")))?;
    Ok(WsStream::new(ws))
}

#[async_trait]
impl LinkProtocol for WsProtocol {
    async fn dial(&self, url: &Url, options: &DialOptions) -> TransportResult<LinkConn> {
        let stream = tcp::dial_url(
            url,
            options.source_interface.as_deref(),
            self.config.dial_timeout,
        )
        .await?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let upgrade = async {
            match &self.tls {
                None => Ok::<_, TransportError>(LinkConn::new(
                    client_handshake(url, stream).await?,
                    local.to_string(),
                    remote.to_string(),
                )),
                Some(identity) => {
                    let sni = tls::sni_for(url);
                    let stream = identity.connect(stream, sni.as_deref(), remote.ip()).await?;
                    Ok::<_, TransportError>(LinkConn::new(
                        client_handshake(url, stream).await?,
                        local.to_string(),
                        remote.to_string(),
                    ))
                }
            }
        };
        tokio::time::timeout(self.config.dial_timeout, upgrade)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn listen(
        &self,
        url: &Url,
        source_interface: Option<&str>,
    ) -> TransportResult<Box<dyn LinkListener>> {
        let listener = tcp::listen_url(url, source_interface, self.config.backlog).await?;
        let inner = TcpLinkListener::from(listener);
        let tls = self.tls.clone();
        Ok(Box::new(ChannelListener::upgrading(
            inner,
            self.config.dial_timeout,
            move |stream| {
                let tls = tls.clone();
                async move {
                    let local = stream.local_addr()?.to_string();
                    let remote = stream.peer_addr()?.to_string();
                    let conn = match tls {
                        None => LinkConn::new(server_handshake(stream).await?, local, remote),
                        Some(identity) => {
                            let stream = identity.accept(stream).await?;
                            LinkConn::new(server_handshake(stream).await?, local, remote)
                        }
                    };
                    Ok::<_, TransportError>(conn)
                }
            },
        )))
    }
}

/// Byte stream over binary WebSocket messages
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    pending: Vec<u8>,
    pos: usize,
}

impl<S> WsStream<S> {
    fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

fn ws_io_error(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::other(e)
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.pos < self.pending.len() {
                let n = buf.remaining().min(self.pending.len() - self.pos);
                let start = self.pos;
                buf.put_slice(&self.pending[start..start + n]);
                self.pos += n;
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) | Poll::Ready(Some(Ok(Message::Close(_)))) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.pending = data;
                    self.pos = 0;
                }
                // Control frames are answered by tungstenite itself
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_io_error(e))),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Sink::<Message>::poll_ready(Pin::new(&mut self.inner), cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_io_error(e))),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_io_error)?;
        // Push the frame towards the socket; completion is checked on flush
        let _ = Sink::<Message>::poll_flush(Pin::new(&mut self.inner), cx);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Sink::<Message>::poll_flush(Pin::new(&mut self.inner), cx).map_err(ws_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Sink::<Message>::poll_close(Pin::new(&mut self.inner), cx).map_err(ws_io_error)
    }
}
