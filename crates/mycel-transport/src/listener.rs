//! Listener plumbing for adapters that upgrade accepted streams.
//!
//! Upgrades (TLS, WebSocket) run in their own task per connection so a slow
//! or hostile client cannot stall the accept loop. Finished connections are
//! queued on a channel that [`ChannelListener::accept`] drains.

use crate::tcp::TcpLinkListener;
use crate::transport::{LinkConn, LinkListener, TransportError, TransportResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const QUEUE_DEPTH: usize = 64;

/// Listener fed by background accept tasks
pub(crate) struct ChannelListener {
    rx: mpsc::Receiver<TransportResult<LinkConn>>,
    local: String,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelListener {
    pub(crate) fn new(
        rx: mpsc::Receiver<TransportResult<LinkConn>>,
        local: String,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self { rx, local, tasks }
    }

    pub(crate) fn channel() -> (
        mpsc::Sender<TransportResult<LinkConn>>,
        mpsc::Receiver<TransportResult<LinkConn>>,
    ) {
        mpsc::channel(QUEUE_DEPTH)
    }

    /// Accept TCP streams from `inner` and upgrade each one concurrently.
    ///
    /// Upgrade failures are logged and dropped; only accept errors reach
    /// the caller.
    pub(crate) fn upgrading<F, Fut>(mut inner: TcpLinkListener, timeout: Duration, upgrade: F) -> Self
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TransportResult<LinkConn>> + Send + 'static,
    {
        let (tx, rx) = Self::channel();
        let local = inner.local_addr();
        let upgrade = Arc::new(upgrade);
        let task = tokio::spawn(async move {
            loop {
                match inner.accept_stream().await {
                    Ok(stream) => {
                        if tx.is_closed() {
                            break;
                        }
                        let peer = stream
                            .peer_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_default();
                        let tx = tx.clone();
                        let upgrade = upgrade.clone();
                        tokio::spawn(async move {
                            match tokio::time::timeout(timeout, upgrade(stream)).await {
                                Ok(Ok(conn)) => {
                                    let _ = tx.send(Ok(conn)).await;
                                }
                                Ok(Err(e)) => debug!("Upgrade from {} failed: {}", peer, e),
                                Err(_) => debug!("Upgrade from {} timed out", peer),
                            }
                        });
                    }
                    Err(e) => {
                        if tx.send(Err(e)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Self::new(rx, local, vec![task])
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl LinkListener for ChannelListener {
    async fn accept(&mut self) -> TransportResult<LinkConn> {
        self.rx.recv().await.unwrap_or(Err(TransportError::Closed))
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }
}
