//! In-memory routing fabric for unit tests.

use crate::fabric::{FabricSelf, OobHandler, PathNotify, RoutingFabric};
use crate::node::{NodeError, Result};
use async_trait::async_trait;
use mycel_crypto::PublicKey;
use mycel_transport::BoxedStream;
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

type Packet = (Vec<u8>, PublicKey);

/// Records everything written to it and replays injected payloads.
pub(crate) struct MockFabric {
    pub key: PublicKey,
    pub mtu: u64,
    pub peers: Mutex<Vec<PublicKey>>,
    writes_tx: mpsc::UnboundedSender<Packet>,
    writes_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    oob_tx: mpsc::UnboundedSender<Packet>,
    oob_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    inbound_tx: mpsc::UnboundedSender<Packet>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    conns_tx: mpsc::UnboundedSender<(PublicKey, u8)>,
    conns_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(PublicKey, u8)>>,
    oob_handler: RwLock<Option<OobHandler>>,
    path_notify: RwLock<Option<PathNotify>>,
}

impl MockFabric {
    pub fn new(key: PublicKey, mtu: u64) -> Self {
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let (oob_tx, oob_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (conns_tx, conns_rx) = mpsc::unbounded_channel();
        Self {
            key,
            mtu,
            peers: Mutex::new(Vec::new()),
            writes_tx,
            writes_rx: tokio::sync::Mutex::new(writes_rx),
            oob_tx,
            oob_rx: tokio::sync::Mutex::new(oob_rx),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            conns_tx,
            conns_rx: tokio::sync::Mutex::new(conns_rx),
            oob_handler: RwLock::new(None),
            path_notify: RwLock::new(None),
        }
    }

    /// Queue a payload for `read_from`
    pub fn inject(&self, payload: Vec<u8>, from: PublicKey) {
        let _ = self.inbound_tx.send((payload, from));
    }

    /// Invoke the installed out-of-band handler
    pub fn deliver_oob(&self, from: PublicKey, to: PublicKey, payload: Vec<u8>) {
        let handler = self.oob_handler.read().clone();
        if let Some(handler) = handler {
            handler(from, to, payload);
        }
    }

    /// Invoke the installed path-notify callback
    pub fn notify_path(&self, key: PublicKey) {
        let notify = self.path_notify.read().clone();
        if let Some(notify) = notify {
            notify(key);
        }
    }

    pub async fn next_write(&self) -> Packet {
        next(&self.writes_rx).await
    }

    pub async fn next_oob(&self) -> Packet {
        next(&self.oob_rx).await
    }

    pub async fn next_conn(&self) -> (PublicKey, u8) {
        let mut rx = self.conns_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("no connection adopted"))
    }

    pub fn try_next_conn(&self) -> Option<(PublicKey, u8)> {
        self.conns_rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn try_next_write(&self) -> Option<Packet> {
        self.writes_rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn try_next_oob(&self) -> Option<Packet> {
        self.oob_rx.try_lock().ok()?.try_recv().ok()
    }
}

async fn next(rx: &tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>) -> Packet {
    let mut rx = rx.lock().await;
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| panic!("nothing written"))
}

#[async_trait]
impl RoutingFabric for MockFabric {
    async fn write_to(&self, payload: &[u8], dest: &PublicKey) -> Result<usize> {
        let _ = self.writes_tx.send((payload.to_vec(), *dest));
        Ok(payload.len())
    }

    async fn read_from(&self) -> Result<Packet> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(NodeError::InvalidState(Cow::Borrowed("closed")))
    }

    async fn send_out_of_band(&self, dest: &PublicKey, payload: &[u8]) -> Result<()> {
        let _ = self.oob_tx.send((payload.to_vec(), *dest));
        Ok(())
    }

    fn set_out_of_band_handler(&self, handler: OobHandler) {
        *self.oob_handler.write() = Some(handler);
    }

    async fn handle_conn(&self, key: PublicKey, mut stream: BoxedStream, priority: u8) -> Result<()> {
        let _ = self.conns_tx.send((key, priority));
        // Hold the link until the remote hangs up
        let mut buf = [0u8; 256];
        while stream.read(&mut buf).await? > 0 {}
        Ok(())
    }

    fn mtu(&self) -> u64 {
        self.mtu
    }

    fn close(&self) {}

    fn set_path_notify(&self, notify: PathNotify) {
        *self.path_notify.write() = Some(notify);
    }

    fn debug_self(&self) -> FabricSelf {
        FabricSelf {
            key: self.key,
            root: self.key,
            coords: vec![1, 2],
        }
    }

    fn debug_peers(&self) -> Vec<PublicKey> {
        self.peers.lock().clone()
    }

    fn debug_tree(&self) -> Vec<PublicKey> {
        let mut keys = self.peers.lock().clone();
        keys.push(self.key);
        keys
    }
}
