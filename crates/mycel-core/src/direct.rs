//! Direct-neighbour routing fabric.
//!
//! Delivers payloads only between nodes that share a link. Each link is
//! framed with a length-delimited codec:
//!
//! ```text
//! [len u32][0x00][payload]                 traffic
//! [len u32][0x01][dest key 32B][payload]   out-of-band
//! ```
//!
//! Out-of-band messages go to the neighbour whose key is closest to the
//! (possibly partial) destination by XOR distance. There is no multi-hop
//! forwarding.

use crate::fabric::{FabricSelf, OobHandler, PathNotify, RoutingFabric};
use crate::node::{NodeError, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use mycel_crypto::{PublicKey, ED25519_PUBLIC_KEY_SIZE};
use mycel_transport::BoxedStream;
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const FRAME_TRAFFIC: u8 = 0x00;
const FRAME_OOB: u8 = 0x01;

/// Frame kind plus destination key
const FRAME_OVERHEAD: usize = 1 + ED25519_PUBLIC_KEY_SIZE;

/// Outbound frames queued per link
const LINK_QUEUE_DEPTH: usize = 256;

/// Inbound payloads queued for `read_from`
const INBOUND_QUEUE_DEPTH: usize = 1024;

struct PeerLink {
    id: u64,
    priority: u8,
    tx: mpsc::Sender<Bytes>,
}

/// Fabric that only reaches directly linked peers
pub struct DirectFabric {
    key: PublicKey,
    mtu: u64,
    peers: Mutex<HashMap<PublicKey, Vec<PeerLink>>>,
    inbound_tx: mpsc::Sender<(Vec<u8>, PublicKey)>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, PublicKey)>>,
    oob_handler: RwLock<Option<OobHandler>>,
    path_notify: RwLock<Option<PathNotify>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl DirectFabric {
    /// Fabric for the node holding `key`
    #[must_use]
    pub fn new(key: PublicKey, mtu: u64) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        Self {
            key,
            mtu,
            peers: Mutex::new(HashMap::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            oob_handler: RwLock::new(None),
            path_notify: RwLock::new(None),
            next_id: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Preferred link to `key`: lowest priority value wins
    fn sender_for(&self, key: &PublicKey) -> Option<mpsc::Sender<Bytes>> {
        let peers = self.peers.lock();
        peers
            .get(key)?
            .iter()
            .min_by_key(|link| link.priority)
            .map(|link| link.tx.clone())
    }

    /// Neighbour closest to `dest` by XOR distance
    fn closest_to(&self, dest: &PublicKey) -> Option<(PublicKey, mpsc::Sender<Bytes>)> {
        let peers = self.peers.lock();
        peers
            .iter()
            .filter_map(|(key, links)| {
                let link = links.iter().min_by_key(|link| link.priority)?;
                Some((*key, link.tx.clone()))
            })
            .min_by_key(|(key, _)| xor_distance(key, dest))
    }

    fn register(&self, key: PublicKey, priority: u8, tx: mpsc::Sender<Bytes>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers
            .lock()
            .entry(key)
            .or_default()
            .push(PeerLink { id, priority, tx });
        id
    }

    fn unregister(&self, key: &PublicKey, id: u64) {
        let mut peers = self.peers.lock();
        if let Some(links) = peers.get_mut(key) {
            links.retain(|link| link.id != id);
            if links.is_empty() {
                peers.remove(key);
            }
        }
    }

    fn notify_path(&self, key: PublicKey) {
        let notify = self.path_notify.read().clone();
        if let Some(notify) = notify {
            notify(key);
        }
    }

    async fn dispatch(&self, from: PublicKey, mut frame: BytesMut) {
        if frame.is_empty() {
            return;
        }
        let kind = frame[0];
        let body = frame.split_off(1);
        match kind {
            FRAME_TRAFFIC => {
                // Receiver gone means the fabric is shutting down
                let _ = self.inbound_tx.send((body.to_vec(), from)).await;
            }
            FRAME_OOB if body.len() >= ED25519_PUBLIC_KEY_SIZE => {
                let Ok(to) = PublicKey::from_slice(&body[..ED25519_PUBLIC_KEY_SIZE]) else {
                    return;
                };
                let handler = self.oob_handler.read().clone();
                if let Some(handler) = handler {
                    handler(from, to, body[ED25519_PUBLIC_KEY_SIZE..].to_vec());
                }
            }
            other => trace!("Dropping frame of kind {} from {}", other, from),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(NodeError::InvalidState(Cow::Borrowed("fabric closed")));
        }
        Ok(())
    }
}

fn xor_distance(a: &PublicKey, b: &PublicKey) -> [u8; ED25519_PUBLIC_KEY_SIZE] {
    let mut out = [0u8; ED25519_PUBLIC_KEY_SIZE];
    for (o, (x, y)) in out.iter_mut().zip(a.as_bytes().iter().zip(b.as_bytes())) {
        *o = x ^ y;
    }
    out
}

fn frame(kind: u8, dest: Option<&PublicKey>, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_u8(kind);
    if let Some(dest) = dest {
        buf.put_slice(dest.as_bytes());
    }
    buf.put_slice(payload);
    buf.freeze()
}

#[async_trait]
impl RoutingFabric for DirectFabric {
    async fn write_to(&self, payload: &[u8], dest: &PublicKey) -> Result<usize> {
        self.check_open()?;
        if payload.len() as u64 > self.mtu {
            return Err(NodeError::invalid_packet("payload exceeds fabric mtu"));
        }
        let tx = self
            .sender_for(dest)
            .ok_or_else(|| NodeError::NoRoute(dest.to_hex()))?;
        tx.send(frame(FRAME_TRAFFIC, None, payload))
            .await
            .map_err(|_| NodeError::NoRoute(dest.to_hex()))?;
        Ok(payload.len())
    }

    async fn read_from(&self) -> Result<(Vec<u8>, PublicKey)> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg.ok_or(NodeError::InvalidState(Cow::Borrowed("fabric closed"))),
            () = self.closed.cancelled() => Err(NodeError::InvalidState(Cow::Borrowed("fabric closed"))),
        }
    }

    async fn send_out_of_band(&self, dest: &PublicKey, payload: &[u8]) -> Result<()> {
        self.check_open()?;
        let (next, tx) = self
            .closest_to(dest)
            .ok_or_else(|| NodeError::NoRoute(dest.to_hex()))?;
        tx.send(frame(FRAME_OOB, Some(dest), payload))
            .await
            .map_err(|_| NodeError::NoRoute(next.to_hex()))
    }

    fn set_out_of_band_handler(&self, handler: OobHandler) {
        *self.oob_handler.write() = Some(handler);
    }

    async fn handle_conn(&self, key: PublicKey, stream: BoxedStream, priority: u8) -> Result<()> {
        self.check_open()?;
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.mtu as usize + FRAME_OVERHEAD)
            .new_codec();
        let (mut sink, mut frames) = Framed::new(stream, codec).split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(LINK_QUEUE_DEPTH);

        let id = self.register(key, priority, tx);
        debug!("Fabric link {} up to {}", id, key);
        self.notify_path(key);

        let writer = async {
            while let Some(frame) = rx.recv().await {
                sink.send(frame).await?;
            }
            Ok::<_, NodeError>(())
        };
        let reader = async {
            while let Some(frame) = frames.next().await {
                self.dispatch(key, frame?).await;
            }
            Ok::<_, NodeError>(())
        };

        let result = tokio::select! {
            r = writer => r,
            r = reader => r,
            () = self.closed.cancelled() => Ok(()),
        };

        self.unregister(&key, id);
        debug!("Fabric link {} down to {}", id, key);
        self.notify_path(key);
        result
    }

    fn mtu(&self) -> u64 {
        self.mtu
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn set_path_notify(&self, notify: PathNotify) {
        *self.path_notify.write() = Some(notify);
    }

    fn debug_self(&self) -> FabricSelf {
        FabricSelf {
            key: self.key,
            root: self.key,
            coords: Vec::new(),
        }
    }

    fn debug_peers(&self) -> Vec<PublicKey> {
        let mut keys: Vec<_> = self.peers.lock().keys().copied().collect();
        keys.sort();
        keys
    }

    fn debug_tree(&self) -> Vec<PublicKey> {
        let mut keys = self.debug_peers();
        keys.push(self.key);
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for DirectFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectFabric")
            .field("key", &self.key)
            .field("mtu", &self.mtu)
            .field("peers", &self.peers.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(b: u8) -> PublicKey {
        PublicKey::from_bytes([b; 32])
    }

    async fn wait_for_peer(fabric: &DirectFabric, peer: PublicKey) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !fabric.debug_peers().contains(&peer) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn linked_pair() -> (Arc<DirectFabric>, Arc<DirectFabric>) {
        let a = Arc::new(DirectFabric::new(key(1), 65535));
        let b = Arc::new(DirectFabric::new(key(2), 65535));
        let (sa, sb) = tokio::io::duplex(1 << 16);
        let fa = a.clone();
        tokio::spawn(async move { fa.handle_conn(key(2), Box::new(sa), 0).await });
        let fb = b.clone();
        tokio::spawn(async move { fb.handle_conn(key(1), Box::new(sb), 0).await });
        (a, b)
    }

    #[test]
    fn test_xor_distance_orders_by_prefix() {
        let dest = PublicKey::from_bytes([0x10; 32]);
        assert!(xor_distance(&key(0x11), &dest) < xor_distance(&key(0x30), &dest));
    }

    #[tokio::test]
    async fn test_traffic_between_neighbours() {
        let (a, b) = linked_pair();
        wait_for_peer(&a, key(2)).await;
        wait_for_peer(&b, key(1)).await;

        assert_eq!(a.write_to(b"hello", &key(2)).await.unwrap(), 5);
        let (payload, from) = b.read_from().await.unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(from, key(1));
    }

    #[tokio::test]
    async fn test_no_route() {
        let a = DirectFabric::new(key(1), 65535);
        assert!(matches!(
            a.write_to(b"x", &key(9)).await,
            Err(NodeError::NoRoute(_))
        ));
        assert!(matches!(
            a.send_out_of_band(&key(9), b"x").await,
            Err(NodeError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_band_to_partial_key() {
        let (a, b) = linked_pair();
        wait_for_peer(&a, key(2)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_out_of_band_handler(Arc::new(move |from: PublicKey, to: PublicKey, payload: Vec<u8>| {
            let _ = tx.send((from, to, payload));
        }));

        let partial = PublicKey::from_bytes([0x02; 32]);
        a.send_out_of_band(&partial, b"lookup").await.unwrap();
        let (from, to, payload) = rx.recv().await.unwrap();
        assert_eq!(from, key(1));
        assert_eq!(to, partial);
        assert_eq!(payload, b"lookup");
    }

    #[tokio::test]
    async fn test_path_notify_and_unregister() {
        let a = Arc::new(DirectFabric::new(key(1), 65535));
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.set_path_notify(Arc::new(move |k: PublicKey| {
            let _ = tx.send(k);
        }));

        let (sa, sb) = tokio::io::duplex(1024);
        let fa = a.clone();
        let task = tokio::spawn(async move { fa.handle_conn(key(3), Box::new(sa), 0).await });
        assert_eq!(rx.recv().await.unwrap(), key(3));
        assert_eq!(a.debug_tree(), vec![key(1), key(3)]);

        drop(sb);
        task.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap(), key(3));
        assert!(a.debug_peers().is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_reads() {
        let a = Arc::new(DirectFabric::new(key(1), 65535));
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.read_from().await })
        };
        a.close();
        assert!(reader.await.unwrap().is_err());
        assert!(a.write_to(b"x", &key(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let a = DirectFabric::new(key(1), 1280);
        let big = vec![0u8; 1281];
        assert!(matches!(
            a.write_to(&big, &key(2)).await,
            Err(NodeError::InvalidPacket(_))
        ));
    }
}
