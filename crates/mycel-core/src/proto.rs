//! Control protocol multiplexer.
//!
//! Proto messages ride the in-band channel behind the `Proto` session byte:
//!
//! ```text
//! [Proto][NodeInfoRequest]
//! [Proto][NodeInfoResponse][json...]
//! [Proto][Debug][GetSelfRequest | GetPeersRequest | GetTreeRequest]
//! [Proto][Debug][GetSelfResponse][json...]
//! [Proto][Debug][GetPeersResponse | GetTreeResponse][32-byte keys...]
//! ```
//!
//! All state lives in a single actor task. Each `(class, key)` pair has at
//! most one pending request; sending another replaces it. A pending request
//! that sees no response before the request timeout is dropped without
//! invoking its callback.

use crate::fabric::RoutingFabric;
use crate::node::config::ProtoConfig;
use crate::node::{NodeError, Result};
use crate::nodeinfo::build_node_info;
use crate::wire::{DebugType, ProtoType, SessionType};
use mycel_crypto::{Address, PublicKey, ED25519_PUBLIC_KEY_SIZE};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Session, proto and debug type bytes
const DEBUG_HEADER_LEN: usize = 3;

/// Invoked with the response body
pub type ResponseCallback = Box<dyn FnOnce(Vec<u8>) + Send + Sync>;

/// Kinds of request that can be pending per remote key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    /// Remote's view of itself
    SelfInfo,
    /// Remote's peers
    Peers,
    /// Remote's routing tree neighbours
    Tree,
    /// Remote's node info
    NodeInfo,
}

impl RequestClass {
    fn request_bytes(self) -> Vec<u8> {
        let proto = SessionType::Proto as u8;
        let debug = ProtoType::Debug as u8;
        match self {
            Self::SelfInfo => vec![proto, debug, DebugType::GetSelfRequest as u8],
            Self::Peers => vec![proto, debug, DebugType::GetPeersRequest as u8],
            Self::Tree => vec![proto, debug, DebugType::GetTreeRequest as u8],
            Self::NodeInfo => vec![proto, ProtoType::NodeInfoRequest as u8],
        }
    }
}

enum ProtoMsg {
    Inbound {
        from: PublicKey,
        payload: Vec<u8>,
    },
    Request {
        key: PublicKey,
        class: RequestClass,
        callback: ResponseCallback,
    },
    Expire {
        key: PublicKey,
        class: RequestClass,
        id: u64,
    },
    SetNodeInfo {
        info: Vec<u8>,
        done: oneshot::Sender<()>,
    },
    GetNodeInfo(oneshot::Sender<Vec<u8>>),
    PendingCount(oneshot::Sender<usize>),
}

struct Pending {
    id: u64,
    callback: ResponseCallback,
    timer: JoinHandle<()>,
}

/// Handle to the protocol actor
#[derive(Clone)]
pub struct ProtoHandler {
    tx: mpsc::UnboundedSender<ProtoMsg>,
    admin_timeout: Duration,
}

impl ProtoHandler {
    /// Start the actor; it stops when `cancel` fires or every handle is dropped
    pub fn spawn(
        fabric: Arc<dyn RoutingFabric>,
        config: &ProtoConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ProtoActor {
            fabric,
            node_info: b"{}".to_vec(),
            pending: HashMap::new(),
            next_id: 0,
            request_timeout: config.request_timeout,
            self_tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx, cancel));
        Self {
            tx,
            admin_timeout: config.admin_timeout,
        }
    }

    fn post(&self, msg: ProtoMsg) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| NodeError::channel("proto handler stopped"))
    }

    /// Feed a received proto payload (without its session byte)
    pub fn handle_inbound(&self, from: PublicKey, payload: Vec<u8>) {
        if self.post(ProtoMsg::Inbound { from, payload }).is_err() {
            trace!("Dropping proto message from {}: handler stopped", from);
        }
    }

    /// Send a request; `callback` runs at most once with the response body
    ///
    /// # Errors
    /// Returns `NodeError::Channel` if the actor has stopped.
    pub fn send_request(
        &self,
        key: PublicKey,
        class: RequestClass,
        callback: ResponseCallback,
    ) -> Result<()> {
        self.post(ProtoMsg::Request {
            key,
            class,
            callback,
        })
    }

    /// Send a request and wait up to the admin timeout for its response
    ///
    /// # Errors
    /// Returns `NodeError::Timeout("timeout")` if no response arrives in time
    /// or the request is replaced by a newer one.
    pub async fn call(&self, key: PublicKey, class: RequestClass) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.send_request(
            key,
            class,
            Box::new(move |body: Vec<u8>| {
                let _ = tx.send(body);
            }),
        )?;
        match tokio::time::timeout(self.admin_timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            _ => Err(NodeError::timeout("timeout")),
        }
    }

    /// Replace the local node info
    ///
    /// # Errors
    /// Returns `NodeError::NodeInfoTooLarge` and keeps the previous node info
    /// if the new object serializes to more than 16384 bytes.
    pub async fn set_node_info(&self, given: &Map<String, Value>, privacy: bool) -> Result<()> {
        let info = build_node_info(given, privacy)?;
        let (done, rx) = oneshot::channel();
        self.post(ProtoMsg::SetNodeInfo { info, done })?;
        rx.await
            .map_err(|_| NodeError::channel("proto handler stopped"))
    }

    /// The serialized local node info
    ///
    /// # Errors
    /// Returns `NodeError::Channel` if the actor has stopped.
    pub async fn node_info(&self) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.post(ProtoMsg::GetNodeInfo(tx))?;
        rx.await
            .map_err(|_| NodeError::channel("proto handler stopped"))
    }

    /// Number of requests awaiting a response
    ///
    /// # Errors
    /// Returns `NodeError::Channel` if the actor has stopped.
    pub async fn pending_requests(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.post(ProtoMsg::PendingCount(tx))?;
        rx.await
            .map_err(|_| NodeError::channel("proto handler stopped"))
    }

    /// Remote node info, keyed by the remote's hex key
    ///
    /// # Errors
    /// Returns `NodeError::Timeout("timeout")` or a serialization error if the
    /// response is not JSON.
    pub async fn get_node_info(&self, key: PublicKey) -> Result<Value> {
        let body = self.call(key, RequestClass::NodeInfo).await?;
        let info: Value = serde_json::from_slice(&body)?;
        Ok(keyed(key.to_hex(), info))
    }

    /// Remote self info, keyed by the remote's overlay address
    ///
    /// # Errors
    /// Returns `NodeError::Timeout("timeout")` or a serialization error.
    pub async fn remote_get_self(&self, key: PublicKey) -> Result<Value> {
        let body = self.call(key, RequestClass::SelfInfo).await?;
        let info: Value = serde_json::from_slice(&body)?;
        Ok(keyed(address_of(&key), info))
    }

    /// Remote peer keys, keyed by the remote's overlay address
    ///
    /// # Errors
    /// Returns `NodeError::Timeout("timeout")`.
    pub async fn remote_get_peers(&self, key: PublicKey) -> Result<Value> {
        let body = self.call(key, RequestClass::Peers).await?;
        Ok(keyed(address_of(&key), json!({ "keys": unpack_keys(&body) })))
    }

    /// Remote tree keys, keyed by the remote's overlay address
    ///
    /// # Errors
    /// Returns `NodeError::Timeout("timeout")`.
    pub async fn remote_get_tree(&self, key: PublicKey) -> Result<Value> {
        let body = self.call(key, RequestClass::Tree).await?;
        Ok(keyed(address_of(&key), json!({ "keys": unpack_keys(&body) })))
    }
}

impl std::fmt::Debug for ProtoHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtoHandler")
            .field("admin_timeout", &self.admin_timeout)
            .finish_non_exhaustive()
    }
}

fn keyed(name: String, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(name, value);
    Value::Object(map)
}

fn address_of(key: &PublicKey) -> String {
    Address::for_key(key).to_ipv6().to_string()
}

/// Concatenate keys, stopping before the message would exceed `mtu`
fn pack_keys(keys: &[PublicKey], mtu: u64) -> Vec<u8> {
    let mut out = Vec::new();
    for key in keys {
        if (DEBUG_HEADER_LEN + out.len() + ED25519_PUBLIC_KEY_SIZE) as u64 > mtu {
            break;
        }
        out.extend_from_slice(key.as_bytes());
    }
    out
}

fn unpack_keys(body: &[u8]) -> Vec<String> {
    body.chunks_exact(ED25519_PUBLIC_KEY_SIZE)
        .map(hex::encode)
        .collect()
}

struct ProtoActor {
    fabric: Arc<dyn RoutingFabric>,
    node_info: Vec<u8>,
    pending: HashMap<(RequestClass, PublicKey), Pending>,
    next_id: u64,
    request_timeout: Duration,
    self_tx: mpsc::WeakUnboundedSender<ProtoMsg>,
}

impl ProtoActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ProtoMsg>, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                () = cancel.cancelled() => break,
            };
            match msg {
                ProtoMsg::Inbound { from, payload } => self.handle_inbound(from, &payload).await,
                ProtoMsg::Request {
                    key,
                    class,
                    callback,
                } => self.send_request(key, class, callback).await,
                ProtoMsg::Expire { key, class, id } => self.expire(key, class, id),
                ProtoMsg::SetNodeInfo { info, done } => {
                    self.node_info = info;
                    let _ = done.send(());
                }
                ProtoMsg::GetNodeInfo(reply) => {
                    let _ = reply.send(self.node_info.clone());
                }
                ProtoMsg::PendingCount(reply) => {
                    let _ = reply.send(self.pending.len());
                }
            }
        }
        for (_, pending) in self.pending.drain() {
            pending.timer.abort();
        }
        debug!("Proto handler stopped");
    }

    async fn send_request(&mut self, key: PublicKey, class: RequestClass, callback: ResponseCallback) {
        if let Some(old) = self.pending.remove(&(class, key)) {
            old.timer.abort();
        }

        let id = self.next_id;
        self.next_id += 1;
        let weak = self.self_tx.clone();
        let timeout = self.request_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(ProtoMsg::Expire { key, class, id });
            }
        });
        self.pending.insert(
            (class, key),
            Pending {
                id,
                callback,
                timer,
            },
        );
        self.send(&key, &class.request_bytes()).await;
    }

    fn expire(&mut self, key: PublicKey, class: RequestClass, id: u64) {
        if self.pending.get(&(class, key)).is_some_and(|p| p.id == id) {
            self.pending.remove(&(class, key));
            trace!("{:?} request to {} expired", class, key);
        }
    }

    fn complete(&mut self, class: RequestClass, from: PublicKey, body: &[u8]) {
        if let Some(pending) = self.pending.remove(&(class, from)) {
            pending.timer.abort();
            (pending.callback)(body.to_vec());
        }
    }

    async fn handle_inbound(&mut self, from: PublicKey, payload: &[u8]) {
        let Some((&kind, rest)) = payload.split_first() else {
            return;
        };
        match ProtoType::try_from(kind) {
            Ok(ProtoType::Dummy) => {}
            Ok(ProtoType::NodeInfoRequest) => {
                let mut out = vec![SessionType::Proto as u8, ProtoType::NodeInfoResponse as u8];
                out.extend_from_slice(&self.node_info);
                self.send(&from, &out).await;
            }
            Ok(ProtoType::NodeInfoResponse) => self.complete(RequestClass::NodeInfo, from, rest),
            Ok(ProtoType::Debug) => self.handle_debug(from, rest).await,
            Err(e) => trace!("Dropping proto message from {}: {}", from, e),
        }
    }

    async fn handle_debug(&mut self, from: PublicKey, payload: &[u8]) {
        let Some((&kind, rest)) = payload.split_first() else {
            return;
        };
        let kind = match DebugType::try_from(kind) {
            Ok(kind) => kind,
            Err(e) => {
                trace!("Dropping debug message from {}: {}", from, e);
                return;
            }
        };
        match kind {
            DebugType::Dummy => {}
            DebugType::GetSelfRequest => {
                let me = self.fabric.debug_self();
                let body = json!({
                    "key": me.key.to_hex(),
                    "root": me.root.to_hex(),
                    "coords": me.coords,
                });
                match serde_json::to_vec(&body) {
                    Ok(body) => self.send_debug(&from, DebugType::GetSelfResponse, &body).await,
                    Err(e) => debug!("Failed to encode self info: {}", e),
                }
            }
            DebugType::GetPeersRequest => {
                let body = pack_keys(&self.fabric.debug_peers(), self.fabric.mtu());
                self.send_debug(&from, DebugType::GetPeersResponse, &body).await;
            }
            DebugType::GetTreeRequest => {
                let body = pack_keys(&self.fabric.debug_tree(), self.fabric.mtu());
                self.send_debug(&from, DebugType::GetTreeResponse, &body).await;
            }
            DebugType::GetSelfResponse => self.complete(RequestClass::SelfInfo, from, rest),
            DebugType::GetPeersResponse => self.complete(RequestClass::Peers, from, rest),
            DebugType::GetTreeResponse => self.complete(RequestClass::Tree, from, rest),
        }
    }

    async fn send_debug(&self, to: &PublicKey, kind: DebugType, body: &[u8]) {
        let mut out = Vec::with_capacity(DEBUG_HEADER_LEN + body.len());
        out.extend_from_slice(&[SessionType::Proto as u8, ProtoType::Debug as u8, kind as u8]);
        out.extend_from_slice(body);
        self.send(to, &out).await;
    }

    async fn send(&self, to: &PublicKey, bytes: &[u8]) {
        if let Err(e) = self.fabric.write_to(bytes, to).await {
            debug!("Failed to send proto message to {}: {}", to, e);
        }
    }
}
