//! Core facade - wires the link manager, key store and control protocol
//! onto a routing fabric.
//!
//! # Example
//!
//! ```no_run
//! use mycel_core::direct::DirectFabric;
//! use mycel_core::node::{Core, NodeConfig};
//! use mycel_crypto::SigningKey;
//! use rand_core::OsRng;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let key = SigningKey::generate(&mut OsRng);
//! let fabric = Arc::new(DirectFabric::new(key.public_key(), 65535));
//! let config = NodeConfig {
//!     listen: vec!["tls://[::]:0".into()],
//!     ..NodeConfig::default()
//! };
//! let core = Core::new(key, config, fabric).await?;
//! println!("address {}", core.address());
//!
//! let packet = core.read_packet().await?;
//! core.write_packet(&packet).await?;
//! core.stop();
//! # Ok(())
//! # }
//! ```

use crate::fabric::{FabricSelf, PathNotify, RoutingFabric};
use crate::keystore::{KeyStore, TunnelRouting};
use crate::link::{LinkManager, ListenerHandle, PeerInfo};
use crate::node::config::NodeConfig;
use crate::node::error::{NodeError, Result};
use crate::packet_conn::PacketConn;
use crate::proto::ProtoHandler;
use mycel_crypto::{Address, PublicKey, SigningKey, Subnet};
use mycel_transport::TransportRegistry;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Admitted packets held for [`Core::read_packet`]; newer ones are dropped
/// while it is full
const READ_QUEUE_LEN: usize = 256;

struct CoreInner {
    public_key: PublicKey,
    fabric: Arc<dyn RoutingFabric>,
    proto: ProtoHandler,
    keystore: Arc<KeyStore>,
    links: LinkManager,
    listeners: Mutex<Vec<ListenerHandle>>,
    path_notify: Arc<RwLock<Option<PathNotify>>>,
    packets: tokio::sync::Mutex<mpsc::Receiver<Result<Vec<u8>>>>,
    cancel: CancellationToken,
}

/// A running overlay node
///
/// Cloning is cheap; all clones share the same node.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Core {
    /// Start a node with every transport available on this platform
    ///
    /// # Errors
    /// Returns configuration errors, a TLS identity error, or the first
    /// listener that fails to bind.
    pub async fn new(
        signing_key: SigningKey,
        config: NodeConfig,
        fabric: Arc<dyn RoutingFabric>,
    ) -> Result<Self> {
        config.validate()?;
        let transports = TransportRegistry::new(&signing_key, config.link.transport_config())?;
        Self::with_transports(signing_key, config, fabric, transports).await
    }

    /// Start a node with a caller-supplied transport registry
    ///
    /// # Errors
    /// As [`Core::new`].
    pub async fn with_transports(
        signing_key: SigningKey,
        config: NodeConfig,
        fabric: Arc<dyn RoutingFabric>,
        transports: TransportRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let allowed = config.allowed_keys()?;
        let public_key = signing_key.public_key();
        let cancel = CancellationToken::new();

        let proto = ProtoHandler::spawn(fabric.clone(), &config.proto, cancel.clone());
        let conn = Arc::new(PacketConn::new(fabric.clone(), proto.clone()));
        let keystore = KeyStore::new(conn, signing_key, &config.key_store);
        keystore.spawn_sweeper(config.key_store.sweep_interval, cancel.clone());
        let packets = spawn_reader(Arc::clone(&keystore), cancel.clone());
        let links = LinkManager::spawn(
            transports,
            fabric.clone(),
            public_key,
            allowed,
            config.link.clone(),
            cancel.clone(),
        );

        let path_notify: Arc<RwLock<Option<PathNotify>>> = Arc::default();
        let slot = Arc::clone(&path_notify);
        fabric.set_path_notify(Arc::new(move |key: PublicKey| {
            let notify = slot.read().clone();
            if let Some(notify) = notify {
                notify(key);
            }
        }));

        let core = Self {
            inner: Arc::new(CoreInner {
                public_key,
                fabric,
                proto,
                keystore,
                links,
                listeners: Mutex::new(Vec::new()),
                path_notify,
                packets: tokio::sync::Mutex::new(packets),
                cancel,
            }),
        };
        if let Err(e) = core.start(&config).await {
            core.stop();
            return Err(e);
        }
        Ok(core)
    }

    async fn start(&self, config: &NodeConfig) -> Result<()> {
        self.inner
            .proto
            .set_node_info(&config.node_info, config.node_info_privacy)
            .await?;
        self.inner.keystore.set_mtu(config.key_store.mtu);

        for uri in &config.listen {
            let listener = self.inner.links.listen(uri, None).await?;
            self.inner.listeners.lock().push(listener);
        }
        for peer in &config.peers {
            self.inner
                .links
                .add_peer(&peer.uri, peer.source_interface.as_deref())
                .await?;
        }

        info!("Your public key is {}", self.inner.public_key);
        info!("Your IPv6 address is {}", self.address());
        info!("Your IPv6 subnet is {}", self.subnet());
        Ok(())
    }
}

/// Drain the fabric continuously so control messages are answered whether or
/// not the application is reading. Admitted packets are queued for
/// [`Core::read_packet`]; the fabric's closing error is queued last.
fn spawn_reader(keystore: Arc<KeyStore>, cancel: CancellationToken) -> mpsc::Receiver<Result<Vec<u8>>> {
    let (tx, rx) = mpsc::channel(READ_QUEUE_LEN);
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = keystore.read_packet() => next,
            };
            match next {
                Ok(packet) => match tx.try_send(Ok(packet)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!("Read queue full, dropping packet");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                },
                Err(e) => {
                    debug!("Packet reader stopped: {}", e);
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    rx
}

// ═══════════════════════════════════════════════════════════════════════════
// Identity Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Core {
    /// Node public key
    pub fn public_key(&self) -> PublicKey {
        self.inner.public_key
    }

    /// Node overlay address
    pub fn address(&self) -> Address {
        self.inner.keystore.address()
    }

    /// Node routed subnet
    pub fn subnet(&self) -> Subnet {
        self.inner.keystore.subnet()
    }

    /// Largest IP packet accepted by [`write_packet`](Self::write_packet)
    pub fn mtu(&self) -> u64 {
        self.inner.keystore.mtu()
    }

    /// Change the packet MTU, clamped to what the fabric can carry
    pub fn set_mtu(&self, mtu: u64) {
        self.inner.keystore.set_mtu(mtu);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Link Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Core {
    /// Start an additional listener
    ///
    /// # Errors
    /// Returns URI, option or bind errors.
    pub async fn listen(&self, uri: &str, source_interface: Option<&str>) -> Result<ListenerHandle> {
        self.inner.links.listen(uri, source_interface).await
    }

    /// Bound addresses of the listeners started from the configuration
    pub fn listen_addrs(&self) -> Vec<String> {
        self.inner
            .listeners
            .lock()
            .iter()
            .map(|l| l.local_addr().to_string())
            .collect()
    }

    /// Add a persistent peer
    ///
    /// # Errors
    /// Returns URI or option errors, or `NodeError::AlreadyConfigured`.
    pub async fn add_peer(&self, uri: &str, source_interface: Option<&str>) -> Result<()> {
        self.inner.links.add_peer(uri, source_interface).await
    }

    /// Remove a persistent peer
    ///
    /// # Errors
    /// Returns `NodeError::NotConfigured` if the peer was never added.
    pub async fn remove_peer(&self, uri: &str, source_interface: Option<&str>) -> Result<()> {
        self.inner.links.remove_peer(uri, source_interface).await
    }

    /// Dial a peer once, without redialling when the link drops
    ///
    /// Only one call per target and source interface runs at a time; the
    /// guard is held until the resulting link closes.
    ///
    /// # Errors
    /// Returns `NodeError::InvalidState` while the same target is already
    /// being called or cooling down, otherwise the dial, handshake or
    /// authorization error.
    pub async fn call_peer(&self, uri: &str, source_interface: Option<&str>) -> Result<()> {
        self.inner.links.connect(uri, source_interface).await?;
        Ok(())
    }

    /// Redial every persistent peer now
    ///
    /// # Errors
    /// Returns `NodeError::Channel` once stopped.
    pub fn retry_peers_now(&self) -> Result<()> {
        self.inner.links.retry_peers_now()
    }

    /// Live links
    ///
    /// # Errors
    /// Returns `NodeError::Channel` once stopped.
    pub async fn get_peers(&self) -> Result<Vec<PeerInfo>> {
        self.inner.links.get_peers().await
    }

    /// The link manager
    pub fn links(&self) -> &LinkManager {
        &self.inner.links
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Packet Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Core {
    /// Wait for the next valid IP packet addressed to this node
    ///
    /// Control messages are handled in the background, so admin calls work
    /// without a reader.
    ///
    /// # Errors
    /// Returns the fabric's error once it closes, then
    /// `NodeError::Channel` on later calls.
    pub async fn read_packet(&self) -> Result<Vec<u8>> {
        self.inner
            .packets
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(Err(NodeError::channel("packet reader stopped")))
    }

    /// Send an IP packet into the overlay
    ///
    /// # Errors
    /// Returns `NodeError::InvalidPacket` for malformed, oversized or
    /// spoofed packets, and for destinations with no route.
    pub async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        self.inner.keystore.write_packet(packet).await
    }

    /// Install or clear the tunnel routing helper
    pub fn set_tunnel_routing(&self, tunnel: Option<Arc<dyn TunnelRouting>>) {
        self.inner.keystore.set_tunnel_routing(tunnel);
    }

    /// Install or clear the path-change callback
    pub fn set_path_notify(&self, notify: Option<PathNotify>) {
        *self.inner.path_notify.write() = notify;
    }

    /// The key store
    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.inner.keystore
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Admin Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Core {
    /// Replace the local node info
    ///
    /// # Errors
    /// Returns `NodeError::NodeInfoTooLarge`, keeping the previous node info.
    pub async fn set_node_info(&self, given: &Map<String, Value>, privacy: bool) -> Result<()> {
        self.inner.proto.set_node_info(given, privacy).await
    }

    /// Local position in the fabric
    pub fn get_self(&self) -> FabricSelf {
        self.inner.fabric.debug_self()
    }

    /// Keys known to the fabric's routing structure
    pub fn get_tree(&self) -> Vec<PublicKey> {
        self.inner.fabric.debug_tree()
    }

    /// Ask `key` for its node info
    ///
    /// # Errors
    /// Returns `NodeError::Timeout("timeout")` after the admin timeout.
    pub async fn get_node_info(&self, key: PublicKey) -> Result<Value> {
        self.inner.proto.get_node_info(key).await
    }

    /// Ask `key` for its view of itself
    ///
    /// # Errors
    /// Returns `NodeError::Timeout("timeout")` after the admin timeout.
    pub async fn remote_get_self(&self, key: PublicKey) -> Result<Value> {
        self.inner.proto.remote_get_self(key).await
    }

    /// Ask `key` for its peers
    ///
    /// # Errors
    /// Returns `NodeError::Timeout("timeout")` after the admin timeout.
    pub async fn remote_get_peers(&self, key: PublicKey) -> Result<Value> {
        self.inner.proto.remote_get_peers(key).await
    }

    /// Ask `key` for its tree neighbours
    ///
    /// # Errors
    /// Returns `NodeError::Timeout("timeout")` after the admin timeout.
    pub async fn remote_get_tree(&self, key: PublicKey) -> Result<Value> {
        self.inner.proto.remote_get_tree(key).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl Core {
    /// Stop listeners, peers, links and background tasks, then close the
    /// fabric. Idempotent.
    pub fn stop(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        debug!("Stopping node {}", self.inner.public_key);
        self.inner.cancel.cancel();
        self.inner.listeners.lock().clear();
        self.inner.fabric.close();
        info!("Stopped node {}", self.inner.public_key);
    }

    /// Whether [`stop`](Self::stop) has not been called
    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("public_key", &self.inner.public_key)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
