//! Link manager.
//!
//! Every connection, dialled or accepted, goes through the same steps:
//!
//! ```text
//! dial/accept -> metadata exchange -> authorization -> duplicate check -> fabric
//! ```
//!
//! The registry of live links, the set of in-flight calls and the
//! persistent peers belong to a single actor task. Dials, handshakes and
//! the fabric's per-link loops run in their own tasks and post messages
//! back to the actor.
//!
//! Two connections that resolve to the same [`LinkInfo`] collapse into one
//! link: the newer connection is dropped and its caller receives the
//! existing link's [`LinkDone`].

pub mod handshake;
mod options;

pub use options::LinkOptions;

use crate::fabric::RoutingFabric;
use crate::node::config::{parse_uri, LinkConfig};
use crate::node::{NodeError, Result};
use crate::version::VersionMetadata;
use mycel_crypto::address::in_overlay_range;
use mycel_crypto::{Address, PublicKey};
use mycel_transport::tcp;
use mycel_transport::{
    BoxedStream, CountingStream, DialOptions, LinkConn, LinkCounters, LinkListener, LinkProtocol,
    TransportError, TransportRegistry, TransportType,
};
use rand::Rng;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Persistent-peer backoff stops growing at 2^32 seconds
const MAX_BACKOFF_EXPONENT: u32 = 32;

/// Identity of a logical link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkInfo {
    /// Remote key
    pub key: PublicKey,
    /// Transport the link runs over
    pub link_type: TransportType,
    /// Local endpoint without port
    pub local: String,
    /// Remote endpoint without port
    pub remote: String,
}

/// Snapshot of one live link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    /// Remote key
    pub key: PublicKey,
    /// Remote endpoint as a URI
    pub remote: String,
    /// Transport scheme
    pub link_type: String,
    /// Whether the remote dialled us
    pub inbound: bool,
    /// Effective link priority
    pub priority: u8,
    /// Bytes received, handshake included
    pub rx_bytes: u64,
    /// Bytes sent, handshake included
    pub tx_bytes: u64,
    /// Time since the link was registered
    pub uptime: Duration,
}

/// Completion signal of a link; resolves once the link is gone
#[derive(Debug, Clone)]
pub struct LinkDone(watch::Receiver<()>);

impl LinkDone {
    /// Wait until the link closes
    pub async fn closed(&mut self) {
        // Nothing is ever sent; this only returns once the sender is dropped
        while self.0.changed().await.is_ok() {}
    }

    /// Whether the link has already closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.has_changed().is_err()
    }
}

/// A running listener
#[derive(Debug)]
pub struct ListenerHandle {
    url: Url,
    local_addr: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// The URI the listener was started from
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Bound address, e.g. `127.0.0.1:41234`
    #[must_use]
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Stop accepting; links already accepted stay up
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the accept loop has exited
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Close and wait for the accept loop to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

type PeerId = (String, Option<String>);

#[derive(Clone)]
struct PeerControl {
    kick: Arc<Notify>,
    cancel: CancellationToken,
}

struct LinkEntry {
    id: u64,
    remote: String,
    inbound: bool,
    priority: u8,
    counters: Arc<LinkCounters>,
    since: Instant,
    done: watch::Receiver<()>,
}

impl LinkEntry {
    fn summary(&self, info: &LinkInfo) -> PeerInfo {
        PeerInfo {
            key: info.key,
            remote: self.remote.clone(),
            link_type: info.link_type.scheme().to_string(),
            inbound: self.inbound,
            priority: self.priority,
            rx_bytes: self.counters.rx_bytes(),
            tx_bytes: self.counters.tx_bytes(),
            uptime: self.since.elapsed(),
        }
    }
}

enum Registration {
    New(u64),
    Existing(LinkDone),
}

enum LinkMsg {
    Register {
        info: LinkInfo,
        entry: LinkEntry,
        reply: oneshot::Sender<Registration>,
    },
    Unregister {
        info: LinkInfo,
        id: u64,
    },
    StartCall {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    EndCall {
        name: String,
    },
    AddPeer {
        id: PeerId,
        reply: oneshot::Sender<Result<PeerControl>>,
    },
    RemovePeer {
        id: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    RetryPeers,
    GetPeers(oneshot::Sender<Vec<PeerInfo>>),
}

struct LinkActor {
    links: HashMap<LinkInfo, LinkEntry>,
    calls: HashSet<String>,
    peers: HashMap<PeerId, PeerControl>,
    next_id: u64,
    cancel: CancellationToken,
}

impl LinkActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LinkMsg>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
        for peer in self.peers.values() {
            peer.cancel.cancel();
        }
        debug!("Link manager stopped with {} links", self.links.len());
    }

    fn handle(&mut self, msg: LinkMsg) {
        match msg {
            LinkMsg::Register {
                info,
                mut entry,
                reply,
            } => {
                if let Some(existing) = self.links.get(&info) {
                    let _ = reply.send(Registration::Existing(LinkDone(existing.done.clone())));
                    return;
                }
                self.next_id += 1;
                entry.id = self.next_id;
                self.links.insert(info.clone(), entry);
                if reply.send(Registration::New(self.next_id)).is_err() {
                    // Establishing task went away before adopting the link
                    self.links.remove(&info);
                }
            }
            LinkMsg::Unregister { info, id } => {
                if self.links.get(&info).is_some_and(|entry| entry.id == id) {
                    self.links.remove(&info);
                }
            }
            LinkMsg::StartCall { name, reply } => {
                let _ = reply.send(self.calls.insert(name));
            }
            LinkMsg::EndCall { name } => {
                self.calls.remove(&name);
            }
            LinkMsg::AddPeer { id, reply } => {
                let result = match self.peers.get(&id) {
                    Some(existing) => {
                        existing.kick.notify_one();
                        Err(NodeError::AlreadyConfigured)
                    }
                    None => {
                        let control = PeerControl {
                            kick: Arc::new(Notify::new()),
                            cancel: self.cancel.child_token(),
                        };
                        self.peers.insert(id, control.clone());
                        Ok(control)
                    }
                };
                let _ = reply.send(result);
            }
            LinkMsg::RemovePeer { id, reply } => {
                let result = match self.peers.remove(&id) {
                    Some(control) => {
                        control.cancel.cancel();
                        Ok(())
                    }
                    None => Err(NodeError::NotConfigured),
                };
                let _ = reply.send(result);
            }
            LinkMsg::RetryPeers => {
                for peer in self.peers.values() {
                    peer.kick.notify_one();
                }
            }
            LinkMsg::GetPeers(reply) => {
                let mut peers: Vec<PeerInfo> = self
                    .links
                    .iter()
                    .map(|(info, entry)| entry.summary(info))
                    .collect();
                peers.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.remote.cmp(&b.remote)));
                let _ = reply.send(peers);
            }
        }
    }
}

struct Shared {
    transports: TransportRegistry,
    fabric: Arc<dyn RoutingFabric>,
    public_key: PublicKey,
    allowed: Vec<PublicKey>,
    config: LinkConfig,
    cancel: CancellationToken,
}

/// A link that passed the handshake and was registered
struct Established {
    info: LinkInfo,
    id: u64,
    name: String,
    stream: CountingStream<BoxedStream>,
    priority: u8,
    incoming: bool,
    done: watch::Sender<()>,
}

enum Outcome {
    Established(Established),
    Duplicate(LinkDone),
}

/// Handle to the link manager actor
#[derive(Clone)]
pub struct LinkManager {
    tx: mpsc::UnboundedSender<LinkMsg>,
    shared: Arc<Shared>,
}

impl LinkManager {
    /// Start the actor. Cancelling `cancel` stops every listener, dial,
    /// persistent peer and link.
    ///
    /// # Arguments
    /// * `transports` - Adapters used to dial and listen
    /// * `fabric` - Receives every established link
    /// * `public_key` - Our key, advertised in the handshake
    /// * `allowed` - Keys allowed to connect inbound; empty allows all
    /// * `config` - Timeouts and cooldowns
    /// * `cancel` - Node lifecycle
    pub fn spawn(
        transports: TransportRegistry,
        fabric: Arc<dyn RoutingFabric>,
        public_key: PublicKey,
        allowed: Vec<PublicKey>,
        config: LinkConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = LinkActor {
            links: HashMap::new(),
            calls: HashSet::new(),
            peers: HashMap::new(),
            next_id: 0,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self {
            tx,
            shared: Arc::new(Shared {
                transports,
                fabric,
                public_key,
                allowed,
                config,
                cancel,
            }),
        }
    }

    fn post(&self, msg: LinkMsg) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| NodeError::channel("link manager stopped"))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> LinkMsg) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx))?;
        rx.await
            .map_err(|_| NodeError::channel("link manager stopped"))
    }

    fn transport_for(&self, url: &Url) -> Result<(TransportType, Arc<dyn LinkProtocol>)> {
        self.shared
            .transports
            .for_url(url)
            .map_err(|_| NodeError::UnrecognisedScheme(url.scheme().to_string()))
    }

    /// Start accepting links on `uri`.
    ///
    /// Query options on the listen URI (`key`, `priority`) apply to every
    /// link accepted through it.
    ///
    /// # Errors
    /// Returns a URI or option error, `NodeError::InvalidConfig` for
    /// dial-only schemes, or the transport's bind error.
    pub async fn listen(&self, uri: &str, source_interface: Option<&str>) -> Result<ListenerHandle> {
        let url = parse_uri(uri)?;
        let options = LinkOptions::from_url(&url)?;
        let (kind, protocol) = self.transport_for(&url)?;
        if !kind.can_listen() {
            return Err(NodeError::InvalidConfig(Cow::Owned(format!(
                "{kind} does not support listening"
            ))));
        }
        let listener = protocol.listen(&url, source_interface).await?;
        let local_addr = listener.local_addr();
        let cancel = self.shared.cancel.child_token();
        let task = tokio::spawn(
            self.clone()
                .accept_loop(listener, kind, options, cancel.clone()),
        );
        Ok(ListenerHandle {
            url,
            local_addr,
            cancel,
            task,
        })
    }

    async fn accept_loop(
        self,
        mut listener: Box<dyn LinkListener>,
        kind: TransportType,
        options: LinkOptions,
        cancel: CancellationToken,
    ) {
        let proto = kind.scheme().to_uppercase();
        let local = listener.local_addr();
        info!("{} listener started on {}", proto, local);
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(conn) => {
                    let manager = self.clone();
                    let options = options.clone();
                    tokio::spawn(async move {
                        let remote = format!("{kind}://{}", conn.remote);
                        let link_cancel = manager.shared.cancel.child_token();
                        if let Err(e) = manager.adopt_with(conn, kind, options, true, link_cancel).await {
                            log_rejected("inbound", &remote, &e);
                        }
                    });
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.shared.config.accept_retry) => {}
                    }
                }
            }
        }
        info!("{} listener stopped on {}", proto, local);
    }

    /// Dial `uri` once and wait for the handshake.
    ///
    /// Returns the completion signal of the resulting link, which is an
    /// already-established link's signal if the new connection turned out
    /// to be a duplicate.
    ///
    /// # Errors
    /// Returns a URI or option error, `NodeError::InvalidState` while the
    /// same target is being called or cooling down, or the dial, handshake
    /// or authorization error.
    pub async fn connect(&self, uri: &str, source_interface: Option<&str>) -> Result<LinkDone> {
        let url = parse_uri(uri)?;
        let options = LinkOptions::from_url(&url)?;
        let cancel = self.shared.cancel.child_token();
        self.connect_url(&url, options, source_interface, cancel)
            .await
    }

    async fn connect_url(
        &self,
        url: &Url,
        options: LinkOptions,
        source_interface: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<LinkDone> {
        let (kind, protocol) = self.transport_for(url)?;
        let name = call_name(url, source_interface);
        let started = self
            .request(|reply| LinkMsg::StartCall {
                name: name.clone(),
                reply,
            })
            .await?;
        if !started {
            return Err(NodeError::InvalidState(Cow::Owned(format!(
                "already calling {name}"
            ))));
        }

        let result: Result<LinkDone> = async {
            let dial_options = DialOptions {
                source_interface: source_interface.map(str::to_string),
            };
            let conn = tokio::select! {
                conn = protocol.dial(url, &dial_options) => conn?,
                _ = cancel.cancelled() => {
                    return Err(NodeError::InvalidState(Cow::Borrowed("link manager stopped")));
                }
            };
            self.adopt_with(conn, kind, options, false, cancel).await
        }
        .await;

        self.cool_down(name);
        if let Err(e) = &result {
            log_rejected("outbound", url.as_str(), e);
        }
        result
    }

    /// Release the call guard for `name` after the jittered cooldown
    fn cool_down(&self, name: String) {
        let config = &self.shared.config;
        let jitter_ms = u64::try_from(config.call_jitter.as_millis()).unwrap_or(u64::MAX);
        let delay = config.call_cooldown + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.shared.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = manager.post(LinkMsg::EndCall { name });
                }
            }
        });
    }

    /// Run the handshake on an already-connected stream and hand it to the
    /// fabric.
    ///
    /// # Errors
    /// Returns the handshake or authorization error; the stream is closed.
    pub async fn adopt(
        &self,
        conn: LinkConn,
        kind: TransportType,
        options: LinkOptions,
        incoming: bool,
    ) -> Result<LinkDone> {
        let cancel = self.shared.cancel.child_token();
        self.adopt_with(conn, kind, options, incoming, cancel).await
    }

    async fn adopt_with(
        &self,
        conn: LinkConn,
        kind: TransportType,
        options: LinkOptions,
        incoming: bool,
        cancel: CancellationToken,
    ) -> Result<LinkDone> {
        match self.establish(conn, kind, &options, incoming).await? {
            Outcome::Duplicate(done) => Ok(done),
            Outcome::Established(link) => {
                let done = LinkDone(link.done.subscribe());
                let manager = self.clone();
                tokio::spawn(async move {
                    let _ = manager.run(link, cancel).await;
                });
                Ok(done)
            }
        }
    }

    async fn establish(
        &self,
        conn: LinkConn,
        kind: TransportType,
        options: &LinkOptions,
        incoming: bool,
    ) -> Result<Outcome> {
        if let Some(IpAddr::V6(ip)) = conn.local_ip() {
            if in_overlay_range(&ip) {
                debug!("Dropping tunneled connection {} {}", conn.local, conn.remote);
                return Err(NodeError::TunneledConnection(format!(
                    "{} -> {}",
                    conn.local, conn.remote
                )));
            }
        }
        let force = conn.remote_ip().is_some_and(|ip| tcp::is_link_local(&ip));
        let local = conn.local_host();
        let remote = conn.remote_host();
        let name = format!("{kind}://{}", conn.remote);
        let counters = Arc::new(LinkCounters::new());
        let mut stream = CountingStream::new(conn.stream, counters.clone());

        let ours = VersionMetadata::base(&self.shared.public_key, options.priority);
        let theirs =
            handshake::exchange(&mut stream, &ours, self.shared.config.handshake_timeout).await?;
        let key = theirs
            .key()
            .ok_or(NodeError::handshake("remote sent no public key"))?;
        if key == self.shared.public_key {
            return Err(NodeError::handshake("connection to self"));
        }
        handshake::authorize(&key, options, &self.shared.allowed, incoming, force)?;

        let info = LinkInfo {
            key,
            link_type: kind,
            local,
            remote,
        };
        let priority = options.priority.max(theirs.priority);
        let (done, done_rx) = watch::channel(());
        let entry = LinkEntry {
            id: 0,
            remote: name.clone(),
            inbound: incoming,
            priority,
            counters,
            since: Instant::now(),
            done: done_rx,
        };
        let registration = self
            .request(|reply| LinkMsg::Register {
                info: info.clone(),
                entry,
                reply,
            })
            .await?;
        match registration {
            Registration::Existing(existing) => {
                debug!("Closing duplicate link to {} via {}", key, name);
                Ok(Outcome::Duplicate(existing))
            }
            Registration::New(id) => Ok(Outcome::Established(Established {
                info,
                id,
                name,
                stream,
                priority,
                incoming,
                done,
            })),
        }
    }

    async fn run(&self, link: Established, cancel: CancellationToken) -> Result<()> {
        let Established {
            info,
            id,
            name,
            stream,
            priority,
            incoming,
            done,
        } = link;
        let dir = if incoming { "inbound" } else { "outbound" };
        let addr = Address::for_key(&info.key).to_ipv6();
        info!("Connected {}: {}@{}, source {}", dir, addr, name, info.local);

        let fabric = self.shared.fabric.clone();
        let result = tokio::select! {
            result = fabric.handle_conn(info.key, Box::new(stream), priority) => result,
            _ = cancel.cancelled() => Ok(()),
        };

        let _ = self.post(LinkMsg::Unregister {
            info: info.clone(),
            id,
        });
        drop(done);
        match &result {
            Ok(()) => info!("Disconnected {}: {}@{}, source {}", dir, addr, name, info.local),
            Err(e) => info!(
                "Disconnected {}: {}@{}, source {}; error: {}",
                dir, addr, name, info.local, e
            ),
        }
        result
    }

    /// Register a persistent peer, redialled with exponential backoff until
    /// removed.
    ///
    /// # Errors
    /// Returns a URI or option error, or `NodeError::AlreadyConfigured` if
    /// the peer exists; in that case its backoff is cut short.
    pub async fn add_peer(&self, uri: &str, source_interface: Option<&str>) -> Result<()> {
        let url = parse_uri(uri)?;
        let options = LinkOptions::from_url(&url)?;
        self.transport_for(&url)?;
        let sintf = source_interface.map(str::to_string);
        let id = (url.to_string(), sintf.clone());
        let control = self
            .request(|reply| LinkMsg::AddPeer { id, reply })
            .await??;
        tokio::spawn(self.clone().persist(url, options, sintf, control));
        Ok(())
    }

    /// Stop redialling a persistent peer and close its link
    ///
    /// # Errors
    /// Returns `NodeError::NotConfigured` if no such peer was added.
    pub async fn remove_peer(&self, uri: &str, source_interface: Option<&str>) -> Result<()> {
        let url = parse_uri(uri)?;
        let id = (url.to_string(), source_interface.map(str::to_string));
        self.request(|reply| LinkMsg::RemovePeer { id, reply })
            .await?
    }

    /// Cut every persistent peer's backoff short
    ///
    /// # Errors
    /// Returns `NodeError::Channel` if the actor has stopped.
    pub fn retry_peers_now(&self) -> Result<()> {
        self.post(LinkMsg::RetryPeers)
    }

    /// Live links, sorted by key
    ///
    /// # Errors
    /// Returns `NodeError::Channel` if the actor has stopped.
    pub async fn get_peers(&self) -> Result<Vec<PeerInfo>> {
        self.request(LinkMsg::GetPeers).await
    }

    async fn persist(
        self,
        url: Url,
        options: LinkOptions,
        source_interface: Option<String>,
        control: PeerControl,
    ) {
        let mut backoff = 0u32;
        loop {
            if backoff > 0 {
                let wait = backoff_delay(backoff, self.shared.config.backoff_max);
                debug!("Redialling {} in {:?}", url, wait);
                tokio::select! {
                    _ = control.cancel.cancelled() => break,
                    _ = control.kick.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            if control.cancel.is_cancelled() {
                break;
            }
            let link_cancel = control.cancel.child_token();
            match self
                .connect_url(&url, options.clone(), source_interface.as_deref(), link_cancel)
                .await
            {
                Ok(mut done) => {
                    backoff = 0;
                    tokio::select! {
                        _ = control.cancel.cancelled() => break,
                        _ = done.closed() => {}
                    }
                }
                Err(_) => {
                    if backoff < MAX_BACKOFF_EXPONENT {
                        backoff += 1;
                    }
                }
            }
        }
        debug!("Stopped calling {}", url);
    }
}

impl fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkManager")
            .field("public_key", &self.shared.public_key)
            .field("allowed", &self.shared.allowed.len())
            .field("transports", &self.shared.transports)
            .finish_non_exhaustive()
    }
}

fn log_rejected(dir: &str, remote: &str, err: &NodeError) {
    if err.is_permanent() {
        warn!("Rejected {} link {}: {}", dir, remote, err);
    } else {
        debug!("Failed {} link {}: {}", dir, remote, err);
    }
}

/// Call guard key: the target without its query, plus the source interface
fn call_name(url: &Url, source_interface: Option<&str>) -> String {
    let mut target = url.clone();
    target.set_query(None);
    target.set_fragment(None);
    format!("{}/{}", target, source_interface.unwrap_or_default())
}

fn backoff_delay(exponent: u32, max: Duration) -> Duration {
    Duration::from_secs(1u64 << exponent.min(MAX_BACKOFF_EXPONENT)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFabric;
    use mycel_crypto::SigningKey;
    use mycel_transport::tcp::TcpProtocol;
    use mycel_transport::TransportConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpStream;

    const WAIT: Duration = Duration::from_secs(5);

    fn manager(seed: u8, allowed: Vec<PublicKey>) -> (LinkManager, Arc<MockFabric>, PublicKey) {
        let key = SigningKey::from_bytes(&[seed; 32]).public_key();
        let fabric = Arc::new(MockFabric::new(key, 65535));
        let mut transports = TransportRegistry::empty();
        transports.register(
            TransportType::Tcp,
            Arc::new(TcpProtocol::new(TransportConfig::default())),
        );
        let manager = LinkManager::spawn(
            transports,
            fabric.clone(),
            key,
            allowed,
            LinkConfig::default(),
            CancellationToken::new(),
        );
        (manager, fabric, key)
    }

    async fn remote_end(stream: DuplexStream, key: PublicKey) -> DuplexStream {
        remote_end_with(stream, VersionMetadata::base(&key, 0)).await
    }

    async fn remote_end_with(mut stream: DuplexStream, meta: VersionMetadata) -> DuplexStream {
        stream.write_all(&meta.encode()).await.unwrap();
        VersionMetadata::read_from(&mut stream).await.unwrap();
        stream
    }

    async fn wait_for_no_peers(manager: &LinkManager) {
        tokio::time::timeout(WAIT, async {
            while !manager.get_peers().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_call_name_ignores_query() {
        let a = Url::parse("tls://peer.example:443?key=00&priority=1").unwrap();
        let b = Url::parse("tls://peer.example:443").unwrap();
        assert_eq!(call_name(&a, Some("eth0")), call_name(&b, Some("eth0")));
        assert_ne!(call_name(&a, Some("eth0")), call_name(&b, None));
    }

    #[test]
    fn test_backoff_delay() {
        let max = Duration::from_secs(3600);
        assert_eq!(backoff_delay(1, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(5, max), Duration::from_secs(32));
        assert_eq!(backoff_delay(12, max), max);
        assert_eq!(backoff_delay(40, max), max);
    }

    #[tokio::test]
    async fn test_link_over_tcp() {
        let (a, fabric_a, key_a) = manager(1, vec![]);
        let (b, fabric_b, key_b) = manager(2, vec![]);
        let listener = a.listen("tcp://127.0.0.1:0", None).await.unwrap();

        let uri = format!("tcp://{}?priority=4", listener.local_addr());
        let done = b.connect(&uri, None).await.unwrap();
        assert!(!done.is_closed());

        assert_eq!(fabric_b.next_conn().await, (key_a, 4));
        assert_eq!(fabric_a.next_conn().await, (key_b, 4));

        let peers = b.get_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].key, key_a);
        assert_eq!(peers[0].link_type, "tcp");
        assert!(!peers[0].inbound);
        assert_eq!(peers[0].priority, 4);
        assert!(peers[0].tx_bytes > 0);
        assert!(peers[0].rx_bytes > 0);

        let peers = a.get_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].key, key_b);
        assert!(peers[0].inbound);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (a, fabric, _) = manager(1, vec![]);
        let listener = a.listen("tcp://127.0.0.1:0", None).await.unwrap();

        let mut raw = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut meta = VersionMetadata::base(&PublicKey::from_bytes([9; 32]), 0);
        meta.minor_ver -= 1;
        raw.write_all(&meta.encode()).await.unwrap();
        let theirs = VersionMetadata::read_from(&mut raw).await.unwrap();
        assert!(VersionMetadata::decode(&theirs).unwrap().check());
        assert!(!meta.check());

        // The listener hangs up without registering anything
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(WAIT, raw.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(a.get_peers().await.unwrap().is_empty());
        assert!(fabric.try_next_conn().is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected_outbound() {
        let (a, fabric, _) = manager(1, vec![]);
        let mut meta = VersionMetadata::base(&PublicKey::from_bytes([9; 32]), 0);
        meta.minor_ver -= 1;

        let (s, r) = tokio::io::duplex(4096);
        let conn = LinkConn::new(s, "10.0.0.1:1000", "10.0.0.2:2000");
        let (result, _r) = tokio::join!(
            a.adopt(conn, TransportType::Tcp, LinkOptions::default(), false),
            remote_end_with(r, meta)
        );
        assert!(matches!(result, Err(NodeError::IncompatibleVersion { .. })));
        assert!(a.get_peers().await.unwrap().is_empty());
        assert!(fabric.try_next_conn().is_none());
    }

    #[tokio::test]
    async fn test_pinned_key_mismatch() {
        let (a, _fabric_a, _) = manager(1, vec![]);
        let (b, _fabric_b, _) = manager(2, vec![]);
        let listener = a.listen("tcp://127.0.0.1:0", None).await.unwrap();

        let other = PublicKey::from_bytes([5; 32]);
        let uri = format!("tcp://{}?key={}", listener.local_addr(), other.to_hex());
        let err = b.connect(&uri, None).await.unwrap_err();
        assert!(matches!(err, NodeError::PinnedKeyMismatch(_)));
        assert!(b.get_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allowed_keys_enforced_inbound() {
        let (a, fabric_a, _) = manager(1, vec![PublicKey::from_bytes([5; 32])]);
        let (b, _fabric_b, _) = manager(2, vec![]);
        let listener = a.listen("tcp://127.0.0.1:0", None).await.unwrap();

        let uri = format!("tcp://{}", listener.local_addr());
        if let Ok(mut done) = b.connect(&uri, None).await {
            tokio::time::timeout(WAIT, done.closed()).await.unwrap();
        }
        assert!(a.get_peers().await.unwrap().is_empty());
        // Rejected before the fabric ever saw it
        assert!(fabric_a.try_next_conn().is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_inbound_not_adopted() {
        let (a, fabric_a, _) = manager(1, vec![PublicKey::from_bytes([5; 32])]);
        let stranger = PublicKey::from_bytes([9; 32]);

        let (s, r) = tokio::io::duplex(4096);
        let conn = LinkConn::new(s, "10.0.0.1:1000", "10.0.0.2:2000");
        let (result, _r) = tokio::join!(
            a.adopt(conn, TransportType::Tcp, LinkOptions::default(), true),
            remote_end(r, stranger)
        );
        assert!(matches!(result, Err(NodeError::Unauthorized(_))));
        assert!(a.get_peers().await.unwrap().is_empty());
        assert!(fabric_a.try_next_conn().is_none());
    }

    #[tokio::test]
    async fn test_call_guard_blocks_redial() {
        let (a, _fabric_a, _) = manager(1, vec![]);
        let (b, _fabric_b, _) = manager(2, vec![]);
        let listener = a.listen("tcp://127.0.0.1:0", None).await.unwrap();

        let uri = format!("tcp://{}", listener.local_addr());
        b.connect(&uri, None).await.unwrap();
        let err = b.connect(&uri, None).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_duplicate_links_collapse() {
        let (a, fabric_a, _) = manager(1, vec![]);
        let peer = PublicKey::from_bytes([9; 32]);

        let (s1, r1) = tokio::io::duplex(4096);
        let conn = LinkConn::new(s1, "10.0.0.1:1000", "10.0.0.2:2000");
        let (first, r1) = tokio::join!(
            a.adopt(conn, TransportType::Tcp, LinkOptions::default(), false),
            remote_end(r1, peer)
        );
        let mut first = first.unwrap();
        assert_eq!(fabric_a.next_conn().await, (peer, 0));

        let (s2, r2) = tokio::io::duplex(4096);
        let conn = LinkConn::new(s2, "10.0.0.1:1001", "10.0.0.2:2001");
        let (second, mut r2) = tokio::join!(
            a.adopt(conn, TransportType::Tcp, LinkOptions::default(), false),
            remote_end(r2, peer)
        );
        let mut second = second.unwrap();

        // The newer connection is dropped
        let mut buf = [0u8; 1];
        assert_eq!(r2.read(&mut buf).await.unwrap(), 0);
        assert_eq!(a.get_peers().await.unwrap().len(), 1);
        assert!(!second.is_closed());

        // Both callers see the surviving link go away
        drop(r1);
        tokio::time::timeout(WAIT, first.closed()).await.unwrap();
        tokio::time::timeout(WAIT, second.closed()).await.unwrap();
        assert!(a.get_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tunneled_connection_dropped() {
        let (a, _fabric, _) = manager(1, vec![]);
        let (s, _r) = tokio::io::duplex(4096);
        let conn = LinkConn::new(s, "[200::1]:1000", "[2001:db8::1]:2000");
        let err = a
            .adopt(conn, TransportType::Tcp, LinkOptions::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::TunneledConnection(_)));
    }

    #[tokio::test]
    async fn test_connection_to_self_rejected() {
        let (a, _fabric, key) = manager(1, vec![]);
        let (s, r) = tokio::io::duplex(4096);
        let conn = LinkConn::new(s, "10.0.0.1:1000", "10.0.0.2:2000");
        let (result, _r) = tokio::join!(
            a.adopt(conn, TransportType::Tcp, LinkOptions::default(), true),
            remote_end(r, key)
        );
        assert!(matches!(result, Err(NodeError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_persistent_peer_lifecycle() {
        let (a, _fabric_a, key_a) = manager(1, vec![]);
        let (b, fabric_b, _) = manager(2, vec![]);
        let listener = a.listen("tcp://127.0.0.1:0", None).await.unwrap();
        let uri = format!("tcp://{}", listener.local_addr());

        b.add_peer(&uri, None).await.unwrap();
        assert_eq!(fabric_b.next_conn().await.0, key_a);
        assert!(matches!(
            b.add_peer(&uri, None).await,
            Err(NodeError::AlreadyConfigured)
        ));
        b.retry_peers_now().unwrap();

        b.remove_peer(&uri, None).await.unwrap();
        assert!(matches!(
            b.remove_peer(&uri, None).await,
            Err(NodeError::NotConfigured)
        ));
        wait_for_no_peers(&b).await;
    }

    #[tokio::test]
    async fn test_add_peer_rejects_bad_uris() {
        let (b, _fabric, _) = manager(2, vec![]);
        assert!(matches!(
            b.add_peer("tcp://127.0.0.1:1?priority=high", None).await,
            Err(NodeError::PriorityInvalid)
        ));
        assert!(matches!(
            b.add_peer("tcp://127.0.0.1:1?key=00", None).await,
            Err(NodeError::PinnedKeyInvalid)
        ));
        assert!(matches!(
            b.add_peer("gopher://127.0.0.1:1", None).await,
            Err(NodeError::UnrecognisedScheme(_))
        ));
        assert!(matches!(
            b.add_peer("not a uri", None).await,
            Err(NodeError::InvalidUri { .. })
        ));
    }

    #[tokio::test]
    async fn test_listener_stop() {
        let (a, _fabric, _) = manager(1, vec![]);
        let listener = a.listen("tcp://127.0.0.1:0", None).await.unwrap();
        let addr = listener.local_addr().to_string();
        assert!(!listener.is_closed());

        listener.stop().await;
        assert!(TcpStream::connect(&addr).await.is_err());
    }
}
