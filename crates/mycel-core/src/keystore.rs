//! Key store: maps overlay addresses to public keys.
//!
//! Outbound IPv6 packets are addressed by overlay address or subnet. The
//! key store resolves these to the public key the fabric routes by. When no
//! key is known yet, the packet is parked in a single-slot buffer (a newer
//! packet replaces it) and a signed key lookup for the partial key is sent
//! out of band. The owner of the matching subnet answers with a signed
//! response, and the buffered packets are flushed.
//!
//! Inbound packets must carry a source address or subnet derived from the
//! sender's key and a destination belonging to this node; everything else
//! is silently dropped unless a [`TunnelRouting`] helper admits it.
//!
//! Cached keys and buffers expire after the idle timeout. A sweep task
//! removes expired entries; each access pushes the deadline out again.

use crate::fabric::OobHandler;
use crate::icmpv6::{self, IPV6_HEADER_LEN};
use crate::node::config::{KeyStoreConfig, MAX_MTU, MIN_MTU};
use crate::node::{NodeError, Result};
use crate::packet_conn::PacketConn;
use crate::wire::{OobType, OOB_MESSAGE_SIZE};
use mycel_crypto::{Address, PublicKey, Signature, SigningKey, Subnet};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const IPV4_HEADER_LEN: usize = 20;

/// Routes traffic for destinations outside the overlay prefix
pub trait TunnelRouting: Send + Sync {
    /// Key of the node that routes `dest`, if any
    fn key_for_destination(&self, dest: IpAddr) -> Option<PublicKey>;

    /// Whether `from` may deliver packets with source `src` that are not
    /// addressed to this node
    fn admit_source(&self, from: &PublicKey, src: IpAddr) -> bool;
}

/// Cached association between a key and its derived address and subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    /// Full public key
    pub key: PublicKey,
    /// Derived address
    pub address: Address,
    /// Derived subnet
    pub subnet: Subnet,
}

impl KeyInfo {
    fn for_key(key: PublicKey) -> Self {
        Self {
            key,
            address: Address::for_key(&key),
            subnet: Subnet::for_key(&key),
        }
    }
}

struct Entry {
    info: KeyInfo,
    deadline: Instant,
}

struct Buffered {
    packet: Vec<u8>,
    deadline: Instant,
}

struct State {
    key_to_info: HashMap<PublicKey, Entry>,
    addr_to_key: HashMap<Address, PublicKey>,
    subnet_to_key: HashMap<Subnet, PublicKey>,
    addr_buffer: HashMap<Address, Buffered>,
    subnet_buffer: HashMap<Subnet, Buffered>,
    mtu: u64,
}

/// Address-to-key cache and packet validator
pub struct KeyStore {
    conn: Arc<PacketConn>,
    signing_key: SigningKey,
    address: Address,
    subnet: Subnet,
    idle_timeout: Duration,
    state: Mutex<State>,
    tunnel: RwLock<Option<Arc<dyn TunnelRouting>>>,
}

impl KeyStore {
    /// Build a key store and install it as the fabric's out-of-band handler
    pub fn new(conn: Arc<PacketConn>, signing_key: SigningKey, config: &KeyStoreConfig) -> Arc<Self> {
        let public = signing_key.public_key();
        let store = Arc::new(Self {
            address: Address::for_key(&public),
            subnet: Subnet::for_key(&public),
            idle_timeout: config.idle_timeout,
            state: Mutex::new(State {
                key_to_info: HashMap::new(),
                addr_to_key: HashMap::new(),
                subnet_to_key: HashMap::new(),
                addr_buffer: HashMap::new(),
                subnet_buffer: HashMap::new(),
                mtu: MIN_MTU,
            }),
            tunnel: RwLock::new(None),
            conn,
            signing_key,
        });
        store.set_mtu(config.mtu);

        let weak = Arc::downgrade(&store);
        let handler: OobHandler = Arc::new(move |from: PublicKey, to: PublicKey, data: Vec<u8>| {
            if let Some(store) = weak.upgrade() {
                tokio::spawn(async move { store.handle_oob(from, to, &data).await });
            }
        });
        store.conn.fabric().set_out_of_band_handler(handler);
        store
    }

    /// Start the periodic expiry sweep
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = cancel.cancelled() => break,
                }
                let Some(store) = weak.upgrade() else { break };
                let removed = store.sweep();
                if removed > 0 {
                    trace!("Key store sweep removed {} entries", removed);
                }
            }
        })
    }

    /// This node's address
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// This node's subnet
    #[must_use]
    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    /// Largest MTU the fabric allows
    #[must_use]
    pub fn max_mtu(&self) -> u64 {
        self.conn.mtu().min(MAX_MTU)
    }

    /// Current MTU
    #[must_use]
    pub fn mtu(&self) -> u64 {
        self.state.lock().mtu
    }

    /// Set the MTU, clamped to `1280..=max_mtu()`
    pub fn set_mtu(&self, mtu: u64) {
        let mtu = mtu.min(self.max_mtu()).max(MIN_MTU);
        self.state.lock().mtu = mtu;
    }

    /// Install or clear the tunnel routing helper
    pub fn set_tunnel_routing(&self, tunnel: Option<Arc<dyn TunnelRouting>>) {
        *self.tunnel.write() = tunnel;
    }

    /// Cached info for `key`, without refreshing it
    #[must_use]
    pub fn key_info(&self, key: &PublicKey) -> Option<KeyInfo> {
        self.state.lock().key_to_info.get(key).map(|e| e.info)
    }

    /// Number of cached keys
    #[must_use]
    pub fn cached_keys(&self) -> usize {
        self.state.lock().key_to_info.len()
    }

    /// Number of buffered packets awaiting a key
    #[must_use]
    pub fn buffered_packets(&self) -> usize {
        let state = self.state.lock();
        state.addr_buffer.len() + state.subnet_buffer.len()
    }

    /// Send `packet` to the owner of `addr`, buffering it until the key is known
    pub async fn send_to_address(&self, addr: Address, packet: &[u8]) {
        let key = {
            let mut state = self.state.lock();
            let deadline = Instant::now() + self.idle_timeout;
            match state.addr_to_key.get(&addr).copied() {
                Some(key) => {
                    if let Some(entry) = state.key_to_info.get_mut(&key) {
                        entry.deadline = deadline;
                    }
                    Some(key)
                }
                None => {
                    state.addr_buffer.insert(
                        addr,
                        Buffered {
                            packet: packet.to_vec(),
                            deadline,
                        },
                    );
                    None
                }
            }
        };
        match key {
            Some(key) => self.forward(packet, &key).await,
            None => self.send_key_lookup(addr.partial_key()).await,
        }
    }

    /// Send `packet` to the owner of `subnet`, buffering it until the key is known
    pub async fn send_to_subnet(&self, subnet: Subnet, packet: &[u8]) {
        let key = {
            let mut state = self.state.lock();
            let deadline = Instant::now() + self.idle_timeout;
            match state.subnet_to_key.get(&subnet).copied() {
                Some(key) => {
                    if let Some(entry) = state.key_to_info.get_mut(&key) {
                        entry.deadline = deadline;
                    }
                    Some(key)
                }
                None => {
                    state.subnet_buffer.insert(
                        subnet,
                        Buffered {
                            packet: packet.to_vec(),
                            deadline,
                        },
                    );
                    None
                }
            }
        };
        match key {
            Some(key) => self.forward(packet, &key).await,
            None => self.send_key_lookup(subnet.partial_key()).await,
        }
    }

    /// Insert or refresh `key`, flushing any packets buffered for it
    pub async fn update(&self, key: PublicKey) -> KeyInfo {
        let (info, flushed) = {
            let mut state = self.state.lock();
            let deadline = Instant::now() + self.idle_timeout;
            let mut flushed = Vec::new();
            let info = if let Some(entry) = state.key_to_info.get_mut(&key) {
                entry.deadline = deadline;
                entry.info
            } else {
                let info = KeyInfo::for_key(key);
                state.key_to_info.insert(key, Entry { info, deadline });
                state.addr_to_key.insert(info.address, key);
                state.subnet_to_key.insert(info.subnet, key);
                if let Some(buf) = state.addr_buffer.remove(&info.address) {
                    flushed.push(buf.packet);
                }
                if let Some(buf) = state.subnet_buffer.remove(&info.subnet) {
                    flushed.push(buf.packet);
                }
                info
            };
            (info, flushed)
        };
        for packet in flushed {
            self.forward(&packet, &key).await;
        }
        info
    }

    /// Remove expired keys and buffers, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let State {
            key_to_info,
            addr_to_key,
            subnet_to_key,
            addr_buffer,
            subnet_buffer,
            ..
        } = &mut *state;

        let before = key_to_info.len() + addr_buffer.len() + subnet_buffer.len();
        key_to_info.retain(|key, entry| {
            if entry.deadline > now {
                return true;
            }
            if addr_to_key.get(&entry.info.address) == Some(key) {
                addr_to_key.remove(&entry.info.address);
            }
            if subnet_to_key.get(&entry.info.subnet) == Some(key) {
                subnet_to_key.remove(&entry.info.subnet);
            }
            false
        });
        addr_buffer.retain(|_, buf| buf.deadline > now);
        subnet_buffer.retain(|_, buf| buf.deadline > now);
        before - (key_to_info.len() + addr_buffer.len() + subnet_buffer.len())
    }

    /// Handle an out-of-band message from the fabric
    pub async fn handle_oob(&self, from: PublicKey, to: PublicKey, data: &[u8]) {
        if data.len() != OOB_MESSAGE_SIZE {
            return;
        }
        let Ok(sig) = Signature::from_slice(&data[1..]) else {
            return;
        };
        match OobType::try_from(data[0]) {
            Ok(OobType::KeyLookup) => {
                if Subnet::for_key(&to) == self.subnet && from.verify(to.as_bytes(), &sig).is_ok() {
                    self.send_key_response(from).await;
                }
            }
            Ok(OobType::KeyResponse) => {
                if from.verify(to.as_bytes(), &sig).is_ok() {
                    self.update(from).await;
                }
            }
            Ok(OobType::Dummy) | Err(_) => {}
        }
    }

    async fn send_key_lookup(&self, partial: PublicKey) {
        self.send_oob(OobType::KeyLookup, partial).await;
    }

    async fn send_key_response(&self, dest: PublicKey) {
        self.send_oob(OobType::KeyResponse, dest).await;
    }

    async fn send_oob(&self, kind: OobType, dest: PublicKey) {
        let sig = self.signing_key.sign(dest.as_bytes());
        let mut msg = Vec::with_capacity(OOB_MESSAGE_SIZE);
        msg.push(kind as u8);
        msg.extend_from_slice(sig.as_bytes());
        if let Err(e) = self.conn.fabric().send_out_of_band(&dest, &msg).await {
            debug!("Failed to send {:?} to {}: {}", kind, dest, e);
        }
    }

    async fn forward(&self, packet: &[u8], key: &PublicKey) {
        if let Err(e) = self.conn.write_to(packet, key).await {
            trace!("Failed to forward packet to {}: {}", key, e);
        }
    }

    fn tunnel(&self) -> Option<Arc<dyn TunnelRouting>> {
        self.tunnel.read().clone()
    }

    /// Wait for the next valid inbound packet
    ///
    /// # Errors
    /// Returns the fabric's error once it is closed.
    pub async fn read_packet(&self) -> Result<Vec<u8>> {
        loop {
            let (packet, from) = self.conn.read_from().await?;
            if let Some(packet) = self.admit_inbound(packet, from).await {
                return Ok(packet);
            }
        }
    }

    async fn admit_inbound(&self, packet: Vec<u8>, from: PublicKey) -> Option<Vec<u8>> {
        let mtu = self.mtu();
        match packet.first()? >> 4 {
            6 if packet.len() >= IPV6_HEADER_LEN => {
                if packet.len() as u64 > mtu {
                    if let Some(reply) = icmpv6::packet_too_big(&packet, mtu as u32) {
                        let _ = self.write_packet(&reply).await;
                    }
                    return None;
                }
                let (src_addr, src_subnet) = overlay_fields(&packet, 8)?;
                let (dst_addr, dst_subnet) = overlay_fields(&packet, 24)?;
                if dst_addr == self.address || dst_subnet == self.subnet {
                    let info = self.update(from).await;
                    if src_addr != info.address && src_subnet != info.subnet {
                        trace!("Dropping packet from {} with spoofed source {}", from, src_addr);
                        return None;
                    }
                    return Some(packet);
                }
                let src = IpAddr::V6(Ipv6Addr::from(src_addr.0));
                self.admit_tunneled(&from, src).then_some(packet)
            }
            4 if packet.len() >= IPV4_HEADER_LEN => {
                if packet.len() as u64 > mtu {
                    return None;
                }
                let src = IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]));
                self.admit_tunneled(&from, src).then_some(packet)
            }
            _ => None,
        }
    }

    fn admit_tunneled(&self, from: &PublicKey, src: IpAddr) -> bool {
        self.tunnel()
            .is_some_and(|tunnel| tunnel.admit_source(from, src))
    }

    /// Validate and send an outbound IP packet
    ///
    /// # Errors
    /// Returns `NodeError::InvalidPacket` if the packet is not IP, is
    /// truncated, has a source that is not this node, or has a destination
    /// nobody routes.
    pub async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        match packet.first().map(|b| b >> 4) {
            Some(6) => {
                if packet.len() < IPV6_HEADER_LEN {
                    return Err(NodeError::InvalidPacket(
                        format!("undersized IPv6 packet, length: {}", packet.len()).into(),
                    ));
                }
                let (src_addr, src_subnet) =
                    overlay_fields(packet, 8).ok_or(NodeError::invalid_packet("truncated"))?;
                let (dst_addr, dst_subnet) =
                    overlay_fields(packet, 24).ok_or(NodeError::invalid_packet("truncated"))?;

                if dst_addr.is_valid() || dst_subnet.is_valid() {
                    if src_addr != self.address && src_subnet != self.subnet {
                        return Err(NodeError::InvalidPacket(
                            format!("incorrect source address: {src_addr}").into(),
                        ));
                    }
                    if dst_addr.is_valid() {
                        self.send_to_address(dst_addr, packet).await;
                    } else {
                        self.send_to_subnet(dst_subnet, packet).await;
                    }
                    return Ok(packet.len());
                }
                self.send_tunneled(IpAddr::V6(Ipv6Addr::from(dst_addr.0)), packet)
                    .await
            }
            Some(4) => {
                if packet.len() < IPV4_HEADER_LEN {
                    return Err(NodeError::InvalidPacket(
                        format!("undersized IPv4 packet, length: {}", packet.len()).into(),
                    ));
                }
                let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
                self.send_tunneled(IpAddr::V4(dst), packet).await
            }
            _ => Err(NodeError::invalid_packet("not an IP packet")),
        }
    }

    async fn send_tunneled(&self, dest: IpAddr, packet: &[u8]) -> Result<usize> {
        let key = self
            .tunnel()
            .and_then(|tunnel| tunnel.key_for_destination(dest))
            .ok_or(NodeError::invalid_packet("invalid destination address"))?;
        self.forward(packet, &key).await;
        Ok(packet.len())
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("address", &self.address)
            .field("subnet", &self.subnet)
            .field("cached_keys", &self.cached_keys())
            .finish_non_exhaustive()
    }
}

/// Address and subnet views of the 16 bytes at `offset`
fn overlay_fields(packet: &[u8], offset: usize) -> Option<(Address, Subnet)> {
    let bytes: [u8; 16] = packet.get(offset..offset + 16)?.try_into().ok()?;
    let mut subnet = [0u8; 8];
    subnet.copy_from_slice(&bytes[..8]);
    Some((Address(bytes), Subnet(subnet)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::config::ProtoConfig;
    use crate::proto::ProtoHandler;
    use crate::testing::MockFabric;
    use rand_core::OsRng;

    struct Fixture {
        fabric: Arc<MockFabric>,
        store: Arc<KeyStore>,
    }

    fn fixture() -> Fixture {
        fixture_with(SigningKey::generate(&mut OsRng))
    }

    fn fixture_with(key: SigningKey) -> Fixture {
        let fabric = Arc::new(MockFabric::new(key.public_key(), 65535));
        let proto = ProtoHandler::spawn(
            fabric.clone(),
            &ProtoConfig::default(),
            CancellationToken::new(),
        );
        let conn = Arc::new(PacketConn::new(fabric.clone(), proto));
        let store = KeyStore::new(conn, key, &KeyStoreConfig::default());
        Fixture { fabric, store }
    }

    fn ipv6_packet(src: [u8; 16], dst: [u8; 16], len: usize) -> Vec<u8> {
        let mut p = vec![0u8; len.max(IPV6_HEADER_LEN)];
        p[0] = 0x60;
        p[6] = 17;
        p[7] = 64;
        p[8..24].copy_from_slice(&src);
        p[24..40].copy_from_slice(&dst);
        p
    }

    fn traffic(packet: &[u8]) -> Vec<u8> {
        let mut out = vec![0x01];
        out.extend_from_slice(packet);
        out
    }

    #[tokio::test]
    async fn test_buffer_holds_latest_packet() {
        let f = fixture();
        let remote = SigningKey::generate(&mut OsRng).public_key();
        let addr = Address::for_key(&remote);

        f.store.send_to_address(addr, b"first").await;
        f.store.send_to_address(addr, b"second").await;
        assert_eq!(f.store.buffered_packets(), 1);
        assert!(f.fabric.try_next_write().is_none());

        // Each unresolved send asks for the key
        let (lookup, dest) = f.fabric.next_oob().await;
        assert_eq!(lookup[0], OobType::KeyLookup as u8);
        assert_eq!(lookup.len(), OOB_MESSAGE_SIZE);
        assert_eq!(dest, addr.partial_key());
        f.fabric.next_oob().await;

        f.store.update(remote).await;
        let (bytes, to) = f.fabric.next_write().await;
        assert_eq!(to, remote);
        assert_eq!(bytes, traffic(b"second"));
        assert!(f.fabric.try_next_write().is_none());
        assert_eq!(f.store.buffered_packets(), 0);
    }

    #[tokio::test]
    async fn test_address_and_subnet_buffers_flush_together() {
        let f = fixture();
        let remote = SigningKey::generate(&mut OsRng).public_key();
        f.store.send_to_address(Address::for_key(&remote), b"a").await;
        f.store.send_to_subnet(Subnet::for_key(&remote), b"s").await;
        assert_eq!(f.store.buffered_packets(), 2);

        f.store.update(remote).await;
        assert_eq!(f.fabric.next_write().await.0, traffic(b"a"));
        assert_eq!(f.fabric.next_write().await.0, traffic(b"s"));
    }

    #[tokio::test]
    async fn test_known_key_sends_directly() {
        let f = fixture();
        let remote = SigningKey::generate(&mut OsRng).public_key();
        f.store.update(remote).await;

        f.store.send_to_subnet(Subnet::for_key(&remote), b"x").await;
        assert_eq!(f.fabric.next_write().await, (traffic(b"x"), remote));
        assert!(f.fabric.try_next_oob().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_is_idempotent_and_refreshes() {
        let f = fixture();
        let remote = SigningKey::generate(&mut OsRng).public_key();

        f.store.update(remote).await;
        tokio::time::advance(Duration::from_secs(90)).await;
        let info = f.store.update(remote).await;
        assert_eq!(f.store.cached_keys(), 1);
        assert_eq!(info.address, Address::for_key(&remote));

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(f.store.sweep(), 0);
        assert!(f.store.key_info(&remote).is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(f.store.sweep(), 1);
        assert!(f.store.key_info(&remote).is_none());

        // Subnet index is gone too, so sends buffer again
        f.store.send_to_subnet(Subnet::for_key(&remote), b"x").await;
        assert_eq!(f.store.buffered_packets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffers_expire() {
        let f = fixture();
        let remote = SigningKey::generate(&mut OsRng).public_key();
        f.store.send_to_address(Address::for_key(&remote), b"x").await;
        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(f.store.sweep(), 1);
        assert_eq!(f.store.buffered_packets(), 0);
    }

    #[tokio::test]
    async fn test_answers_lookup_for_own_subnet() {
        let local = SigningKey::generate(&mut OsRng);
        let local_pub = local.public_key();
        let f = fixture_with(local);
        let remote = SigningKey::generate(&mut OsRng);

        let partial = Address::for_key(&local_pub).partial_key();
        let mut lookup = vec![OobType::KeyLookup as u8];
        lookup.extend_from_slice(remote.sign(partial.as_bytes()).as_bytes());
        f.store.handle_oob(remote.public_key(), partial, &lookup).await;

        let (response, dest) = f.fabric.next_oob().await;
        assert_eq!(dest, remote.public_key());
        assert_eq!(response[0], OobType::KeyResponse as u8);
        let sig = Signature::from_slice(&response[1..]).unwrap();
        assert!(local_pub.verify(remote.public_key().as_bytes(), &sig).is_ok());
    }

    #[tokio::test]
    async fn test_ignores_bad_lookups() {
        let f = fixture();
        let remote = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng).public_key();

        // Lookup for a subnet we do not own
        let partial = Address::for_key(&other).partial_key();
        let mut lookup = vec![OobType::KeyLookup as u8];
        lookup.extend_from_slice(remote.sign(partial.as_bytes()).as_bytes());
        f.store.handle_oob(remote.public_key(), partial, &lookup).await;

        // Lookup with a bad signature
        let own = Address::for_key(&f.fabric.key).partial_key();
        let mut forged = vec![OobType::KeyLookup as u8];
        forged.extend_from_slice(&[0u8; 64]);
        f.store.handle_oob(remote.public_key(), own, &forged).await;

        // Wrong length
        f.store.handle_oob(remote.public_key(), own, &[1, 2, 3]).await;

        assert!(f.fabric.try_next_oob().is_none());
    }

    #[tokio::test]
    async fn test_signed_response_resolves_key() {
        let local = SigningKey::generate(&mut OsRng);
        let local_pub = local.public_key();
        let f = fixture_with(local);
        let remote = SigningKey::generate(&mut OsRng);
        let remote_pub = remote.public_key();

        f.store.send_to_address(Address::for_key(&remote_pub), b"hi").await;

        let mut response = vec![OobType::KeyResponse as u8];
        response.extend_from_slice(remote.sign(local_pub.as_bytes()).as_bytes());
        f.store.handle_oob(remote_pub, local_pub, &response).await;

        assert_eq!(f.fabric.next_write().await, (traffic(b"hi"), remote_pub));
        assert!(f.store.key_info(&remote_pub).is_some());
    }

    #[tokio::test]
    async fn test_unsigned_response_ignored() {
        let f = fixture();
        let remote = SigningKey::generate(&mut OsRng).public_key();
        let mut response = vec![OobType::KeyResponse as u8];
        response.extend_from_slice(&[7u8; 64]);
        f.store.handle_oob(remote, f.fabric.key, &response).await;
        assert!(f.store.key_info(&remote).is_none());
    }

    #[tokio::test]
    async fn test_read_drops_spoofed_source() {
        let f = fixture();
        let own = f.store.address().0;
        let k1 = SigningKey::generate(&mut OsRng).public_key();
        let k2 = SigningKey::generate(&mut OsRng).public_key();

        let spoofed = ipv6_packet(Address::for_key(&k1).0, own, 60);
        let genuine = ipv6_packet(Address::for_key(&k2).0, own, 61);
        f.fabric.inject(traffic(&spoofed), k2);
        f.fabric.inject(traffic(&genuine), k2);

        assert_eq!(f.store.read_packet().await.unwrap(), genuine);
    }

    #[tokio::test]
    async fn test_read_accepts_subnet_traffic() {
        let f = fixture();
        let remote = SigningKey::generate(&mut OsRng).public_key();
        let mut src = [0u8; 16];
        src[..8].copy_from_slice(&Subnet::for_key(&remote).0);
        src[15] = 1;
        let mut dst = [0u8; 16];
        dst[..8].copy_from_slice(&f.store.subnet().0);
        dst[15] = 2;

        let packet = ipv6_packet(src, dst, 48);
        f.fabric.inject(traffic(&packet), remote);
        assert_eq!(f.store.read_packet().await.unwrap(), packet);
        assert!(f.store.key_info(&remote).is_some());
    }

    #[tokio::test]
    async fn test_read_drops_foreign_destination_and_junk() {
        let f = fixture();
        let remote = SigningKey::generate(&mut OsRng).public_key();
        let other = SigningKey::generate(&mut OsRng).public_key();

        let foreign = ipv6_packet(Address::for_key(&remote).0, Address::for_key(&other).0, 40);
        f.fabric.inject(traffic(&foreign), remote);
        f.fabric.inject(traffic(&[0x60; 10]), remote);
        f.fabric.inject(traffic(&[0x10; 50]), remote);

        let good = ipv6_packet(Address::for_key(&remote).0, f.store.address().0, 40);
        f.fabric.inject(traffic(&good), remote);
        assert_eq!(f.store.read_packet().await.unwrap(), good);
    }

    #[tokio::test]
    async fn test_oversized_inbound_gets_packet_too_big() {
        let f = fixture();
        f.store.set_mtu(1280);
        let remote = SigningKey::generate(&mut OsRng).public_key();
        f.store.update(remote).await;

        let big = ipv6_packet(Address::for_key(&remote).0, f.store.address().0, 1400);
        f.fabric.inject(traffic(&big), remote);
        let good = ipv6_packet(Address::for_key(&remote).0, f.store.address().0, 40);
        f.fabric.inject(traffic(&good), remote);

        assert_eq!(f.store.read_packet().await.unwrap(), good);
        let (bytes, to) = f.fabric.next_write().await;
        assert_eq!(to, remote);
        let reply = &bytes[1..];
        assert_eq!(reply[40], icmpv6::ICMPV6_PACKET_TOO_BIG);
        assert_eq!(&reply[44..48], &1280u32.to_be_bytes());
        assert_eq!(&reply[24..40], &Address::for_key(&remote).0);
    }

    #[tokio::test]
    async fn test_write_validates_source() {
        let f = fixture();
        let remote = SigningKey::generate(&mut OsRng).public_key();
        let dst = Address::for_key(&remote).0;

        let bad = ipv6_packet(Address::for_key(&remote).0, dst, 40);
        assert!(matches!(
            f.store.write_packet(&bad).await,
            Err(NodeError::InvalidPacket(_))
        ));
        assert!(f.store.write_packet(&[0x60; 20]).await.is_err());
        assert!(f.store.write_packet(&[0x00; 60]).await.is_err());
        assert!(f.store.write_packet(&[]).await.is_err());

        let good = ipv6_packet(f.store.address().0, dst, 40);
        assert_eq!(f.store.write_packet(&good).await.unwrap(), 40);
        assert_eq!(f.store.buffered_packets(), 1);
    }

    #[tokio::test]
    async fn test_write_without_tunnel_rejects_foreign_destination() {
        let f = fixture();
        let mut dst = [0u8; 16];
        dst[0] = 0x20; // 2000::/3
        let packet = ipv6_packet(f.store.address().0, dst, 40);
        assert!(f.store.write_packet(&packet).await.is_err());
    }

    struct StaticTunnel {
        key: PublicKey,
    }

    impl TunnelRouting for StaticTunnel {
        fn key_for_destination(&self, dest: IpAddr) -> Option<PublicKey> {
            matches!(dest, IpAddr::V4(v4) if v4.octets()[0] == 10).then_some(self.key)
        }

        fn admit_source(&self, from: &PublicKey, src: IpAddr) -> bool {
            *from == self.key && matches!(src, IpAddr::V4(v4) if v4.octets()[0] == 10)
        }
    }

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut p = vec![0u8; 28];
        p[0] = 0x45;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        p
    }

    #[tokio::test]
    async fn test_tunnel_routing() {
        let f = fixture();
        let gateway = SigningKey::generate(&mut OsRng).public_key();
        let stranger = SigningKey::generate(&mut OsRng).public_key();

        let out = ipv4_packet([192, 168, 1, 1], [10, 0, 0, 1]);
        assert!(f.store.write_packet(&out).await.is_err());

        f.store
            .set_tunnel_routing(Some(Arc::new(StaticTunnel { key: gateway })));
        assert_eq!(f.store.write_packet(&out).await.unwrap(), out.len());
        assert_eq!(f.fabric.next_write().await, (traffic(&out), gateway));

        let unrouted = ipv4_packet([192, 168, 1, 1], [172, 16, 0, 1]);
        assert!(f.store.write_packet(&unrouted).await.is_err());

        let from_stranger = ipv4_packet([10, 0, 0, 9], [192, 168, 1, 1]);
        let from_gateway = ipv4_packet([10, 0, 0, 7], [192, 168, 1, 1]);
        f.fabric.inject(traffic(&from_stranger), stranger);
        f.fabric.inject(traffic(&from_gateway), gateway);
        assert_eq!(f.store.read_packet().await.unwrap(), from_gateway);
    }

    #[test]
    fn test_overlay_fields() {
        let mut packet = vec![0u8; 40];
        packet[8] = 0x02;
        packet[9] = 0xAA;
        let (addr, subnet) = overlay_fields(&packet, 8).unwrap();
        assert!(addr.is_valid());
        assert_eq!(subnet.0[1], 0xAA);
        assert!(overlay_fields(&packet, 30).is_none());
    }

    #[tokio::test]
    async fn test_mtu_clamped() {
        let f = fixture();
        f.store.set_mtu(100);
        assert_eq!(f.store.mtu(), 1280);
        f.store.set_mtu(1_000_000);
        assert_eq!(f.store.mtu(), f.store.max_mtu());
        assert_eq!(f.store.max_mtu(), 65534);
    }
}
