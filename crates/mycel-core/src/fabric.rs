//! Contract with the routing fabric.
//!
//! The fabric moves opaque payloads between nodes by public key. This crate
//! only adopts authenticated connections into it and exchanges payloads
//! through it; how packets are forwarded between non-adjacent nodes is the
//! fabric's business.

use crate::node::Result;
use async_trait::async_trait;
use mycel_crypto::PublicKey;
use mycel_transport::BoxedStream;
use serde::Serialize;
use std::sync::Arc;

/// Called with `(from, to, payload)` for every out-of-band message
pub type OobHandler = Arc<dyn Fn(PublicKey, PublicKey, Vec<u8>) + Send + Sync>;

/// Called with a key whenever the path to it changes
pub type PathNotify = Arc<dyn Fn(PublicKey) + Send + Sync>;

/// The fabric's view of the local node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FabricSelf {
    /// Local key
    pub key: PublicKey,
    /// Root of the fabric's spanning structure, if it has one
    pub root: PublicKey,
    /// Coordinates in that structure
    pub coords: Vec<u64>,
}

/// Packet-forwarding layer consumed by the node
#[async_trait]
pub trait RoutingFabric: Send + Sync {
    /// Send `payload` to the node holding `dest`
    ///
    /// # Errors
    /// Returns `NodeError::NoRoute` if the fabric cannot reach `dest`, or
    /// `NodeError::InvalidState` once closed.
    async fn write_to(&self, payload: &[u8], dest: &PublicKey) -> Result<usize>;

    /// Wait for the next payload and its sender
    ///
    /// # Errors
    /// Returns `NodeError::InvalidState` once closed.
    async fn read_from(&self) -> Result<(Vec<u8>, PublicKey)>;

    /// Send an out-of-band message towards `dest`, which may be a partial key
    ///
    /// # Errors
    /// Returns `NodeError::NoRoute` if nothing is reachable.
    async fn send_out_of_band(&self, dest: &PublicKey, payload: &[u8]) -> Result<()>;

    /// Install the out-of-band message handler, replacing any previous one
    fn set_out_of_band_handler(&self, handler: OobHandler);

    /// Adopt an authenticated connection to `key` as a forwarding link.
    ///
    /// Resolves when the connection drops.
    ///
    /// # Errors
    /// Returns the error that ended the connection.
    async fn handle_conn(&self, key: PublicKey, stream: BoxedStream, priority: u8) -> Result<()>;

    /// Largest payload accepted by [`write_to`](Self::write_to)
    fn mtu(&self) -> u64;

    /// Shut down; pending and future reads fail
    fn close(&self);

    /// Install the path-change callback
    fn set_path_notify(&self, notify: PathNotify);

    /// Local position in the fabric
    fn debug_self(&self) -> FabricSelf;

    /// Keys of directly connected peers
    fn debug_peers(&self) -> Vec<PublicKey>;

    /// Keys known to the fabric's routing structure
    fn debug_tree(&self) -> Vec<PublicKey>;
}
