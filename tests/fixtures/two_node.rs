//! Two-node fixture: a listening node and a dialling node sharing a TCP link
//!
//! Both nodes run on a [`DirectFabric`], so traffic only reaches the node at
//! the other end of the link.
//!
//! # Example
//!
//! ```no_run
//! use mycel_integration_tests::fixtures::TwoNodeFixture;
//!
//! # async fn demo() -> mycel_core::Result<()> {
//! let fixture = TwoNodeFixture::new().await?;
//! fixture.connect().await?;
//! let info = fixture.dialer.remote_get_self(fixture.listener.public_key()).await?;
//! fixture.cleanup();
//! # Ok(())
//! # }
//! ```

use mycel_core::direct::DirectFabric;
use mycel_core::{Core, NodeConfig, NodeError, Result};
use mycel_crypto::{PublicKey, SigningKey};
use mycel_transport::tcp::TcpProtocol;
use mycel_transport::{TransportConfig, TransportRegistry, TransportType};
use rand_core::OsRng;
use std::sync::Arc;
use std::time::Duration;

/// Fabric MTU used by every fixture node
const FABRIC_MTU: u64 = 65535;

/// How long to wait for a link to come up
const LINK_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry holding only the TCP transport
#[must_use]
pub fn tcp_registry() -> TransportRegistry {
    let mut transports = TransportRegistry::empty();
    transports.register(
        TransportType::Tcp,
        Arc::new(TcpProtocol::new(TransportConfig::default())),
    );
    transports
}

/// Wait until `fabric` has a live link to `peer`
///
/// # Errors
/// Returns `NodeError::Timeout` if the link is not up within five seconds.
pub async fn wait_for_neighbour(fabric: &DirectFabric, peer: PublicKey) -> Result<()> {
    use mycel_core::RoutingFabric;

    tokio::time::timeout(LINK_TIMEOUT, async {
        while !fabric.debug_peers().contains(&peer) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| NodeError::timeout("link did not come up"))
}

/// A listening node and a dialling node
pub struct TwoNodeFixture {
    pub listener: Core,
    pub dialer: Core,
    pub listener_fabric: Arc<DirectFabric>,
    pub dialer_fabric: Arc<DirectFabric>,
}

impl TwoNodeFixture {
    /// Two nodes with default configuration and random keys
    ///
    /// # Errors
    /// Returns the first node startup error.
    pub async fn new() -> Result<Self> {
        Self::new_with_config(NodeConfig::default(), NodeConfig::default()).await
    }

    /// Two nodes with custom configuration
    ///
    /// The listener always gets a TCP listener on an ephemeral loopback port
    /// in addition to whatever `listener_config` names.
    ///
    /// # Errors
    /// Returns the first node startup error.
    pub async fn new_with_config(
        mut listener_config: NodeConfig,
        dialer_config: NodeConfig,
    ) -> Result<Self> {
        crate::init_tracing();
        listener_config.listen.push("tcp://127.0.0.1:0".into());
        let (listener, listener_fabric) =
            Self::start_node(SigningKey::generate(&mut OsRng), listener_config).await?;
        let (dialer, dialer_fabric) =
            match Self::start_node(SigningKey::generate(&mut OsRng), dialer_config).await {
                Ok(node) => node,
                Err(e) => {
                    listener.stop();
                    return Err(e);
                }
            };
        Ok(Self {
            listener,
            dialer,
            listener_fabric,
            dialer_fabric,
        })
    }

    /// Start one node over TCP with `key`
    ///
    /// # Errors
    /// Returns the node startup error.
    pub async fn start_node(key: SigningKey, config: NodeConfig) -> Result<(Core, Arc<DirectFabric>)> {
        let fabric = Arc::new(DirectFabric::new(key.public_key(), FABRIC_MTU));
        let core = Core::with_transports(key, config, fabric.clone(), tcp_registry()).await?;
        Ok((core, fabric))
    }

    /// Peering URI of the listener's TCP listener
    ///
    /// # Errors
    /// Returns `NodeError::InvalidState` if the listener has been stopped.
    pub fn listener_uri(&self) -> Result<String> {
        self.listener
            .listen_addrs()
            .into_iter()
            .next()
            .map(|addr| format!("tcp://{addr}"))
            .ok_or(NodeError::InvalidState("listener stopped".into()))
    }

    /// Dial the listener once and wait until both fabrics see the link
    ///
    /// # Errors
    /// Returns the dial error, or `NodeError::Timeout` if either side never
    /// registers the link.
    pub async fn connect(&self) -> Result<()> {
        self.dialer.call_peer(&self.listener_uri()?, None).await?;
        wait_for_neighbour(&self.dialer_fabric, self.listener.public_key()).await?;
        wait_for_neighbour(&self.listener_fabric, self.dialer.public_key()).await
    }

    /// Stop both nodes
    pub fn cleanup(self) {
        self.dialer.stop();
        self.listener.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixture_creation() {
        let fixture = TwoNodeFixture::new().await.unwrap();
        assert_ne!(fixture.listener.public_key(), fixture.dialer.public_key());
        assert!(fixture.listener_uri().unwrap().starts_with("tcp://127.0.0.1:"));
        fixture.cleanup();
    }

    #[tokio::test]
    async fn test_fixture_connect() {
        let fixture = TwoNodeFixture::new().await.unwrap();
        fixture.connect().await.unwrap();
        assert_eq!(fixture.dialer.get_peers().await.unwrap().len(), 1);
        assert_eq!(fixture.listener.get_peers().await.unwrap().len(), 1);
        fixture.cleanup();
    }
}
