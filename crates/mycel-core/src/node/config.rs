//! Node configuration
//!
//! All sections implement [`Default`] and deserialize with missing fields
//! filled from the defaults, so an empty JSON object is a valid config.
//! Reading a file is left to the embedding process.

use crate::node::error::{NodeError, Result};
use mycel_crypto::PublicKey;
use mycel_transport::{TransportConfig, TransportType};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use url::Url;

/// Smallest MTU an IPv6 link may have
pub const MIN_MTU: u64 = 1280;

/// Largest payload the key store accepts
pub const MAX_MTU: u64 = 65535;

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// URIs to listen on at startup, e.g. `tls://[::]:0`
    pub listen: Vec<String>,

    /// Persistent peers, redialled with backoff
    pub peers: Vec<PeerConfig>,

    /// Hex-encoded keys allowed to connect inbound; empty allows everyone
    pub allowed_public_keys: Vec<String>,

    /// Operator-supplied node info
    pub node_info: serde_json::Map<String, serde_json::Value>,

    /// Suppress the built-in node-info fields
    pub node_info_privacy: bool,

    /// Link manager tuning
    pub link: LinkConfig,

    /// Key store tuning
    pub key_store: KeyStoreConfig,

    /// Control protocol tuning
    pub proto: ProtoConfig,
}

/// A persistent peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peering URI
    pub uri: String,
    /// Interface to dial from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_interface: Option<String>,
}

impl PeerConfig {
    /// Peer without a source interface
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            source_interface: None,
        }
    }
}

/// Link manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Bound on the metadata exchange
    pub handshake_timeout: Duration,

    /// Bound on establishing the underlying connection
    pub dial_timeout: Duration,

    /// Minimum pause before redialling the same target
    pub call_cooldown: Duration,

    /// Random extra pause added to the cooldown
    pub call_jitter: Duration,

    /// Pause after a listener accept error
    pub accept_retry: Duration,

    /// Cap on the persistent-peer redial backoff
    pub backoff_max: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5),
            call_cooldown: Duration::from_secs(6),
            call_jitter: Duration::from_secs(10),
            accept_retry: Duration::from_secs(1),
            backoff_max: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl LinkConfig {
    /// Settings handed to the transport adapters
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            dial_timeout: self.dial_timeout,
            ..TransportConfig::default()
        }
    }
}

/// Key store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    /// Idle lifetime of cached keys and buffered packets
    pub idle_timeout: Duration,

    /// Largest packet delivered to the application
    pub mtu: u64,

    /// How often expired entries are swept
    pub sweep_interval: Duration,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120), // 2 minutes
            mtu: MAX_MTU,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Control protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtoConfig {
    /// Lifetime of a pending debug or node-info request
    pub request_timeout: Duration,

    /// Deadline for admin-facing synchronous calls
    pub admin_timeout: Duration,
}

impl Default for ProtoConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            admin_timeout: Duration::from_secs(6),
        }
    }
}

impl NodeConfig {
    /// Check the configuration for errors that would prevent startup
    ///
    /// # Errors
    /// Returns `NodeError::InvalidConfig` for malformed keys or tuning
    /// values, `NodeError::InvalidUri` / `NodeError::UnrecognisedScheme` for
    /// unusable listen or peer URIs.
    pub fn validate(&self) -> Result<()> {
        self.allowed_keys()?;

        for uri in &self.listen {
            let url = parse_uri(uri)?;
            match TransportType::from_scheme(url.scheme()) {
                Some(kind) if kind.can_listen() => {}
                Some(kind) => {
                    return Err(NodeError::InvalidConfig(Cow::Owned(format!(
                        "{kind} does not support listening"
                    ))));
                }
                None => return Err(NodeError::UnrecognisedScheme(url.scheme().to_string())),
            }
        }
        for peer in &self.peers {
            let url = parse_uri(&peer.uri)?;
            if TransportType::from_scheme(url.scheme()).is_none() {
                return Err(NodeError::UnrecognisedScheme(url.scheme().to_string()));
            }
        }

        if !(MIN_MTU..=MAX_MTU).contains(&self.key_store.mtu) {
            return Err(NodeError::InvalidConfig(Cow::Owned(format!(
                "mtu must be between {MIN_MTU} and {MAX_MTU}"
            ))));
        }
        if self.key_store.idle_timeout.is_zero() || self.key_store.sweep_interval.is_zero() {
            return Err(NodeError::invalid_config("key store timeouts must be non-zero"));
        }
        if self.link.handshake_timeout.is_zero() || self.link.dial_timeout.is_zero() {
            return Err(NodeError::invalid_config("link timeouts must be non-zero"));
        }
        if self.proto.request_timeout.is_zero() || self.proto.admin_timeout.is_zero() {
            return Err(NodeError::invalid_config("proto timeouts must be non-zero"));
        }
        Ok(())
    }

    /// Decoded allowed public keys
    ///
    /// # Errors
    /// Returns `NodeError::InvalidConfig` naming the first malformed key.
    pub fn allowed_keys(&self) -> Result<Vec<PublicKey>> {
        self.allowed_public_keys
            .iter()
            .map(|hex| {
                hex.parse::<PublicKey>().map_err(|e| {
                    NodeError::InvalidConfig(Cow::Owned(format!(
                        "allowed public key {hex:?}: {e}"
                    )))
                })
            })
            .collect()
    }
}

/// Parse a peering or listen URI
///
/// # Errors
/// Returns `NodeError::InvalidUri` if the string is not a URL.
pub fn parse_uri(uri: &str) -> Result<Url> {
    Url::parse(uri).map_err(|e| NodeError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}
