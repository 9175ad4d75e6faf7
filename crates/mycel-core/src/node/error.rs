//! Error types for the node API
//!
//! Errors are grouped the way the node reacts to them:
//!
//! - **Transient**: may succeed on retry (dial failures, timeouts)
//! - **Permanent**: need operator intervention (bad configuration, wrong keys)
//!
//! Handshake and authorization failures are never fatal to the node; they are
//! logged and the offending connection is closed. Configuration errors are
//! only fatal at [`Core::new`](crate::Core::new).

use mycel_crypto::CryptoError;
use mycel_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Maximum serialized size of the local node-info object
pub const MAX_NODE_INFO_SIZE: usize = 16384;

/// Errors that can occur in node operations
#[derive(Debug, Error)]
pub enum NodeError {
    // ============ Transport Errors ============
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // ============ Handshake Errors ============
    /// Metadata exchange failed
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// Remote advertised a different protocol version
    #[error("incompatible version (local {local}, remote {remote})")]
    IncompatibleVersion {
        /// Our version
        local: String,
        /// Their version
        remote: String,
    },

    /// Remote key is not in the allowed public keys
    #[error("node public key that does not match AllowedPublicKeys: {0}")]
    Unauthorized(String),

    /// Remote key is not among the keys pinned on the peering URI
    #[error("node public key that does not match pinned keys: {0}")]
    PinnedKeyMismatch(String),

    /// Local end of the connection is inside the overlay range
    #[error("connection is tunneled over the overlay: {0}")]
    TunneledConnection(String),

    // ============ Packet Errors ============
    /// Routing fabric has no path to the destination key
    #[error("no route to {0}")]
    NoRoute(String),

    /// Outbound packet rejected
    #[error("Invalid packet: {0}")]
    InvalidPacket(Cow<'static, str>),

    /// Local node info too large
    #[error("NodeInfo exceeds max length of {MAX_NODE_INFO_SIZE} bytes")]
    NodeInfoTooLarge,

    // ============ Configuration Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Peering or listen URI did not parse
    #[error("Invalid URI {uri}: {reason}")]
    InvalidUri {
        /// The URI as given
        uri: String,
        /// Parser message
        reason: String,
    },

    /// URI scheme has no transport
    #[error("link schema unknown: {0}")]
    UnrecognisedScheme(String),

    /// `priority` query parameter is not a u8
    #[error("priority value is invalid")]
    PriorityInvalid,

    /// `key` query parameter is not a hex-encoded public key
    #[error("pinned public key is invalid")]
    PinnedKeyInvalid,

    /// Persistent peer already registered
    #[error("peer is already configured")]
    AlreadyConfigured,

    /// Persistent peer not registered
    #[error("peer is not configured")]
    NotConfigured,

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("{0}")]
    Timeout(Cow<'static, str>),

    /// Actor or task channel closed
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Key material rejected
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Stream I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for edge cases
    #[error("{0}")]
    Other(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Transport(_)
                | NodeError::NoRoute(_)
                | NodeError::Timeout(_)
                | NodeError::Channel(_)
                | NodeError::Io(_)
                | NodeError::Handshake(_)
        )
    }

    /// Returns true if this error will not go away without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidConfig(_)
                | NodeError::InvalidUri { .. }
                | NodeError::UnrecognisedScheme(_)
                | NodeError::PriorityInvalid
                | NodeError::PinnedKeyInvalid
                | NodeError::IncompatibleVersion { .. }
                | NodeError::Unauthorized(_)
                | NodeError::PinnedKeyMismatch(_)
                | NodeError::Crypto(_)
        )
    }

    /// Returns true if a persistent peer should be redialled after this error
    #[must_use]
    pub fn should_retry(&self) -> bool {
        !self.is_permanent() || matches!(self, NodeError::Unauthorized(_))
    }

    /// Create a handshake error with static context (zero allocation)
    #[must_use]
    pub const fn handshake(context: &'static str) -> Self {
        NodeError::Handshake(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create a channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        NodeError::Channel(Cow::Borrowed(context))
    }

    /// Create an invalid packet error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_packet(context: &'static str) -> Self {
        NodeError::InvalidPacket(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
