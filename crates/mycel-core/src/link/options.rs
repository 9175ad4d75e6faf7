//! Per-link options carried in the peering URI query string.
//!
//! ```text
//! tls://peer.example:443?key=<hex>&key=<hex>&priority=2&sni=peer.example
//! ```
//!
//! `sni` is consumed by the TLS-based transports themselves and is only
//! tolerated here.

use crate::node::{NodeError, Result};
use mycel_crypto::PublicKey;
use url::Url;

/// Options negotiated for one link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkOptions {
    /// Remote keys accepted on this link; empty accepts any key
    pub pinned_keys: Vec<PublicKey>,
    /// Local priority; the higher of both ends' values is used
    pub priority: u8,
}

impl LinkOptions {
    /// Read options from a peering or listen URL
    ///
    /// # Errors
    /// Returns `NodeError::PinnedKeyInvalid` for a `key` that is not 32
    /// hex-encoded bytes, `NodeError::PriorityInvalid` for a `priority`
    /// outside `0..=255`.
    pub fn from_url(url: &Url) -> Result<Self> {
        let mut options = Self::default();
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "key" => {
                    let bytes = hex::decode(value.as_ref()).map_err(|_| NodeError::PinnedKeyInvalid)?;
                    let key = PublicKey::from_slice(&bytes).map_err(|_| NodeError::PinnedKeyInvalid)?;
                    options.pinned_keys.push(key);
                }
                "priority" => {
                    options.priority = value.parse().map_err(|_| NodeError::PriorityInvalid)?;
                }
                _ => {}
            }
        }
        Ok(options)
    }

    /// Whether `key` may be accepted on this link
    #[must_use]
    pub fn accepts(&self, key: &PublicKey) -> bool {
        self.pinned_keys.is_empty() || self.pinned_keys.contains(key)
    }
}
