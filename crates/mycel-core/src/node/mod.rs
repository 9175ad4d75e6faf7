//! Node layer for mycel
//!
//! [`Core`] is the entry point for embedding applications. It owns the
//! node's key and ties the protocol pieces together:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Core                              │
//! │   (peers, listeners, packets, admin calls, lifecycle)    │
//! ├──────────────────┬──────────────────┬────────────────────┤
//! │   LinkManager    │    KeyStore      │   ProtoHandler     │
//! │ (handshake,      │ (address lookup, │ (node info, debug  │
//! │  dedup, authz)   │  buffering)      │  requests)         │
//! ├──────────────────┴──────────────────┴────────────────────┤
//! │                   RoutingFabric                          │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
#[allow(clippy::module_inception)]
pub mod node;

pub use config::{KeyStoreConfig, LinkConfig, NodeConfig, PeerConfig, ProtoConfig};
pub use node::Core;
pub use error::{NodeError, Result};
