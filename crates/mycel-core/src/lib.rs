//! # mycel Core
//!
//! Link establishment and crypto-addressed packet delivery for the mycel
//! overlay.
//!
//! This crate provides:
//! - The version metadata handshake exchanged on every link
//! - A link manager that dials, accepts, authorizes and deduplicates links
//!   and hands them to a routing fabric
//! - A key store resolving overlay addresses to public keys through signed
//!   out-of-band lookups
//! - The in-band control protocol (node info, debug queries)
//! - The [`Core`](node::Core) facade tying these together
//!
//! ## Data flow
//!
//! ```text
//! connection ─▶ LinkManager ─▶ RoutingFabric::handle_conn
//!
//! write_packet ─▶ KeyStore ─▶ PacketConn ─▶ RoutingFabric::write_to
//! read_packet  ◀─ KeyStore ◀─ PacketConn ◀─ RoutingFabric::read_from
//!                                  └──▶ ProtoHandler (control messages)
//! ```
//!
//! A background task inside [`Core`](node::Core) drives the read side, so
//! control messages are answered even when nothing calls `read_packet`.
//!
//! The fabric itself is external; [`direct::DirectFabric`] is a
//! single-hop implementation for running nodes without one.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod direct;
pub mod error;
pub mod fabric;
pub mod icmpv6;
pub mod keystore;
pub mod link;
pub mod node;
pub mod nodeinfo;
pub mod packet_conn;
pub mod proto;
pub mod version;
pub mod wire;

#[cfg(test)]
mod testing;

pub use error::WireError;
pub use fabric::{FabricSelf, RoutingFabric};
pub use keystore::{KeyInfo, KeyStore, TunnelRouting};
pub use link::{LinkDone, LinkInfo, LinkManager, LinkOptions, ListenerHandle, PeerInfo};
pub use node::{Core, NodeConfig, NodeError, Result};
pub use version::VersionMetadata;

/// Protocol major version; peers must match exactly
pub const PROTOCOL_VERSION_MAJOR: u16 = 0;

/// Protocol minor version; peers must match exactly
pub const PROTOCOL_VERSION_MINOR: u16 = 5;
