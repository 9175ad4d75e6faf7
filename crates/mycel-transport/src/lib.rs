//! # mycel Transport
//!
//! Link transports for the mycel overlay.
//!
//! Every supported peering URI scheme is served by a [`LinkProtocol`]
//! implementation exposing the same two operations:
//!
//! ```text
//!   dial(url, options)   -> LinkConn       (outbound byte stream)
//!   listen(url, sintf)   -> LinkListener   (yields inbound LinkConns)
//! ```
//!
//! Adapters select the address family, bind link-local dials to the
//! requested interface, traverse SOCKS proxies and negotiate TLS, QUIC or
//! WebSocket framing. They never perform the overlay handshake; that is
//! the link manager's job in `mycel-core`.
//!
//! | Scheme | Platform | Module |
//! |--------|----------|--------|
//! | `tcp` | all | [`tcp`] |
//! | `tls` | all | [`tls`] |
//! | `unix` | unix | [`unix`] |
//! | `socks`, `sockstls` | all | [`socks`] |
//! | `sctp` | linux | [`sctp`] |
//! | `quic` | all | [`quic`] |
//! | `ws`, `wss` | all | [`ws`] |
//! | `vsock` | linux | [`vsock`] |
//! | `mpath` | all (MPTCP on linux) | [`mpath`] |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mpath;
pub mod quic;
pub mod registry;
pub mod socks;
pub mod tcp;
pub mod tls;
pub mod transport;
pub mod ws;

mod listener;

#[cfg(target_os = "linux")]
pub mod sctp;
#[cfg(unix)]
pub mod unix;
#[cfg(target_os = "linux")]
pub mod vsock;

#[cfg(target_os = "linux")]
mod fd;

pub use registry::{TransportRegistry, TransportType};
pub use transport::{
    BoxedStream, CountingStream, DialOptions, LinkConn, LinkCounters, LinkListener,
    LinkProtocol, LinkStream, TransportError, TransportResult,
};

use std::time::Duration;

/// Transport configuration shared by all adapters
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on establishing an outbound connection
    pub dial_timeout: Duration,
    /// Listen backlog for stream sockets
    pub backlog: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            backlog: 1024,
        }
    }
}
