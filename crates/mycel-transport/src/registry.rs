//! Scheme registry for link protocols.
//!
//! Maps a peering URL scheme to the adapter that serves it. Platform-only
//! adapters are compiled in where supported; elsewhere their schemes are
//! reported as unsupported.

use crate::mpath::MpathProtocol;
use crate::quic::QuicProtocol;
use crate::socks::SocksProtocol;
use crate::tcp::TcpProtocol;
use crate::tls::{TlsIdentity, TlsProtocol};
use crate::transport::{LinkProtocol, TransportError, TransportResult};
use crate::ws::WsProtocol;
use crate::TransportConfig;
use mycel_crypto::SigningKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Link transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportType {
    /// Plain TCP
    Tcp,
    /// TLS over TCP
    Tls,
    /// UNIX domain socket
    Unix,
    /// TCP through a SOCKS5 proxy
    Socks,
    /// TLS through a SOCKS5 proxy
    SocksTls,
    /// SCTP
    Sctp,
    /// QUIC
    Quic,
    /// WebSocket
    Ws,
    /// WebSocket over TLS
    Wss,
    /// VM sockets
    Vsock,
    /// Multipath TCP
    Mpath,
}

impl TransportType {
    /// Every known transport type
    pub const ALL: [TransportType; 11] = [
        TransportType::Tcp,
        TransportType::Tls,
        TransportType::Unix,
        TransportType::Socks,
        TransportType::SocksTls,
        TransportType::Sctp,
        TransportType::Quic,
        TransportType::Ws,
        TransportType::Wss,
        TransportType::Vsock,
        TransportType::Mpath,
    ];

    /// Parse a URL scheme (case-insensitive)
    #[must_use]
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        let scheme = scheme.to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.scheme() == scheme)
    }

    /// URL scheme for this transport
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            TransportType::Tcp => "tcp",
            TransportType::Tls => "tls",
            TransportType::Unix => "unix",
            TransportType::Socks => "socks",
            TransportType::SocksTls => "sockstls",
            TransportType::Sctp => "sctp",
            TransportType::Quic => "quic",
            TransportType::Ws => "ws",
            TransportType::Wss => "wss",
            TransportType::Vsock => "vsock",
            TransportType::Mpath => "mpath",
        }
    }

    /// Whether the transport can accept inbound connections
    #[must_use]
    pub const fn can_listen(self) -> bool {
        !matches!(self, TransportType::Socks | TransportType::SocksTls)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Registry of link protocols keyed by transport type.
///
/// # Examples
///
/// ```no_run
/// use mycel_crypto::SigningKey;
/// use mycel_transport::{TransportConfig, TransportRegistry};
///
/// # fn example(key: &SigningKey) -> Result<(), Box<dyn std::error::Error>> {
/// let registry = TransportRegistry::new(key, TransportConfig::default())?;
/// let url = url::Url::parse("tls://peer.example:443")?;
/// let (kind, _protocol) = registry.for_url(&url)?;
/// assert_eq!(kind.scheme(), "tls");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TransportRegistry {
    protocols: HashMap<TransportType, Arc<dyn LinkProtocol>>,
}

impl TransportRegistry {
    /// Build every adapter available on this platform.
    ///
    /// # Arguments
    /// * `key` - Node identity, used for the TLS and QUIC certificates
    /// * `config` - Shared transport settings
    ///
    /// # Errors
    /// Returns `TransportError::Tls` if the TLS identity cannot be built
    pub fn new(key: &SigningKey, config: TransportConfig) -> TransportResult<Self> {
        let identity = TlsIdentity::new(key, &[])?;
        let mut protocols: HashMap<TransportType, Arc<dyn LinkProtocol>> = HashMap::new();

        protocols.insert(TransportType::Tcp, Arc::new(TcpProtocol::new(config.clone())));
        protocols.insert(
            TransportType::Tls,
            Arc::new(TlsProtocol::new(config.clone(), identity.clone())),
        );
        protocols.insert(TransportType::Socks, Arc::new(SocksProtocol::new(config.clone())));
        protocols.insert(
            TransportType::SocksTls,
            Arc::new(SocksProtocol::with_tls(config.clone(), identity.clone())),
        );
        protocols.insert(
            TransportType::Quic,
            Arc::new(QuicProtocol::new(config.clone(), key)?),
        );
        protocols.insert(TransportType::Ws, Arc::new(WsProtocol::new(config.clone())));
        protocols.insert(
            TransportType::Wss,
            Arc::new(WsProtocol::secure(config.clone(), identity)),
        );
        protocols.insert(TransportType::Mpath, Arc::new(MpathProtocol::new(config.clone())));

        #[cfg(unix)]
        protocols.insert(
            TransportType::Unix,
            Arc::new(crate::unix::UnixProtocol::new(config.clone())),
        );
        #[cfg(target_os = "linux")]
        {
            protocols.insert(
                TransportType::Sctp,
                Arc::new(crate::sctp::SctpProtocol::new(config.clone())),
            );
            protocols.insert(
                TransportType::Vsock,
                Arc::new(crate::vsock::VsockProtocol::new(config)),
            );
        }

        Ok(Self { protocols })
    }

    /// Empty registry, for embedding custom adapters
    #[must_use]
    pub fn empty() -> Self {
        Self {
            protocols: HashMap::new(),
        }
    }

    /// Install or replace the adapter for a transport type
    pub fn register(&mut self, kind: TransportType, protocol: Arc<dyn LinkProtocol>) {
        self.protocols.insert(kind, protocol);
    }

    /// Adapter for a transport type, if available on this platform
    #[must_use]
    pub fn get(&self, kind: TransportType) -> Option<Arc<dyn LinkProtocol>> {
        self.protocols.get(&kind).cloned()
    }

    /// Adapter for a URL's scheme
    ///
    /// # Errors
    /// Returns `TransportError::UnsupportedScheme` if the scheme is unknown
    /// or not available on this platform
    pub fn for_url(&self, url: &Url) -> TransportResult<(TransportType, Arc<dyn LinkProtocol>)> {
        let kind = TransportType::from_scheme(url.scheme())
            .ok_or_else(|| TransportError::UnsupportedScheme(url.scheme().to_string()))?;
        let protocol = self
            .get(kind)
            .ok_or_else(|| TransportError::UnsupportedScheme(url.scheme().to_string()))?;
        Ok((kind, protocol))
    }

    /// Transport types available in this registry, sorted
    #[must_use]
    pub fn available_transports(&self) -> Vec<TransportType> {
        let mut kinds: Vec<_> = self.protocols.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("transports", &self.available_transports())
            .finish()
    }
}
