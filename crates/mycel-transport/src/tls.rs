//! TLS links and the node's TLS identity.
//!
//! The certificate is self-signed with the node's own Ed25519 key. Peers do
//! not validate it: the overlay handshake that follows authenticates the
//! key, and pinned keys are enforced there. TLS only provides transport
//! confidentiality and a traffic shape that passes through middleboxes.

use crate::listener::ChannelListener;
use crate::tcp::{self, TcpLinkListener};
use crate::transport::{
    DialOptions, LinkConn, LinkListener, LinkProtocol, LinkStream, TransportError,
    TransportResult,
};
use crate::TransportConfig;
use async_trait::async_trait;
use mycel_crypto::SigningKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use url::Url;

/// PKCS#8 v1 wrapper for a raw Ed25519 seed (RFC 8410)
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

/// Certificate subject name
const CERT_NAME: &str = "mycel";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Self-signed certificate and client/server configs derived from it
#[derive(Clone)]
pub struct TlsIdentity {
    server: Arc<rustls::ServerConfig>,
    client: Arc<rustls::ClientConfig>,
}

impl TlsIdentity {
    /// Build a TLS identity for `key` with the given ALPN protocols.
    ///
    /// # Errors
    /// Returns `TransportError::Tls` if certificate generation or config
    /// assembly fails.
    pub fn new(key: &SigningKey, alpn: &[&[u8]]) -> TransportResult<Self> {
        let (certs, private) = self_signed_cert(key)?;
        let provider = provider();

        let mut server = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(tls_err)?
            .with_no_client_auth()
            .with_single_cert(certs, private)
            .map_err(tls_err)?;
        server.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        let mut client = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(tls_err)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth();
        client.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }

    /// rustls server config
    #[must_use]
    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        self.server.clone()
    }

    /// rustls client config
    #[must_use]
    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        self.client.clone()
    }

    /// Run the client side of a TLS handshake over `stream`.
    ///
    /// Without an SNI host the server name falls back to the peer IP,
    /// which rustls never places in the SNI extension.
    pub(crate) async fn connect<S: LinkStream>(
        &self,
        stream: S,
        sni: Option<&str>,
        peer_ip: IpAddr,
    ) -> TransportResult<tokio_rustls::client::TlsStream<S>> {
        let name = match sni {
            Some(host) => ServerName::try_from(host.to_string())
                .map_err(|e| TransportError::Tls(format!("invalid SNI {host}: {e}")))?,
            None => ServerName::IpAddress(peer_ip.into()),
        };
        Ok(TlsConnector::from(self.client.clone())
            .connect(name, stream)
            .await?)
    }

    /// Run the server side of a TLS handshake over `stream`
    pub(crate) async fn accept<S: LinkStream>(
        &self,
        stream: S,
    ) -> TransportResult<tokio_rustls::server::TlsStream<S>> {
        Ok(TlsAcceptor::from(self.server.clone()).accept(stream).await?)
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity").finish_non_exhaustive()
    }
}

fn tls_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

fn self_signed_cert(
    key: &SigningKey,
) -> TransportResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut pkcs8 = Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + 32);
    pkcs8.extend_from_slice(&ED25519_PKCS8_PREFIX);
    pkcs8.extend_from_slice(&key.to_bytes());

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der).map_err(tls_err)?;

    let mut params = rcgen::CertificateParams::new(vec![CERT_NAME.to_string()]).map_err(tls_err)?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(key.public_key().to_hex()),
    );
    let cert = params.self_signed(&key_pair).map_err(tls_err)?;

    Ok((
        vec![CertificateDer::from(cert.der().to_vec())],
        PrivateKeyDer::Pkcs8(pkcs8.into()),
    ))
}

/// Accepts any server certificate while still checking handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// SNI host for a peering URL.
///
/// An explicit `sni` query parameter wins, then the URL host. IP literals
/// are never used.
#[must_use]
pub fn sni_for(url: &Url) -> Option<String> {
    choose_sni(url, url.host_str())
}

pub(crate) fn choose_sni(url: &Url, host: Option<&str>) -> Option<String> {
    let not_ip = |h: &str| {
        let bare = h.trim_start_matches('[').trim_end_matches(']');
        bare.parse::<IpAddr>().is_err()
    };
    if let Some((_, sni)) = url.query_pairs().find(|(k, _)| k == "sni") {
        if !sni.is_empty() && not_ip(&sni) {
            return Some(sni.into_owned());
        }
    }
    host.filter(|h| !h.is_empty() && not_ip(h))
        .map(str::to_string)
}

/// `tls://host:port?sni=name`
#[derive(Debug, Clone)]
pub struct TlsProtocol {
    config: TransportConfig,
    identity: TlsIdentity,
}

impl TlsProtocol {
    /// Create a TLS adapter using `identity`
    #[must_use]
    pub fn new(config: TransportConfig, identity: TlsIdentity) -> Self {
        Self { config, identity }
    }
}

#[async_trait]
impl LinkProtocol for TlsProtocol {
    async fn dial(&self, url: &Url, options: &DialOptions) -> TransportResult<LinkConn> {
        let stream = tcp::dial_url(
            url,
            options.source_interface.as_deref(),
            self.config.dial_timeout,
        )
        .await?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let sni = sni_for(url);
        let tls = tokio::time::timeout(
            self.config.dial_timeout,
            self.identity.connect(stream, sni.as_deref(), remote.ip()),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        Ok(LinkConn::new(tls, local.to_string(), remote.to_string()))
    }

    async fn listen(
        &self,
        url: &Url,
        source_interface: Option<&str>,
    ) -> TransportResult<Box<dyn LinkListener>> {
        let listener = tcp::listen_url(url, source_interface, self.config.backlog).await?;
        let inner = TcpLinkListener::from(listener);
        let identity = self.identity.clone();
        Ok(Box::new(ChannelListener::upgrading(
            inner,
            self.config.dial_timeout,
            move |stream| {
                let identity = identity.clone();
                async move {
                    let local = stream.local_addr()?.to_string();
                    let remote = stream.peer_addr()?.to_string();
                    let tls = identity.accept(stream).await?;
                    Ok::<_, TransportError>(LinkConn::new(tls, local, remote))
                }
            },
        )))
    }
}
