//! Metadata exchange and link authorization.
//!
//! Both ends write their metadata before reading the peer's, so neither
//! side can stall waiting for the other to speak first.

use crate::link::options::LinkOptions;
use crate::node::{NodeError, Result};
use crate::version::VersionMetadata;
use mycel_crypto::PublicKey;
use std::borrow::Cow;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Exchange metadata over `stream` and return the remote's, if compatible
///
/// # Errors
/// Returns `NodeError::Timeout` if the exchange does not finish within
/// `timeout`, `NodeError::Io` on stream failure, `NodeError::Handshake` for
/// undecodable metadata and `NodeError::IncompatibleVersion` on a version
/// or key-size mismatch.
pub async fn exchange<S>(
    stream: &mut S,
    local: &VersionMetadata,
    timeout: Duration,
) -> Result<VersionMetadata>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let raw = tokio::time::timeout(timeout, async {
        stream.write_all(&local.encode()).await?;
        stream.flush().await?;
        VersionMetadata::read_from(stream).await
    })
    .await
    .map_err(|_| NodeError::timeout("handshake timed out"))??;

    let remote = VersionMetadata::decode(&raw).map_err(|e| {
        NodeError::Handshake(Cow::Owned(format!("failed to decode metadata: {e}")))
    })?;
    if !remote.check() {
        return Err(NodeError::IncompatibleVersion {
            local: local.version_string(),
            remote: remote.version_string(),
        });
    }
    Ok(remote)
}

/// Apply the pinned-key and allowed-key policies to a remote key.
///
/// Pinned keys always apply. The allowed list applies only to inbound links
/// that are not forced (link-local peers are), and only when it is non-empty.
///
/// # Errors
/// Returns `NodeError::PinnedKeyMismatch` or `NodeError::Unauthorized`.
pub fn authorize(
    remote: &PublicKey,
    options: &LinkOptions,
    allowed: &[PublicKey],
    incoming: bool,
    force: bool,
) -> Result<()> {
    if !options.accepts(remote) {
        return Err(NodeError::PinnedKeyMismatch(remote.to_hex()));
    }
    if incoming && !force && !allowed.is_empty() && !allowed.contains(remote) {
        return Err(NodeError::Unauthorized(remote.to_hex()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};

    fn key(b: u8) -> PublicKey {
        PublicKey::from_bytes([b; 32])
    }

    #[tokio::test]
    async fn test_exchange_success() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let meta_a = VersionMetadata::base(&key(1), 3);
        let meta_b = VersionMetadata::base(&key(2), 0);
        let timeout = Duration::from_secs(5);

        let (ra, rb) = tokio::join!(
            exchange(&mut a, &meta_a, timeout),
            exchange(&mut b, &meta_b, timeout)
        );
        assert_eq!(ra.unwrap(), meta_b);
        let rb = rb.unwrap();
        assert_eq!(rb.key(), Some(key(1)));
        assert_eq!(rb.priority, 3);
    }

    #[tokio::test]
    async fn test_exchange_version_mismatch() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let meta_a = VersionMetadata::base(&key(1), 0);
        let mut meta_b = VersionMetadata::base(&key(2), 0);
        meta_b.minor_ver = PROTOCOL_VERSION_MINOR - 1;
        let timeout = Duration::from_secs(5);

        let (ra, rb) = tokio::join!(
            exchange(&mut a, &meta_a, timeout),
            exchange(&mut b, &meta_b, timeout)
        );
        let err = ra.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "incompatible version (local {PROTOCOL_VERSION_MAJOR}.{PROTOCOL_VERSION_MINOR}, remote {PROTOCOL_VERSION_MAJOR}.{})",
                PROTOCOL_VERSION_MINOR - 1
            )
        );
        // b only checks what it received, and a sent current metadata
        assert_eq!(rb.unwrap().minor_ver, PROTOCOL_VERSION_MINOR);
    }

    #[tokio::test]
    async fn test_exchange_garbage() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        b.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let err = exchange(&mut a, &VersionMetadata::base(&key(1), 0), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_timeout() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let err = exchange(&mut a, &VersionMetadata::base(&key(1), 0), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Timeout(_)));
    }

    #[test]
    fn test_authorize_pinned() {
        let options = LinkOptions {
            pinned_keys: vec![key(1)],
            priority: 0,
        };
        assert!(authorize(&key(1), &options, &[], false, false).is_ok());
        assert!(matches!(
            authorize(&key(2), &options, &[], false, true),
            Err(NodeError::PinnedKeyMismatch(_))
        ));
    }

    #[test]
    fn test_authorize_allowed_list() {
        let options = LinkOptions::default();
        let allowed = [key(1)];
        assert!(authorize(&key(1), &options, &allowed, true, false).is_ok());
        assert!(matches!(
            authorize(&key(2), &options, &allowed, true, false),
            Err(NodeError::Unauthorized(_))
        ));
        // Outbound and link-local links skip the allowed list
        assert!(authorize(&key(2), &options, &allowed, false, false).is_ok());
        assert!(authorize(&key(2), &options, &allowed, true, true).is_ok());
        // An empty list allows everyone
        assert!(authorize(&key(2), &options, &[], true, false).is_ok());
    }
}
