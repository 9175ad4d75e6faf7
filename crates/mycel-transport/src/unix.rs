//! UNIX domain socket links (`unix:///path/to/socket`).

use crate::transport::{
    DialOptions, LinkConn, LinkListener, LinkProtocol, TransportError, TransportResult,
};
use crate::TransportConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use url::Url;

/// `unix:///path`
#[derive(Debug, Clone, Default)]
pub struct UnixProtocol {
    config: TransportConfig,
}

impl UnixProtocol {
    /// Create a UNIX socket adapter
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

fn socket_path(url: &Url) -> TransportResult<PathBuf> {
    let path = url.path();
    if path.is_empty() || path == "/" {
        return Err(TransportError::InvalidConfig(format!(
            "missing socket path in {url}"
        )));
    }
    Ok(PathBuf::from(path))
}

fn peer_name(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "@".to_string())
}

#[async_trait]
impl LinkProtocol for UnixProtocol {
    async fn dial(&self, url: &Url, _options: &DialOptions) -> TransportResult<LinkConn> {
        let path = socket_path(url)?;
        let stream = tokio::time::timeout(self.config.dial_timeout, UnixStream::connect(&path))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let local = stream.local_addr()?;
        Ok(LinkConn::new(
            stream,
            peer_name(local.as_pathname()),
            path.display().to_string(),
        ))
    }

    async fn listen(
        &self,
        url: &Url,
        _source_interface: Option<&str>,
    ) -> TransportResult<Box<dyn LinkListener>> {
        let path = socket_path(url)?;
        let listener = UnixListener::bind(&path)
            .map_err(|e| TransportError::BindFailed(format!("{}: {e}", path.display())))?;
        Ok(Box::new(UnixLinkListener { listener, path }))
    }
}

/// Inbound UNIX socket connections
pub struct UnixLinkListener {
    listener: UnixListener,
    path: PathBuf,
}

#[async_trait]
impl LinkListener for UnixLinkListener {
    async fn accept(&mut self) -> TransportResult<LinkConn> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(LinkConn::new(
            stream,
            self.path.display().to_string(),
            peer_name(peer.as_pathname()),
        ))
    }

    fn local_addr(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for UnixLinkListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_socket_path() {
        let url = Url::parse("unix:///run/mycel.sock").unwrap();
        assert_eq!(socket_path(&url).unwrap(), PathBuf::from("/run/mycel.sock"));
        assert!(socket_path(&Url::parse("unix:///").unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_unix_dial_listen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.sock");
        let url = Url::parse(&format!("unix://{}", path.display())).unwrap();

        let proto = UnixProtocol::default();
        let mut listener = proto.listen(&url, None).await.unwrap();
        assert_eq!(listener.local_addr(), path.display().to_string());

        let dial_opts = DialOptions::default();
        let (client, server) =
            tokio::join!(proto.dial(&url, &dial_opts), listener.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();
        assert_eq!(client.remote, path.display().to_string());
        assert_eq!(server.remote, "@");

        server.stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        drop(listener);
        assert!(!path.exists());
    }
}
