//! Version metadata exchanged at the start of every link.
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! +------+---------+-----------------------------------------+
//! | meta | len u16 | { tag u16 | len u16 | value } ...       |
//! +------+---------+-----------------------------------------+
//!   4B      2B       len bytes of TLV records
//! ```
//!
//! Records: major version (tag 0, 2B), minor version (tag 1, 2B), public
//! key (tag 2, 32B), priority (tag 3, 1B). Unknown tags are skipped.

use crate::error::WireError;
use crate::{PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use mycel_crypto::{PublicKey, ED25519_PUBLIC_KEY_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Metadata magic
pub const META_MAGIC: [u8; 4] = *b"meta";

/// Magic plus length field
pub const META_HEADER_SIZE: usize = 6;

const TAG_MAJOR_VER: u16 = 0;
const TAG_MINOR_VER: u16 = 1;
const TAG_PUBLIC_KEY: u16 = 2;
const TAG_PRIORITY: u16 = 3;

/// Handshake payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionMetadata {
    /// Protocol major version
    pub major_ver: u16,
    /// Protocol minor version
    pub minor_ver: u16,
    /// Sender's Ed25519 public key; any length decodes, [`check`](Self::check) enforces 32
    pub public_key: Vec<u8>,
    /// Link priority requested by the sender
    pub priority: u8,
}

impl VersionMetadata {
    /// Metadata carrying this build's protocol version
    #[must_use]
    pub fn base(public_key: &PublicKey, priority: u8) -> Self {
        Self {
            major_ver: PROTOCOL_VERSION_MAJOR,
            minor_ver: PROTOCOL_VERSION_MINOR,
            public_key: public_key.as_bytes().to_vec(),
            priority,
        }
    }

    /// Encode to wire format
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 * 4 + 2 + 2 + self.public_key.len() + 1);
        push_field(&mut body, TAG_MAJOR_VER, &self.major_ver.to_be_bytes());
        push_field(&mut body, TAG_MINOR_VER, &self.minor_ver.to_be_bytes());
        push_field(&mut body, TAG_PUBLIC_KEY, &self.public_key);
        push_field(&mut body, TAG_PRIORITY, &[self.priority]);

        let mut out = Vec::with_capacity(META_HEADER_SIZE + body.len());
        out.extend_from_slice(&META_MAGIC);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decode from wire format
    ///
    /// # Errors
    /// Returns a [`WireError`] if the magic, length or any record is malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < META_HEADER_SIZE {
            return Err(WireError::TooShort {
                expected: META_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[..4] != META_MAGIC {
            return Err(WireError::BadMagic);
        }
        let declared = usize::from(u16::from_be_bytes([bytes[4], bytes[5]]));
        let mut body = &bytes[META_HEADER_SIZE..];
        if body.len() != declared {
            return Err(WireError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }

        let mut meta = Self::default();
        while !body.is_empty() {
            if body.len() < 4 {
                return Err(WireError::TooShort {
                    expected: 4,
                    actual: body.len(),
                });
            }
            let tag = u16::from_be_bytes([body[0], body[1]]);
            let len = usize::from(u16::from_be_bytes([body[2], body[3]]));
            body = &body[4..];
            if body.len() < len {
                return Err(WireError::TruncatedField(tag));
            }
            let (value, rest) = body.split_at(len);
            body = rest;

            match tag {
                TAG_MAJOR_VER => meta.major_ver = be_u16(tag, value)?,
                TAG_MINOR_VER => meta.minor_ver = be_u16(tag, value)?,
                TAG_PUBLIC_KEY => meta.public_key = value.to_vec(),
                TAG_PRIORITY => {
                    let [p] = value else {
                        return Err(WireError::InvalidFieldLength { tag, len });
                    };
                    meta.priority = *p;
                }
                _ => {}
            }
        }
        Ok(meta)
    }

    /// Whether the remote speaks exactly this build's protocol version and
    /// sent a full-size key
    #[must_use]
    pub fn check(&self) -> bool {
        self.major_ver == PROTOCOL_VERSION_MAJOR
            && self.minor_ver == PROTOCOL_VERSION_MINOR
            && self.public_key.len() == ED25519_PUBLIC_KEY_SIZE
    }

    /// The sender's key, if it has the right size
    #[must_use]
    pub fn key(&self) -> Option<PublicKey> {
        PublicKey::from_slice(&self.public_key).ok()
    }

    /// `major.minor` rendering used in log lines
    #[must_use]
    pub fn version_string(&self) -> String {
        format!("{}.{}", self.major_ver, self.minor_ver)
    }

    /// Read one metadata message from `reader`
    ///
    /// # Errors
    /// Returns `std::io::ErrorKind::InvalidData` if the header is not a
    /// metadata header, or any underlying read error.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
        let mut header = [0u8; META_HEADER_SIZE];
        reader.read_exact(&mut header).await?;
        if header[..4] != META_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                WireError::BadMagic,
            ));
        }
        let len = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let mut out = vec![0u8; META_HEADER_SIZE + len];
        out[..META_HEADER_SIZE].copy_from_slice(&header);
        reader.read_exact(&mut out[META_HEADER_SIZE..]).await?;
        Ok(out)
    }
}

fn push_field(buf: &mut Vec<u8>, tag: u16, value: &[u8]) {
    buf.extend_from_slice(&tag.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

fn be_u16(tag: u16, value: &[u8]) -> Result<u16, WireError> {
    match value {
        [a, b] => Ok(u16::from_be_bytes([*a, *b])),
        _ => Err(WireError::InvalidFieldLength {
            tag,
            len: value.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VersionMetadata {
        VersionMetadata::base(&PublicKey::from_bytes([7u8; 32]), 3)
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample().encode();
        assert_eq!(&bytes[..4], b"meta");
        let declared = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        assert_eq!(declared, bytes.len() - META_HEADER_SIZE);
        // 4 records of 4-byte headers plus 2 + 2 + 32 + 1 value bytes
        assert_eq!(declared, 16 + 37);
        // First record is the major version
        assert_eq!(&bytes[6..10], &[0, 0, 0, 2]);
    }

    #[test]
    fn test_roundtrip() {
        let meta = sample();
        assert_eq!(VersionMetadata::decode(&meta.encode()).unwrap(), meta);
    }

    #[test]
    fn test_check() {
        assert!(sample().check());

        let mut older = sample();
        older.minor_ver = 4;
        assert!(!older.check());

        let mut newer_major = sample();
        newer_major.major_ver = 1;
        assert!(!newer_major.check());

        let mut short_key = sample();
        short_key.public_key.truncate(31);
        assert!(!short_key.check());
    }

    #[test]
    fn test_unknown_tags_skipped() {
        let meta = sample();
        let mut bytes = meta.encode();
        // Append an unknown record and fix up the length
        bytes.extend_from_slice(&[0x00, 0x63, 0x00, 0x03, 1, 2, 3]);
        let len = (bytes.len() - META_HEADER_SIZE) as u16;
        bytes[4..6].copy_from_slice(&len.to_be_bytes());
        assert_eq!(VersionMetadata::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            VersionMetadata::decode(b"met"),
            Err(WireError::TooShort { .. })
        ));
        assert_eq!(
            VersionMetadata::decode(b"nope\x00\x00"),
            Err(WireError::BadMagic)
        );

        let mut bytes = sample().encode();
        bytes.pop();
        assert!(matches!(
            VersionMetadata::decode(&bytes),
            Err(WireError::LengthMismatch { .. })
        ));

        // Record claims more bytes than present
        let bytes = [b'm', b'e', b't', b'a', 0, 5, 0, 2, 0, 32, 1];
        assert_eq!(
            VersionMetadata::decode(&bytes),
            Err(WireError::TruncatedField(2))
        );

        // Version field with the wrong width
        let bytes = [b'm', b'e', b't', b'a', 0, 5, 0, 0, 0, 1, 9];
        assert!(matches!(
            VersionMetadata::decode(&bytes),
            Err(WireError::InvalidFieldLength { tag: 0, len: 1 })
        ));
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let meta = sample();
        let mut wire = meta.encode();
        wire.extend_from_slice(b"trailing traffic");
        let mut reader = &wire[..];
        let read = VersionMetadata::read_from(&mut reader).await.unwrap();
        assert_eq!(VersionMetadata::decode(&read).unwrap(), meta);
        assert_eq!(reader, b"trailing traffic");
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..128)) {
            let _ = VersionMetadata::decode(&bytes);
        }

        #[test]
        fn prop_decode_with_magic_never_panics(body in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..96)) {
            let mut bytes = META_MAGIC.to_vec();
            bytes.extend_from_slice(&(body.len() as u16).to_be_bytes());
            bytes.extend_from_slice(&body);
            if let Ok(meta) = VersionMetadata::decode(&bytes) {
                proptest::prop_assert!(meta.public_key.len() <= body.len());
            }
        }
    }
}
