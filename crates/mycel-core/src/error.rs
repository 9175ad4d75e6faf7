//! Wire-level decoding errors.

use thiserror::Error;

/// Errors decoding handshake metadata or control messages
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer too short to parse
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Handshake did not start with the metadata magic
    #[error("bad metadata magic")]
    BadMagic,

    /// Declared length does not match the bytes present
    #[error("length mismatch: declared {declared}, got {actual}")]
    LengthMismatch {
        /// Length from the header
        declared: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// A TLV record runs past the end of the buffer
    #[error("truncated field with tag {0}")]
    TruncatedField(u16),

    /// A known field has the wrong size
    #[error("field with tag {tag} has invalid length {len}")]
    InvalidFieldLength {
        /// Field tag
        tag: u16,
        /// Length found
        len: usize,
    },

    /// Unknown type discriminator
    #[error("invalid {kind} type: 0x{value:02X}")]
    InvalidType {
        /// Which discriminator
        kind: &'static str,
        /// Byte found
        value: u8,
    },
}
