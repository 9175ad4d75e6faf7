//! # mycel Crypto
//!
//! Cryptographic identity for the mycel overlay.
//!
//! This crate provides:
//! - Ed25519 signing keys and raw public keys
//! - Detached 64-byte signatures
//! - Deterministic derivation of overlay IPv6 addresses (`/128`) and
//!   routed subnets (`/64`) from public keys
//! - Recovery of the partial public key visible in an address or subnet,
//!   used as the target of out-of-band key lookups
//!
//! ## Address layout
//!
//! | Byte | Address | Subnet |
//! |------|---------|--------|
//! | 0 | `0x02` | `0x03` |
//! | 1 | leading one bits of `!key` | leading one bits of `!key` |
//! | 2.. | `!key` after the first zero bit | same, truncated to 8 bytes |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod address;
pub mod error;
pub mod signatures;

pub use address::{Address, Subnet};
pub use error::CryptoError;
pub use signatures::{PublicKey, Signature, SigningKey};

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key (seed) size
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;
