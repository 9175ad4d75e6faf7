//! Overlay address and subnet derivation.
//!
//! Node addresses live in `0200::/7`. An address is derived from the
//! bitwise inverse of the node's public key: the number of leading one
//! bits becomes byte 1, the first zero bit is skipped, and the remaining
//! bits fill the rest of the 16 bytes. A node's routed `/64` subnet is the
//! first 8 bytes of its address with the low bit of byte 0 set.
//!
//! Because the derivation keeps a prefix of the key, an address or subnet
//! can be turned back into a *partial* key: the visible bits are exact and
//! all hidden bits are zero in the inverted domain. [`Address::partial_key`]
//! and [`Subnet::partial_key`] return that value, which peers use as the
//! target of out-of-band key lookups.

use crate::signatures::PublicKey;
use crate::ED25519_PUBLIC_KEY_SIZE;
use std::fmt;
use std::net::Ipv6Addr;

/// Address family prefix byte
pub const ADDRESS_PREFIX: u8 = 0x02;

/// Low bit of the prefix byte marks a subnet
const SUBNET_FLAG: u8 = 0x01;

/// Number of prefix bytes (prefix plus ones count)
const HEADER_LEN: usize = 2;

/// Overlay IPv6 address of a node (`/128`)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 16]);

/// Routed `/64` prefix owned by a node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Subnet(pub [u8; 8]);

impl Address {
    /// Derive the address for a public key
    #[must_use]
    pub fn for_key(key: &PublicKey) -> Self {
        let mut inverted = *key.as_bytes();
        for b in &mut inverted {
            *b = !*b;
        }

        let mut addr = [0u8; 16];
        addr[0] = ADDRESS_PREFIX;

        let mut ones: u8 = 0;
        let mut done = false;
        let mut acc: u8 = 0;
        let mut n_bits = 0;
        let mut out = HEADER_LEN;

        for idx in 0..8 * ED25519_PUBLIC_KEY_SIZE {
            let bit = (inverted[idx / 8] >> (7 - (idx % 8))) & 1;
            if !done {
                if bit != 0 {
                    ones = ones.wrapping_add(1);
                } else {
                    done = true;
                }
                continue;
            }
            acc = (acc << 1) | bit;
            n_bits += 1;
            if n_bits == 8 {
                n_bits = 0;
                if out < addr.len() {
                    addr[out] = acc;
                    out += 1;
                } else {
                    break;
                }
            }
        }

        // A key of all zeros has 256 leading ones, stored as 0
        addr[1] = ones;
        Self(addr)
    }

    /// Whether the address falls within the node address range
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0[0] == ADDRESS_PREFIX
    }

    /// Recover the partial public key visible in this address
    #[must_use]
    pub fn partial_key(&self) -> PublicKey {
        partial_key_from(&self.0)
    }

    /// View as a standard IPv6 address
    #[must_use]
    pub fn to_ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }
}

impl Subnet {
    /// Derive the routed subnet for a public key
    #[must_use]
    pub fn for_key(key: &PublicKey) -> Self {
        let addr = Address::for_key(key);
        let mut subnet = [0u8; 8];
        subnet.copy_from_slice(&addr.0[..8]);
        subnet[0] |= SUBNET_FLAG;
        Self(subnet)
    }

    /// Whether the prefix falls within the routed subnet range
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0[0] == ADDRESS_PREFIX | SUBNET_FLAG
    }

    /// Recover the partial public key visible in this subnet
    #[must_use]
    pub fn partial_key(&self) -> PublicKey {
        let mut addr = [0u8; 16];
        addr[..8].copy_from_slice(&self.0);
        partial_key_from(&addr)
    }

    /// View as a standard IPv6 address with the host part zeroed
    #[must_use]
    pub fn to_ipv6(&self) -> Ipv6Addr {
        let mut addr = [0u8; 16];
        addr[..8].copy_from_slice(&self.0);
        Ipv6Addr::from(addr)
    }
}

fn partial_key_from(addr: &[u8; 16]) -> PublicKey {
    let mut key = [0u8; ED25519_PUBLIC_KEY_SIZE];
    let ones = usize::from(addr[1]);
    for idx in 0..ones {
        key[idx / 8] |= 0x80 >> (idx % 8);
    }

    let key_offset = ones + 1;
    let addr_offset = 8 * HEADER_LEN;
    for idx in addr_offset..8 * addr.len() {
        let key_idx = key_offset + (idx - addr_offset);
        if key_idx / 8 >= key.len() {
            break;
        }
        let bit = (addr[idx / 8] >> (7 - (idx % 8))) & 1;
        key[key_idx / 8] |= bit << (7 - (key_idx % 8));
    }

    for b in &mut key {
        *b = !*b;
    }
    PublicKey::from_bytes(key)
}

/// Whether `addr` lies anywhere in the overlay range (`0200::/7`)
#[must_use]
pub fn in_overlay_range(addr: &Ipv6Addr) -> bool {
    addr.octets()[0] & !SUBNET_FLAG == ADDRESS_PREFIX
}

impl From<Address> for Ipv6Addr {
    fn from(addr: Address) -> Self {
        addr.to_ipv6()
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Self(ip.octets())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_ipv6())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_ipv6(), f)
    }
}

impl fmt::Debug for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subnet({}/64)", self.to_ipv6())
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/64", self.to_ipv6())
    }
}
