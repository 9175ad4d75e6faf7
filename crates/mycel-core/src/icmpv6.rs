//! ICMPv6 Packet Too Big generation (RFC 4443 section 3.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type=2    |     Code=0    |          Checksum             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             MTU                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    As much of invoking packet as fits in the minimum MTU      |
//! ```

use std::net::Ipv6Addr;

/// IPv6 next-header value for ICMPv6
pub const IPPROTO_ICMPV6: u8 = 58;

/// ICMPv6 Packet Too Big type
pub const ICMPV6_PACKET_TOO_BIG: u8 = 2;

/// IPv6 fixed header length
pub const IPV6_HEADER_LEN: usize = 40;

const ICMPV6_HEADER_LEN: usize = 8;
const MIN_IPV6_MTU: usize = 1280;
const MAX_INVOKING_BYTES: usize = MIN_IPV6_MTU - IPV6_HEADER_LEN - ICMPV6_HEADER_LEN;

/// Build a Packet Too Big reply to `original`.
///
/// The reply is sourced from the original destination and addressed to the
/// original source. Returns `None` for packets that must not trigger an
/// ICMPv6 error: non-IPv6, truncated, multicast or unspecified source, or
/// ICMPv6 errors themselves.
#[must_use]
pub fn packet_too_big(original: &[u8], mtu: u32) -> Option<Vec<u8>> {
    if original.len() < IPV6_HEADER_LEN || original[0] >> 4 != 6 {
        return None;
    }
    let src = ipv6_at(original, 8)?;
    let dst = ipv6_at(original, 24)?;
    if src.is_unspecified() || src.is_multicast() {
        return None;
    }
    if original[6] == IPPROTO_ICMPV6
        && original.len() > IPV6_HEADER_LEN
        && original[IPV6_HEADER_LEN] < 128
    {
        return None;
    }

    let invoking = original.len().min(MAX_INVOKING_BYTES);
    let icmp_len = ICMPV6_HEADER_LEN + invoking;
    let mut out = vec![0u8; IPV6_HEADER_LEN + icmp_len];

    out[0] = 0x60;
    out[4..6].copy_from_slice(&(icmp_len as u16).to_be_bytes());
    out[6] = IPPROTO_ICMPV6;
    out[7] = 64; // hop limit
    out[8..24].copy_from_slice(&dst.octets());
    out[24..40].copy_from_slice(&src.octets());

    let icmp = &mut out[IPV6_HEADER_LEN..];
    icmp[0] = ICMPV6_PACKET_TOO_BIG;
    icmp[4..8].copy_from_slice(&mtu.to_be_bytes());
    icmp[ICMPV6_HEADER_LEN..].copy_from_slice(&original[..invoking]);

    let checksum = icmpv6_checksum(&out[IPV6_HEADER_LEN..], &dst, &src);
    out[IPV6_HEADER_LEN + 2..IPV6_HEADER_LEN + 4].copy_from_slice(&checksum.to_be_bytes());
    Some(out)
}

/// ICMPv6 checksum over the IPv6 pseudo-header and `message`
///
/// `message` must have its checksum field zeroed.
#[must_use]
pub fn icmpv6_checksum(message: &[u8], src: &Ipv6Addr, dst: &Ipv6Addr) -> u16 {
    let mut sum: u32 = 0;
    let mut add = |bytes: &[u8]| {
        for chunk in bytes.chunks(2) {
            let word = match chunk {
                [hi, lo] => u16::from_be_bytes([*hi, *lo]),
                [hi] => u16::from_be_bytes([*hi, 0]),
                _ => 0,
            };
            sum += u32::from(word);
        }
    };
    add(&src.octets());
    add(&dst.octets());
    add(&(message.len() as u32).to_be_bytes());
    add(&[0, 0, 0, IPPROTO_ICMPV6]);
    add(message);

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn ipv6_at(packet: &[u8], offset: usize) -> Option<Ipv6Addr> {
    let octets: [u8; 16] = packet.get(offset..offset + 16)?.try_into().ok()?;
    Some(Ipv6Addr::from(octets))
}
