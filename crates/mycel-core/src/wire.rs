//! Type discriminators for in-band and out-of-band control traffic.
//!
//! ```text
//! in-band:      [session type][payload...]
//! proto:        [session=Proto][proto type][payload...]
//! debug:        [session=Proto][proto=Debug][debug type][payload...]
//! out-of-band:  [oob type][64-byte signature]
//! ```

use crate::error::WireError;

/// First byte of every in-band payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionType {
    /// Padding, dropped on receipt
    Dummy = 0x00,
    /// IP traffic
    Traffic = 0x01,
    /// Control protocol message
    Proto = 0x02,
}

impl TryFrom<u8> for SessionType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Dummy),
            0x01 => Ok(Self::Traffic),
            0x02 => Ok(Self::Proto),
            _ => Err(WireError::InvalidType {
                kind: "session",
                value,
            }),
        }
    }
}

/// Second byte of a proto message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtoType {
    /// Padding
    Dummy = 0x00,
    /// Ask a node for its node info
    NodeInfoRequest = 0x01,
    /// Node info reply
    NodeInfoResponse = 0x02,
    /// Debug request or response, see [`DebugType`]
    Debug = 0xFF,
}

impl TryFrom<u8> for ProtoType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Dummy),
            0x01 => Ok(Self::NodeInfoRequest),
            0x02 => Ok(Self::NodeInfoResponse),
            0xFF => Ok(Self::Debug),
            _ => Err(WireError::InvalidType {
                kind: "proto",
                value,
            }),
        }
    }
}

/// Third byte of a debug message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DebugType {
    /// Padding
    Dummy = 0x00,
    /// Ask for the remote's self info
    GetSelfRequest = 0x01,
    /// Self info reply
    GetSelfResponse = 0x02,
    /// Ask for the remote's peer keys
    GetPeersRequest = 0x03,
    /// Peer keys reply
    GetPeersResponse = 0x04,
    /// Ask for the remote's tree neighbours
    GetTreeRequest = 0x05,
    /// Tree neighbours reply
    GetTreeResponse = 0x06,
}

impl TryFrom<u8> for DebugType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Dummy),
            0x01 => Ok(Self::GetSelfRequest),
            0x02 => Ok(Self::GetSelfResponse),
            0x03 => Ok(Self::GetPeersRequest),
            0x04 => Ok(Self::GetPeersResponse),
            0x05 => Ok(Self::GetTreeRequest),
            0x06 => Ok(Self::GetTreeResponse),
            _ => Err(WireError::InvalidType {
                kind: "debug",
                value,
            }),
        }
    }
}

/// First byte of an out-of-band message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OobType {
    /// Padding
    Dummy = 0x00,
    /// Key lookup for a partial key
    KeyLookup = 0x01,
    /// Answer to a key lookup
    KeyResponse = 0x02,
}

impl TryFrom<u8> for OobType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Dummy),
            0x01 => Ok(Self::KeyLookup),
            0x02 => Ok(Self::KeyResponse),
            _ => Err(WireError::InvalidType { kind: "oob", value }),
        }
    }
}

/// Out-of-band message length: type byte plus signature
pub const OOB_MESSAGE_SIZE: usize = 1 + mycel_crypto::ED25519_SIGNATURE_SIZE;
