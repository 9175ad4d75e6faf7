//! Session-typed view of the routing fabric.
//!
//! Every in-band payload starts with a [`SessionType`] byte. Traffic
//! payloads are handed to the caller; proto payloads are diverted to the
//! [`ProtoHandler`]; anything else is dropped.

use crate::fabric::RoutingFabric;
use crate::node::Result;
use crate::proto::ProtoHandler;
use crate::wire::SessionType;
use mycel_crypto::PublicKey;
use std::sync::Arc;
use tracing::trace;

/// Traffic channel over the fabric
pub struct PacketConn {
    fabric: Arc<dyn RoutingFabric>,
    proto: ProtoHandler,
}

impl PacketConn {
    /// Wrap a fabric, diverting proto messages to `proto`
    pub fn new(fabric: Arc<dyn RoutingFabric>, proto: ProtoHandler) -> Self {
        Self { fabric, proto }
    }

    /// The underlying fabric
    #[must_use]
    pub fn fabric(&self) -> &Arc<dyn RoutingFabric> {
        &self.fabric
    }

    /// The proto handler
    #[must_use]
    pub fn proto(&self) -> &ProtoHandler {
        &self.proto
    }

    /// Largest traffic payload
    #[must_use]
    pub fn mtu(&self) -> u64 {
        self.fabric.mtu().saturating_sub(1)
    }

    /// Send a traffic payload to `dest`
    ///
    /// # Errors
    /// Propagates the fabric's error.
    pub async fn write_to(&self, payload: &[u8], dest: &PublicKey) -> Result<usize> {
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(SessionType::Traffic as u8);
        buf.extend_from_slice(payload);
        let n = self.fabric.write_to(&buf, dest).await?;
        Ok(n.saturating_sub(1))
    }

    /// Wait for the next traffic payload
    ///
    /// # Errors
    /// Propagates the fabric's error, e.g. once it is closed.
    pub async fn read_from(&self) -> Result<(Vec<u8>, PublicKey)> {
        loop {
            let (mut payload, from) = self.fabric.read_from().await?;
            let Some(&kind) = payload.first() else {
                continue;
            };
            match SessionType::try_from(kind) {
                Ok(SessionType::Traffic) => {
                    payload.remove(0);
                    return Ok((payload, from));
                }
                Ok(SessionType::Proto) => {
                    self.proto.handle_inbound(from, payload.split_off(1));
                }
                Ok(SessionType::Dummy) => {}
                Err(e) => trace!("Dropping payload from {}: {}", from, e),
            }
        }
    }
}

impl std::fmt::Debug for PacketConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketConn")
            .field("mtu", &self.mtu())
            .finish_non_exhaustive()
    }
}
