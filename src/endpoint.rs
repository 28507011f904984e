//! Endpoint identity and the transport contract.
//!
//! Per the design notes, endpoints do not hold a back-reference to their
//! transport. An [`Endpoint`] is just a name and a receive buffer; sending
//! goes through a separate [`Transport`] handle that looks the destination
//! up by [`EndpointId`] in its own table. This avoids the owning cycle the
//! original callback-based design had.

use crate::error::KatapultError;
use crate::reassembler::Reassembler;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointId {
    CanAdmin,
    CanNode(u32),
    Serial,
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::CanAdmin => write!(f, "can-admin"),
            EndpointId::CanNode(id) => write!(f, "can-node-{id}"),
            EndpointId::Serial => write!(f, "serial"),
        }
    }
}

#[derive(Clone)]
pub struct Endpoint {
    id: EndpointId,
    reassembler: Reassembler,
}

impl Endpoint {
    pub fn new(id: EndpointId) -> Self {
        Endpoint {
            reassembler: Reassembler::new(id.to_string()),
            id,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn feed(&self, data: &[u8]) {
        self.reassembler.feed(data);
    }

    pub fn close(&self) {
        self.reassembler.close();
    }

    pub async fn read(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>, KatapultError> {
        self.reassembler.read(n, timeout).await
    }

    pub async fn read_exactly(
        &self,
        n: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, KatapultError> {
        self.reassembler.read_exactly(n, timeout).await
    }

    pub async fn read_until(
        &self,
        sep: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, KatapultError> {
        self.reassembler.read_until(sep, timeout).await
    }
}

/// Union-of-transports contract (design notes: "tagged variant with two
/// operations"). The command engine is generic over this trait, not over
/// the concrete CAN/serial transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` to the endpoint named by `id`. For CAN this fragments
    /// into <=8 byte frames; for serial `id` is ignored beyond validation.
    async fn send(&self, id: EndpointId, payload: &[u8]) -> Result<(), KatapultError>;

    /// Idempotently close the transport, signalling EOF to every endpoint.
    async fn close(&self);
}
