//! The "datagram transport" capability abstraction (§9 design note).
//!
//! Two sibling transports share an identical surface: the main fabric
//! endpoint and, for co-located peers, a shared-memory transport. The
//! engine routes per-peer by the peer's `is_local` bit rather than branching
//! on transport type at every call site.

use crate::error::RdmError;
use crate::peer::PeerHandle;
use crate::protocol::Packet;

/// One raw completion pulled off a transport's CQ, before the progress
/// engine has classified it against tx/rx entry state.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    SendComplete { peer: PeerHandle, packet: Packet },
    RecvComplete { peer: PeerHandle, packet: Packet },
    Rnr { peer: PeerHandle, packet: Packet },
    Error { peer: PeerHandle, prov_errno: i32 },
}

pub trait DatagramTransport: Send {
    /// Posts a receive buffer; the transport fills it in on the next
    /// matching inbound packet and reports it through `poll_cq`.
    fn post_recv(&mut self) -> Result<(), RdmError>;

    /// Submits a packet for transmission, non-blocking.
    fn send(&mut self, peer: PeerHandle, packet: Packet) -> Result<(), RdmError>;

    /// Small, unreliable, fire-and-forget control path used for pure
    /// acknowledgements (CONNACK) that don't warrant a full entry.
    fn inject(&mut self, peer: PeerHandle, packet: Packet) -> Result<(), RdmError>;

    /// Drains up to `max` completions.
    fn poll_cq(&mut self, max: usize) -> Vec<TransportEvent>;

    /// Number of receive buffers currently posted to this transport.
    fn posted_recv_count(&self) -> usize;
}

pub mod fabric;
pub mod shm;

pub use fabric::FabricTransport;
pub use shm::ShmTransport;

/// Enum-dispatch wrapper so the engine can hold either transport behind one
/// concrete type without a vtable.
pub enum Transport {
    Fabric(FabricTransport),
    Shm(ShmTransport),
}

macro_rules! dispatch {
    ($self:ident, $fn:ident $(, $args:expr)*) => {
        match $self {
            Transport::Fabric(t) => t.$fn($($args),*),
            Transport::Shm(t) => t.$fn($($args),*),
        }
    };
}

impl DatagramTransport for Transport {
    fn post_recv(&mut self) -> Result<(), RdmError> {
        dispatch!(self, post_recv)
    }

    fn send(&mut self, peer: PeerHandle, packet: Packet) -> Result<(), RdmError> {
        dispatch!(self, send, peer, packet)
    }

    fn inject(&mut self, peer: PeerHandle, packet: Packet) -> Result<(), RdmError> {
        dispatch!(self, inject, peer, packet)
    }

    fn poll_cq(&mut self, max: usize) -> Vec<TransportEvent> {
        dispatch!(self, poll_cq, max)
    }

    fn posted_recv_count(&self) -> usize {
        dispatch!(self, posted_recv_count)
    }
}
