//! Main-fabric transport.
//!
//! Fabric/domain/endpoint object lifecycle and name resolution are out of
//! scope; this is the minimal loopback-queue implementation of
//! [`DatagramTransport`] that the engine drives, standing in for whatever
//! verbs/libfabric binding a real deployment supplies.

use std::collections::VecDeque;

use crate::error::RdmError;
use crate::peer::PeerHandle;
use crate::protocol::Packet;

use super::{DatagramTransport, TransportEvent};

pub struct FabricTransport {
    cq_capacity: usize,
    posted_recv: usize,
    outbox: VecDeque<TransportEvent>,
    inbox_capacity: usize,
    /// Packets accepted by `send`/`inject`, retained so a test harness can
    /// relay them to a peer endpoint's transport; real deployments never
    /// read this back.
    sent_log: Vec<(PeerHandle, Packet)>,
}

impl FabricTransport {
    pub fn new(cq_capacity: usize, inbox_capacity: usize) -> Self {
        Self {
            cq_capacity,
            posted_recv: 0,
            outbox: VecDeque::new(),
            inbox_capacity,
            sent_log: Vec::new(),
        }
    }

    /// Test/loopback hook: injects an event as if it had arrived from the
    /// wire, for driving the progress engine without real hardware.
    pub fn deliver(&mut self, event: TransportEvent) -> Result<(), RdmError> {
        if self.outbox.len() >= self.inbox_capacity {
            return Err(RdmError::WouldBlock);
        }
        self.outbox.push_back(event);
        Ok(())
    }

    pub fn take_sent(&mut self) -> Vec<(PeerHandle, Packet)> {
        std::mem::take(&mut self.sent_log)
    }
}

impl DatagramTransport for FabricTransport {
    fn post_recv(&mut self) -> Result<(), RdmError> {
        self.posted_recv += 1;
        Ok(())
    }

    fn send(&mut self, peer: PeerHandle, packet: Packet) -> Result<(), RdmError> {
        self.sent_log.push((peer, packet.clone()));
        self.deliver(TransportEvent::SendComplete { peer, packet })
    }

    fn inject(&mut self, peer: PeerHandle, packet: Packet) -> Result<(), RdmError> {
        self.sent_log.push((peer, packet.clone()));
        self.deliver(TransportEvent::SendComplete { peer, packet })
    }

    fn poll_cq(&mut self, max: usize) -> Vec<TransportEvent> {
        let n = max.min(self.cq_capacity).min(self.outbox.len());
        self.outbox.drain(..n).collect()
    }

    fn posted_recv_count(&self) -> usize {
        self.posted_recv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_cq_respects_requested_max() {
        let mut t = FabricTransport::new(64, 64);
        for _ in 0..5 {
            t.deliver(TransportEvent::Error {
                peer: PeerHandle(1),
                prov_errno: 0,
            })
            .unwrap();
        }
        assert_eq!(t.poll_cq(3).len(), 3);
        assert_eq!(t.poll_cq(64).len(), 2);
    }
}
