//! Shared-memory transport for co-located peers.
//!
//! Internals of the shared-memory ring are out of scope; this crate treats
//! it as a sibling endpoint with the same [`DatagramTransport`] surface, a
//! bounded slot count standing in for the fixed-capacity ring a real
//! implementation would map between processes.

use std::collections::VecDeque;

use crate::error::RdmError;
use crate::peer::PeerHandle;
use crate::protocol::Packet;

use super::{DatagramTransport, TransportEvent};

pub struct ShmTransport {
    slot_count: usize,
    posted_recv: usize,
    ring: VecDeque<TransportEvent>,
    sent_log: Vec<(PeerHandle, Packet)>,
}

impl ShmTransport {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slot_count,
            posted_recv: 0,
            ring: VecDeque::new(),
            sent_log: Vec::new(),
        }
    }

    pub fn deliver(&mut self, event: TransportEvent) -> Result<(), RdmError> {
        if self.ring.len() >= self.slot_count {
            return Err(RdmError::WouldBlock);
        }
        self.ring.push_back(event);
        Ok(())
    }

    pub fn take_sent(&mut self) -> Vec<(PeerHandle, Packet)> {
        std::mem::take(&mut self.sent_log)
    }
}

impl DatagramTransport for ShmTransport {
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
        let n = max.min(self.ring.len());
        self.ring.drain(..n).collect()
    }

    fn posted_recv_count(&self) -> usize {
        self.posted_recv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_rejects_past_slot_count() {
        let mut t = ShmTransport::new(1);
        t.deliver(TransportEvent::Error {
            peer: PeerHandle(1),
            prov_errno: 0,
        })
        .unwrap();
        let err = t
            .deliver(TransportEvent::Error {
                peer: PeerHandle(1),
                prov_errno: 0,
            })
            .unwrap_err();
        assert_eq!(err, RdmError::WouldBlock);
    }
}
