//! Per-peer connection and credit state.
//!
//! A peer is created implicitly on first use (§4.2): the first send sets
//! `tx_init` and pre-credits `tx_max_credits`; the first inbound RTS sets
//! `rx_init` and allocates the receive window.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::MsgId;
use crate::reorder::ReorderWindow;

/// Wire-visible identifier for a peer. Values come from the address-vector
/// layer; this crate never interprets them beyond equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmState {
    Free,
    ConnreqSent,
    Acked,
}

#[derive(Debug, Clone)]
pub struct RnrState {
    pub rnr_ts: Option<Instant>,
    pub rnr_timeout_exp: u32,
    pub timeout_interval: Duration,
    pub rnr_queued_pkt_cnt: u32,
    pub in_backoff: bool,
    pub backed_off_this_pass: bool,
}

impl RnrState {
    fn new(initial_interval: Duration) -> Self {
        Self {
            rnr_ts: None,
            rnr_timeout_exp: 0,
            timeout_interval: initial_interval,
            rnr_queued_pkt_cnt: 0,
            in_backoff: false,
            backed_off_this_pass: false,
        }
    }
}

#[derive(Debug)]
pub struct Peer {
    pub handle: PeerHandle,
    pub state: CmState,
    pub tx_init: bool,
    pub rx_init: bool,
    pub next_msg_id: MsgId,
    pub expected_msg_id: MsgId,
    pub robuf: Option<ReorderWindow>,
    pub tx_credits: u16,
    pub rx_credits: u16,
    pub tx_pending: u32,
    pub rnr: RnrState,
    pub is_local: bool,
    /// Whether this endpoint has already sent a CONNACK for an inbound RTS
    /// from this peer (§4.2); guards against re-sending one per message.
    pub connack_sent: bool,
}

impl Peer {
    pub fn new(handle: PeerHandle, initial_rnr_interval: Duration) -> Self {
        Self {
            handle,
            state: CmState::Free,
            tx_init: false,
            rx_init: false,
            next_msg_id: MsgId::ZERO,
            expected_msg_id: MsgId::ZERO,
            robuf: None,
            tx_credits: 0,
            rx_credits: 0,
            tx_pending: 0,
            rnr: RnrState::new(initial_rnr_interval),
            is_local: false,
            connack_sent: false,
        }
    }

    /// Sets up the sending side of the peer on first outbound use.
    pub fn init_tx(&mut self, tx_max_credits: u16) {
        if !self.tx_init {
            self.tx_init = true;
            self.tx_credits = tx_max_credits;
            if self.state == CmState::Free {
                self.state = CmState::ConnreqSent;
            }
        }
    }

    /// Sets up the receiving side of the peer on first inbound RTS.
    pub fn init_rx(&mut self, rx_window_size: u16, recvwin_size: u32) {
        if !self.rx_init {
            self.rx_init = true;
            self.rx_credits = rx_window_size;
            self.robuf = Some(ReorderWindow::new(recvwin_size));
        }
    }

    pub fn on_connack(&mut self) {
        self.state = CmState::Acked;
    }

    /// Piggybacking of the source address stops once the peer is ACKED.
    pub fn should_piggyback_src_addr(&self) -> bool {
        self.state != CmState::Acked
    }

    pub fn assign_msg_id(&mut self) -> MsgId {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.next();
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_init_precredits_once() {
        let mut p = Peer::new(PeerHandle(1), Duration::from_micros(100));
        p.init_tx(64);
        assert_eq!(p.tx_credits, 64);
        p.tx_credits = 10;
        p.init_tx(64);
        assert_eq!(p.tx_credits, 10, "second init_tx must be a no-op");
    }

    #[test]
    fn msg_ids_are_monotone() {
        let mut p = Peer::new(PeerHandle(1), Duration::from_micros(100));
        let a = p.assign_msg_id();
        let b = p.assign_msg_id();
        assert!(b.0 > a.0);
    }

    #[test]
    fn src_addr_piggyback_stops_after_ack() {
        let mut p = Peer::new(PeerHandle(1), Duration::from_micros(100));
        assert!(p.should_piggyback_src_addr());
        p.on_connack();
        assert!(!p.should_piggyback_src_addr());
    }
}
