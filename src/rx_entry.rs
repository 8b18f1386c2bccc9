//! Receiver-side per-operation record (§3 "RX entry").

use smallvec::SmallVec;

use crate::config::SGL_LIMIT;
use crate::peer::PeerHandle;
use crate::protocol::{MsgId, Operation, Packet, RtsPacket, SlotId};
use crate::tx_entry::IovSegment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Free,
    Init,
    Unexp,
    Matched,
    Recv,
    QueuedCtrl,
    QueuedShmLargeRead,
    QueuedEor,
    QueuedCtsRnr,
    WaitReadFinish,
}

#[derive(Debug, Clone)]
pub struct RxEntry {
    pub op: Operation,
    pub tx_id: Option<u32>,
    pub rx_id: SlotId,
    pub msg_id: MsgId,
    pub tag: u64,
    pub ignore: u64,
    pub peer: PeerHandle,
    pub op_context: u64,

    pub buffer: SmallVec<[IovSegment; SGL_LIMIT]>,
    /// Owned backing storage the buffer segments index into.
    pub data: Vec<u8>,
    pub bytes_done: u64,
    pub total_len: u64,
    pub window: u32,
    pub credit_request: u16,
    pub credit_cts: u16,

    pub state: RxState,

    /// True on a posted multi-receive master buffer.
    pub multi_recv: bool,
    /// Multi-receive bookkeeping: set on consumer entries, pointing back at
    /// the posted master buffer they were carved out of.
    pub master_entry: Option<SlotId>,
    pub multi_recv_consumers: Vec<SlotId>,
    pub min_multi_recv_size: u64,
    pub multi_recv_remaining: u64,

    /// The RTS that created an unexpected entry, retained until a matching
    /// post arrives.
    pub unexp_pkt: Option<RtsPacket>,
    pub queued_pkts: Vec<Packet>,

    /// Set only on the RMA READ initiator's paired rx_entry: the tx_entry
    /// parked in `WaitReadFinish` that this entry's completion unblocks,
    /// instead of writing a CQ entry of its own (§4.5).
    pub read_pairing_tx_id: Option<SlotId>,
}

impl RxEntry {
    pub fn new_inactive() -> Self {
        Self {
            op: Operation::MsgSend,
            tx_id: None,
            rx_id: SlotId::new(0, 0),
            msg_id: MsgId::ZERO,
            tag: 0,
            ignore: 0,
            peer: PeerHandle(0),
            op_context: 0,
            buffer: SmallVec::new(),
            data: Vec::new(),
            bytes_done: 0,
            total_len: 0,
            window: 0,
            credit_request: 0,
            credit_cts: 0,
            state: RxState::Free,
            multi_recv: false,
            master_entry: None,
            multi_recv_consumers: Vec::new(),
            min_multi_recv_size: 0,
            multi_recv_remaining: 0,
            unexp_pkt: None,
            queued_pkts: Vec::new(),
            read_pairing_tx_id: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_done == self.total_len
    }

    pub fn advance_done(&mut self, n: u64) {
        self.bytes_done = (self.bytes_done + n).min(self.total_len);
    }

    /// Tag matching per §4.4: `(recv.tag | recv.ignore) == (msg.tag | recv.ignore)`.
    pub fn tag_matches(recv_tag: u64, recv_ignore: u64, msg_tag: u64) -> bool {
        (recv_tag | recv_ignore) == (msg_tag | recv_ignore)
    }

    /// Whether this posted multi-receive master can still accept another
    /// consumer of `len` bytes.
    pub fn multi_recv_can_consume(&self, len: u64) -> bool {
        self.multi_recv_remaining >= len
    }

    /// Whether the master should be released to the app: remaining capacity
    /// has dropped below the threshold and every carved-out consumer has
    /// finished.
    pub fn multi_recv_should_release(&self) -> bool {
        self.multi_recv_remaining < self.min_multi_recv_size && self.multi_recv_consumers.is_empty()
    }
}

impl crate::pool::Poisonable for RxEntry {
    fn poison(&mut self) {
        self.state = RxState::Free;
        self.unexp_pkt = None;
        self.queued_pkts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_matching_respects_ignore_mask() {
        assert!(RxEntry::tag_matches(0b1010, 0b0010, 0b1000));
        assert!(!RxEntry::tag_matches(0b1010, 0b0000, 0b1000));
    }

    #[test]
    fn multi_recv_release_requires_drained_consumers() {
        let mut e = RxEntry::new_inactive();
        e.min_multi_recv_size = 1024;
        e.multi_recv_remaining = 500;
        e.multi_recv_consumers.push(SlotId::new(1, 0));
        assert!(!e.multi_recv_should_release());
        e.multi_recv_consumers.clear();
        assert!(e.multi_recv_should_release());
    }
}
