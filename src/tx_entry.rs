//! Sender-side per-operation record (§3 "TX entry").

use smallvec::SmallVec;

use crate::config::SGL_LIMIT;
use crate::cq::CompletionFlags;
use crate::peer::PeerHandle;
use crate::protocol::{MsgId, Operation, Packet, RemoteIov, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Free,
    /// Waiting on the peer's per-peer admission credit before the RTS for
    /// this op is even submitted (§3 invariant 3).
    WaitCredit,
    Rts,
    Send,
    ShmRma,
    QueuedShmRma,
    QueuedCtrl,
    QueuedRtsRnr,
    QueuedDataRnr,
    SentReadRsp,
    QueuedReadRsp,
    WaitReadFinish,
}

#[derive(Debug, Clone, Copy)]
pub struct IovSegment {
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct CompletionDescriptor {
    pub op_context: u64,
    pub flags: CompletionFlags,
    pub len: u64,
    pub tag: u64,
    pub data: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TxEntry {
    pub op: Operation,
    pub tx_id: SlotId,
    /// The peer's rx slot id, known only once the CTS arrives.
    pub rx_id: Option<u32>,
    /// Generation of `rx_id`'s slot, carried on DATA headers so a stale
    /// slot reuse on the receiver is detectable (§3, §9).
    pub rx_generation: u32,
    pub msg_id: MsgId,
    pub peer: PeerHandle,

    pub payload: SmallVec<[IovSegment; SGL_LIMIT]>,
    /// Owned backing storage for `payload`'s segments. For RMA READ this is
    /// the local destination buffer, filled in as READRSP packets arrive.
    pub data: Vec<u8>,
    pub iov_index: usize,
    pub iov_offset: usize,
    pub bytes_sent: u64,
    pub bytes_acked: u64,
    pub total_len: u64,

    pub window: u32,
    pub credit_request: u16,
    pub credit_allocated: u16,

    pub state: TxState,

    /// Remote IOV for RMA WRITE/READ; local rx_id used to correlate a READ
    /// response back to this entry.
    pub remote_iov: SmallVec<[RemoteIov; SGL_LIMIT]>,
    pub local_rx_id: Option<SlotId>,

    pub queued_pkts: Vec<Packet>,
    pub completion: CompletionDescriptor,
}

impl TxEntry {
    pub fn new_inactive() -> Self {
        Self {
            op: Operation::MsgSend,
            tx_id: SlotId::new(0, 0),
            rx_id: None,
            rx_generation: 0,
            msg_id: MsgId::ZERO,
            peer: PeerHandle(0),
            payload: SmallVec::new(),
            data: Vec::new(),
            iov_index: 0,
            iov_offset: 0,
            bytes_sent: 0,
            bytes_acked: 0,
            total_len: 0,
            window: 0,
            credit_request: 0,
            credit_allocated: 0,
            state: TxState::Free,
            remote_iov: SmallVec::new(),
            local_rx_id: None,
            queued_pkts: Vec::new(),
            completion: CompletionDescriptor {
                op_context: 0,
                flags: CompletionFlags::new(0),
                len: 0,
                tag: 0,
                data: None,
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_acked == self.total_len
    }

    pub fn advance_acked(&mut self, n: u64) {
        self.bytes_acked = (self.bytes_acked + n).min(self.total_len);
    }
}

impl crate::pool::Poisonable for TxEntry {
    fn poison(&mut self) {
        self.state = TxState::Free;
        self.queued_pkts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_acked_clamps_to_total_len() {
        let mut e = TxEntry::new_inactive();
        e.total_len = 10;
        e.advance_acked(7);
        e.advance_acked(7);
        assert_eq!(e.bytes_acked, 10);
        assert!(e.is_complete());
    }
}
