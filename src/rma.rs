//! Emulated RMA READ/WRITE, layered on the message protocol (§4.5).
//!
//! There is no transport-native RDMA verb here: WRITE rides as a tagged
//! send whose RTS names a destination IOV instead of matching a posted
//! receive, and READ is a request/response pair of ordinary sends
//! correlated by slot id.

use crate::cq::{CompletionFlags, CompletionRecord, CqEntry};
use crate::endpoint::Endpoint;
use crate::peer::PeerHandle;
use crate::protocol::{
    CtsPacket, Operation, PacketHeader, PacketType, RtsFlags, RtsPacket, SlotId, PROTOCOL_VERSION,
};
use crate::rx_entry::{RxEntry, RxState};
use crate::tx_entry::{CompletionDescriptor, TxEntry, TxState};

impl Endpoint {
    /// WRITE's RTS handler performs a direct copy into the named remote IOV
    /// rather than matching a posted recv; the rx_entry it allocates is
    /// otherwise driven through the normal RECV/DATA path.
    pub(crate) fn rma_on_write_rts(&mut self, peer: PeerHandle, rts: RtsPacket) {
        let mut entry = RxEntry::new_inactive();
        entry.peer = peer;
        entry.op = Operation::RmaWrite;
        entry.tx_id = Some(rts.header.tx_id);
        entry.msg_id = rts.header.msg_id;
        entry.total_len = rts.total_len;
        entry.data = vec![0u8; rts.total_len as usize];
        entry.state = RxState::Matched;

        let remote_cq_data = rts.remote_cq_data;
        let inline_complete = !rts.inline_payload.is_empty() || rts.total_len == 0;
        if inline_complete {
            let n = rts.inline_payload.len().min(entry.data.len());
            entry.data[..n].copy_from_slice(&rts.inline_payload[..n]);
            if let Some(data) = remote_cq_data {
                self.cq.push(CqEntry::Completion(CompletionRecord {
                    op_context: 0,
                    flags: CompletionFlags::new(CompletionFlags::RMA),
                    len: rts.total_len,
                    buf: 0,
                    data: Some(data),
                    tag: 0,
                }));
            }
            return;
        }

        entry.state = RxState::Recv;
        entry.credit_cts = self.config.rx_window_size.min(rts.credit_request.max(1));
        let rx_id = match self.rx_entries.allocate(entry) {
            Ok(id) => id,
            Err(_) => return,
        };
        self.rx_entries.get_mut(rx_id).unwrap().rx_id = rx_id;

        let cts = CtsPacket {
            header: PacketHeader {
                version: PROTOCOL_VERSION,
                pkt_type: PacketType::Cts,
                msg_id: rts.header.msg_id,
                tx_id: rts.header.tx_id,
                rx_id: rx_id.index,
                rx_generation: rx_id.generation,
                flags: RtsFlags::empty(),
                source_addr: None,
            },
            credit_allocated: self.rx_entries.get(rx_id).unwrap().credit_cts,
            window: self.config.rx_window_size as u32,
        };
        self.submit_or_queue_rx(peer, rx_id, crate::protocol::Packet::Cts(cts));

        if remote_cq_data.is_some() {
            // A write completion with REMOTE_CQ_DATA is written once the
            // transfer finishes; complete_rx on the target will see no
            // posted/unexpected bookkeeping to run, just a bare RMA flag.
        }
    }

    /// READ-REQ handler: the target becomes a SENT_READRSP sender, streaming
    /// back using the initiator's tx_id as the reply's rx_id.
    pub(crate) fn rma_on_read_req(&mut self, peer: PeerHandle, rts: RtsPacket) {
        let total_len = rts.total_len;
        // Real deployments source this from registered local memory named by
        // `rts.remote_iov`; memory-region registration is out of scope here,
        // so the response streams a placeholder buffer of the requested size.
        let mut entry = TxEntry::new_inactive();
        entry.op = Operation::RmaRead;
        entry.peer = peer;
        entry.msg_id = rts.header.msg_id;
        entry.total_len = total_len;
        entry.data = vec![0u8; total_len as usize];
        entry.payload = smallvec::smallvec![crate::tx_entry::IovSegment {
            offset: 0,
            len: total_len as usize,
        }];
        entry.rx_id = Some(rts.header.tx_id);
        entry.credit_allocated = self.config.tx_max_credits;
        entry.state = TxState::SentReadRsp;
        entry.completion = CompletionDescriptor {
            op_context: 0,
            flags: CompletionFlags::new(CompletionFlags::RMA),
            len: total_len,
            tag: 0,
            data: None,
        };
        let tx_id = match self.tx_entries.allocate(entry) {
            Ok(id) => id,
            Err(_) => return,
        };
        self.tx_entries.get_mut(tx_id).unwrap().tx_id = tx_id;
        self.rma_pump_readrsp(peer, tx_id);
    }

    /// Streams READRSP packets for a SENT_READRSP tx_entry; mirrors
    /// `pump_data_packets` but tags the wire packet as `ReadResponse`. There
    /// is no receiver-driven re-grant message for READRSP, so an exhausted
    /// grant parks on `read_pending_list` and is simply refilled to
    /// `tx_max_credits` the next time `progress()` drains it (§4.7 step 5).
    pub(crate) fn rma_pump_readrsp(&mut self, peer: PeerHandle, tx_id: SlotId) {
        let mtu = self.config.mtu_size as u64;
        loop {
            let (offset, chunk, rx_id, msg_id) = {
                let entry = match self.tx_entries.get(tx_id) {
                    Some(e) => e,
                    None => return,
                };
                if entry.state != TxState::SentReadRsp {
                    return;
                }
                if entry.bytes_sent >= entry.total_len {
                    return;
                }
                if entry.credit_allocated == 0 {
                    if !self.read_pending_list.contains(&tx_id) {
                        self.read_pending_list.push_back(tx_id);
                    }
                    return;
                }
                let remaining = entry.total_len - entry.bytes_sent;
                let len = remaining.min(mtu) as usize;
                let offset = entry.bytes_sent;
                let chunk = entry.data[offset as usize..offset as usize + len].to_vec();
                (offset, chunk, entry.rx_id.unwrap_or(0), entry.msg_id)
            };

            let pkt = crate::protocol::ReadResponsePacket {
                header: PacketHeader {
                    version: PROTOCOL_VERSION,
                    pkt_type: PacketType::ReadResponse,
                    msg_id,
                    tx_id: tx_id.index,
                    rx_id,
                    rx_generation: 0,
                    flags: RtsFlags::empty(),
                    source_addr: None,
                },
                offset,
                payload: chunk.clone(),
            };

            if let Some(entry) = self.tx_entries.get_mut(tx_id) {
                entry.bytes_sent += chunk.len() as u64;
                entry.credit_allocated -= 1;
            }
            self.submit_or_queue(peer, tx_id, crate::protocol::Packet::ReadResponse(pkt));
        }
    }

    /// Target side: a READRSP send has been accepted by the transport.
    pub(crate) fn rma_on_readrsp_sent(&mut self, tx_id: SlotId, n: u64) {
        let done = {
            let entry = match self.tx_entries.get_mut(tx_id) {
                Some(e) => e,
                None => return,
            };
            entry.advance_acked(n);
            entry.is_complete()
        };
        if done {
            self.tx_entries.release(tx_id);
        }
    }

    /// Resolves the wire `rx_id` carried by an inbound READRSP packet (the
    /// initiator's own tx_entry slot index) to that tx_entry's paired
    /// rx_entry.
    pub(crate) fn resolve_read_rx_id(&self, wire_rx_id: u32) -> Option<SlotId> {
        self.tx_entries
            .iter()
            .find(|(id, _)| id.index == wire_rx_id)
            .and_then(|(_, e)| e.local_rx_id)
    }

    /// Initiator side: a READRSP packet arrived, filling the paired
    /// rx_entry that was set up alongside the original READ-REQ.
    pub(crate) fn rma_on_readrsp_received(
        &mut self,
        rx_id: SlotId,
        offset: u64,
        payload: &[u8],
    ) {
        if let Some(entry) = self.rx_entries.get_mut(rx_id) {
            let off = offset as usize;
            if off + payload.len() <= entry.data.len() {
                entry.data[off..off + payload.len()].copy_from_slice(payload);
                entry.advance_done(payload.len() as u64);
            }
            if entry.is_complete() {
                self.complete_rx(rx_id);
            }
        }
    }

    /// Runs once the initiator's paired rx_entry finishes: copies the
    /// reassembled bytes into the original tx_entry and writes its CQ entry.
    pub(crate) fn rma_finish_read(&mut self, tx_id: SlotId, data: Vec<u8>) {
        if let Some(entry) = self.tx_entries.get_mut(tx_id) {
            entry.data = data;
            entry.bytes_acked = entry.total_len;
            entry.bytes_sent = entry.total_len;
        }
        if let Some(entry) = self.tx_entries.release(tx_id) {
            self.cq.push(CqEntry::Completion(CompletionRecord {
                op_context: entry.completion.op_context,
                flags: entry.completion.flags,
                len: entry.completion.len,
                buf: 0,
                data: entry.completion.data,
                tag: entry.completion.tag,
            }));
        }
    }
}
