//! Receive-side state machine (§4.4).

use smallvec::SmallVec;

use crate::cq::{CompletionFlags, CompletionRecord, CqEntry, ErrorCompletionRecord};
use crate::endpoint::Endpoint;
use crate::error::{ProtocolError, RdmError};
use crate::peer::PeerHandle;
use crate::protocol::{
    CtsPacket, DataPacket, Operation, PacketHeader, PacketType, RtsFlags, RtsPacket, SlotId,
    PROTOCOL_VERSION,
};
use crate::rx_entry::{RxEntry, RxState};
use crate::tx_entry::IovSegment;

pub struct PostedRecv {
    pub buf_len: u64,
    pub tag: u64,
    pub ignore: u64,
    pub tagged: bool,
    pub multi_recv: bool,
    pub min_multi_recv_size: u64,
}

impl Endpoint {
    pub fn recv(&mut self, peer: PeerHandle, buf_len: u64, op_context: u64) -> Result<SlotId, RdmError> {
        self.post_recv(
            peer,
            PostedRecv {
                buf_len,
                tag: 0,
                ignore: u64::MAX,
                tagged: false,
                multi_recv: false,
                min_multi_recv_size: 0,
            },
            op_context,
        )
    }

    pub fn trecv(
        &mut self,
        peer: PeerHandle,
        buf_len: u64,
        tag: u64,
        ignore: u64,
        op_context: u64,
    ) -> Result<SlotId, RdmError> {
        self.post_recv(
            peer,
            PostedRecv {
                buf_len,
                tag,
                ignore,
                tagged: true,
                multi_recv: false,
                min_multi_recv_size: 0,
            },
            op_context,
        )
    }

    pub fn recvmsg(
        &mut self,
        peer: PeerHandle,
        buf_len: u64,
        multi_recv: bool,
        min_multi_recv_size: u64,
        op_context: u64,
    ) -> Result<SlotId, RdmError> {
        self.post_recv(
            peer,
            PostedRecv {
                buf_len,
                tag: 0,
                ignore: u64::MAX,
                tagged: false,
                multi_recv,
                min_multi_recv_size,
            },
            op_context,
        )
    }

    fn post_recv(&mut self, peer: PeerHandle, posted: PostedRecv, op_context: u64) -> Result<SlotId, RdmError> {
        let mut entry = RxEntry::new_inactive();
        entry.peer = peer;
        entry.tag = posted.tag;
        entry.ignore = posted.ignore;
        entry.total_len = posted.buf_len;
        entry.data = vec![0u8; posted.buf_len as usize];
        entry.buffer = SmallVec::from_elem(
            IovSegment {
                offset: 0,
                len: posted.buf_len as usize,
            },
            1,
        );
        entry.state = RxState::Init;
        entry.multi_recv = posted.multi_recv;
        entry.min_multi_recv_size = posted.min_multi_recv_size;
        entry.multi_recv_remaining = if posted.multi_recv { posted.buf_len } else { 0 };
        entry.credit_request = self.config.rx_window_size;

        let rx_id = self.rx_entries.allocate(entry)?;
        if let Some(e) = self.rx_entries.get_mut(rx_id) {
            e.rx_id = rx_id;
        }
        self.rx_entries
            .get_mut(rx_id)
            .unwrap()
            .completion_context(op_context);

        if let Some(unexpected_idx) = self.find_matching_unexpected(rx_id) {
            let unexp_slot = self.unexpected_list.remove(unexpected_idx).unwrap();
            self.match_unexpected(rx_id, unexp_slot);
        } else if posted.tagged {
            self.rx_tagged_list.push_back(rx_id);
        } else {
            self.rx_list.push_back(rx_id);
        }
        Ok(rx_id)
    }

    fn find_matching_unexpected(&self, rx_id: SlotId) -> Option<usize> {
        let posted = self.rx_entries.get(rx_id)?;
        self.unexpected_list.iter().position(|&u| {
            self.rx_entries
                .get(u)
                .map(|unexp| {
                    let msg = unexp.unexp_pkt.as_ref().map(|p| p.tag).unwrap_or(0);
                    RxEntry::tag_matches(posted.tag, posted.ignore, msg)
                })
                .unwrap_or(false)
        })
    }

    fn match_unexpected(&mut self, rx_id: SlotId, unexp_rx_id: SlotId) {
        let unexp = match self.rx_entries.release(unexp_rx_id) {
            Some(e) => e,
            None => return,
        };
        let rts = match unexp.unexp_pkt {
            Some(rts) => rts,
            None => return,
        };
        self.match_rts_against_entry(rx_id, unexp.peer, rts);
    }

    /// Arrival of an RTS, after any SAS reorder-window gating has already
    /// released it in order (§4.4 step 1-4).
    pub(crate) fn on_rts(&mut self, peer: PeerHandle, rts: RtsPacket) {
        if rts.op == Operation::RmaWrite {
            self.rma_on_write_rts(peer, rts);
            return;
        }
        if rts.op == Operation::RmaRead {
            self.rma_on_read_req(peer, rts);
            return;
        }

        let list = if rts.header.flags.contains(RtsFlags::TAGGED) {
            &self.rx_tagged_list
        } else {
            &self.rx_list
        };
        let found = list.iter().copied().find(|&rx_id| {
            self.rx_entries
                .get(rx_id)
                .map(|e| {
                    RxEntry::tag_matches(e.tag, e.ignore, rts.tag)
                        && (!e.multi_recv || e.multi_recv_can_consume(rts.total_len))
                })
                .unwrap_or(false)
        });

        match found {
            Some(rx_id) => {
                let is_master = self.rx_entries.get(rx_id).map(|e| e.multi_recv).unwrap_or(false);
                if is_master {
                    self.dispatch_multi_recv(rx_id, peer, rts);
                } else {
                    if rts.header.flags.contains(RtsFlags::TAGGED) {
                        self.rx_tagged_list.retain(|&x| x != rx_id);
                    } else {
                        self.rx_list.retain(|&x| x != rx_id);
                    }
                    self.match_rts_against_entry(rx_id, peer, rts);
                }
            }
            None => self.stage_unexpected(peer, rts),
        }
    }

    /// Carves a consumer entry out of a posted multi-receive master for one
    /// inbound message, then matches that consumer normally (§4.4 multi-recv).
    fn dispatch_multi_recv(&mut self, master_id: SlotId, peer: PeerHandle, rts: RtsPacket) {
        let consumer_len = rts.total_len;
        let mut consumer = RxEntry::new_inactive();
        consumer.peer = peer;
        consumer.tag = self.rx_entries.get(master_id).map(|m| m.tag).unwrap_or(0);
        consumer.ignore = self.rx_entries.get(master_id).map(|m| m.ignore).unwrap_or(u64::MAX);
        consumer.total_len = consumer_len;
        consumer.data = vec![0u8; consumer_len as usize];
        consumer.buffer = SmallVec::from_elem(
            IovSegment {
                offset: 0,
                len: consumer_len as usize,
            },
            1,
        );
        consumer.state = RxState::Init;
        consumer.master_entry = Some(master_id);
        consumer.credit_request = self.config.rx_window_size;
        let op_context = self.rx_entries.get(master_id).map(|m| m.op_context).unwrap_or(0);
        consumer.op_context = op_context;

        let consumer_id = match self.rx_entries.allocate(consumer) {
            Ok(id) => id,
            Err(_) => return,
        };
        self.rx_entries.get_mut(consumer_id).unwrap().rx_id = consumer_id;

        if let Some(master) = self.rx_entries.get_mut(master_id) {
            master.multi_recv_remaining = master.multi_recv_remaining.saturating_sub(consumer_len);
            master.multi_recv_consumers.push(consumer_id);
            if master.multi_recv_remaining < master.min_multi_recv_size {
                self.rx_list.retain(|&x| x != master_id);
                self.rx_tagged_list.retain(|&x| x != master_id);
            }
        }

        self.match_rts_against_entry(consumer_id, peer, rts);
    }

    fn stage_unexpected(&mut self, peer: PeerHandle, rts: RtsPacket) {
        let mut entry = RxEntry::new_inactive();
        entry.peer = peer;
        entry.op = rts.op;
        entry.tag = rts.tag;
        entry.tx_id = Some(rts.header.tx_id);
        entry.msg_id = rts.header.msg_id;
        entry.total_len = rts.total_len;
        entry.state = RxState::Unexp;
        entry.unexp_pkt = Some(rts);
        match self.rx_entries.allocate(entry) {
            Ok(rx_id) => {
                self.rx_entries.get_mut(rx_id).unwrap().rx_id = rx_id;
                self.unexpected_list.push_back(rx_id);
            }
            Err(_) => {
                // Staging pool exhausted: drop silently, mirroring a CQ
                // overrun on the unexpected path rather than blocking progress.
            }
        }
    }

    fn match_rts_against_entry(&mut self, rx_id: SlotId, peer: PeerHandle, rts: RtsPacket) {
        if let Some(entry) = self.rx_entries.get_mut(rx_id) {
            entry.peer = peer;
            entry.op = rts.op;
            entry.tx_id = Some(rts.header.tx_id);
            entry.msg_id = rts.header.msg_id;
            entry.total_len = rts.total_len;
            entry.state = RxState::Matched;
        }

        let inline_complete = !rts.inline_payload.is_empty() || rts.total_len == 0;
        if inline_complete {
            if let Some(entry) = self.rx_entries.get_mut(rx_id) {
                let n = rts.inline_payload.len().min(entry.data.len());
                entry.data[..n].copy_from_slice(&rts.inline_payload[..n]);
                entry.bytes_done = rts.total_len;
            }
            self.complete_rx(rx_id);
            return;
        }

        let (credit_cts, window) = {
            let entry = self.rx_entries.get_mut(rx_id).unwrap();
            entry.state = RxState::Recv;
            entry.credit_cts = self.config.rx_window_size.min(rts.credit_request.max(1));
            (entry.credit_cts, self.config.rx_window_size as u32)
        };

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
            credit_allocated: credit_cts,
            window,
        };
        self.submit_or_queue_rx(peer, rx_id, crate::protocol::Packet::Cts(cts));
    }

    pub(crate) fn submit_or_queue_rx(&mut self, peer: PeerHandle, rx_id: SlotId, packet: crate::protocol::Packet) {
        use crate::transport::DatagramTransport;
        let is_local = self.peers.get(&peer).map(|p| p.is_local).unwrap_or(false);
        let result = if is_local {
            self.shm.send(peer, packet.clone())
        } else {
            self.fabric.send(peer, packet.clone())
        };
        if let Err(RdmError::WouldBlock) = result {
            if let Some(entry) = self.rx_entries.get_mut(rx_id) {
                entry.queued_pkts.push(packet);
                entry.state = RxState::QueuedCtrl;
            }
            if !self.rx_entry_queued_list.contains(&rx_id) {
                self.rx_entry_queued_list.push_back(rx_id);
            }
        }
    }

    /// DATA packet delivery; `rx_id` is the slot the CTS advertised (§4.4).
    /// The packet's `rx_generation` must match the slot's live generation: a
    /// DATA packet addressed to a released-and-reused slot is a stale-owner
    /// condition (§9), not a hit on the new occupant.
    pub(crate) fn on_data(&mut self, data: DataPacket) -> Result<(), ProtocolError> {
        let resolved = self
            .rx_entries
            .iter()
            .find(|(id, _)| id.index == data.header.rx_id)
            .map(|(id, _)| id)
            .ok_or(ProtocolError::SlotOutOfRange(data.header.rx_id))?;
        if resolved.generation != data.header.rx_generation {
            return Err(ProtocolError::StaleOwner);
        }
        let entry = self
            .rx_entries
            .get_mut(resolved)
            .ok_or(ProtocolError::SlotOutOfRange(data.header.rx_id))?;
        if entry.state != RxState::Recv {
            return Err(ProtocolError::UnexpectedState("rx_entry not in RECV"));
        }
        if entry.tx_id != Some(data.header.tx_id) || entry.msg_id != data.header.msg_id {
            return Err(ProtocolError::IdMismatch);
        }
        let len = data.payload.len();
        let offset = data.offset as usize;
        if offset + len > entry.data.len() {
            return Err(ProtocolError::UnexpectedState("data packet overruns buffer"));
        }
        entry.data[offset..offset + len].copy_from_slice(&data.payload);
        entry.advance_done(len as u64);
        let complete = entry.is_complete();
        let peer = entry.peer;
        let wire_tx_id = entry.tx_id.unwrap_or(0);
        let msg_id = entry.msg_id;

        if !complete {
            let out_of_credit = {
                let e = self.rx_entries.get_mut(resolved).unwrap();
                e.credit_cts = e.credit_cts.saturating_sub(1);
                e.credit_cts == 0
            };
            if out_of_credit {
                self.regrant_credit(resolved, peer, wire_tx_id, msg_id);
            }
        }

        if complete {
            self.complete_rx(resolved);
        }
        Ok(())
    }

    /// Tops the per-op credit grant back up to `rx_window_size` and sends
    /// another CTS carrying it, letting a message whose chunk count exceeds
    /// the initial grant keep streaming (§4.7 step 5, known simplification:
    /// grants always refill to the full window rather than the sender's
    /// original `credit_request`).
    fn regrant_credit(&mut self, rx_id: SlotId, peer: PeerHandle, wire_tx_id: u32, msg_id: crate::protocol::MsgId) {
        let fresh_grant = self.config.rx_window_size;
        if let Some(e) = self.rx_entries.get_mut(rx_id) {
            e.credit_cts = fresh_grant;
        }
        let cts = CtsPacket {
            header: PacketHeader {
                version: PROTOCOL_VERSION,
                pkt_type: PacketType::Cts,
                msg_id,
                tx_id: wire_tx_id,
                rx_id: rx_id.index,
                rx_generation: rx_id.generation,
                flags: RtsFlags::empty(),
                source_addr: None,
            },
            credit_allocated: fresh_grant,
            window: self.config.rx_window_size as u32,
        };
        self.submit_or_queue_rx(peer, rx_id, crate::protocol::Packet::Cts(cts));
    }

    pub(crate) fn complete_rx(&mut self, rx_id: SlotId) {
        let read_pairing = self.rx_entries.get(rx_id).and_then(|e| e.read_pairing_tx_id);
        if let Some(tx_id) = read_pairing {
            if let Some(entry) = self.rx_entries.release(rx_id) {
                self.rma_finish_read(tx_id, entry.data);
            }
            return;
        }

        let (is_consumer, master, len, total_len) = match self.rx_entries.get(rx_id) {
            Some(e) => (e.master_entry.is_some(), e.master_entry, e.bytes_done.max(e.total_len), e.total_len),
            None => return,
        };
        let _ = total_len;

        if let Some(entry) = self.rx_entries.release(rx_id) {
            self.cq.push(CqEntry::Completion(CompletionRecord {
                op_context: entry.op_context_stash(),
                flags: CompletionFlags::new(if is_consumer {
                    CompletionFlags::RECV | CompletionFlags::MULTI_RECV
                } else {
                    CompletionFlags::RECV
                }),
                len,
                buf: 0,
                data: None,
                tag: entry.tag,
            }));
        }

        if let Some(master_id) = master {
            if let Some(m) = self.rx_entries.get_mut(master_id) {
                m.multi_recv_consumers.retain(|&c| c != rx_id);
                if m.multi_recv_should_release() {
                    let master_len = m.total_len - m.multi_recv_remaining;
                    let ctx = m.op_context_stash();
                    if let Some(master) = self.rx_entries.release(master_id) {
                        self.cq.push(CqEntry::Completion(CompletionRecord {
                            op_context: ctx,
                            flags: CompletionFlags::new(CompletionFlags::RECV | CompletionFlags::MULTI_RECV),
                            len: master_len,
                            buf: 0,
                            data: None,
                            tag: master.tag,
                        }));
                    }
                }
            }
        }
    }

    pub(crate) fn fail_rx_entry(&mut self, rx_id: SlotId, err: RdmError) {
        if let Some(entry) = self.rx_entries.release(rx_id) {
            self.cq.push(CqEntry::Error(ErrorCompletionRecord {
                op_context: entry.op_context_stash(),
                flags: CompletionFlags::new(CompletionFlags::RECV),
                err,
                prov_errno: -1,
            }));
        }
    }

    pub fn cancel_recv(&mut self, rx_id: SlotId) -> Result<(), RdmError> {
        self.rx_list.retain(|&x| x != rx_id);
        self.rx_tagged_list.retain(|&x| x != rx_id);
        self.fail_rx_entry(rx_id, RdmError::Cancelled);
        Ok(())
    }
}

impl RxEntry {
    pub(crate) fn completion_context(&mut self, ctx: u64) {
        self.op_context = ctx;
    }

    pub(crate) fn op_context_stash(&self) -> u64 {
        self.op_context
    }
}
