//! Send-side state machine (§4.3).
//!
//! `send`/`tsend`/`write`/`read` are all non-blocking: they classify the
//! operation by size, format an RTS, and either submit it immediately or
//! park it on the endpoint's queued list when the transport returns
//! "again". Everything past RTS formatting is driven by `progress()`
//! dispatching transport completions back into this module.

use smallvec::SmallVec;

use crate::cq::{CompletionFlags, CompletionRecord, CqEntry, ErrorCompletionRecord};
use crate::endpoint::Endpoint;
use crate::error::RdmError;
use crate::peer::PeerHandle;
use crate::protocol::{
    CtsPacket, MsgId, Operation, Packet, PacketHeader, PacketType, RemoteIov, RtsFlags, RtsPacket,
    SlotId, PROTOCOL_VERSION,
};
use crate::transport::DatagramTransport;
use crate::tx_entry::{IovSegment, TxEntry, TxState};

impl Endpoint {
    pub fn send(&mut self, peer: PeerHandle, payload: Vec<u8>, op_context: u64) -> Result<SlotId, RdmError> {
        self.submit(peer, Operation::MsgSend, 0, payload, SmallVec::new(), op_context)
    }

    pub fn tsend(
        &mut self,
        peer: PeerHandle,
        payload: Vec<u8>,
        tag: u64,
        op_context: u64,
    ) -> Result<SlotId, RdmError> {
        self.submit(peer, Operation::TaggedSend, tag, payload, SmallVec::new(), op_context)
    }

    pub fn write(
        &mut self,
        peer: PeerHandle,
        payload: Vec<u8>,
        remote_iov: SmallVec<[RemoteIov; crate::config::SGL_LIMIT]>,
        op_context: u64,
    ) -> Result<SlotId, RdmError> {
        self.submit(peer, Operation::RmaWrite, 0, payload, remote_iov, op_context)
    }

    /// Emits a READ-REQ; the local buffer is pre-sized to `len` and filled
    /// in as READRSP packets arrive (§4.5). A paired rx_entry is allocated
    /// alongside the tx_entry so inbound READRSP packets (addressed by this
    /// tx_entry's own slot index, per the wire correlation in §4.5) have
    /// somewhere to land; its completion, not a CQ write, is what unblocks
    /// `WaitReadFinish`.
    pub fn read(
        &mut self,
        peer: PeerHandle,
        len: u64,
        remote_iov: SmallVec<[RemoteIov; crate::config::SGL_LIMIT]>,
        op_context: u64,
    ) -> Result<SlotId, RdmError> {
        let placeholder = vec![0u8; len as usize];
        let tx_id = self.submit(peer, Operation::RmaRead, 0, placeholder, remote_iov, op_context)?;

        let mut pairing = crate::rx_entry::RxEntry::new_inactive();
        pairing.peer = peer;
        pairing.op = Operation::RmaRead;
        pairing.total_len = len;
        pairing.data = vec![0u8; len as usize];
        pairing.state = crate::rx_entry::RxState::Recv;
        pairing.read_pairing_tx_id = Some(tx_id);
        let rx_id = match self.rx_entries.allocate(pairing) {
            Ok(id) => id,
            Err(e) => {
                self.tx_entries.release(tx_id);
                return Err(e);
            }
        };
        self.rx_entries.get_mut(rx_id).unwrap().rx_id = rx_id;

        if let Some(entry) = self.tx_entries.get_mut(tx_id) {
            entry.state = TxState::WaitReadFinish;
            entry.local_rx_id = Some(rx_id);
        }
        Ok(tx_id)
    }

    fn submit(
        &mut self,
        peer: PeerHandle,
        op: Operation,
        tag: u64,
        payload: Vec<u8>,
        remote_iov: SmallVec<[RemoteIov; crate::config::SGL_LIMIT]>,
        op_context: u64,
    ) -> Result<SlotId, RdmError> {
        let tx_max_credits = self.config.tx_max_credits;
        let tx_min_credits = self.config.tx_min_credits;
        let mtu = self.config.mtu_size;

        self.peer_mut(peer).init_tx(tx_max_credits);
        let msg_id = self.peer_mut(peer).assign_msg_id();

        let total_len = payload.len() as u64;
        let fits_inline = op != Operation::RmaRead && total_len as usize <= mtu;

        let mut entry = TxEntry::new_inactive();
        entry.op = op;
        entry.peer = peer;
        entry.msg_id = msg_id;
        entry.total_len = total_len;
        entry.payload = SmallVec::from_elem(
            IovSegment {
                offset: 0,
                len: payload.len(),
            },
            1,
        );
        entry.data = payload;
        entry.remote_iov = remote_iov;
        entry.completion = crate::tx_entry::CompletionDescriptor {
            op_context,
            flags: completion_flags_for(op, tag),
            len: total_len,
            tag,
            data: None,
        };

        let peer_credits = self.peer_mut(peer).tx_credits;
        let credit_request = tx_min_credits.max(tx_max_credits.min(peer_credits));
        entry.credit_request = credit_request;
        entry.state = TxState::Rts;

        let tx_id = self.tx_entries.allocate(entry)?;
        if let Some(e) = self.tx_entries.get_mut(tx_id) {
            e.tx_id = tx_id;
        }

        self.peer_mut(peer).tx_pending += 1;
        let rts = self.format_rts(tx_id, fits_inline);
        let has_credit = self.peers.get(&peer).map(|p| p.tx_credits > 0).unwrap_or(false);
        if has_credit {
            self.peer_mut(peer).tx_credits -= 1;
            self.submit_or_queue(peer, tx_id, Packet::Rts(rts));
        } else {
            // No admission credit available for a new op to this peer: park
            // the RTS until a CTS frees one up (§3 invariant 3, §4.7 step 5).
            if let Some(e) = self.tx_entries.get_mut(tx_id) {
                e.state = TxState::WaitCredit;
                e.queued_pkts.push(Packet::Rts(rts));
            }
            if !self.tx_pending_list.contains(&tx_id) {
                self.tx_pending_list.push_back(tx_id);
            }
        }
        Ok(tx_id)
    }

    fn format_rts(&self, tx_id: SlotId, inline: bool) -> RtsPacket {
        let entry = self.tx_entries.get(tx_id).expect("just allocated");
        let mut flags = RtsFlags::empty();
        if entry.op == Operation::TaggedSend || entry.completion.tag != 0 {
            flags |= RtsFlags::TAGGED;
        }
        if entry.op == Operation::RmaWrite {
            flags |= RtsFlags::WRITE;
        }
        if entry.op == Operation::RmaRead {
            flags |= RtsFlags::READ_REQ;
        }
        flags |= RtsFlags::CREDIT_REQUEST;
        let piggyback = self
            .peers
            .get(&entry.peer)
            .map(|p| p.should_piggyback_src_addr())
            .unwrap_or(true);
        if piggyback {
            flags |= RtsFlags::REMOTE_SRC_ADDR;
        }

        RtsPacket {
            header: PacketHeader {
                version: PROTOCOL_VERSION,
                pkt_type: PacketType::Rts,
                msg_id: entry.msg_id,
                tx_id: tx_id.index,
                rx_id: 0,
                rx_generation: 0,
                flags,
                source_addr: if piggyback { Some(self.config.local_addr) } else { None },
            },
            op: entry.op,
            tag: entry.completion.tag,
            total_len: entry.total_len,
            credit_request: entry.credit_request,
            remote_iov: entry.remote_iov.clone(),
            remote_cq_data: None,
            inline_payload: if inline { entry.data.clone() } else { Vec::new() },
        }
    }

    /// Sends now if the transport accepts it; otherwise parks the packet on
    /// the tx_entry's queue and links the entry into the FIFO retry list.
    pub(crate) fn submit_or_queue(&mut self, peer: PeerHandle, tx_id: SlotId, packet: Packet) {
        let is_local = self.peers.get(&peer).map(|p| p.is_local).unwrap_or(false);
        let result = if is_local {
            self.shm.send(peer, packet.clone())
        } else {
            self.fabric.send(peer, packet.clone())
        };
        match result {
            Ok(()) => {}
            Err(RdmError::WouldBlock) => {
                if let Some(entry) = self.tx_entries.get_mut(tx_id) {
                    entry.queued_pkts.push(packet);
                    let was_rnr = entry.state == TxState::QueuedRtsRnr || entry.state == TxState::QueuedDataRnr;
                    if !was_rnr {
                        entry.state = TxState::QueuedCtrl;
                    }
                }
                if !self.tx_entry_queued_list.contains(&tx_id) {
                    self.tx_entry_queued_list.push_back(tx_id);
                }
            }
            Err(_) => {
                // Any other submission failure is a peer-fatal condition; the
                // progress engine's error path drains and completes this entry.
                self.fail_tx_entry(tx_id, RdmError::Internal("transport send failed".into()));
            }
        }
    }

    /// Invoked once a CTS arrives for `tx_id`: records the allocated credit
    /// and window, then starts streaming data packets. A CTS also frees the
    /// peer-level admission credit this op reserved at submission, the first
    /// time it arrives (later re-grant CTS packets for the same op top up
    /// only the per-op `credit_allocated`, not the peer's admission credit
    /// again).
    pub(crate) fn on_cts(&mut self, tx_id: SlotId, cts: CtsPacket) {
        let peer = match self.tx_entries.get(tx_id) {
            Some(e) => e.peer,
            None => return,
        };
        let first_cts = self.tx_entries.get(tx_id).map(|e| e.state == TxState::Rts).unwrap_or(false);
        if let Some(entry) = self.tx_entries.get_mut(tx_id) {
            entry.rx_id = Some(cts.header.rx_id);
            entry.rx_generation = cts.header.rx_generation;
            entry.credit_allocated = cts.credit_allocated;
            entry.window = cts.window;
            entry.state = TxState::Send;
        }
        if first_cts {
            let tx_max_credits = self.config.tx_max_credits;
            if let Some(p) = self.peers.get_mut(&peer) {
                p.tx_credits = (p.tx_credits + 1).min(tx_max_credits);
            }
        }
        self.pump_data_packets(peer, tx_id);
    }

    /// Streams DATA packets for `tx_id` while it holds allocated credit and
    /// has unsent bytes. A message whose chunk count exceeds the current
    /// grant parks on `tx_pending_list` until a credit re-grant CTS (§4.4)
    /// calls this again via `on_cts` (§4.7 step 5 drains it defensively).
    pub(crate) fn pump_data_packets(&mut self, peer: PeerHandle, tx_id: SlotId) {
        let mtu = self.config.mtu_size as u64;
        loop {
            let (offset, chunk, rx_id, rx_generation, msg_id) = {
                let entry = match self.tx_entries.get(tx_id) {
                    Some(e) => e,
                    None => return,
                };
                if entry.state != TxState::Send {
                    return;
                }
                if entry.bytes_sent >= entry.total_len {
                    return;
                }
                if entry.credit_allocated == 0 {
                    if !self.tx_pending_list.contains(&tx_id) {
                        self.tx_pending_list.push_back(tx_id);
                    }
                    return;
                }
                let remaining = entry.total_len - entry.bytes_sent;
                let len = remaining.min(mtu) as usize;
                let offset = entry.bytes_sent;
                let chunk = entry.data[offset as usize..offset as usize + len].to_vec();
                (offset, chunk, entry.rx_id.unwrap_or(0), entry.rx_generation, entry.msg_id)
            };

            let data_pkt = crate::protocol::DataPacket {
                header: PacketHeader {
                    version: PROTOCOL_VERSION,
                    pkt_type: PacketType::Data,
                    msg_id,
                    tx_id: tx_id.index,
                    rx_id,
                    rx_generation,
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
            self.submit_or_queue(peer, tx_id, Packet::Data(data_pkt));
        }
    }

    /// A DATA (or inline RTS) packet's send has been acknowledged by the
    /// transport; advances `bytes_acked` and completes the entry once full.
    pub(crate) fn on_data_acked(&mut self, tx_id: SlotId, n: u64) {
        let is_complete = {
            let entry = match self.tx_entries.get_mut(tx_id) {
                Some(e) => e,
                None => return,
            };
            entry.advance_acked(n);
            entry.is_complete()
        };
        if is_complete {
            self.complete_tx(tx_id);
        }
    }

    pub(crate) fn complete_tx(&mut self, tx_id: SlotId) {
        let peer = match self.tx_entries.get(tx_id) {
            Some(e) => e.peer,
            None => return,
        };
        if let Some(entry) = self.tx_entries.release(tx_id) {
            if entry.state != TxState::WaitReadFinish {
                self.cq.push(CqEntry::Completion(CompletionRecord {
                    op_context: entry.completion.op_context,
                    flags: entry.completion.flags,
                    len: entry.completion.len,
                    buf: 0,
                    data: entry.completion.data,
                    tag: entry.completion.tag,
                }));
            }
            // RMA READ completions are written once the paired rx_entry
            // (carrying the READRSP stream) reports done; see rma.rs. Either
            // way this op is no longer outstanding against the peer.
        }
        if let Some(p) = self.peers.get_mut(&peer) {
            p.tx_pending = p.tx_pending.saturating_sub(1);
        }
    }

    /// RNR classification for an in-flight packet to `peer` (§4.3).
    pub(crate) fn on_rnr(&mut self, peer: PeerHandle, tx_id: SlotId, packet: Packet) {
        let now = self.time.now();
        {
            let p = self.peer_mut(peer);
            p.rnr.rnr_ts = Some(now);
            p.rnr.in_backoff = true;
            p.rnr.rnr_queued_pkt_cnt += 1;
        }
        if !self.peer_backoff_list.contains(&peer) {
            self.peer_backoff_list.push(peer);
        }
        if let Some(p) = self.peers.get_mut(&peer) {
            p.rnr.rnr_timeout_exp = p.rnr.rnr_timeout_exp.saturating_add(1);
        }
        if let Some(entry) = self.tx_entries.get_mut(tx_id) {
            entry.queued_pkts.push(packet);
            entry.state = if packet_type_is_rts(&entry.queued_pkts) {
                TxState::QueuedRtsRnr
            } else {
                TxState::QueuedDataRnr
            };
        }
        if !self.tx_entry_queued_list.contains(&tx_id) {
            self.tx_entry_queued_list.push_back(tx_id);
        }
    }

    pub(crate) fn fail_tx_entry(&mut self, tx_id: SlotId, err: RdmError) {
        if let Some(entry) = self.tx_entries.release(tx_id) {
            let peer = entry.peer;
            self.cq.push(CqEntry::Error(ErrorCompletionRecord {
                op_context: entry.completion.op_context,
                flags: entry.completion.flags,
                err,
                prov_errno: -1,
            }));
            if let Some(p) = self.peers.get_mut(&peer) {
                p.tx_pending = p.tx_pending.saturating_sub(1);
            }
        }
    }
}

fn packet_type_is_rts(queued: &[Packet]) -> bool {
    matches!(queued.last(), Some(Packet::Rts(_)))
}

fn completion_flags_for(op: Operation, tag: u64) -> CompletionFlags {
    if matches!(op, Operation::RmaWrite | Operation::RmaRead) {
        return CompletionFlags::new(CompletionFlags::RMA);
    }
    let mut bits = CompletionFlags::SEND;
    if tag != 0 || op == Operation::TaggedSend {
        bits |= CompletionFlags::TAGGED;
    }
    CompletionFlags::new(bits)
}
