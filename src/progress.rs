//! The single-threaded progress engine (§4.7).
//!
//! One `progress()` pass performs, in order: poll the main-fabric CQ, poll
//! the shared-memory CQ, expire elapsed RNR backoffs, drain queued sends and
//! receives, drain large-message tx/read-pending work, and repost receive
//! buffers. Nothing here blocks; every step bounds its own work per pass.

use crate::endpoint::Endpoint;
use crate::error::RdmError;
use crate::peer::PeerHandle;
use crate::protocol::{ConnAckPacket, Packet, PacketHeader, PacketType, RtsFlags, SlotId, PROTOCOL_VERSION};
use crate::transport::{DatagramTransport, TransportEvent};
use crate::tx_entry::TxState;

impl Endpoint {
    /// Runs one pump pass. Returns the number of transport events processed,
    /// mainly useful for tests driving the engine to a fixed point.
    pub fn progress(&mut self) -> usize {
        let mut processed = 0;

        let efa_events = self.fabric.poll_cq(self.config.efa_cq_read_size);
        processed += efa_events.len();
        for event in efa_events {
            self.handle_transport_event(event);
        }

        let shm_events = self.shm.poll_cq(self.config.shm_cq_read_size);
        processed += shm_events.len();
        for event in shm_events {
            self.handle_transport_event(event);
        }

        self.expire_backoffs();
        self.drain_queued_sends();
        self.drain_queued_recvs();
        self.drain_tx_pending();
        self.drain_read_pending();
        self.repost_receive_buffers();

        processed
    }

    /// Runs `progress()` until a pass processes nothing, bounded by `limit`
    /// iterations so a misbehaving test can't spin forever.
    pub fn progress_until_idle(&mut self, limit: usize) {
        for _ in 0..limit {
            if self.progress() == 0 {
                break;
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::SendComplete { peer, packet } => self.on_send_complete(peer, packet),
            TransportEvent::RecvComplete { peer, packet } => self.on_recv_complete(peer, packet),
            TransportEvent::Rnr { peer, packet } => self.handle_rnr_event(peer, packet),
            TransportEvent::Error { peer, prov_errno } => self.handle_peer_fatal(peer, prov_errno),
        }
    }

    fn on_send_complete(&mut self, peer: PeerHandle, packet: Packet) {
        match packet {
            Packet::Rts(rts) => {
                let tx_id = self.find_tx_by_index(rts.header.tx_id);
                let inline_complete = !rts.inline_payload.is_empty() || rts.total_len == 0;
                if inline_complete {
                    if let Some(tx_id) = tx_id {
                        self.on_data_acked(tx_id, rts.total_len);
                    }
                }
            }
            Packet::Data(data) => {
                if let Some(tx_id) = self.find_tx_by_index(data.header.tx_id) {
                    let n = data.payload.len() as u64;
                    self.on_data_acked(tx_id, n);
                    self.pump_data_packets(peer, tx_id);
                }
            }
            Packet::ReadResponse(rsp) => {
                if let Some(tx_id) = self.find_tx_by_index(rsp.header.tx_id) {
                    let n = rsp.payload.len() as u64;
                    self.rma_on_readrsp_sent(tx_id, n);
                    self.rma_pump_readrsp(peer, tx_id);
                }
            }
            Packet::Cts(_) | Packet::Eor(_) | Packet::ConnAck(_) => {}
        }
    }

    fn on_recv_complete(&mut self, peer: PeerHandle, packet: Packet) {
        match packet {
            Packet::Rts(rts) => self.gate_and_dispatch_rts(peer, rts),
            Packet::Cts(cts) => {
                if let Some(tx_id) = self.find_tx_by_index(cts.header.tx_id) {
                    self.on_cts(tx_id, cts);
                }
            }
            Packet::Data(data) => {
                let _ = self.on_data(data);
            }
            Packet::ReadResponse(rsp) => {
                if let Some(rx_id) = self.resolve_read_rx_id(rsp.header.rx_id) {
                    self.rma_on_readrsp_received(rx_id, rsp.offset, &rsp.payload);
                }
            }
            Packet::Eor(_) => {}
            Packet::ConnAck(_) => {
                self.peer_mut(peer).on_connack();
            }
        }
    }

    /// Applies SAS reordering (§4.4 step 1) before an RTS reaches matching.
    fn gate_and_dispatch_rts(&mut self, peer_handle: PeerHandle, rts: Packet) {
        let rts = match rts {
            Packet::Rts(r) => r,
            _ => return,
        };
        let rx_window_size = self.config.rx_window_size;
        let recvwin_size = self.config.recvwin_size;
        self.peer_mut(peer_handle).init_rx(rx_window_size, recvwin_size);
        self.ack_connection(peer_handle);

        if !self.config.enable_sas_ordering {
            self.on_rts(peer_handle, rts);
            return;
        }

        let expected = self
            .peers
            .get(&peer_handle)
            .and_then(|p| p.robuf.as_ref())
            .map(|w| w.base_msg_id());
        let expected = match expected {
            Some(e) => e,
            None => {
                self.on_rts(peer_handle, rts);
                return;
            }
        };

        if rts.header.msg_id.0 != expected {
            if let Some(p) = self.peers.get_mut(&peer_handle) {
                if let Some(w) = p.robuf.as_mut() {
                    let _ = w.insert(rts.header.msg_id, rts);
                }
            }
            return;
        }

        self.on_rts(peer_handle, rts);
        let drained = self
            .peers
            .get_mut(&peer_handle)
            .and_then(|p| p.robuf.as_mut())
            .map(|w| w.advance_and_drain())
            .unwrap_or_default();
        for pkt in drained {
            self.on_rts(peer_handle, pkt);
        }
    }

    fn handle_rnr_event(&mut self, peer: PeerHandle, packet: Packet) {
        if let Some(tx_id) = self.find_tx_by_index(packet.header().tx_id) {
            self.on_rnr(peer, tx_id, packet);
        }
    }

    /// A non-RNR completion error: the owning entry (if still live) gets an
    /// error completion and is released; everything else for the peer is
    /// drained the same way (§7 PeerFatal).
    fn handle_peer_fatal(&mut self, peer: PeerHandle, prov_errno: i32) {
        let tx_ids: Vec<SlotId> = self
            .tx_entries
            .iter()
            .filter(|(_, e)| e.peer == peer)
            .map(|(id, _)| id)
            .collect();
        for tx_id in tx_ids {
            self.fail_tx_entry(
                tx_id,
                RdmError::PeerFatal {
                    peer,
                    reason: format!("transport completion error (errno {prov_errno})"),
                },
            );
        }
        let rx_ids: Vec<SlotId> = self
            .rx_entries
            .iter()
            .filter(|(_, e)| e.peer == peer)
            .map(|(id, _)| id)
            .collect();
        for rx_id in rx_ids {
            self.fail_rx_entry(
                rx_id,
                RdmError::PeerFatal {
                    peer,
                    reason: format!("transport completion error (errno {prov_errno})"),
                },
            );
        }
    }

    fn find_tx_by_index(&self, index: u32) -> Option<SlotId> {
        self.tx_entries.iter().find(|(id, _)| id.index == index).map(|(id, _)| id)
    }

    /// Walks `peer_backoff_list`, releasing peers whose RNR backoff has
    /// elapsed and draining their queued packets.
    fn expire_backoffs(&mut self) {
        let now = self.time.now();
        let mut still_backed_off = Vec::new();
        let expired: Vec<PeerHandle> = self.peer_backoff_list.drain(..).collect();
        for peer in expired {
            let elapsed = self.peers.get(&peer).map(|p| {
                let rnr = &p.rnr;
                match rnr.rnr_ts {
                    Some(ts) => {
                        let backoff = crate::backoff::backoff_for(
                            rnr.timeout_interval,
                            rnr.rnr_timeout_exp.saturating_sub(1),
                            self.config.max_timeout,
                        );
                        now >= ts + backoff
                    }
                    None => true,
                }
            });
            match elapsed {
                Some(true) => {
                    if let Some(p) = self.peers.get_mut(&peer) {
                        p.rnr.in_backoff = false;
                        p.rnr.rnr_ts = None;
                    }
                }
                _ => still_backed_off.push(peer),
            }
        }
        self.peer_backoff_list = still_backed_off;
    }

    /// Retries the head packet of each queued tx/rx entry, FIFO, stopping at
    /// the first peer that again returns "again" so ordering is preserved.
    fn drain_queued_sends(&mut self) {
        let queued: Vec<SlotId> = self.tx_entry_queued_list.drain(..).collect();
        for tx_id in queued {
            let (peer, in_backoff, head) = match self.tx_entries.get_mut(tx_id) {
                Some(e) => {
                    let peer = e.peer;
                    let in_backoff = self.peers.get(&peer).map(|p| p.rnr.in_backoff).unwrap_or(false);
                    (peer, in_backoff, e.queued_pkts.first().cloned())
                }
                None => continue,
            };
            if in_backoff {
                self.tx_entry_queued_list.push_back(tx_id);
                continue;
            }
            if let Some(packet) = head {
                if let Some(e) = self.tx_entries.get_mut(tx_id) {
                    e.queued_pkts.remove(0);
                }
                self.submit_or_queue(peer, tx_id, packet);
            }
        }
    }

    fn drain_queued_recvs(&mut self) {
        let queued: Vec<SlotId> = self.rx_entry_queued_list.drain(..).collect();
        for rx_id in queued {
            let (peer, head) = match self.rx_entries.get_mut(rx_id) {
                Some(e) => (e.peer, e.queued_pkts.first().cloned()),
                None => continue,
            };
            if let Some(packet) = head {
                if let Some(e) = self.rx_entries.get_mut(rx_id) {
                    e.queued_pkts.remove(0);
                }
                self.submit_or_queue_rx(peer, rx_id, packet);
            }
        }
    }

    /// Resumes senders parked on `tx_pending_list`: an op whose RTS was
    /// withheld for lack of peer admission credit (`WaitCredit`), or one
    /// mid-stream whose per-op DATA credit ran out (`Send`) (§4.7 step 5).
    fn drain_tx_pending(&mut self) {
        let queued: Vec<SlotId> = self.tx_pending_list.drain(..).collect();
        for tx_id in queued {
            let (peer, state) = match self.tx_entries.get(tx_id) {
                Some(e) => (e.peer, e.state),
                None => continue,
            };
            match state {
                TxState::WaitCredit => {
                    let has_credit = self.peers.get(&peer).map(|p| p.tx_credits > 0).unwrap_or(false);
                    if !has_credit {
                        self.tx_pending_list.push_back(tx_id);
                        continue;
                    }
                    self.peer_mut(peer).tx_credits -= 1;
                    let packet = self.tx_entries.get_mut(tx_id).and_then(|e| {
                        e.state = TxState::Rts;
                        if e.queued_pkts.is_empty() {
                            None
                        } else {
                            Some(e.queued_pkts.remove(0))
                        }
                    });
                    if let Some(packet) = packet {
                        self.submit_or_queue(peer, tx_id, packet);
                    }
                }
                TxState::Send => self.pump_data_packets(peer, tx_id),
                _ => {}
            }
        }
    }

    /// Resumes RMA READ responders parked on `read_pending_list` once their
    /// per-op credit is refilled (§4.7 step 5).
    fn drain_read_pending(&mut self) {
        let tx_max_credits = self.config.tx_max_credits;
        let queued: Vec<SlotId> = self.read_pending_list.drain(..).collect();
        for tx_id in queued {
            let peer = match self.tx_entries.get_mut(tx_id) {
                Some(e) => {
                    e.credit_allocated = tx_max_credits;
                    e.peer
                }
                None => continue,
            };
            self.rma_pump_readrsp(peer, tx_id);
        }
    }

    /// Emits a CONNACK the first time an RTS arrives from a peer, completing
    /// the CM handshake so the peer's `should_piggyback_src_addr` turns false
    /// once it processes the reply (§4.2).
    fn ack_connection(&mut self, peer: PeerHandle) {
        let already_sent = self.peers.get(&peer).map(|p| p.connack_sent).unwrap_or(true);
        if already_sent {
            return;
        }
        if let Some(p) = self.peers.get_mut(&peer) {
            p.connack_sent = true;
        }
        let is_local = self.peers.get(&peer).map(|p| p.is_local).unwrap_or(false);
        let packet = Packet::ConnAck(ConnAckPacket {
            header: PacketHeader {
                version: PROTOCOL_VERSION,
                pkt_type: PacketType::ConnAck,
                msg_id: crate::protocol::MsgId::ZERO,
                tx_id: 0,
                rx_id: 0,
                rx_generation: 0,
                flags: RtsFlags::empty(),
                source_addr: None,
            },
        });
        let result = if is_local {
            self.shm.inject(peer, packet)
        } else {
            self.fabric.inject(peer, packet)
        };
        let _ = result;
    }

    /// Tops up posted receive buffers on both transports to the configured
    /// target (§4.7 step 6).
    fn repost_receive_buffers(&mut self) {
        while self.fabric.posted_recv_count() < self.rx_bufs_efa_to_post {
            if self.fabric.post_recv().is_err() {
                break;
            }
        }
        while self.shm.posted_recv_count() < self.rx_bufs_shm_to_post {
            if self.shm.post_recv().is_err() {
                break;
            }
        }
    }
}
