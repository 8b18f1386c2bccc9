//! Top-level public API: wires together the peer table, entry arenas, pools,
//! transports and completion queue into one endpoint (§2, §9 "globals").
//!
//! An `Endpoint` owns everything the core touches. There is no process-wide
//! mutable state; every other module is driven exclusively through `&mut
//! Endpoint` methods, matching the single-threaded cooperative scheduling
//! model of §5.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::EndpointConfig;
use crate::cq::CompletionQueue;
use crate::error::RdmError;
use crate::peer::{Peer, PeerHandle};
use crate::pool::{Arena, BufferPool};
use crate::rx_entry::RxEntry;
use crate::time::{SystemTimeProvider, TimeProvider};
use crate::transport::{FabricTransport, ShmTransport, Transport};
use crate::tx_entry::TxEntry;

pub struct Endpoint {
    pub(crate) config: EndpointConfig,
    pub(crate) time: Arc<dyn TimeProvider>,

    pub(crate) peers: crate::flat_map::FlatMap<PeerHandle, Peer>,
    pub(crate) tx_entries: Arena<TxEntry>,
    pub(crate) rx_entries: Arena<RxEntry>,

    pub(crate) tx_pool: BufferPool,
    pub(crate) rx_pool: BufferPool,

    /// Posted (non-tagged) and tagged receive lists: indices into
    /// `rx_entries`, in post order.
    pub(crate) rx_list: VecDeque<crate::protocol::SlotId>,
    pub(crate) rx_tagged_list: VecDeque<crate::protocol::SlotId>,
    /// Unmatched inbound RTS staged here until a matching post arrives.
    pub(crate) unexpected_list: VecDeque<crate::protocol::SlotId>,

    pub(crate) tx_entry_queued_list: VecDeque<crate::protocol::SlotId>,
    pub(crate) rx_entry_queued_list: VecDeque<crate::protocol::SlotId>,
    pub(crate) tx_pending_list: VecDeque<crate::protocol::SlotId>,
    pub(crate) read_pending_list: VecDeque<crate::protocol::SlotId>,
    pub(crate) peer_backoff_list: Vec<PeerHandle>,

    pub(crate) cq: CompletionQueue,

    pub(crate) fabric: Transport,
    pub(crate) shm: Transport,

    pub(crate) rx_bufs_efa_to_post: usize,
    pub(crate) rx_bufs_shm_to_post: usize,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Result<Self, RdmError> {
        Self::with_time_provider(config, Arc::new(SystemTimeProvider))
    }

    pub fn with_time_provider(
        config: EndpointConfig,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Self, RdmError> {
        let cq_size = config.cq_size;
        let mtu = config.mtu_size;
        let rx_bufs_efa_to_post = config.efa_cq_read_size.max(1);
        let rx_bufs_shm_to_post = config.shm_cq_read_size.max(1);
        Ok(Self {
            tx_entries: Arena::new(cq_size),
            rx_entries: Arena::new(cq_size),
            tx_pool: BufferPool::new(cq_size, mtu),
            rx_pool: BufferPool::new(cq_size, mtu),
            rx_list: VecDeque::new(),
            rx_tagged_list: VecDeque::new(),
            unexpected_list: VecDeque::new(),
            tx_entry_queued_list: VecDeque::new(),
            rx_entry_queued_list: VecDeque::new(),
            tx_pending_list: VecDeque::new(),
            read_pending_list: VecDeque::new(),
            peer_backoff_list: Vec::new(),
            cq: CompletionQueue::new(),
            fabric: Transport::Fabric(FabricTransport::new(config.efa_cq_read_size.max(64), 4096)),
            shm: Transport::Shm(ShmTransport::new(config.shm_cq_read_size.max(64))),
            rx_bufs_efa_to_post,
            rx_bufs_shm_to_post,
            config,
            time,
            peers: crate::flat_map::FlatMap::new(),
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn poll_completion(&mut self) -> Option<crate::cq::CqEntry> {
        self.cq.pop()
    }

    /// Loopback test harness hook: injects a transport event as if it had
    /// just arrived off the wire. Real deployments never call this; the
    /// transport itself is an external collaborator (§1 scope) that this
    /// crate only submits packets to and consumes completions from.
    pub fn inject_transport_event(
        &mut self,
        local: bool,
        event: crate::transport::TransportEvent,
    ) -> Result<(), RdmError> {
        match if local { &mut self.shm } else { &mut self.fabric } {
            Transport::Fabric(t) => t.deliver(event),
            Transport::Shm(t) => t.deliver(event),
        }
    }

    /// Marks `peer` as co-located, routing its traffic over the
    /// shared-memory transport per `enable_shm_transfer` (§9).
    pub fn mark_peer_local(&mut self, peer: PeerHandle) {
        if self.config.enable_shm_transfer {
            self.peer_mut(peer).is_local = true;
        }
    }

    /// Loopback test harness hook: drains packets this endpoint has handed
    /// to a transport, for relaying to a peer endpoint's transport.
    pub fn drain_sent(&mut self, local: bool) -> Vec<(PeerHandle, crate::protocol::Packet)> {
        match if local { &mut self.shm } else { &mut self.fabric } {
            Transport::Fabric(t) => t.take_sent(),
            Transport::Shm(t) => t.take_sent(),
        }
    }

    /// Whether `peer` currently has an elapsed-but-unexpired RNR backoff in
    /// effect (queued sends to it are held until it clears).
    pub fn peer_in_backoff(&self, peer: PeerHandle) -> bool {
        self.peers.get(&peer).map(|p| p.rnr.in_backoff).unwrap_or(false)
    }

    /// Looks up a peer, creating it on first use (§4.2).
    pub(crate) fn peer_mut(&mut self, handle: PeerHandle) -> &mut Peer {
        self.peers.entry(handle).or_insert_with(|| {
            Peer::new(handle, crate::backoff::random_initial_interval())
        })
    }
}
