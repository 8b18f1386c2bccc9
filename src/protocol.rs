//! Wire packet types and the constants that bound them.
//!
//! Encoding is plain `serde` + `rmp-serde` (MessagePack): compact, self
//! describing enough for cross-version CONNACK negotiation, and without the
//! bespoke derive machinery a from-scratch wire format would otherwise need.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::config::{MAX_SRC_ADDR_LEN, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR, SGL_LIMIT};

/// Sender-assigned, monotone-per-peer message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MsgId(pub u64);

impl MsgId {
    pub const ZERO: MsgId = MsgId(0);

    pub fn next(self) -> MsgId {
        MsgId(self.0.wrapping_add(1))
    }
}

/// A weak reference to an arena slot: stable index plus a generation counter
/// bumped on release so a packet that outlives its owning entry can be
/// recognized as stale instead of silently aliasing a new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub index: u32,
    pub generation: u32,
}

impl SlotId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

pub const PROTOCOL_VERSION: u8 = (PROTOCOL_VERSION_MAJOR << 4) | PROTOCOL_VERSION_MINOR;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RtsFlags: u16 {
        const TAGGED            = 1 << 0;
        const REMOTE_CQ_DATA     = 1 << 1;
        const REMOTE_SRC_ADDR    = 1 << 2;
        const RECV_CANCEL        = 1 << 3;
        const WRITE              = 1 << 4;
        const READ_REQ           = 1 << 5;
        const READ_DATA          = 1 << 6;
        const CREDIT_REQUEST     = 1 << 7;
        const SHM_HDR            = 1 << 8;
        const SHM_HDR_DATA       = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    Rts,
    Cts,
    Data,
    ReadResponse,
    Eor,
    ConnAck,
}

/// Fields common to every wire packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub version: u8,
    pub pkt_type: PacketType,
    pub msg_id: MsgId,
    /// Sender-side slot id of the tx_entry that produced this packet.
    pub tx_id: u32,
    /// Receiver-side slot id this packet is addressed to, once known
    /// (assigned by the CTS; 0 before that point).
    pub rx_id: u32,
    /// Generation of the rx slot named by `rx_id`, carried so a packet that
    /// outlives its rx_entry (slot reused by a later post) is recognized as
    /// stale instead of silently aliasing the new occupant. 0 where `rx_id`
    /// isn't yet meaningful (RTS before CTS, EOR, CONNACK).
    pub rx_generation: u32,
    pub flags: RtsFlags,
    /// Present only when `flags` carries `REMOTE_SRC_ADDR`; piggybacked
    /// source address, cleared once the peer's CM state reaches ACKED.
    pub source_addr: Option<[u8; MAX_SRC_ADDR_LEN]>,
}

/// A single scatter-gather segment describing remote memory, carried by RMA
/// WRITE and READ-REQ headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIov {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    MsgSend,
    TaggedSend,
    RmaWrite,
    RmaRead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtsPacket {
    pub header: PacketHeader,
    pub op: Operation,
    pub tag: u64,
    pub total_len: u64,
    pub credit_request: u16,
    /// Remote memory descriptors for WRITE / READ_REQ; empty otherwise.
    pub remote_iov: smallvec::SmallVec<[RemoteIov; SGL_LIMIT]>,
    pub remote_cq_data: Option<u64>,
    /// Inline payload when the message fits entirely in the RTS.
    pub inline_payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtsPacket {
    pub header: PacketHeader,
    pub credit_allocated: u16,
    pub window: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPacket {
    pub header: PacketHeader,
    pub offset: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponsePacket {
    pub header: PacketHeader,
    pub offset: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EorPacket {
    pub header: PacketHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnAckPacket {
    pub header: PacketHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    Rts(RtsPacket),
    Cts(CtsPacket),
    Data(DataPacket),
    ReadResponse(ReadResponsePacket),
    Eor(EorPacket),
    ConnAck(ConnAckPacket),
}

impl Packet {
    pub fn header(&self) -> &PacketHeader {
        match self {
            Packet::Rts(p) => &p.header,
            Packet::Cts(p) => &p.header,
            Packet::Data(p) => &p.header,
            Packet::ReadResponse(p) => &p.header,
            Packet::Eor(p) => &p.header,
            Packet::ConnAck(p) => &p.header,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(pkt_type: PacketType) -> PacketHeader {
        PacketHeader {
            version: PROTOCOL_VERSION,
            pkt_type,
            msg_id: MsgId(7),
            tx_id: 3,
            rx_id: 0,
            rx_generation: 0,
            flags: RtsFlags::TAGGED,
            source_addr: None,
        }
    }

    #[test]
    fn rts_round_trips_through_wire_encoding() {
        let pkt = Packet::Rts(RtsPacket {
            header: header(PacketType::Rts),
            op: Operation::TaggedSend,
            tag: 5,
            total_len: 32,
            credit_request: 32,
            remote_iov: Default::default(),
            remote_cq_data: None,
            inline_payload: vec![1, 2, 3, 4],
        });
        let bytes = pkt.encode().unwrap();
        let back = Packet::decode(&bytes).unwrap();
        match back {
            Packet::Rts(p) => {
                assert_eq!(p.tag, 5);
                assert_eq!(p.inline_payload, vec![1, 2, 3, 4]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn protocol_version_packs_major_minor() {
        assert_eq!(PROTOCOL_VERSION >> 4, PROTOCOL_VERSION_MAJOR);
        assert_eq!(PROTOCOL_VERSION & 0x0f, PROTOCOL_VERSION_MINOR);
    }
}
