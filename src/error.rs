use thiserror::Error;

use crate::peer::PeerHandle;

/// Errors surfaced by the engine's public API.
///
/// `WouldBlock` and the internal RNR classification are never wrapped in this
/// type when they reach a caller: `WouldBlock` is returned directly so retry
/// loops don't need to match on an enum variant, and RNR never crosses the
/// public boundary at all (it only drives internal backoff bookkeeping).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RdmError {
    #[error("operation would block: resource busy")]
    WouldBlock,
    #[error("operation cancelled")]
    Cancelled,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("peer {peer:?} is fatally errored: {reason}")]
    PeerFatal { peer: PeerHandle, reason: String },
    #[error("message exceeds maximum size")]
    MessageTooLarge,
    #[error("invalid MTU configuration")]
    InvalidMtu,
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// A state-machine impossibility: a slot id that doesn't resolve to a live
/// entry, a packet that arrives for an entry in a state that cannot accept
/// it, or a stale-generation match (see `SlotId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("slot id {0} is out of range")]
    SlotOutOfRange(u32),
    #[error("owner generation mismatch: packet belongs to a released entry")]
    StaleOwner,
    #[error("entry in state {0:?} cannot accept this packet")]
    UnexpectedState(&'static str),
    #[error("reorder window exhausted: msg_id is too far beyond the window")]
    ReorderWindowExhausted,
    #[error("rx_id/tx_id mismatch on data packet")]
    IdMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("tx_min_credits ({min}) must be <= tx_max_credits ({max})")]
    CreditBoundsInverted { min: u16, max: u16 },
    #[error("mtu_size must be in 1..=32768, got {0}")]
    InvalidMtu(usize),
    #[error("recvwin_size must be non-zero")]
    ZeroRecvWindow,
    #[error("tx_iov_limit/rx_iov_limit must be in 1..=4, got {0}")]
    InvalidIovLimit(usize),
}
