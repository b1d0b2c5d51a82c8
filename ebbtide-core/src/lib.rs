//! Ebbtide Core - peer wire protocol connection engine
//!
//! This crate provides the per-peer connection state machine for a
//! BitTorrent-style engine: handshake negotiation, bilateral choke/interest
//! flow control, optional stream obfuscation with live transform swapping,
//! an extension plugin surface, and non-owning handles over connections
//! that may be torn down at any time. Piece selection, storage, discovery,
//! and wire framing are external collaborators.

pub mod config;
pub mod engine;
pub mod peer;

// Re-export main types for convenient access
pub use config::{CryptoPolicy, EbbtideConfig};
pub use engine::{ConnectionId, PeerEngine};
pub use peer::{
    ConnectionState, CryptoTransform, DiagnosticsSink, Direction, DisconnectReason, ErrorKind,
    ExtensionPlugin, InfoHash, MessageCodec, Operation, PeerError, PeerHandle, PeerId, PeerInfo,
    PeerMessage, PieceIndex, TorrentRef,
};

pub type Result<T> = std::result::Result<T, PeerError>;
