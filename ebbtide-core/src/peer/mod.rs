//! Peer wire protocol connection core

pub mod choke;
pub mod connection;
pub mod crypto;
pub mod diagnostics;
pub mod extensions;
pub mod handle;
pub mod handshake;
pub mod message;
pub mod state;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

pub use choke::ChokeState;
pub use connection::{PeerConnection, PeerInfo, PeerKind, PieceSet};
pub use crypto::{CryptoTransform, PlaintextCrypto, Rc4Crypto};
pub use diagnostics::{DiagnosticsSink, LogDirection, PeerLogEvent, TracingSink};
pub use extensions::{ExtensionPlugin, ExtensionRegistry};
pub use handle::PeerHandle;
pub use handshake::{HandshakeCodec, PeerHandshake};
pub use message::{MessageCodec, PeerMessage};
pub use state::{ConnectionState, Direction, DisconnectReason, ErrorKind, Operation};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to key the engine's torrent registry and validated against
/// incoming handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// BitTorrent peer identifier.
///
/// 20-byte identifier exchanged in handshakes. Ordering is the raw byte
/// ordering, which both endpoints of a connection share and which the
/// redundant-connection resolver leans on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID with the given client prefix.
    pub fn generate(client_id: &str) -> Self {
        let mut id = [0u8; 20];
        let prefix = client_id.as_bytes();
        let n = prefix.len().min(8);
        id[..n].copy_from_slice(&prefix[..n]);
        for byte in &mut id[n..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference into torrent-level session state.
///
/// Connections to the same torrent share one of these through `Arc`. The
/// piece count is zero until metadata is known (magnet-style starts), which
/// is what `has_metadata` reports.
#[derive(Debug)]
pub struct TorrentRef {
    info_hash: InfoHash,
    piece_count: AtomicU32,
}

impl TorrentRef {
    /// Creates a torrent reference; `piece_count` of zero means metadata is
    /// not yet available.
    pub fn new(info_hash: InfoHash, piece_count: u32) -> Self {
        Self {
            info_hash,
            piece_count: AtomicU32::new(piece_count),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count.load(Ordering::Relaxed)
    }

    /// Records the piece count once metadata has been resolved.
    pub fn set_piece_count(&self, count: u32) {
        self.piece_count.store(count, Ordering::Relaxed);
    }

    pub fn has_metadata(&self) -> bool {
        self.piece_count() > 0
    }
}

/// Errors surfaced by the connection engine's fallible entry points.
///
/// Failures inside the state machine never escape as errors; they resolve
/// to a closed connection with an attached reason. This enum covers the
/// library boundary: codec parsing, registration preconditions, and handle
/// resolution.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Handshake error: {reason}")]
    Handshake { reason: String },

    #[error("Peer does not support the extension protocol")]
    ExtensionsUnsupported,

    #[error("Extension registration before handshake completion")]
    StillHandshaking,

    #[error("Extension plugin {tag:?} already registered")]
    PluginCollision { tag: &'static str },

    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,

    #[error("Torrent {info_hash} not registered")]
    UnknownTorrent { info_hash: InfoHash },

    #[error("Connection no longer exists")]
    ConnectionGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_peer_id_generation_prefix() {
        let peer_id = PeerId::generate("-EB0001-");
        assert_eq!(&peer_id.as_bytes()[..8], b"-EB0001-");

        let other = PeerId::generate("-EB0001-");
        assert_ne!(peer_id.as_bytes(), other.as_bytes());
    }

    #[test]
    fn test_peer_id_ordering_is_byte_ordering() {
        let low = PeerId::new([0u8; 20]);
        let high = PeerId::new([0xff; 20]);
        assert!(low < high);
    }

    #[test]
    fn test_torrent_ref_metadata() {
        let torrent = TorrentRef::new(InfoHash::new([7u8; 20]), 0);
        assert!(!torrent.has_metadata());

        torrent.set_piece_count(64);
        assert!(torrent.has_metadata());
        assert_eq!(torrent.piece_count(), 64);
    }
}
