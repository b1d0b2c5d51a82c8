//! Handshake serialization and the handshake/encryption negotiator

use super::{InfoHash, PeerError, PeerId};
use crate::config::{CryptoConfig, CryptoPolicy};

/// Protocol identifier exchanged in every handshake.
pub const PROTOCOL_NAME: &str = "BitTorrent protocol";

/// Reserved byte 5 bit advertising extension protocol support (BEP 10).
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;

/// The 68-byte protocol identification message.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string
    pub protocol: String,
    /// Reserved bytes carrying capability bits
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Creates our handshake, advertising extension protocol support.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= EXTENSION_PROTOCOL_BIT;
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Creates a handshake with explicit reserved bytes, for peers whose
    /// capabilities we are modeling.
    pub fn with_reserved(info_hash: InfoHash, peer_id: PeerId, reserved: [u8; 8]) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the reserved bits advertise the extension protocol.
    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & EXTENSION_PROTOCOL_BIT != 0
    }
}

/// Handshake serialization utilities.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes the 68-byte handshake message.
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(49 + handshake.protocol.len());

        buf.push(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());

        buf
    }

    /// Deserializes and validates a handshake message.
    ///
    /// # Errors
    /// - `PeerError::Handshake` - Truncated data or wrong protocol identifier
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, PeerError> {
        if data.len() < 49 {
            return Err(PeerError::Handshake {
                reason: "Handshake too short".to_string(),
            });
        }

        let protocol_len = data[0] as usize;
        if data.len() < 1 + protocol_len + 8 + 20 + 20 {
            return Err(PeerError::Handshake {
                reason: "Invalid handshake length".to_string(),
            });
        }

        let protocol = String::from_utf8_lossy(&data[1..1 + protocol_len]).to_string();
        if protocol != PROTOCOL_NAME {
            return Err(PeerError::Handshake {
                reason: format!("Unknown protocol identifier: {protocol}"),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[1 + protocol_len..1 + protocol_len + 8]);

        let mut info_hash_bytes = [0u8; 20];
        info_hash_bytes.copy_from_slice(&data[1 + protocol_len + 8..1 + protocol_len + 8 + 20]);
        let info_hash = InfoHash::new(info_hash_bytes);

        let mut peer_id_bytes = [0u8; 20];
        peer_id_bytes
            .copy_from_slice(&data[1 + protocol_len + 8 + 20..1 + protocol_len + 8 + 20 + 20]);
        let peer_id = PeerId::new(peer_id_bytes);

        Ok(PeerHandshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }
}

/// What the connection should do after a rejected encrypted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoFallback {
    /// Attempts remain; the external machinery retries the encrypted path
    RetryEncrypted,
    /// Fall back to a plaintext handshake
    Plaintext,
    /// Policy requires encryption and attempts are exhausted
    Fail,
}

/// Tracks the handshake phase and the bounded encryption negotiation.
///
/// The actual key-exchange traffic lives below this layer; the negotiator
/// consumes its outcome (`crypto_agreed` / `crypto_rejected`) and decides
/// between retry, plaintext fallback, and failure.
#[derive(Debug)]
pub struct HandshakeNegotiator {
    completed: bool,
    policy: CryptoPolicy,
    attempts_left: u32,
    attempting_encrypted: bool,
    encrypted: bool,
}

impl HandshakeNegotiator {
    pub fn new(config: &CryptoConfig) -> Self {
        let attempting = config.policy != CryptoPolicy::Disabled;
        Self {
            completed: false,
            policy: config.policy,
            attempts_left: config.max_attempts,
            attempting_encrypted: attempting,
            encrypted: false,
        }
    }

    /// Whether the handshake phase is still active.
    pub fn in_handshake(&self) -> bool {
        !self.completed
    }

    /// Whether negotiation produced a working encrypted channel.
    pub fn supports_encryption(&self) -> bool {
        self.encrypted
    }

    /// Whether the connection is currently waiting on an encrypted attempt.
    pub fn attempting_encrypted(&self) -> bool {
        self.attempting_encrypted && !self.completed
    }

    /// The external key exchange succeeded; the channel is encrypted from
    /// here on.
    pub fn crypto_agreed(&mut self) -> Result<(), PeerError> {
        if self.completed || !self.attempting_encrypted {
            return Err(PeerError::Handshake {
                reason: "Unexpected encryption agreement".to_string(),
            });
        }
        self.attempting_encrypted = false;
        self.encrypted = true;
        Ok(())
    }

    /// One encrypted attempt failed; consume it and decide what is next.
    pub fn crypto_rejected(&mut self) -> CryptoFallback {
        if !self.attempting_encrypted {
            return CryptoFallback::Plaintext;
        }
        self.attempts_left = self.attempts_left.saturating_sub(1);
        if self.attempts_left > 0 {
            return CryptoFallback::RetryEncrypted;
        }
        self.attempting_encrypted = false;
        match self.policy {
            CryptoPolicy::Required => CryptoFallback::Fail,
            _ => CryptoFallback::Plaintext,
        }
    }

    /// Protocol identification finished; the handshake phase is over.
    pub fn complete(&mut self) {
        self.completed = true;
        self.attempting_encrypted = false;
    }
}
