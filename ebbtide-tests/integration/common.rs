//! Shared helpers for driving the engine in tests

use std::net::SocketAddr;

use bytes::Bytes;
use ebbtide_core::peer::handshake::PeerHandshake;
use ebbtide_core::{
    CryptoPolicy, EbbtideConfig, InfoHash, PeerEngine, PeerHandle, PeerId,
};

pub const TEST_PIECES: u32 = 16;

pub fn plaintext_engine() -> PeerEngine {
    let mut config = EbbtideConfig::default();
    config.crypto.policy = CryptoPolicy::Disabled;
    PeerEngine::new(config, None)
}

pub fn test_info_hash() -> InfoHash {
    InfoHash::new([0xabu8; 20])
}

pub fn remote_pid() -> PeerId {
    PeerId::new([0xeeu8; 20])
}

pub fn addr(port: u16) -> SocketAddr {
    format!("10.2.2.2:{port}").parse().unwrap()
}

pub fn remote_handshake() -> PeerHandshake {
    PeerHandshake::new(test_info_hash(), remote_pid())
}

/// Connects outgoing and drives the handshake to `Established`.
pub fn establish(engine: &PeerEngine) -> PeerHandle {
    engine.register_torrent(test_info_hash(), TEST_PIECES);
    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    engine.socket_connected(handle.id());
    engine.handshake_received(handle.id(), &remote_handshake());
    assert!(!handle.in_handshake());
    handle
}

/// Drains every queued outbound packet.
pub fn drain(engine: &PeerEngine, handle: &PeerHandle) -> Vec<Bytes> {
    let mut packets = Vec::new();
    while let Some(packet) = engine.take_outbound(handle.id()) {
        packets.push(packet);
    }
    packets
}
