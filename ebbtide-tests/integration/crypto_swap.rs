//! Encryption negotiation and live transform swapping

use ebbtide_core::peer::crypto::{CryptoTransform, Rc4Crypto, derive_rc4_keys};
use ebbtide_core::peer::handshake::HandshakeCodec;
use ebbtide_core::peer::state::Direction;
use ebbtide_core::{
    ConnectionState, CryptoPolicy, EbbtideConfig, ErrorKind, MessageCodec, Operation, PeerEngine,
    PeerMessage,
};

use crate::common::{addr, drain, establish, plaintext_engine, remote_handshake, test_info_hash};

fn engine_with_policy(policy: CryptoPolicy, max_attempts: u32) -> PeerEngine {
    let mut config = EbbtideConfig::default();
    config.crypto.policy = policy;
    config.crypto.max_attempts = max_attempts;
    PeerEngine::new(config, None)
}

#[test]
fn test_encrypted_handshake_goes_out_under_rc4() {
    let engine = engine_with_policy(CryptoPolicy::Preferred, 2);
    engine.register_torrent(test_info_hash(), 16);
    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    engine.socket_connected(handle.id());

    // While the key exchange is pending nothing is queued.
    assert!(drain(&engine, &handle).is_empty());

    let secret = [0x5au8; 96];
    engine.crypto_agreed(handle.id(), &secret);
    assert!(handle.supports_encryption());

    let packets = drain(&engine, &handle);
    assert_eq!(packets.len(), 1);

    // The raw bytes are not a plaintext handshake...
    assert!(HandshakeCodec::deserialize_handshake(&packets[0]).is_err());

    // ...but the peer's receive key recovers it. Our send key is the
    // incoming side's receive key.
    let (_, peer_recv_key) = derive_rc4_keys(&secret, &test_info_hash(), Direction::Incoming);
    let mut rc4 = Rc4Crypto::new(&peer_recv_key);
    let mut decrypted = packets[0].to_vec();
    rc4.apply(&mut decrypted);
    let handshake = HandshakeCodec::deserialize_handshake(&decrypted).unwrap();
    assert_eq!(handshake.info_hash, test_info_hash());
    assert_eq!(handshake.peer_id, engine.local_peer_id());
}

#[test]
fn test_preferred_policy_falls_back_to_plaintext() {
    let engine = engine_with_policy(CryptoPolicy::Preferred, 1);
    engine.register_torrent(test_info_hash(), 16);
    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    engine.socket_connected(handle.id());

    engine.crypto_rejected(handle.id());
    assert!(!handle.supports_encryption());

    // Fallback queued a plaintext handshake and the connection can still
    // establish.
    let packets = drain(&engine, &handle);
    assert_eq!(packets.len(), 1);
    assert!(HandshakeCodec::deserialize_handshake(&packets[0]).is_ok());

    engine.handshake_received(handle.id(), &remote_handshake());
    assert_eq!(handle.state(), Some(ConnectionState::Established));
}

#[test]
fn test_required_policy_exhaustion_fails_handshake() {
    let engine = engine_with_policy(CryptoPolicy::Required, 2);
    engine.register_torrent(test_info_hash(), 16);
    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    engine.socket_connected(handle.id());

    engine.crypto_rejected(handle.id()); // one attempt left
    assert!(!handle.failed());

    engine.crypto_rejected(handle.id()); // exhausted
    assert_eq!(handle.state(), Some(ConnectionState::Closed));
    let reason = handle.disconnect_reason().unwrap();
    assert_eq!(reason.error, ErrorKind::HandshakeFailed);
    assert_eq!(reason.op, Operation::Encryption);
}

#[test]
fn test_send_swap_preserves_message_ordering() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    drain(&engine, &handle);

    // One message under the old (plaintext) transform...
    assert!(handle.send_unchoke());

    // ...swap the send transform...
    handle.switch_send_crypto(Box::new(Rc4Crypto::new(b"swap key")));

    // ...and one message after the swap.
    handle.send_interested();

    let packets = drain(&engine, &handle);
    assert_eq!(packets.len(), 2);

    // Bytes enqueued before the swap are plaintext.
    assert_eq!(
        MessageCodec::deserialize_message(&packets[0]).unwrap(),
        PeerMessage::Unchoke
    );

    // Bytes enqueued after it only decode under the new transform.
    assert!(MessageCodec::deserialize_message(&packets[1]).is_err());
    let mut rc4 = Rc4Crypto::new(b"swap key");
    let mut decrypted = packets[1].to_vec();
    rc4.apply(&mut decrypted);
    assert_eq!(
        MessageCodec::deserialize_message(&decrypted).unwrap(),
        PeerMessage::Interested
    );
}

#[test]
fn test_send_swap_is_message_atomic_across_queue() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    drain(&engine, &handle);

    // Queue several messages around two swaps; each packet must decode
    // whole under exactly one transform.
    assert!(handle.send_unchoke());
    handle.switch_send_crypto(Box::new(Rc4Crypto::new(b"first")));
    handle.send_interested();
    handle.send_not_interested();
    handle.switch_send_crypto(Box::new(Rc4Crypto::new(b"second")));
    assert!(handle.send_choke());

    let packets = drain(&engine, &handle);
    assert_eq!(packets.len(), 4);

    assert_eq!(
        MessageCodec::deserialize_message(&packets[0]).unwrap(),
        PeerMessage::Unchoke
    );

    // The first rc4 stream covers packets 1 and 2, in order.
    let mut first = Rc4Crypto::new(b"first");
    let mut stream = packets[1].to_vec();
    stream.extend_from_slice(&packets[2]);
    first.apply(&mut stream);
    assert_eq!(
        MessageCodec::deserialize_message(&stream[..5]).unwrap(),
        PeerMessage::Interested
    );
    assert_eq!(
        MessageCodec::deserialize_message(&stream[5..]).unwrap(),
        PeerMessage::NotInterested
    );

    let mut second = Rc4Crypto::new(b"second");
    let mut last = packets[3].to_vec();
    second.apply(&mut last);
    assert_eq!(
        MessageCodec::deserialize_message(&last).unwrap(),
        PeerMessage::Choke
    );
}

#[test]
fn test_recv_swap_commits_at_message_boundary() {
    let engine = plaintext_engine();
    let handle = establish(&engine);

    // Stage a receive transform; bytes arriving before the next boundary
    // still pass through the active (plaintext) transform.
    handle.switch_recv_crypto(Box::new(Rc4Crypto::new(b"inbound key")));

    let mut tail = MessageCodec::serialize_message(&PeerMessage::Unchoke);
    engine.recv_transform(handle.id(), &mut tail);
    assert_eq!(tail, MessageCodec::serialize_message(&PeerMessage::Unchoke));

    // Delivering the decoded message marks the boundary and commits the
    // pending transform.
    engine.deliver_message(handle.id(), &PeerMessage::Unchoke);

    // The peer now sends rc4 bytes; the committed transform recovers them.
    let mut peer_rc4 = Rc4Crypto::new(b"inbound key");
    let mut wire = MessageCodec::serialize_message(&PeerMessage::Interested);
    peer_rc4.apply(&mut wire);

    engine.recv_transform(handle.id(), &mut wire);
    assert_eq!(
        MessageCodec::deserialize_message(&wire).unwrap(),
        PeerMessage::Interested
    );
}

#[test]
fn test_plaintext_policy_never_reports_encryption() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    assert!(!handle.supports_encryption());
}
