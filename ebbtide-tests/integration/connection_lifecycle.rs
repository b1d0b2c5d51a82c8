//! Connection lifecycle: handshake flow, disconnect semantics, timeouts

use std::time::Instant;

use ebbtide_core::peer::handshake::{HandshakeCodec, PeerHandshake};
use ebbtide_core::{
    ConnectionState, EbbtideConfig, ErrorKind, InfoHash, Operation, PeerId, PeerMessage,
};

use crate::common::{
    addr, drain, establish, plaintext_engine, remote_handshake, test_info_hash,
};

#[test]
fn test_outgoing_connection_reaches_established() {
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);

    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    assert_eq!(handle.state(), Some(ConnectionState::Connecting));
    assert!(handle.is_outgoing());
    assert!(handle.in_handshake());

    engine.socket_connected(handle.id());
    assert_eq!(handle.state(), Some(ConnectionState::Handshaking));

    // The engine queued our handshake; it parses back to our identity.
    let packets = drain(&engine, &handle);
    assert_eq!(packets.len(), 1);
    let ours = HandshakeCodec::deserialize_handshake(&packets[0]).unwrap();
    assert_eq!(ours.info_hash, test_info_hash());
    assert_eq!(ours.peer_id, engine.local_peer_id());
    assert!(ours.supports_extension_protocol());

    engine.handshake_received(handle.id(), &remote_handshake());
    assert_eq!(handle.state(), Some(ConnectionState::Established));
    assert!(!handle.in_handshake());
    assert!(!handle.failed());
}

#[test]
fn test_in_handshake_is_monotonic() {
    let engine = plaintext_engine();
    let handle = establish(&engine);

    // Once the handshake completes the flag never comes back.
    assert!(!handle.in_handshake());
    engine.deliver_message(handle.id(), &PeerMessage::Unchoke);
    handle.send_interested();
    assert!(!handle.in_handshake());

    handle.disconnect(ErrorKind::Requested, Operation::Bittorrent, None);
    assert!(!handle.in_handshake());
}

#[test]
fn test_wrong_info_hash_closes_with_handshake_failed() {
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);
    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    engine.socket_connected(handle.id());

    let wrong = PeerHandshake::new(InfoHash::new([0x01u8; 20]), PeerId::new([0xeeu8; 20]));
    engine.handshake_received(handle.id(), &wrong);

    assert_eq!(handle.state(), Some(ConnectionState::Closed));
    assert!(handle.failed());
    let reason = handle.disconnect_reason().unwrap();
    assert_eq!(reason.error, ErrorKind::HandshakeFailed);
    assert_eq!(reason.op, Operation::Handshake);
}

#[test]
fn test_disconnect_during_handshake_spec_scenario() {
    // disconnect(TimedOut, Read) while in_handshake() is true
    //   -> Closed(TimedOut, Read), subsequent send_choke() has no effect.
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);
    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    engine.socket_connected(handle.id());
    assert!(handle.in_handshake());

    handle.disconnect(ErrorKind::TimedOut, Operation::Read, None);
    assert_eq!(handle.state(), Some(ConnectionState::Closed));
    let reason = handle.disconnect_reason().unwrap();
    assert_eq!(reason.error, ErrorKind::TimedOut);
    assert_eq!(reason.op, Operation::Read);

    assert!(!handle.send_choke());
    assert!(drain(&engine, &handle).is_empty());
}

#[test]
fn test_disconnect_idempotence_keeps_first_reason() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    drain(&engine, &handle);

    handle.disconnect(ErrorKind::ConnectionReset, Operation::Read, Some(104));
    handle.disconnect(ErrorKind::ProtocolViolation, Operation::Extension, None);
    handle.disconnect(ErrorKind::Requested, Operation::Bittorrent, None);

    assert_eq!(handle.state(), Some(ConnectionState::Closed));
    let reason = handle.disconnect_reason().unwrap();
    assert_eq!(reason.error, ErrorKind::ConnectionReset);
    assert_eq!(reason.op, Operation::Read);
    assert_eq!(reason.code, Some(104));
    assert!(handle.failed());
}

#[test]
fn test_established_teardown_drains_prior_sends() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    drain(&engine, &handle);

    assert!(handle.send_unchoke());
    handle.disconnect(ErrorKind::Requested, Operation::Bittorrent, None);
    assert_eq!(handle.state(), Some(ConnectionState::Disconnecting));

    // Sends queued after the disconnect are discarded...
    handle.send_interested();

    // ...while the unchoke queued before it drains.
    let packets = drain(&engine, &handle);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].as_ref(), &[0, 0, 0, 1, 1]); // unchoke wire form

    assert_eq!(handle.state(), Some(ConnectionState::Closed));
    assert!(!handle.failed()); // requested close is clean
}

#[test]
fn test_can_disconnect_predicate_never_mutates() {
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);
    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    engine.socket_connected(handle.id());

    // Handshake bytes still queued: a clean close must wait, failures not.
    assert!(!handle.can_disconnect(ErrorKind::Requested));
    assert!(handle.can_disconnect(ErrorKind::TimedOut));
    assert_eq!(handle.state(), Some(ConnectionState::Handshaking));

    drain(&engine, &handle);
    assert!(handle.can_disconnect(ErrorKind::Requested));
    assert_eq!(handle.state(), Some(ConnectionState::Handshaking));
}

#[test]
fn test_handshake_timeout_via_tick() {
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);
    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    engine.socket_connected(handle.id());

    let timeout = EbbtideConfig::default().connection.handshake_timeout;
    engine.on_tick(Instant::now() + timeout * 2);

    assert!(handle.failed());
    let reason = handle.disconnect_reason().unwrap();
    assert_eq!(reason.error, ErrorKind::TimedOut);
    assert_eq!(reason.op, Operation::Handshake);
}

#[test]
fn test_message_before_established_is_protocol_violation() {
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);
    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    engine.socket_connected(handle.id());

    engine.deliver_message(handle.id(), &PeerMessage::Interested);
    assert!(handle.failed());
    assert_eq!(
        handle.disconnect_reason().map(|r| r.error),
        Some(ErrorKind::ProtocolViolation)
    );
}

#[test]
fn test_peer_info_snapshot_outlives_connection() {
    let engine = plaintext_engine();
    let handle = establish(&engine);

    let info = handle.peer_info().unwrap();
    assert_eq!(info.state, ConnectionState::Established);
    assert_eq!(info.remote, addr(6881));

    // Snapshots serialize for the external observability surface.
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["state"], "Established");
    assert_eq!(json["failed"], false);

    handle.disconnect(ErrorKind::Io, Operation::Write, None);
    drain(&engine, &handle);
    engine.remove_closed();

    // The retained snapshot is untouched by the teardown.
    assert_eq!(info.state, ConnectionState::Established);
    assert!(handle.peer_info().is_none());
}
