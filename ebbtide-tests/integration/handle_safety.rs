//! Handle behavior across connection teardown and slot reuse

use ebbtide_core::{ErrorKind, Operation, PeerError, PieceIndex};

use crate::common::{addr, drain, establish, plaintext_engine, test_info_hash};

#[test]
fn test_every_query_degrades_when_target_is_gone() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    handle.disconnect(ErrorKind::Requested, Operation::Bittorrent, None);
    drain(&engine, &handle);
    engine.remove_closed();

    assert!(!handle.is_alive());
    assert!(handle.state().is_none());
    assert!(handle.kind().is_none());
    assert!(handle.remote().is_none());
    assert!(handle.local_endpoint().is_none());
    assert!(handle.pid().is_none());
    assert!(handle.peer_rank().is_none());
    assert!(handle.associated_torrent().is_none());
    assert!(handle.disconnect_reason().is_none());
    assert!(handle.last_seen_complete().is_none());
    assert!(handle.time_of_last_unchoke().is_none());

    assert!(!handle.is_seed());
    assert!(!handle.has_piece(PieceIndex::new(0)));
    assert!(!handle.is_interesting());
    assert!(!handle.is_choked());
    assert!(!handle.is_peer_interested());
    assert!(!handle.has_peer_choked());
    assert!(!handle.failed());
    assert!(!handle.is_disconnecting());
    assert!(!handle.is_connecting());
    assert!(!handle.is_outgoing());
    assert!(!handle.in_handshake());
    assert!(!handle.has_metadata());
    assert!(!handle.upload_only());
    assert!(!handle.share_mode());
    assert!(!handle.received_listen_port());
    assert!(!handle.on_local_network());
    assert!(!handle.supports_encryption());
    assert!(!handle.support_extensions());
    assert!(!handle.can_write());
}

#[test]
fn test_every_command_is_a_noop_when_target_is_gone() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    handle.disconnect(ErrorKind::Requested, Operation::Bittorrent, None);
    drain(&engine, &handle);
    engine.remove_closed();

    // None of these may panic or resurrect the slot.
    handle.set_upload_only(true);
    handle.set_share_mode(true);
    handle.keep_alive();
    handle.choke_this_peer();
    assert!(!handle.maybe_unchoke_this_peer());
    assert!(!handle.send_choke());
    assert!(!handle.send_unchoke());
    handle.send_interested();
    handle.send_not_interested();
    handle.send_suggest(PieceIndex::new(1));
    assert!(!handle.send_buffer(b"raw"));
    handle.disconnect(ErrorKind::TimedOut, Operation::Read, None);
    assert!(!handle.disconnect_if_redundant());

    assert!(!handle.is_alive());
    assert_eq!(engine.connection_count(), 0);
}

#[test]
fn test_stale_handle_does_not_see_slot_reuse() {
    let engine = plaintext_engine();
    let stale = establish(&engine);
    stale.disconnect(ErrorKind::Requested, Operation::Bittorrent, None);
    drain(&engine, &stale);
    engine.remove_closed();

    // A new connection reuses the freed slot index under a new generation.
    let fresh = engine
        .connect(test_info_hash(), addr(6999), addr(7100))
        .unwrap();
    assert!(fresh.is_alive());
    assert!(!stale.is_alive());

    // Commands through the stale handle must not leak onto the fresh
    // connection.
    stale.set_upload_only(true);
    assert!(!fresh.upload_only());
}

#[test]
fn test_with_native_scopes_strong_access() {
    let engine = plaintext_engine();
    let handle = establish(&engine);

    let remote = handle.with_native(|conn| conn.remote());
    assert_eq!(remote, Some(addr(6881)));

    drop(engine);
    assert_eq!(handle.with_native(|conn| conn.remote()), None);
}

#[test]
fn test_add_extension_reports_gone_target() {
    struct NullPlugin;
    impl ebbtide_core::ExtensionPlugin for NullPlugin {
        fn tag(&self) -> &'static str {
            "null"
        }
        fn on_extended_message(&mut self, _: u8, _: &[u8]) -> Result<bool, PeerError> {
            Ok(false)
        }
    }

    let engine = plaintext_engine();
    let handle = establish(&engine);
    drop(engine);

    assert!(matches!(
        handle.add_extension(Box::new(NullPlugin)),
        Err(PeerError::ConnectionGone)
    ));
    assert_eq!(handle.find_plugin("null", |p| p.tag()), None);
}
