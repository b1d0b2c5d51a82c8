//! Redundant-connection resolution: deterministic, symmetric, rank-driven

use ebbtide_core::peer::handshake::PeerHandshake;
use ebbtide_core::{ConnectionState, ErrorKind, PeerEngine, PeerHandle, PeerId};

use crate::common::{addr, plaintext_engine, test_info_hash};

fn remote() -> PeerId {
    // Higher than any generated "-EB0001-..." id, so the canonical
    // initiator of a duplicate pair is always our side.
    PeerId::new([0xf0u8; 20])
}

fn handshake() -> PeerHandshake {
    PeerHandshake::new(test_info_hash(), remote())
}

fn outgoing(engine: &PeerEngine) -> PeerHandle {
    let handle = engine
        .connect(test_info_hash(), addr(6881), addr(7100))
        .unwrap();
    engine.socket_connected(handle.id());
    engine.handshake_received(handle.id(), &handshake());
    handle
}

fn incoming(engine: &PeerEngine) -> PeerHandle {
    let handle = engine
        .accept(test_info_hash(), addr(6950), addr(7100))
        .unwrap();
    engine.handshake_received(handle.id(), &handshake());
    handle
}

#[test]
fn test_duplicate_pair_resolves_to_one_survivor() {
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);

    let first = outgoing(&engine);
    assert_eq!(first.state(), Some(ConnectionState::Established));

    let second = incoming(&engine);

    // Resolution happened automatically when the duplicate completed its
    // handshake; the canonical (outgoing) connection survives.
    assert_eq!(first.state(), Some(ConnectionState::Established));
    assert_eq!(second.state(), Some(ConnectionState::Closed));
    assert_eq!(
        second.disconnect_reason().map(|r| r.error),
        Some(ErrorKind::Redundant)
    );
}

#[test]
fn test_resolution_is_order_independent() {
    // Same duplicate pair, arrival order reversed: the verdict must not
    // change.
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);

    let loser_first = incoming(&engine);
    assert_eq!(loser_first.state(), Some(ConnectionState::Established));

    let winner_second = outgoing(&engine);
    assert_eq!(winner_second.state(), Some(ConnectionState::Established));
    assert!(loser_first.failed());
    assert_eq!(
        loser_first.disconnect_reason().map(|r| r.error),
        Some(ErrorKind::Redundant)
    );
}

#[test]
fn test_explicit_check_closes_only_the_lower_ranked() {
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);

    let winner = outgoing(&engine);
    let loser = incoming(&engine);
    // The automatic pass already closed the loser.
    assert!(loser.failed());

    // Calling the check on the survivor changes nothing.
    assert!(!winner.disconnect_if_redundant());
    assert_eq!(winner.state(), Some(ConnectionState::Established));
}

#[test]
fn test_ranks_differ_between_duplicate_directions() {
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);

    let out = outgoing(&engine);
    let rank_out = out.peer_rank().unwrap();

    let inc = incoming(&engine);
    // The loser is already closed but its rank is still observable until
    // the set reaps it.
    let rank_in = inc.peer_rank().unwrap();

    assert_ne!(rank_out, rank_in);
    assert!(rank_out > rank_in);
}

#[test]
fn test_duplicates_across_torrents_are_not_redundant() {
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);
    let other_hash = ebbtide_core::InfoHash::new([0x77u8; 20]);
    engine.register_torrent(other_hash, 16);

    let first = outgoing(&engine);

    // Same remote peer, different torrent: both survive.
    let second = engine.accept(other_hash, addr(6950), addr(7100)).unwrap();
    engine.handshake_received(second.id(), &PeerHandshake::new(other_hash, remote()));

    assert_eq!(first.state(), Some(ConnectionState::Established));
    assert_eq!(second.state(), Some(ConnectionState::Established));
}

#[test]
fn test_established_invariant_one_connection_per_identity() {
    let engine = plaintext_engine();
    engine.register_torrent(test_info_hash(), 16);

    let handles = [
        outgoing(&engine),
        incoming(&engine),
        incoming(&engine),
    ];

    let established = handles
        .iter()
        .filter(|h| h.state() == Some(ConnectionState::Established))
        .count();
    assert_eq!(established, 1);

    let redundant = handles
        .iter()
        .filter(|h| {
            h.disconnect_reason().map(|r| r.error) == Some(ErrorKind::Redundant)
        })
        .count();
    assert_eq!(redundant, 2);
}
