//! Choke/interest negotiation over the engine surface

use ebbtide_core::{MessageCodec, PeerMessage, PieceIndex};

use crate::common::{drain, establish, plaintext_engine};

#[test]
fn test_send_unchoke_when_already_unchoked_sends_nothing() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    drain(&engine, &handle);

    assert!(handle.send_unchoke()); // transition: message sent
    assert!(!handle.send_unchoke()); // redundant: no message
    assert!(!handle.is_choked());

    let packets = drain(&engine, &handle);
    assert_eq!(packets.len(), 1);
    let decoded = MessageCodec::deserialize_message(&packets[0]).unwrap();
    assert_eq!(decoded, PeerMessage::Unchoke);
}

#[test]
fn test_choke_unchoke_bit_tracks_wire_traffic() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    drain(&engine, &handle);

    // Starts choked; choking again is a no-op.
    assert!(handle.is_choked());
    assert!(!handle.send_choke());

    assert!(handle.send_unchoke());
    assert!(handle.send_choke());
    assert!(handle.send_unchoke());

    let messages: Vec<_> = drain(&engine, &handle)
        .iter()
        .map(|packet| MessageCodec::deserialize_message(packet).unwrap())
        .collect();
    assert_eq!(
        messages,
        vec![
            PeerMessage::Unchoke,
            PeerMessage::Choke,
            PeerMessage::Unchoke
        ]
    );
    assert!(!handle.is_choked());
    assert!(handle.time_of_last_unchoke().is_some());
}

#[test]
fn test_interest_pair_is_deduplicated() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    drain(&engine, &handle);

    handle.send_interested();
    handle.send_interested();
    handle.send_not_interested();
    handle.send_not_interested();

    let messages: Vec<_> = drain(&engine, &handle)
        .iter()
        .map(|packet| MessageCodec::deserialize_message(packet).unwrap())
        .collect();
    assert_eq!(
        messages,
        vec![PeerMessage::Interested, PeerMessage::NotInterested]
    );
    assert!(!handle.is_interesting());
}

#[test]
fn test_remote_control_messages_update_their_bits() {
    let engine = plaintext_engine();
    let handle = establish(&engine);

    assert!(handle.has_peer_choked());
    assert!(!handle.is_peer_interested());

    engine.deliver_message(handle.id(), &PeerMessage::Unchoke);
    engine.deliver_message(handle.id(), &PeerMessage::Interested);
    assert!(!handle.has_peer_choked());
    assert!(handle.is_peer_interested());

    engine.deliver_message(handle.id(), &PeerMessage::Choke);
    engine.deliver_message(handle.id(), &PeerMessage::NotInterested);
    assert!(handle.has_peer_choked());
    assert!(!handle.is_peer_interested());

    // Remote traffic never touches the local pair.
    assert!(handle.is_choked());
    assert!(!handle.is_interesting());
}

#[test]
fn test_suggest_does_not_disturb_control_bits() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    drain(&engine, &handle);

    handle.send_suggest(PieceIndex::new(3));
    assert!(handle.is_choked());
    assert!(!handle.is_interesting());

    let packets = drain(&engine, &handle);
    assert_eq!(packets.len(), 1);
    assert_eq!(
        MessageCodec::deserialize_message(&packets[0]).unwrap(),
        PeerMessage::Suggest {
            piece_index: PieceIndex::new(3)
        }
    );

    // Out-of-range suggestions are swallowed, not sent.
    handle.send_suggest(PieceIndex::new(999));
    assert!(drain(&engine, &handle).is_empty());
}

#[test]
fn test_keep_alive_is_a_wire_noop() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    drain(&engine, &handle);

    handle.keep_alive();
    let packets = drain(&engine, &handle);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].as_ref(), &[0, 0, 0, 0]);
    assert_eq!(
        MessageCodec::deserialize_message(&packets[0]).unwrap(),
        PeerMessage::KeepAlive
    );

    // No control bit moved.
    assert!(handle.is_choked());
    assert!(!handle.is_interesting());
}

#[test]
fn test_choke_this_peer_forces_choke() {
    let engine = plaintext_engine();
    let handle = establish(&engine);
    handle.send_unchoke();
    drain(&engine, &handle);

    handle.choke_this_peer();
    assert!(handle.is_choked());
    assert_eq!(drain(&engine, &handle).len(), 1);

    // Forcing again stays idempotent on the wire.
    handle.choke_this_peer();
    assert!(drain(&engine, &handle).is_empty());
}

#[test]
fn test_bitfield_and_piece_queries() {
    let engine = plaintext_engine();
    let handle = establish(&engine);

    engine.deliver_message(
        handle.id(),
        &PeerMessage::Bitfield {
            bitfield: bytes::Bytes::from_static(&[0b1010_0000, 0x00]),
        },
    );
    assert!(handle.has_piece(PieceIndex::new(0)));
    assert!(!handle.has_piece(PieceIndex::new(1)));
    assert!(handle.has_piece(PieceIndex::new(2)));
    assert!(!handle.is_seed());

    engine.deliver_message(
        handle.id(),
        &PeerMessage::Have {
            piece_index: PieceIndex::new(1),
        },
    );
    assert!(handle.has_piece(PieceIndex::new(1)));
}

#[test]
fn test_full_bitfield_marks_seed() {
    let engine = plaintext_engine();
    let handle = establish(&engine);

    engine.deliver_message(
        handle.id(),
        &PeerMessage::Bitfield {
            bitfield: bytes::Bytes::from_static(&[0xff, 0xff]),
        },
    );
    assert!(handle.is_seed());
    assert!(handle.last_seen_complete().is_some());
}
