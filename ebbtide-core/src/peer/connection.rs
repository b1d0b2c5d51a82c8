//! The per-peer connection entity
//!
//! Composes the lifecycle state machine, choke/interest negotiator,
//! handshake/encryption negotiator, extension registry, and the outbound
//! byte queue. Every operation completes synchronously against in-memory
//! state; the external transport drains `take_outbound` and feeds decoded
//! messages back in.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use serde::Serialize;

use super::choke::ChokeState;
use super::crypto::{CryptoSlot, CryptoTransform, Rc4Crypto, derive_rc4_keys};
use super::diagnostics::{self, DiagnosticsSink, LogDirection};
use super::extensions::{ExtensionPlugin, ExtensionRegistry};
use super::handshake::{CryptoFallback, HandshakeCodec, HandshakeNegotiator, PeerHandshake};
use super::message::{MessageCodec, PeerMessage};
use super::state::{
    ConnectionState, Direction, DisconnectOutcome, DisconnectReason, ErrorKind, Lifecycle,
    Operation,
};
use super::{PeerError, PeerId, PieceIndex, TorrentRef};
use crate::config::EbbtideConfig;

/// Transport flavor of a connection. Only the BitTorrent TCP flavor exists
/// in this engine; web seeds live outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerKind {
    BitTorrent,
}

/// Piece availability bitfield for one peer.
#[derive(Debug, Clone)]
pub struct PieceSet {
    bits: Vec<u8>,
    piece_count: u32,
}

impl PieceSet {
    /// Creates an empty set for the given number of pieces.
    pub fn new(piece_count: u32) -> Self {
        let byte_count = piece_count.div_ceil(8);
        Self {
            bits: vec![0u8; byte_count as usize],
            piece_count,
        }
    }

    /// Creates a set from a received bitfield.
    ///
    /// # Errors
    /// - `PeerError::Protocol` - Size does not match the piece count
    pub fn from_bytes(data: &[u8], piece_count: u32) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if data.len() != expected as usize {
            return Err(PeerError::Protocol {
                message: format!(
                    "Invalid bitfield size: expected {} bytes for {} pieces, got {}",
                    expected,
                    piece_count,
                    data.len()
                ),
            });
        }
        Ok(Self {
            bits: data.to_vec(),
            piece_count,
        })
    }

    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return false;
        }
        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8); // MSB first
        byte_index < self.bits.len() && (self.bits[byte_index] & (1 << bit_index)) != 0
    }

    pub fn set_piece(&mut self, piece_index: PieceIndex) {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return;
        }
        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        if byte_index < self.bits.len() {
            self.bits[byte_index] |= 1 << bit_index;
        }
    }

    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn is_complete(&self) -> bool {
        self.piece_count > 0 && self.count_set() == self.piece_count
    }
}

/// Immutable point-in-time snapshot of a connection.
///
/// Decoupled from the live connection; callers may retain it after the
/// connection changes or disappears.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub kind: PeerKind,
    pub direction: Direction,
    pub state: ConnectionState,
    pub peer_id: Option<String>,
    pub pieces_have: u32,
    pub is_seed: bool,
    pub interesting: bool,
    pub choked: bool,
    pub peer_interested: bool,
    pub peer_choked: bool,
    pub upload_only: bool,
    pub share_mode: bool,
    pub supports_encryption: bool,
    pub supports_extensions: bool,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub failed: bool,
    pub reason: Option<DisconnectReason>,
    pub age_secs: u64,
}

impl PeerInfo {
    /// Blank snapshot for `fill_peer_info` to populate.
    pub fn empty() -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self {
            remote: unspecified,
            local: unspecified,
            kind: PeerKind::BitTorrent,
            direction: Direction::Outgoing,
            state: ConnectionState::Connecting,
            peer_id: None,
            pieces_have: 0,
            is_seed: false,
            interesting: false,
            choked: true,
            peer_interested: false,
            peer_choked: true,
            upload_only: false,
            share_mode: false,
            supports_encryption: false,
            supports_extensions: false,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            failed: false,
            reason: None,
            age_secs: 0,
        }
    }
}

/// A connection to one remote peer.
pub struct PeerConnection {
    config: Arc<EbbtideConfig>,
    sink: Option<Arc<dyn DiagnosticsSink>>,
    torrent: Arc<TorrentRef>,
    local_id: PeerId,
    peer_id: Option<PeerId>,
    remote: SocketAddr,
    local: SocketAddr,
    direction: Direction,
    lifecycle: Lifecycle,
    negotiator: HandshakeNegotiator,
    choke: ChokeState,
    send_crypto: CryptoSlot,
    recv_crypto: CryptoSlot,
    extensions: ExtensionRegistry,
    pieces: Option<PieceSet>,
    outbound: VecDeque<Bytes>,
    outbound_bytes: usize,
    handshake_sent: bool,
    peer_supports_extensions: bool,
    received_listen_port: Option<u16>,
    upload_only: bool,
    share_mode: bool,
    no_download: bool,
    ignore_stats: bool,
    bytes_downloaded: u64,
    bytes_uploaded: u64,
    last_seen_complete: Option<SystemTime>,
    created_at: Instant,
    last_receive: Instant,
    last_send: Instant,
    /// Insertion-order serial assigned by the owning set; stable tie-breaker
    sequence: u64,
}

impl PeerConnection {
    pub fn new(
        config: Arc<EbbtideConfig>,
        sink: Option<Arc<dyn DiagnosticsSink>>,
        torrent: Arc<TorrentRef>,
        local_id: PeerId,
        direction: Direction,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Self {
        let lifecycle = match direction {
            Direction::Outgoing => Lifecycle::outgoing(),
            Direction::Incoming => Lifecycle::incoming(),
        };
        let negotiator = HandshakeNegotiator::new(&config.crypto);
        let now = Instant::now();
        Self {
            config,
            sink,
            torrent,
            local_id,
            peer_id: None,
            remote,
            local,
            direction,
            lifecycle,
            negotiator,
            choke: ChokeState::new(),
            send_crypto: CryptoSlot::plaintext(),
            recv_crypto: CryptoSlot::plaintext(),
            extensions: ExtensionRegistry::new(),
            pieces: None,
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            handshake_sent: false,
            peer_supports_extensions: false,
            received_listen_port: None,
            upload_only: false,
            share_mode: false,
            no_download: false,
            ignore_stats: false,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            last_seen_complete: None,
            created_at: now,
            last_receive: now,
            last_send: now,
            sequence: 0,
        }
    }

    // --- queries ---

    pub fn kind(&self) -> PeerKind {
        PeerKind::BitTorrent
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }

    pub fn is_connecting(&self) -> bool {
        self.lifecycle.is_connecting()
    }

    pub fn is_disconnecting(&self) -> bool {
        self.lifecycle.is_disconnecting()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    pub fn failed(&self) -> bool {
        self.lifecycle.failed()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.lifecycle.reason()
    }

    pub fn in_handshake(&self) -> bool {
        self.negotiator.in_handshake()
    }

    pub fn supports_encryption(&self) -> bool {
        self.negotiator.supports_encryption()
    }

    /// Whether both ends negotiated the extension protocol.
    pub fn support_extensions(&self) -> bool {
        !self.in_handshake() && self.peer_supports_extensions
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    pub fn pid(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn associated_torrent(&self) -> Arc<TorrentRef> {
        Arc::clone(&self.torrent)
    }

    pub fn has_metadata(&self) -> bool {
        self.torrent.has_metadata()
    }

    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        self.pieces
            .as_ref()
            .is_some_and(|pieces| pieces.has_piece(piece_index))
    }

    pub fn is_seed(&self) -> bool {
        self.pieces.as_ref().is_some_and(|pieces| pieces.is_complete())
    }

    pub fn is_interesting(&self) -> bool {
        self.choke.is_interesting()
    }

    pub fn is_choked(&self) -> bool {
        self.choke.is_choked()
    }

    pub fn is_peer_interested(&self) -> bool {
        self.choke.is_peer_interested()
    }

    pub fn has_peer_choked(&self) -> bool {
        self.choke.has_peer_choked()
    }

    pub fn received_listen_port(&self) -> bool {
        self.received_listen_port.is_some()
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.received_listen_port
    }

    pub fn upload_only(&self) -> bool {
        self.upload_only
    }

    pub fn share_mode(&self) -> bool {
        self.share_mode
    }

    pub fn no_download(&self) -> bool {
        self.no_download
    }

    pub fn ignore_stats(&self) -> bool {
        self.ignore_stats
    }

    pub fn last_seen_complete(&self) -> Option<SystemTime> {
        self.last_seen_complete
    }

    pub fn time_of_last_unchoke(&self) -> Option<Instant> {
        self.choke.time_of_last_unchoke()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    /// Whether the outbound queue has room for more data.
    pub fn can_write(&self) -> bool {
        self.lifecycle.accepts_sends()
            && self.outbound_bytes < self.config.connection.max_outbound_buffer
    }

    pub fn on_local_network(&self) -> bool {
        match self.remote.ip() {
            IpAddr::V4(ip) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
            IpAddr::V6(ip) => {
                ip.is_loopback()
                    || (ip.segments()[0] & 0xfe00) == 0xfc00 // unique local fc00::/7
                    || (ip.segments()[0] & 0xffc0) == 0xfe80 // link local fe80::/10
            }
        }
    }

    /// Whether the external unchoke-slot accounting does not apply here.
    pub fn ignore_unchoke_slots(&self) -> bool {
        self.on_local_network() && !self.config.connection.unchoke_slots_on_local_network
    }

    /// Pure predicate: is disconnecting for this reason currently allowed?
    ///
    /// A clean requested close is refused while handshake output is still
    /// queued; genuine failures may always disconnect.
    pub fn can_disconnect(&self, error: ErrorKind) -> bool {
        !(error == ErrorKind::Requested && self.in_handshake() && !self.outbound.is_empty())
    }

    /// Deterministic comparable score for redundant-connection resolution.
    ///
    /// The dominant term prefers the connection whose direction matches the
    /// canonical initiator, the side with the smaller peer id. Both
    /// endpoints of a duplicate pair share that fact, so their verdicts
    /// agree. Encryption and local-network transport break remaining ties;
    /// exact ties fall to the owning set's stable sequence order.
    pub fn peer_rank(&self) -> u32 {
        let mut rank = 0;
        if let Some(peer_id) = self.peer_id {
            let canonical_outgoing = self.local_id < peer_id;
            if (self.direction == Direction::Outgoing) == canonical_outgoing {
                rank += 4;
            }
        }
        if self.supports_encryption() {
            rank += 2;
        }
        if self.on_local_network() {
            rank += 1;
        }
        rank
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Fills an external snapshot structure with the current state.
    pub fn fill_peer_info(&self, out: &mut PeerInfo) {
        out.remote = self.remote;
        out.local = self.local;
        out.kind = self.kind();
        out.direction = self.direction;
        out.state = self.lifecycle.state();
        out.peer_id = self.peer_id.map(|id| id.to_string());
        out.pieces_have = self.pieces.as_ref().map_or(0, |p| p.count_set());
        out.is_seed = self.is_seed();
        out.interesting = self.choke.is_interesting();
        out.choked = self.choke.is_choked();
        out.peer_interested = self.choke.is_peer_interested();
        out.peer_choked = self.choke.has_peer_choked();
        out.upload_only = self.upload_only;
        out.share_mode = self.share_mode;
        out.supports_encryption = self.supports_encryption();
        out.supports_extensions = self.support_extensions();
        out.bytes_downloaded = self.bytes_downloaded;
        out.bytes_uploaded = self.bytes_uploaded;
        out.failed = self.failed();
        out.reason = self.lifecycle.reason();
        out.age_secs = self.created_at.elapsed().as_secs();
    }

    pub fn peer_info(&self) -> PeerInfo {
        let mut info = PeerInfo::empty();
        self.fill_peer_info(&mut info);
        info
    }

    // --- flags ---

    pub fn set_upload_only(&mut self, upload_only: bool) {
        if self.upload_only != upload_only {
            self.upload_only = upload_only;
            self.peer_log(LogDirection::Info, "upload_only", format!("{upload_only}"));
        }
    }

    pub fn set_share_mode(&mut self, share_mode: bool) {
        self.share_mode = share_mode;
    }

    /// Marking a peer no-download forces and pins local disinterest.
    pub fn set_no_download(&mut self, no_download: bool) {
        self.no_download = no_download;
        if no_download && self.lifecycle.is_established() && self.choke.set_interesting(false) {
            self.send_message(&PeerMessage::NotInterested);
        }
    }

    pub fn set_ignore_stats(&mut self, ignore_stats: bool) {
        self.ignore_stats = ignore_stats;
    }

    // --- handshake phase ---

    /// Outbound TCP connect finished. Plaintext connections send their
    /// handshake right away; encrypted attempts wait for the key exchange
    /// outcome so the handshake goes out under the agreed transform.
    pub fn on_socket_connected(&mut self) {
        if !self.lifecycle.socket_connected() {
            return;
        }
        self.peer_log(LogDirection::Info, "socket_connected", String::new());
        if !self.negotiator.attempting_encrypted() {
            self.enqueue_handshake();
        }
    }

    /// The external key exchange produced a shared secret; install the RC4
    /// pair for both directions. This is a message boundary by construction:
    /// no protocol bytes have flowed under the previous transforms.
    pub fn on_crypto_agreed(&mut self, secret: &[u8]) {
        if self.lifecycle.is_disconnecting() {
            return;
        }
        if self.negotiator.crypto_agreed().is_err() {
            self.disconnect(ErrorKind::ProtocolViolation, Operation::Encryption, None);
            return;
        }
        let (send_key, recv_key) = derive_rc4_keys(secret, &self.torrent.info_hash(), self.direction);
        self.send_crypto.stage(Box::new(Rc4Crypto::new(&send_key)));
        self.recv_crypto.stage(Box::new(Rc4Crypto::new(&recv_key)));
        self.send_crypto.commit();
        self.recv_crypto.commit();
        self.peer_log(LogDirection::Info, "encrypted", "rc4".to_string());
        if self.direction == Direction::Outgoing {
            self.enqueue_handshake();
        }
    }

    /// One encrypted attempt failed; retry, fall back, or give up per the
    /// configured policy.
    pub fn on_crypto_rejected(&mut self) {
        if self.lifecycle.is_disconnecting() {
            return;
        }
        match self.negotiator.crypto_rejected() {
            CryptoFallback::RetryEncrypted => {
                self.peer_log(LogDirection::Info, "crypto_retry", String::new());
            }
            CryptoFallback::Plaintext => {
                self.peer_log(LogDirection::Info, "crypto_fallback", "plaintext".to_string());
                if self.direction == Direction::Outgoing {
                    self.enqueue_handshake();
                }
            }
            CryptoFallback::Fail => {
                self.disconnect(ErrorKind::HandshakeFailed, Operation::Encryption, None);
            }
        }
    }

    /// The peer's protocol identification arrived.
    pub fn on_handshake_received(&mut self, handshake: &PeerHandshake) {
        if self.lifecycle.is_disconnecting() {
            return;
        }
        if !self.negotiator.in_handshake() || self.lifecycle.is_connecting() {
            self.disconnect(ErrorKind::ProtocolViolation, Operation::Handshake, None);
            return;
        }
        if handshake.info_hash != self.torrent.info_hash() {
            self.peer_log(
                LogDirection::Incoming,
                "handshake",
                format!("info hash mismatch: {}", handshake.info_hash),
            );
            self.disconnect(ErrorKind::HandshakeFailed, Operation::Handshake, None);
            return;
        }
        if handshake.peer_id == self.local_id {
            // We connected to ourselves.
            self.disconnect(ErrorKind::DuplicateConnection, Operation::Handshake, None);
            return;
        }

        self.peer_id = Some(handshake.peer_id);
        self.peer_supports_extensions = handshake.supports_extension_protocol();
        self.last_receive = Instant::now();
        self.choke.record_activity();

        if self.direction == Direction::Incoming {
            self.enqueue_handshake();
        }
        self.negotiator.complete();
        self.lifecycle.handshake_complete();
        self.peer_log(
            LogDirection::Incoming,
            "handshake",
            format!(
                "peer {} extensions={}",
                handshake.peer_id,
                self.peer_supports_extensions
            ),
        );
    }

    fn enqueue_handshake(&mut self) {
        if self.handshake_sent {
            return;
        }
        self.handshake_sent = true;
        let handshake = PeerHandshake::new(self.torrent.info_hash(), self.local_id);
        let packet = HandshakeCodec::serialize_handshake(&handshake);
        self.enqueue_packet(packet, "handshake");
    }

    // --- crypto hot swap ---

    /// Stages a replacement send transform; it takes effect with the next
    /// whole message, never mid-message.
    pub fn switch_send_crypto(&mut self, transform: Box<dyn CryptoTransform>) {
        self.peer_log(LogDirection::Info, "switch_send_crypto", transform.name().to_string());
        self.send_crypto.stage(transform);
    }

    /// Stages a replacement receive transform; committed when the engine
    /// marks the next inbound message boundary.
    pub fn switch_recv_crypto(&mut self, transform: Box<dyn CryptoTransform>) {
        self.peer_log(LogDirection::Info, "switch_recv_crypto", transform.name().to_string());
        self.recv_crypto.stage(transform);
    }

    /// Runs raw inbound bytes through the active receive transform. Called
    /// by the external framing layer below message decoding.
    pub fn recv_transform(&mut self, data: &mut [u8]) {
        self.recv_crypto.apply(data);
    }

    /// The framing layer finished one inbound message; pending receive
    /// transforms may now commit.
    pub fn mark_recv_boundary(&mut self) {
        self.recv_crypto.commit();
    }

    // --- inbound messages ---

    /// Handles one decoded wire message. Messages before handshake
    /// completion are protocol violations, as is an extended message when
    /// extensions were never negotiated.
    pub fn handle_message(&mut self, message: &PeerMessage) {
        if self.lifecycle.is_disconnecting() {
            return;
        }
        if self.in_handshake() {
            self.disconnect(
                ErrorKind::ProtocolViolation,
                Operation::Bittorrent,
                None,
            );
            return;
        }

        self.last_receive = Instant::now();
        self.choke.record_activity();
        self.peer_log(LogDirection::Incoming, message.name(), String::new());

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => self.choke.on_peer_choke(),
            PeerMessage::Unchoke => self.choke.on_peer_unchoke(),
            PeerMessage::Interested => self.choke.on_peer_interested(),
            PeerMessage::NotInterested => self.choke.on_peer_not_interested(),
            PeerMessage::Have { piece_index } => self.on_have(*piece_index),
            PeerMessage::Bitfield { bitfield } => self.on_bitfield(bitfield),
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => {
                // Piece serving is the storage layer's concern; the
                // connection only tracks liveness here.
            }
            PeerMessage::Piece { data, .. } => {
                if !self.ignore_stats {
                    self.bytes_downloaded += data.len() as u64;
                }
            }
            PeerMessage::Port { port } => {
                self.received_listen_port = Some(*port);
            }
            PeerMessage::Suggest { piece_index } => {
                if self.torrent.has_metadata()
                    && piece_index.as_u32() >= self.torrent.piece_count()
                {
                    self.disconnect(
                        ErrorKind::ProtocolViolation,
                        Operation::Bittorrent,
                        None,
                    );
                }
            }
            PeerMessage::Extended { id, payload } => self.on_extended(*id, payload),
        }
    }

    fn on_have(&mut self, piece_index: PieceIndex) {
        if self.torrent.has_metadata() && piece_index.as_u32() >= self.torrent.piece_count() {
            self.disconnect(ErrorKind::ProtocolViolation, Operation::Bittorrent, None);
            return;
        }
        if self.pieces.is_none() {
            self.pieces = Some(PieceSet::new(self.torrent.piece_count()));
        }
        if let Some(ref mut pieces) = self.pieces {
            pieces.set_piece(piece_index);
        }
        self.update_seen_complete();
    }

    fn on_bitfield(&mut self, bitfield: &Bytes) {
        if self.pieces.is_some() {
            // A second bitfield is never legal.
            self.disconnect(ErrorKind::ProtocolViolation, Operation::Bittorrent, None);
            return;
        }
        let piece_count = if self.torrent.has_metadata() {
            self.torrent.piece_count()
        } else {
            // Metadata not resolved yet; take the bitfield at face value.
            bitfield.len() as u32 * 8
        };
        match PieceSet::from_bytes(bitfield, piece_count) {
            Ok(pieces) => {
                self.pieces = Some(pieces);
                self.update_seen_complete();
            }
            Err(_) => {
                self.disconnect(ErrorKind::ProtocolViolation, Operation::Bittorrent, None);
            }
        }
    }

    fn on_extended(&mut self, id: u8, payload: &[u8]) {
        if !self.support_extensions() {
            self.disconnect(ErrorKind::ProtocolViolation, Operation::Extension, None);
            return;
        }
        match self.extensions.dispatch(id, payload) {
            Ok(_consumed) => {}
            Err(_) => {
                self.disconnect(ErrorKind::ProtocolViolation, Operation::Extension, None);
            }
        }
    }

    fn update_seen_complete(&mut self) {
        if self.last_seen_complete.is_none() && self.is_seed() {
            self.last_seen_complete = Some(SystemTime::now());
        }
    }

    // --- extension registry ---

    /// Registers a capability plugin. Only legal once the handshake
    /// completed and the peer advertised extension support.
    ///
    /// # Errors
    /// - `PeerError::StillHandshaking` - Handshake phase still active
    /// - `PeerError::ExtensionsUnsupported` - Peer never advertised support
    /// - `PeerError::PluginCollision` - Tag already registered
    pub fn add_extension(&mut self, plugin: Box<dyn ExtensionPlugin>) -> Result<(), PeerError> {
        if self.in_handshake() {
            return Err(PeerError::StillHandshaking);
        }
        if !self.peer_supports_extensions {
            return Err(PeerError::ExtensionsUnsupported);
        }
        self.extensions.register(plugin)
    }

    /// Looks up a registered plugin by tag.
    pub fn find_plugin(&self, tag: &str) -> Option<&dyn ExtensionPlugin> {
        self.extensions.find(tag)
    }

    // --- choke/interest operations ---

    /// Sends a choke message unless the peer is already choked.
    /// Returns whether a message was actually sent.
    pub fn send_choke(&mut self) -> bool {
        if !self.lifecycle.is_established() || !self.choke.set_choked(true) {
            return false;
        }
        self.send_message(&PeerMessage::Choke);
        true
    }

    /// Sends an unchoke message unless the peer is already unchoked.
    /// Returns whether a message was actually sent.
    pub fn send_unchoke(&mut self) -> bool {
        if !self.lifecycle.is_established() || !self.choke.set_choked(false) {
            return false;
        }
        self.send_message(&PeerMessage::Unchoke);
        true
    }

    /// Declares interest in the peer's pieces. Redundant calls send nothing.
    pub fn send_interested(&mut self) {
        if !self.lifecycle.is_established() || self.no_download {
            return;
        }
        if self.choke.set_interesting(true) {
            self.send_message(&PeerMessage::Interested);
        }
    }

    /// Withdraws interest. Redundant calls send nothing.
    pub fn send_not_interested(&mut self) {
        if !self.lifecycle.is_established() {
            return;
        }
        if self.choke.set_interesting(false) {
            self.send_message(&PeerMessage::NotInterested);
        }
    }

    /// Policy hook: force a choke regardless of scheduler slots.
    pub fn choke_this_peer(&mut self) {
        self.send_choke();
    }

    /// Policy hook: unchoke only when local conditions permit bypassing the
    /// external scheduler's slot accounting. Not guaranteed to send.
    pub fn maybe_unchoke_this_peer(&mut self) -> bool {
        if self.ignore_unchoke_slots() {
            self.send_unchoke()
        } else {
            false
        }
    }

    /// Advisory suggest-piece message; no effect on the four control bits.
    pub fn send_suggest(&mut self, piece: PieceIndex) {
        if !self.lifecycle.is_established() {
            return;
        }
        if self.torrent.has_metadata() && piece.as_u32() >= self.torrent.piece_count() {
            return;
        }
        self.send_message(&PeerMessage::Suggest { piece_index: piece });
    }

    /// Protocol no-op resetting the peer's idle timer.
    pub fn keep_alive(&mut self) {
        if self.in_handshake() || !self.lifecycle.accepts_sends() {
            return;
        }
        if self.send_message(&PeerMessage::KeepAlive) {
            self.choke.record_activity();
        }
    }

    // --- send path ---

    /// Queues raw bytes as one unit through the active send transform.
    /// Used by extension plugins that build their own payloads.
    pub fn send_buffer(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        self.enqueue_packet(data.to_vec(), "send_buffer")
    }

    fn send_message(&mut self, message: &PeerMessage) -> bool {
        if let PeerMessage::Piece { data, .. } = message
            && !self.ignore_stats
        {
            self.bytes_uploaded += data.len() as u64;
        }
        let packet = MessageCodec::serialize_message(message);
        self.enqueue_packet(packet, message.name())
    }

    fn enqueue_packet(&mut self, mut packet: Vec<u8>, event: &'static str) -> bool {
        if !self.lifecycle.accepts_sends() {
            return false;
        }
        // The queue holds whole messages, so enqueue time is a message
        // boundary: commit any staged send transform before applying.
        self.send_crypto.commit();
        self.send_crypto.apply(&mut packet);
        self.outbound_bytes += packet.len();
        self.outbound.push_back(Bytes::from(packet));
        self.last_send = Instant::now();
        self.peer_log(LogDirection::Outgoing, event, String::new());
        true
    }

    /// Hands the next queued packet to the external transport. While
    /// disconnecting, draining the last packet completes the teardown.
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        let packet = self.outbound.pop_front();
        if let Some(ref bytes) = packet {
            self.outbound_bytes -= bytes.len();
        }
        if self.outbound.is_empty() && self.lifecycle.finish_disconnect() {
            self.peer_log(LogDirection::Info, "closed", String::new());
        }
        packet
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn outbound_bytes(&self) -> usize {
        self.outbound_bytes
    }

    // --- disconnect ---

    /// Single entry point for ending the connection. Idempotent; only the
    /// first reason is recorded and exactly one diagnostic event is emitted.
    pub fn disconnect(&mut self, error: ErrorKind, op: Operation, code: Option<u32>) {
        let reason = DisconnectReason { error, op, code };
        let drain = !self.outbound.is_empty();
        match self.lifecycle.request_disconnect(reason, drain) {
            DisconnectOutcome::Ignored => {}
            outcome => {
                self.peer_log(
                    LogDirection::Info,
                    "disconnect",
                    format!("{error} (op: {})", op.tag()),
                );
                if outcome == DisconnectOutcome::Closed {
                    // Nothing drains on an immediate close.
                    self.outbound.clear();
                    self.outbound_bytes = 0;
                }
            }
        }
    }

    // --- timers ---

    /// Timer tick from the external event loop: handshake and idle
    /// timeouts, keep-alive scheduling, and plugin maintenance.
    pub fn on_tick(&mut self, now: Instant) {
        if self.lifecycle.is_disconnecting() {
            return;
        }
        if self.in_handshake() {
            if now.duration_since(self.created_at) > self.config.connection.handshake_timeout {
                self.disconnect(ErrorKind::TimedOut, Operation::Handshake, None);
            }
            return;
        }
        if now.duration_since(self.last_receive) > self.config.connection.idle_timeout {
            self.disconnect(ErrorKind::TimedOut, Operation::Bittorrent, None);
            return;
        }
        if now.duration_since(self.last_send) >= self.config.connection.keep_alive_interval {
            self.keep_alive();
        }
        self.extensions.tick_all(now);
    }

    // --- diagnostics ---

    /// Emits a structured diagnostic event; best-effort, never throws.
    pub fn peer_log(&self, direction: LogDirection, event: &'static str, detail: String) {
        diagnostics::emit(self.sink.as_ref(), self.remote, direction, event, detail);
    }

    #[doc(hidden)]
    pub fn local_peer_id(&self) -> PeerId {
        self.local_id
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("state", &self.lifecycle.state())
            .field("peer_id", &self.peer_id.map(|id| id.to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryptoPolicy;
    use crate::peer::InfoHash;

    fn test_config() -> Arc<EbbtideConfig> {
        let mut config = EbbtideConfig::default();
        config.crypto.policy = CryptoPolicy::Disabled;
        Arc::new(config)
    }

    fn test_torrent() -> Arc<TorrentRef> {
        Arc::new(TorrentRef::new(InfoHash::new([1u8; 20]), 16))
    }

    fn addr(port: u16) -> SocketAddr {
        format!("10.1.1.1:{port}").parse().unwrap()
    }

    fn outgoing_connection() -> PeerConnection {
        PeerConnection::new(
            test_config(),
            None,
            test_torrent(),
            PeerId::new([0x11u8; 20]),
            Direction::Outgoing,
            addr(6881),
            addr(6900),
        )
    }

    fn remote_handshake() -> PeerHandshake {
        PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([0x99u8; 20]))
    }

    /// Drives an outgoing connection to Established.
    fn established_connection() -> PeerConnection {
        let mut conn = outgoing_connection();
        conn.on_socket_connected();
        conn.on_handshake_received(&remote_handshake());
        assert!(conn.state() == ConnectionState::Established);
        conn
    }

    #[test]
    fn test_outgoing_handshake_flow() {
        let mut conn = outgoing_connection();
        assert!(conn.is_connecting());
        assert!(conn.in_handshake());

        conn.on_socket_connected();
        assert_eq!(conn.state(), ConnectionState::Handshaking);
        // Plaintext policy: our handshake is queued immediately.
        assert_eq!(conn.outbound_len(), 1);

        conn.on_handshake_received(&remote_handshake());
        assert!(!conn.in_handshake());
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(conn.pid(), Some(PeerId::new([0x99u8; 20])));
        assert!(conn.support_extensions());
    }

    #[test]
    fn test_incoming_replies_to_handshake() {
        let mut conn = PeerConnection::new(
            test_config(),
            None,
            test_torrent(),
            PeerId::new([0x11u8; 20]),
            Direction::Incoming,
            addr(6881),
            addr(6900),
        );
        assert_eq!(conn.state(), ConnectionState::Handshaking);
        assert_eq!(conn.outbound_len(), 0);

        conn.on_handshake_received(&remote_handshake());
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(conn.outbound_len(), 1); // our reply
    }

    #[test]
    fn test_info_hash_mismatch_fails_handshake() {
        let mut conn = outgoing_connection();
        conn.on_socket_connected();
        let bad = PeerHandshake::new(InfoHash::new([9u8; 20]), PeerId::new([0x99u8; 20]));
        conn.on_handshake_received(&bad);
        assert!(conn.is_closed());
        assert!(conn.failed());
        assert_eq!(
            conn.disconnect_reason().map(|r| r.error),
            Some(ErrorKind::HandshakeFailed)
        );
    }

    #[test]
    fn test_self_connection_is_rejected() {
        let mut conn = outgoing_connection();
        conn.on_socket_connected();
        let own = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([0x11u8; 20]));
        conn.on_handshake_received(&own);
        assert_eq!(
            conn.disconnect_reason().map(|r| r.error),
            Some(ErrorKind::DuplicateConnection)
        );
    }

    #[test]
    fn test_choke_send_gating() {
        let mut conn = established_connection();
        let queued = conn.outbound_len();

        assert!(!conn.send_choke()); // already choked
        assert_eq!(conn.outbound_len(), queued);

        assert!(conn.send_unchoke());
        assert!(!conn.is_choked());
        assert_eq!(conn.outbound_len(), queued + 1);

        assert!(!conn.send_unchoke()); // redundant
        assert_eq!(conn.outbound_len(), queued + 1);
    }

    #[test]
    fn test_interest_is_deduplicated() {
        let mut conn = established_connection();
        let queued = conn.outbound_len();

        conn.send_interested();
        conn.send_interested();
        assert!(conn.is_interesting());
        assert_eq!(conn.outbound_len(), queued + 1);

        conn.send_not_interested();
        conn.send_not_interested();
        assert!(!conn.is_interesting());
        assert_eq!(conn.outbound_len(), queued + 2);
    }

    #[test]
    fn test_message_before_handshake_is_violation() {
        let mut conn = outgoing_connection();
        conn.on_socket_connected();
        conn.handle_message(&PeerMessage::Unchoke);
        assert!(conn.is_closed());
        assert_eq!(
            conn.disconnect_reason().map(|r| r.error),
            Some(ErrorKind::ProtocolViolation)
        );
    }

    #[test]
    fn test_disconnect_during_handshake_closes_and_blocks_sends() {
        let mut conn = outgoing_connection();
        conn.on_socket_connected();
        conn.disconnect(ErrorKind::TimedOut, Operation::Read, None);

        assert!(conn.is_closed());
        let reason = conn.disconnect_reason().unwrap();
        assert_eq!(reason.error, ErrorKind::TimedOut);
        assert_eq!(reason.op, Operation::Read);

        assert!(!conn.send_choke());
        assert_eq!(conn.outbound_len(), 0);
    }

    #[test]
    fn test_disconnect_first_reason_wins() {
        let mut conn = established_connection();
        while conn.take_outbound().is_some() {}

        conn.disconnect(ErrorKind::TimedOut, Operation::Read, None);
        conn.disconnect(ErrorKind::ProtocolViolation, Operation::Write, Some(3));
        let reason = conn.disconnect_reason().unwrap();
        assert_eq!(reason.error, ErrorKind::TimedOut);
        assert_eq!(reason.op, Operation::Read);
        assert_eq!(reason.code, None);
    }

    #[test]
    fn test_established_disconnect_drains_queue() {
        let mut conn = established_connection();
        conn.send_unchoke();
        assert!(conn.outbound_len() > 0);

        conn.disconnect(ErrorKind::Requested, Operation::Bittorrent, None);
        assert_eq!(conn.state(), ConnectionState::Disconnecting);

        // Sends after the disconnect are discarded.
        conn.send_suggest(PieceIndex::new(1));
        let before = conn.outbound_len();
        while conn.take_outbound().is_some() {}
        assert!(before > 0);
        assert!(conn.is_closed());
        assert!(!conn.failed()); // requested close is clean
    }

    #[test]
    fn test_can_disconnect_guards_handshake_flush() {
        let mut conn = outgoing_connection();
        conn.on_socket_connected();
        // Our handshake is still queued.
        assert!(!conn.can_disconnect(ErrorKind::Requested));
        assert!(conn.can_disconnect(ErrorKind::TimedOut));

        while conn.take_outbound().is_some() {}
        assert!(conn.can_disconnect(ErrorKind::Requested));
    }

    #[test]
    fn test_bitfield_and_seed_tracking() {
        let mut conn = established_connection();
        assert!(!conn.is_seed());

        conn.handle_message(&PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0xff, 0xff]),
        });
        assert!(conn.has_piece(PieceIndex::new(0)));
        assert!(conn.has_piece(PieceIndex::new(15)));
        assert!(conn.is_seed());
        assert!(conn.last_seen_complete().is_some());
    }

    #[test]
    fn test_double_bitfield_is_violation() {
        let mut conn = established_connection();
        let bitfield = Bytes::from_static(&[0x00, 0x00]);
        conn.handle_message(&PeerMessage::Bitfield {
            bitfield: bitfield.clone(),
        });
        conn.handle_message(&PeerMessage::Bitfield { bitfield });
        assert_eq!(
            conn.disconnect_reason().map(|r| r.error),
            Some(ErrorKind::ProtocolViolation)
        );
    }

    #[test]
    fn test_have_out_of_range_is_violation() {
        let mut conn = established_connection();
        conn.handle_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(99),
        });
        assert!(conn.failed());
    }

    #[test]
    fn test_port_message_records_listen_port() {
        let mut conn = established_connection();
        assert!(!conn.received_listen_port());
        conn.handle_message(&PeerMessage::Port { port: 6889 });
        assert!(conn.received_listen_port());
        assert_eq!(conn.listen_port(), Some(6889));
    }

    #[test]
    fn test_extended_without_negotiation_is_violation() {
        let mut conn = outgoing_connection();
        conn.on_socket_connected();
        let plain = PeerHandshake::with_reserved(
            InfoHash::new([1u8; 20]),
            PeerId::new([0x99u8; 20]),
            [0u8; 8],
        );
        conn.on_handshake_received(&plain);
        assert!(!conn.support_extensions());

        conn.handle_message(&PeerMessage::Extended {
            id: 1,
            payload: Bytes::new(),
        });
        assert_eq!(
            conn.disconnect_reason().map(|r| r.error),
            Some(ErrorKind::ProtocolViolation)
        );
    }

    #[test]
    fn test_add_extension_gated_on_handshake() {
        struct NullPlugin;
        impl ExtensionPlugin for NullPlugin {
            fn tag(&self) -> &'static str {
                "null"
            }
            fn on_extended_message(&mut self, _: u8, _: &[u8]) -> Result<bool, PeerError> {
                Ok(false)
            }
        }

        let mut conn = outgoing_connection();
        conn.on_socket_connected();
        assert!(matches!(
            conn.add_extension(Box::new(NullPlugin)),
            Err(PeerError::StillHandshaking)
        ));

        conn.on_handshake_received(&remote_handshake());
        conn.add_extension(Box::new(NullPlugin)).unwrap();
        assert!(conn.find_plugin("null").is_some());
        assert!(conn.find_plugin("missing").is_none());
    }

    #[test]
    fn test_keep_alive_waits_for_handshake() {
        let mut conn = outgoing_connection();
        conn.on_socket_connected();
        let queued = conn.outbound_len();
        conn.keep_alive();
        assert_eq!(conn.outbound_len(), queued);

        conn.on_handshake_received(&remote_handshake());
        let queued = conn.outbound_len();
        conn.keep_alive();
        assert_eq!(conn.outbound_len(), queued + 1);
    }

    #[test]
    fn test_peer_rank_prefers_canonical_direction() {
        // Our id 0x11.. is lower than the peer's 0x99.., so the canonical
        // initiator is us and the outgoing connection ranks higher.
        let out = established_connection();

        let mut incoming = PeerConnection::new(
            test_config(),
            None,
            test_torrent(),
            PeerId::new([0x11u8; 20]),
            Direction::Incoming,
            addr(6881),
            addr(6900),
        );
        incoming.on_handshake_received(&remote_handshake());

        assert!(out.peer_rank() > incoming.peer_rank());
    }

    #[test]
    fn test_peer_info_snapshot() {
        let mut conn = established_connection();
        conn.send_unchoke();
        conn.set_upload_only(true);

        let info = conn.peer_info();
        assert_eq!(info.remote, addr(6881));
        assert_eq!(info.state, ConnectionState::Established);
        assert!(!info.choked);
        assert!(info.upload_only);
        assert!(!info.failed);
        assert_eq!(info.kind, PeerKind::BitTorrent);

        // The snapshot survives the connection's teardown.
        conn.disconnect(ErrorKind::Io, Operation::Write, None);
        assert_eq!(info.state, ConnectionState::Established);
    }

    #[test]
    fn test_no_download_pins_disinterest() {
        let mut conn = established_connection();
        conn.send_interested();
        assert!(conn.is_interesting());

        conn.set_no_download(true);
        assert!(!conn.is_interesting());
        conn.send_interested();
        assert!(!conn.is_interesting());
    }

    #[test]
    fn test_handshake_timeout_tick() {
        let mut conn = outgoing_connection();
        conn.on_socket_connected();
        let late = Instant::now() + test_config().connection.handshake_timeout * 2;
        conn.on_tick(late);
        assert!(conn.is_closed());
        assert_eq!(
            conn.disconnect_reason().map(|r| r.error),
            Some(ErrorKind::TimedOut)
        );
    }

    #[test]
    fn test_ignore_stats_suppresses_counters() {
        let mut conn = established_connection();
        conn.set_ignore_stats(true);
        conn.handle_message(&PeerMessage::Piece {
            piece_index: PieceIndex::new(0),
            offset: 0,
            data: Bytes::from_static(&[0u8; 64]),
        });
        assert_eq!(conn.bytes_downloaded(), 0);
    }
}
