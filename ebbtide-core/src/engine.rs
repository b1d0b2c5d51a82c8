//! Engine-wide connection ownership and event delivery
//!
//! The `ConnectionSet` is a generation-checked arena owning every
//! `PeerConnection`; handles resolve into it and fail safely once a slot
//! has been reaped. The set also keeps the `(peer id, torrent)` identity
//! index the redundant-connection resolver consults. `PeerEngine` is the
//! upstream surface the external event loop drives: construct and destroy
//! connections, deliver decoded wire messages, socket errors, and timer
//! ticks.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::warn;

use crate::config::EbbtideConfig;
use crate::peer::connection::PeerConnection;
use crate::peer::diagnostics::DiagnosticsSink;
use crate::peer::handle::PeerHandle;
use crate::peer::handshake::PeerHandshake;
use crate::peer::message::PeerMessage;
use crate::peer::state::{Direction, ErrorKind, Operation};
use crate::peer::{InfoHash, PeerError, PeerId, TorrentRef};

/// Generation-checked identifier of a connection slot.
///
/// The generation makes identifiers single-use: once a slot is reaped and
/// reused, stale ids no longer resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}v{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    conn: Option<PeerConnection>,
}

/// Arena of live connections plus the duplicate-detection registry.
pub struct ConnectionSet {
    config: Arc<EbbtideConfig>,
    sink: Option<Arc<dyn DiagnosticsSink>>,
    local_id: PeerId,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    next_sequence: u64,
    torrents: HashMap<InfoHash, Arc<TorrentRef>>,
    identities: HashMap<(PeerId, InfoHash), Vec<ConnectionId>>,
}

impl ConnectionSet {
    fn new(
        config: Arc<EbbtideConfig>,
        sink: Option<Arc<dyn DiagnosticsSink>>,
        local_id: PeerId,
    ) -> Self {
        Self {
            config,
            sink,
            local_id,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            next_sequence: 0,
            torrents: HashMap::new(),
            identities: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<&PeerConnection> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.conn.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut PeerConnection> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.conn.as_mut()
    }

    fn insert(&mut self, mut conn: PeerConnection) -> Result<ConnectionId, PeerError> {
        if self.live >= self.config.connection.max_connections {
            warn!(
                limit = self.config.connection.max_connections,
                "connection limit reached"
            );
            return Err(PeerError::ConnectionLimitExceeded);
        }
        conn.set_sequence(self.next_sequence);
        self.next_sequence += 1;

        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.conn = Some(conn);
                ConnectionId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    conn: Some(conn),
                });
                ConnectionId {
                    index,
                    generation: 0,
                }
            }
        };
        self.live += 1;
        Ok(id)
    }

    fn torrent(&self, info_hash: InfoHash) -> Option<Arc<TorrentRef>> {
        self.torrents.get(&info_hash).cloned()
    }

    /// Records a handshake-completed connection in the identity index.
    fn register_identity(&mut self, id: ConnectionId) {
        let Some(conn) = self.get(id) else { return };
        let Some(pid) = conn.pid() else { return };
        let key = (pid, conn.associated_torrent().info_hash());
        let entry = self.identities.entry(key).or_default();
        if !entry.contains(&id) {
            entry.push(id);
        }
    }

    /// Compares this connection against every other live connection to the
    /// same peer and torrent; the lower-ranked side of each pair closes
    /// with reason `Redundant`. Returns whether this connection closed.
    ///
    /// Rank comparison is a total order: higher `peer_rank` wins, equal
    /// ranks fall to the older connection (smaller insertion sequence).
    pub(crate) fn disconnect_if_redundant(&mut self, id: ConnectionId) -> bool {
        let Some((pid, info_hash, my_rank, my_sequence)) = self.get(id).and_then(|conn| {
            if conn.is_closed() {
                return None;
            }
            let pid = conn.pid()?;
            Some((
                pid,
                conn.associated_torrent().info_hash(),
                conn.peer_rank(),
                conn.sequence(),
            ))
        }) else {
            return false;
        };

        let candidates = self
            .identities
            .get(&(pid, info_hash))
            .cloned()
            .unwrap_or_default();

        for other_id in candidates {
            if other_id == id {
                continue;
            }
            let Some((other_rank, other_sequence)) = self.get(other_id).and_then(|other| {
                if other.is_closed() {
                    None
                } else {
                    Some((other.peer_rank(), other.sequence()))
                }
            }) else {
                continue;
            };

            let keep_self = my_rank > other_rank
                || (my_rank == other_rank && my_sequence < other_sequence);
            if keep_self {
                if let Some(other) = self.get_mut(other_id) {
                    other.disconnect(ErrorKind::Redundant, Operation::Bittorrent, None);
                }
            } else {
                if let Some(conn) = self.get_mut(id) {
                    conn.disconnect(ErrorKind::Redundant, Operation::Bittorrent, None);
                }
                return true;
            }
        }
        false
    }

    /// Reaps `Closed` connections: frees their slots, bumps generations so
    /// stale handles miss, and prunes the identity index.
    fn remove_closed(&mut self) -> usize {
        let mut removed = 0;
        for index in 0..self.slots.len() {
            let reap = match self.slots[index].conn {
                Some(ref conn) => conn.is_closed(),
                None => false,
            };
            if !reap {
                continue;
            }
            let slot = &mut self.slots[index];
            let Some(conn) = slot.conn.take() else { continue };
            let id = ConnectionId {
                index: index as u32,
                generation: slot.generation,
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
            self.live -= 1;
            removed += 1;

            if let Some(pid) = conn.pid() {
                let key = (pid, conn.associated_torrent().info_hash());
                if let Some(ids) = self.identities.get_mut(&key) {
                    ids.retain(|entry| *entry != id);
                    if ids.is_empty() {
                        self.identities.remove(&key);
                    }
                }
            }
        }
        removed
    }

    fn len(&self) -> usize {
        self.live
    }

    fn for_each_mut(&mut self, mut f: impl FnMut(&mut PeerConnection)) {
        for slot in &mut self.slots {
            if let Some(ref mut conn) = slot.conn {
                f(conn);
            }
        }
    }
}

/// The connection engine: owns the set and exposes the upstream event
/// surface the external event loop drives.
pub struct PeerEngine {
    shared: Arc<RwLock<ConnectionSet>>,
    local_id: PeerId,
}

impl PeerEngine {
    /// Creates an engine with a freshly generated local peer id and the
    /// given diagnostics sink (`None` drops all events).
    pub fn new(config: EbbtideConfig, sink: Option<Arc<dyn DiagnosticsSink>>) -> Self {
        let local_id = PeerId::generate(config.connection.client_id);
        let set = ConnectionSet::new(Arc::new(config), sink, local_id);
        Self {
            shared: Arc::new(RwLock::new(set)),
            local_id,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_id
    }

    /// Registers torrent-level session state connections will share.
    /// `piece_count` of zero means metadata is not yet known.
    pub fn register_torrent(&self, info_hash: InfoHash, piece_count: u32) -> Arc<TorrentRef> {
        let torrent = Arc::new(TorrentRef::new(info_hash, piece_count));
        self.shared
            .write()
            .torrents
            .insert(info_hash, Arc::clone(&torrent));
        torrent
    }

    /// Drops a torrent and disconnects every connection associated with it.
    pub fn remove_torrent(&self, info_hash: InfoHash) {
        let mut set = self.shared.write();
        set.torrents.remove(&info_hash);
        set.for_each_mut(|conn| {
            if conn.associated_torrent().info_hash() == info_hash {
                conn.disconnect(ErrorKind::TorrentRemoved, Operation::Bittorrent, None);
            }
        });
    }

    /// Creates an outgoing connection in the `Connecting` state.
    ///
    /// # Errors
    /// - `PeerError::UnknownTorrent` - Torrent was never registered
    /// - `PeerError::ConnectionLimitExceeded` - Set is full
    pub fn connect(
        &self,
        info_hash: InfoHash,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Result<PeerHandle, PeerError> {
        self.create(info_hash, Direction::Outgoing, remote, local)
    }

    /// Adopts an accepted inbound connection, starting at `Handshaking`.
    ///
    /// # Errors
    /// - `PeerError::UnknownTorrent` - Torrent was never registered
    /// - `PeerError::ConnectionLimitExceeded` - Set is full
    pub fn accept(
        &self,
        info_hash: InfoHash,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Result<PeerHandle, PeerError> {
        self.create(info_hash, Direction::Incoming, remote, local)
    }

    fn create(
        &self,
        info_hash: InfoHash,
        direction: Direction,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Result<PeerHandle, PeerError> {
        let mut set = self.shared.write();
        let torrent = set
            .torrent(info_hash)
            .ok_or(PeerError::UnknownTorrent { info_hash })?;
        let conn = PeerConnection::new(
            Arc::clone(&set.config),
            set.sink.clone(),
            torrent,
            set.local_id,
            direction,
            remote,
            local,
        );
        let id = set.insert(conn)?;
        Ok(PeerHandle::new(Arc::downgrade(&self.shared), id))
    }

    /// Produces a (possibly stale) handle for an existing id.
    pub fn handle(&self, id: ConnectionId) -> PeerHandle {
        PeerHandle::new(Arc::downgrade(&self.shared), id)
    }

    /// Outbound TCP connect for `id` completed.
    pub fn socket_connected(&self, id: ConnectionId) {
        if let Some(conn) = self.shared.write().get_mut(id) {
            conn.on_socket_connected();
        }
    }

    /// A decoded handshake arrived; completes the phase, registers the peer
    /// identity, and resolves duplicate connections before the new one may
    /// rest in `Established`.
    pub fn handshake_received(&self, id: ConnectionId, handshake: &PeerHandshake) {
        let mut set = self.shared.write();
        let Some(conn) = set.get_mut(id) else { return };
        conn.on_handshake_received(handshake);
        if conn.pid().is_some() && !conn.is_closed() {
            set.register_identity(id);
            set.disconnect_if_redundant(id);
        }
    }

    /// The external key exchange for `id` agreed on a shared secret.
    pub fn crypto_agreed(&self, id: ConnectionId, secret: &[u8]) {
        if let Some(conn) = self.shared.write().get_mut(id) {
            conn.on_crypto_agreed(secret);
        }
    }

    /// The external key exchange for `id` was rejected by the peer.
    pub fn crypto_rejected(&self, id: ConnectionId) {
        if let Some(conn) = self.shared.write().get_mut(id) {
            conn.on_crypto_rejected();
        }
    }

    /// Delivers one decoded wire message. The end of a delivered message is
    /// an inbound boundary, so a staged receive transform commits here.
    pub fn deliver_message(&self, id: ConnectionId, message: &PeerMessage) {
        if let Some(conn) = self.shared.write().get_mut(id) {
            conn.handle_message(message);
            conn.mark_recv_boundary();
        }
    }

    /// Runs raw inbound bytes through the connection's receive transform,
    /// for the framing layer sitting between socket and `deliver_message`.
    pub fn recv_transform(&self, id: ConnectionId, data: &mut [u8]) {
        if let Some(conn) = self.shared.write().get_mut(id) {
            conn.recv_transform(data);
        }
    }

    /// Socket-level failure notification with its operation tag.
    pub fn socket_error(&self, id: ConnectionId, op: Operation, kind: ErrorKind) {
        if let Some(conn) = self.shared.write().get_mut(id) {
            conn.disconnect(kind, op, None);
        }
    }

    /// Timer tick fanned out to every connection.
    pub fn on_tick(&self, now: Instant) {
        self.shared.write().for_each_mut(|conn| conn.on_tick(now));
    }

    /// Takes the next outbound packet for the transport to write.
    pub fn take_outbound(&self, id: ConnectionId) -> Option<Bytes> {
        self.shared.write().get_mut(id)?.take_outbound()
    }

    /// Reaps closed connections; their handles fail safely afterwards.
    pub fn remove_closed(&self) -> usize {
        self.shared.write().remove_closed()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.read().len()
    }
}

impl fmt::Debug for PeerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEngine")
            .field("local_id", &self.local_id.to_string())
            .field("connections", &self.shared.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryptoPolicy;
    use crate::peer::state::ConnectionState;

    fn test_engine() -> PeerEngine {
        let mut config = EbbtideConfig::default();
        config.crypto.policy = CryptoPolicy::Disabled;
        PeerEngine::new(config, None)
    }

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.1.5:{port}").parse().unwrap()
    }

    fn info_hash() -> InfoHash {
        InfoHash::new([3u8; 20])
    }

    fn handshake_from(peer_id: PeerId) -> PeerHandshake {
        PeerHandshake::new(info_hash(), peer_id)
    }

    #[test]
    fn test_connect_requires_registered_torrent() {
        let engine = test_engine();
        let result = engine.connect(info_hash(), addr(6881), addr(7000));
        assert!(matches!(result, Err(PeerError::UnknownTorrent { .. })));

        engine.register_torrent(info_hash(), 8);
        let handle = engine.connect(info_hash(), addr(6881), addr(7000)).unwrap();
        assert!(handle.is_connecting());
        assert_eq!(engine.connection_count(), 1);
    }

    #[test]
    fn test_connection_limit() {
        let mut config = EbbtideConfig::default();
        config.connection.max_connections = 1;
        config.crypto.policy = CryptoPolicy::Disabled;
        let engine = PeerEngine::new(config, None);
        engine.register_torrent(info_hash(), 8);

        engine.connect(info_hash(), addr(6881), addr(7000)).unwrap();
        let second = engine.connect(info_hash(), addr(6882), addr(7000));
        assert!(matches!(second, Err(PeerError::ConnectionLimitExceeded)));
    }

    #[test]
    fn test_redundant_pair_keeps_higher_rank() {
        let engine = test_engine();
        engine.register_torrent(info_hash(), 8);
        let remote_pid = PeerId::new([0xffu8; 20]); // higher than any generated id

        // Outgoing connection: we initiated, and our id is lower, so this
        // direction is canonical and ranks higher.
        let outgoing = engine.connect(info_hash(), addr(6881), addr(7000)).unwrap();
        let outgoing_id = outgoing.id();
        engine.socket_connected(outgoing_id);
        engine.handshake_received(outgoing_id, &handshake_from(remote_pid));
        assert_eq!(outgoing.state(), Some(ConnectionState::Established));

        // The same peer dials us back: redundant, and the loser.
        let incoming = engine.accept(info_hash(), addr(6999), addr(7000)).unwrap();
        let incoming_id = incoming.id();
        engine.handshake_received(incoming_id, &handshake_from(remote_pid));

        assert_eq!(outgoing.state(), Some(ConnectionState::Established));
        assert!(incoming.failed());
        assert_eq!(
            incoming.disconnect_reason().map(|r| r.error),
            Some(ErrorKind::Redundant)
        );
    }

    #[test]
    fn test_redundancy_is_symmetric() {
        let engine = test_engine();
        engine.register_torrent(info_hash(), 8);
        let remote_pid = PeerId::new([0xffu8; 20]);

        // Reversed arrival order: the incoming (losing) connection
        // completes its handshake first.
        let incoming = engine.accept(info_hash(), addr(6999), addr(7000)).unwrap();
        engine.handshake_received(incoming.id(), &handshake_from(remote_pid));
        assert_eq!(incoming.state(), Some(ConnectionState::Established));

        let outgoing = engine.connect(info_hash(), addr(6881), addr(7000)).unwrap();
        engine.socket_connected(outgoing.id());
        engine.handshake_received(outgoing.id(), &handshake_from(remote_pid));

        // Exactly one survivor, and it is the canonical-direction one.
        assert_eq!(outgoing.state(), Some(ConnectionState::Established));
        assert!(incoming.failed());
    }

    #[test]
    fn test_equal_ranks_keep_older_connection() {
        let engine = test_engine();
        engine.register_torrent(info_hash(), 8);
        let remote_pid = PeerId::new([0xffu8; 20]);

        // Two outgoing connections to the same peer: identical ranks, the
        // earlier one survives.
        let first = engine.connect(info_hash(), addr(6881), addr(7000)).unwrap();
        engine.socket_connected(first.id());
        engine.handshake_received(first.id(), &handshake_from(remote_pid));

        let second = engine.connect(info_hash(), addr(6881), addr(7001)).unwrap();
        engine.socket_connected(second.id());
        engine.handshake_received(second.id(), &handshake_from(remote_pid));

        assert_eq!(first.state(), Some(ConnectionState::Established));
        assert!(second.failed());
    }

    #[test]
    fn test_remove_closed_invalidates_handles() {
        let engine = test_engine();
        engine.register_torrent(info_hash(), 8);

        let doomed = engine.connect(info_hash(), addr(6881), addr(7000)).unwrap();
        let survivor = engine.connect(info_hash(), addr(6882), addr(7000)).unwrap();

        doomed.disconnect(ErrorKind::Requested, Operation::Bittorrent, None);
        assert_eq!(engine.remove_closed(), 1);

        assert!(doomed.state().is_none());
        assert!(survivor.state().is_some());
        assert_eq!(engine.connection_count(), 1);
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let engine = test_engine();
        engine.register_torrent(info_hash(), 8);

        let first = engine.connect(info_hash(), addr(6881), addr(7000)).unwrap();
        let stale_id = first.id();
        first.disconnect(ErrorKind::Requested, Operation::Bittorrent, None);
        engine.remove_closed();

        // The freed slot is reused with a new generation.
        let second = engine.connect(info_hash(), addr(6882), addr(7000)).unwrap();
        assert_ne!(second.id(), stale_id);
        assert!(engine.handle(stale_id).state().is_none());
        assert!(second.state().is_some());
    }

    #[test]
    fn test_remove_torrent_disconnects_its_connections() {
        let engine = test_engine();
        engine.register_torrent(info_hash(), 8);
        let other_hash = InfoHash::new([4u8; 20]);
        engine.register_torrent(other_hash, 8);

        let doomed = engine.connect(info_hash(), addr(6881), addr(7000)).unwrap();
        let unrelated = engine.connect(other_hash, addr(6882), addr(7000)).unwrap();

        engine.remove_torrent(info_hash());
        assert_eq!(
            doomed.disconnect_reason().map(|r| r.error),
            Some(ErrorKind::TorrentRemoved)
        );
        assert!(unrelated.disconnect_reason().is_none());
    }

    #[test]
    fn test_tick_fans_out() {
        let engine = test_engine();
        engine.register_torrent(info_hash(), 8);
        let conn = engine.connect(info_hash(), addr(6881), addr(7000)).unwrap();
        engine.socket_connected(conn.id());

        let config = EbbtideConfig::default();
        engine.on_tick(Instant::now() + config.connection.handshake_timeout * 2);
        assert_eq!(
            conn.disconnect_reason().map(|r| r.error),
            Some(ErrorKind::TimedOut)
        );
    }
}
