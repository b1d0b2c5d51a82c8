//! Non-owning handle onto a connection in the engine's set
//!
//! A handle is a weak reference to the owning `ConnectionSet` plus a
//! generation-checked `ConnectionId`. Every call resolves liveness from
//! scratch: queries degrade to `None`/`false` and commands become no-ops
//! once the target is gone. A handle never extends its target's lifetime.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use parking_lot::RwLock;

use super::connection::{PeerConnection, PeerInfo, PeerKind};
use super::crypto::CryptoTransform;
use super::diagnostics::LogDirection;
use super::extensions::ExtensionPlugin;
use super::state::{ConnectionState, DisconnectReason, ErrorKind, Operation};
use super::{PeerError, PeerId, PieceIndex, TorrentRef};
use crate::engine::{ConnectionId, ConnectionSet};

/// Weak, generation-checked reference to one peer connection.
#[derive(Clone)]
pub struct PeerHandle {
    set: Weak<RwLock<ConnectionSet>>,
    id: ConnectionId,
}

impl PeerHandle {
    pub(crate) fn new(set: Weak<RwLock<ConnectionSet>>, id: ConnectionId) -> Self {
        Self { set, id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Resolves the target for one read-only call.
    fn read<R>(&self, f: impl FnOnce(&PeerConnection) -> R) -> Option<R> {
        let set = self.set.upgrade()?;
        let guard = set.read();
        guard.get(self.id).map(f)
    }

    /// Resolves the target for one mutating call.
    fn write<R>(&self, f: impl FnOnce(&mut PeerConnection) -> R) -> Option<R> {
        let set = self.set.upgrade()?;
        let mut guard = set.write();
        guard.get_mut(self.id).map(f)
    }

    /// Resolves the weak reference into a strong borrow for the duration of
    /// a single closure call; `None` when the connection is gone.
    pub fn with_native<R>(&self, f: impl FnOnce(&mut PeerConnection) -> R) -> Option<R> {
        self.write(f)
    }

    /// Whether the target still exists.
    pub fn is_alive(&self) -> bool {
        self.read(|_| ()).is_some()
    }

    // --- queries; all fail safely on a gone target ---

    pub fn kind(&self) -> Option<PeerKind> {
        self.read(|conn| conn.kind())
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.read(|conn| conn.state())
    }

    pub fn is_seed(&self) -> bool {
        self.read(|conn| conn.is_seed()).unwrap_or(false)
    }

    pub fn share_mode(&self) -> bool {
        self.read(|conn| conn.share_mode()).unwrap_or(false)
    }

    pub fn upload_only(&self) -> bool {
        self.read(|conn| conn.upload_only()).unwrap_or(false)
    }

    pub fn no_download(&self) -> bool {
        self.read(|conn| conn.no_download()).unwrap_or(false)
    }

    pub fn ignore_stats(&self) -> bool {
        self.read(|conn| conn.ignore_stats()).unwrap_or(false)
    }

    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        self.read(|conn| conn.has_piece(piece_index)).unwrap_or(false)
    }

    pub fn is_interesting(&self) -> bool {
        self.read(|conn| conn.is_interesting()).unwrap_or(false)
    }

    pub fn is_choked(&self) -> bool {
        self.read(|conn| conn.is_choked()).unwrap_or(false)
    }

    pub fn is_peer_interested(&self) -> bool {
        self.read(|conn| conn.is_peer_interested()).unwrap_or(false)
    }

    pub fn has_peer_choked(&self) -> bool {
        self.read(|conn| conn.has_peer_choked()).unwrap_or(false)
    }

    pub fn received_listen_port(&self) -> bool {
        self.read(|conn| conn.received_listen_port())
            .unwrap_or(false)
    }

    pub fn on_local_network(&self) -> bool {
        self.read(|conn| conn.on_local_network()).unwrap_or(false)
    }

    pub fn ignore_unchoke_slots(&self) -> bool {
        self.read(|conn| conn.ignore_unchoke_slots())
            .unwrap_or(false)
    }

    pub fn has_metadata(&self) -> bool {
        self.read(|conn| conn.has_metadata()).unwrap_or(false)
    }

    pub fn failed(&self) -> bool {
        self.read(|conn| conn.failed()).unwrap_or(false)
    }

    pub fn is_disconnecting(&self) -> bool {
        self.read(|conn| conn.is_disconnecting()).unwrap_or(false)
    }

    pub fn is_connecting(&self) -> bool {
        self.read(|conn| conn.is_connecting()).unwrap_or(false)
    }

    pub fn is_outgoing(&self) -> bool {
        self.read(|conn| conn.is_outgoing()).unwrap_or(false)
    }

    pub fn in_handshake(&self) -> bool {
        self.read(|conn| conn.in_handshake()).unwrap_or(false)
    }

    pub fn supports_encryption(&self) -> bool {
        self.read(|conn| conn.supports_encryption())
            .unwrap_or(false)
    }

    pub fn support_extensions(&self) -> bool {
        self.read(|conn| conn.support_extensions())
            .unwrap_or(false)
    }

    pub fn can_write(&self) -> bool {
        self.read(|conn| conn.can_write()).unwrap_or(false)
    }

    pub fn can_disconnect(&self, error: ErrorKind) -> bool {
        self.read(|conn| conn.can_disconnect(error))
            .unwrap_or(false)
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.read(|conn| conn.remote())
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.read(|conn| conn.local_endpoint())
    }

    pub fn pid(&self) -> Option<PeerId> {
        self.read(|conn| conn.pid()).flatten()
    }

    pub fn last_seen_complete(&self) -> Option<SystemTime> {
        self.read(|conn| conn.last_seen_complete()).flatten()
    }

    pub fn time_of_last_unchoke(&self) -> Option<Instant> {
        self.read(|conn| conn.time_of_last_unchoke()).flatten()
    }

    pub fn peer_rank(&self) -> Option<u32> {
        self.read(|conn| conn.peer_rank())
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.read(|conn| conn.disconnect_reason()).flatten()
    }

    pub fn associated_torrent(&self) -> Option<Arc<TorrentRef>> {
        self.read(|conn| conn.associated_torrent())
    }

    /// Fills an external snapshot structure; false when the target is gone
    /// and `out` was left untouched.
    pub fn get_peer_info(&self, out: &mut PeerInfo) -> bool {
        self.read(|conn| conn.fill_peer_info(out)).is_some()
    }

    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.read(|conn| conn.peer_info())
    }

    // --- commands; no-ops on a gone target ---

    pub fn set_upload_only(&self, upload_only: bool) {
        self.write(|conn| conn.set_upload_only(upload_only));
    }

    pub fn set_share_mode(&self, share_mode: bool) {
        self.write(|conn| conn.set_share_mode(share_mode));
    }

    pub fn set_no_download(&self, no_download: bool) {
        self.write(|conn| conn.set_no_download(no_download));
    }

    pub fn set_ignore_stats(&self, ignore_stats: bool) {
        self.write(|conn| conn.set_ignore_stats(ignore_stats));
    }

    pub fn keep_alive(&self) {
        self.write(|conn| conn.keep_alive());
    }

    pub fn choke_this_peer(&self) {
        self.write(|conn| conn.choke_this_peer());
    }

    pub fn maybe_unchoke_this_peer(&self) -> bool {
        self.write(|conn| conn.maybe_unchoke_this_peer())
            .unwrap_or(false)
    }

    /// Returns whether a choke message was actually sent.
    pub fn send_choke(&self) -> bool {
        self.write(|conn| conn.send_choke()).unwrap_or(false)
    }

    /// Returns whether an unchoke message was actually sent.
    pub fn send_unchoke(&self) -> bool {
        self.write(|conn| conn.send_unchoke()).unwrap_or(false)
    }

    pub fn send_interested(&self) {
        self.write(|conn| conn.send_interested());
    }

    pub fn send_not_interested(&self) {
        self.write(|conn| conn.send_not_interested());
    }

    pub fn send_suggest(&self, piece: PieceIndex) {
        self.write(|conn| conn.send_suggest(piece));
    }

    pub fn send_buffer(&self, data: &[u8]) -> bool {
        self.write(|conn| conn.send_buffer(data)).unwrap_or(false)
    }

    pub fn switch_send_crypto(&self, transform: Box<dyn CryptoTransform>) {
        self.write(|conn| conn.switch_send_crypto(transform));
    }

    pub fn switch_recv_crypto(&self, transform: Box<dyn CryptoTransform>) {
        self.write(|conn| conn.switch_recv_crypto(transform));
    }

    pub fn disconnect(&self, error: ErrorKind, op: Operation, code: Option<u32>) {
        self.write(|conn| conn.disconnect(error, op, code));
    }

    /// Runs the redundant-connection resolver against every other live
    /// connection to the same peer and torrent. Returns whether *this*
    /// connection was the lower-ranked one and got closed.
    pub fn disconnect_if_redundant(&self) -> bool {
        let Some(set) = self.set.upgrade() else {
            return false;
        };
        let mut guard = set.write();
        guard.disconnect_if_redundant(self.id)
    }

    /// Registers an extension plugin on the live connection.
    ///
    /// # Errors
    /// - `PeerError::ConnectionGone` - Target no longer exists
    /// - `PeerError::StillHandshaking` / `PeerError::ExtensionsUnsupported` /
    ///   `PeerError::PluginCollision` - Forwarded from the connection
    pub fn add_extension(&self, plugin: Box<dyn ExtensionPlugin>) -> Result<(), PeerError> {
        self.write(|conn| conn.add_extension(plugin))
            .unwrap_or(Err(PeerError::ConnectionGone))
    }

    /// Looks up a plugin by tag and applies `f` to it while the connection
    /// is resolved. `None` when the connection or the plugin is missing.
    pub fn find_plugin<R>(&self, tag: &str, f: impl FnOnce(&dyn ExtensionPlugin) -> R) -> Option<R> {
        self.read(|conn| conn.find_plugin(tag).map(f)).flatten()
    }

    /// Emits a diagnostic event through the connection's sink.
    pub fn peer_log(&self, direction: LogDirection, event: &'static str, detail: String) {
        self.read(|conn| conn.peer_log(direction, event, detail));
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id.to_string())
            .field("alive", &self.is_alive())
            .finish()
    }
}
