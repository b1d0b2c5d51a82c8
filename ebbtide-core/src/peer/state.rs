//! Connection lifecycle state machine and disconnect classification

use serde::Serialize;

/// Whether we or the remote side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Lifecycle state of a peer connection.
///
/// Outgoing connections start at `Connecting`; incoming connections are
/// already established at the transport level and start at `Handshaking`.
/// `Closed` is terminal and carries its reason in the owning `Lifecycle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Outbound TCP connect in flight
    Connecting,
    /// Exchanging protocol identification and negotiating encryption
    Handshaking,
    /// Steady state: choke/interest, extensions, and data transfer
    Established,
    /// Teardown requested; queued outbound bytes drain best-effort
    Disconnecting,
    /// Terminal; the connection is eligible for removal
    Closed,
}

/// Logical step that failed, attached to every abnormal disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    Connect,
    Handshake,
    Encryption,
    Read,
    Write,
    Bittorrent,
    Extension,
    Unknown,
}

impl Operation {
    /// Short tag for diagnostic events.
    pub fn tag(&self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Handshake => "handshake",
            Operation::Encryption => "encryption",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Bittorrent => "bittorrent",
            Operation::Extension => "extension",
            Operation::Unknown => "unknown",
        }
    }
}

/// Classification of why a connection ended.
///
/// `Requested` is the one clean close; everything else makes `failed()`
/// report true on the closed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum ErrorKind {
    #[error("close requested")]
    Requested,

    #[error("handshake failed")]
    HandshakeFailed,

    #[error("encryption negotiation failed")]
    EncryptionFailed,

    #[error("peer violated the protocol")]
    ProtocolViolation,

    #[error("connection timed out")]
    TimedOut,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("transport i/o failure")]
    Io,

    #[error("redundant connection to the same peer")]
    Redundant,

    #[error("duplicate peer id")]
    DuplicateConnection,

    #[error("associated torrent was removed")]
    TorrentRemoved,
}

impl ErrorKind {
    /// Whether this classification counts as an abnormal termination.
    pub fn is_failure(&self) -> bool {
        !matches!(self, ErrorKind::Requested)
    }
}

/// What failed and why, recorded once per connection, first writer wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisconnectReason {
    pub error: ErrorKind,
    pub op: Operation,
    /// Optional protocol-specific detail code
    pub code: Option<u32>,
}

impl DisconnectReason {
    pub fn new(error: ErrorKind, op: Operation) -> Self {
        Self {
            error,
            op,
            code: None,
        }
    }

    pub fn with_code(error: ErrorKind, op: Operation, code: u32) -> Self {
        Self {
            error,
            op,
            code: Some(code),
        }
    }
}

/// Outcome of a disconnect request against the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Transitioned straight to `Closed`; outbound bytes are discarded
    Closed,
    /// Entered `Disconnecting`; previously queued bytes drain first
    Draining,
    /// Already disconnecting or closed; the request was ignored
    Ignored,
}

/// Lifecycle state machine for a single connection.
///
/// `Connecting → Handshaking → Established → Disconnecting → Closed`.
/// Any disconnect before `Established` short-circuits to `Closed` since
/// there is nothing worth draining for a connection that never finished
/// its handshake.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    reason: Option<DisconnectReason>,
}

impl Lifecycle {
    pub fn outgoing() -> Self {
        Self {
            state: ConnectionState::Connecting,
            reason: None,
        }
    }

    pub fn incoming() -> Self {
        Self {
            state: ConnectionState::Handshaking,
            reason: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reason(&self) -> Option<DisconnectReason> {
        self.reason
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// True from the first disconnect request onward.
    pub fn is_disconnecting(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Disconnecting | ConnectionState::Closed
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Whether the connection ended abnormally.
    pub fn failed(&self) -> bool {
        self.is_closed() && self.reason.is_some_and(|r| r.error.is_failure())
    }

    /// Whether new outbound messages may still be queued.
    pub fn accepts_sends(&self) -> bool {
        !self.is_disconnecting()
    }

    /// Outbound TCP connect finished; the handshake phase begins.
    pub fn socket_connected(&mut self) -> bool {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Handshaking;
            true
        } else {
            false
        }
    }

    /// Protocol identification (and any encryption negotiation) succeeded.
    pub fn handshake_complete(&mut self) -> bool {
        if self.state == ConnectionState::Handshaking {
            self.state = ConnectionState::Established;
            true
        } else {
            false
        }
    }

    /// Requests teardown. Idempotent: only the first reason is recorded.
    ///
    /// `drain` reports whether the caller still has queued outbound bytes;
    /// an established connection with bytes to flush enters `Disconnecting`,
    /// everything else closes immediately.
    pub fn request_disconnect(&mut self, reason: DisconnectReason, drain: bool) -> DisconnectOutcome {
        if self.is_disconnecting() {
            return DisconnectOutcome::Ignored;
        }
        self.reason = Some(reason);
        if self.state == ConnectionState::Established && drain {
            self.state = ConnectionState::Disconnecting;
            DisconnectOutcome::Draining
        } else {
            self.state = ConnectionState::Closed;
            DisconnectOutcome::Closed
        }
    }

    /// Outbound queue drained while `Disconnecting`; reach the terminal state.
    pub fn finish_disconnect(&mut self) -> bool {
        if self.state == ConnectionState::Disconnecting {
            self.state = ConnectionState::Closed;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_lifecycle_progression() {
        let mut lifecycle = Lifecycle::outgoing();
        assert!(lifecycle.is_connecting());

        assert!(lifecycle.socket_connected());
        assert_eq!(lifecycle.state(), ConnectionState::Handshaking);

        assert!(lifecycle.handshake_complete());
        assert!(lifecycle.is_established());
    }

    #[test]
    fn test_incoming_starts_handshaking() {
        let mut lifecycle = Lifecycle::incoming();
        assert_eq!(lifecycle.state(), ConnectionState::Handshaking);
        assert!(!lifecycle.socket_connected()); // only valid from Connecting
        assert!(lifecycle.handshake_complete());
    }

    #[test]
    fn test_disconnect_during_handshake_closes_immediately() {
        let mut lifecycle = Lifecycle::incoming();
        let reason = DisconnectReason::new(ErrorKind::TimedOut, Operation::Read);
        assert_eq!(
            lifecycle.request_disconnect(reason, true),
            DisconnectOutcome::Closed
        );
        assert!(lifecycle.is_closed());
        assert!(lifecycle.failed());
    }

    #[test]
    fn test_disconnect_is_idempotent_first_writer_wins() {
        let mut lifecycle = Lifecycle::incoming();
        lifecycle.handshake_complete();

        let first = DisconnectReason::new(ErrorKind::TimedOut, Operation::Read);
        let second = DisconnectReason::new(ErrorKind::ProtocolViolation, Operation::Extension);

        assert_eq!(
            lifecycle.request_disconnect(first, false),
            DisconnectOutcome::Closed
        );
        assert_eq!(
            lifecycle.request_disconnect(second, false),
            DisconnectOutcome::Ignored
        );
        assert_eq!(lifecycle.reason(), Some(first));
    }

    #[test]
    fn test_established_disconnect_drains_then_closes() {
        let mut lifecycle = Lifecycle::incoming();
        lifecycle.handshake_complete();

        let reason = DisconnectReason::new(ErrorKind::Requested, Operation::Bittorrent);
        assert_eq!(
            lifecycle.request_disconnect(reason, true),
            DisconnectOutcome::Draining
        );
        assert!(lifecycle.is_disconnecting());
        assert!(!lifecycle.is_closed());
        assert!(!lifecycle.accepts_sends());

        assert!(lifecycle.finish_disconnect());
        assert!(lifecycle.is_closed());
        assert!(!lifecycle.failed()); // clean close
    }

    #[test]
    fn test_requested_close_is_not_a_failure() {
        let reason = DisconnectReason::new(ErrorKind::Requested, Operation::Bittorrent);
        assert!(!reason.error.is_failure());
        assert!(ErrorKind::Redundant.is_failure());
    }
}
