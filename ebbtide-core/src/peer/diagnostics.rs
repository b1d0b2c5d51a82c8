//! Structured diagnostic events for peer connections
//!
//! The engine emits one event per noteworthy protocol step. Formatting and
//! sinks are external; the bundled `TracingSink` forwards to `tracing` so a
//! host application's subscriber decides what happens to them. Emission is
//! fire-and-forget: a missing or panicking sink never disturbs the state
//! machine.

use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

/// Which way the logged event flowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogDirection {
    /// Message or event received from the peer
    Incoming,
    /// Message or event sent to the peer
    Outgoing,
    /// Local state change with no wire traffic
    Info,
}

impl LogDirection {
    pub fn arrow(&self) -> &'static str {
        match self {
            LogDirection::Incoming => "<==",
            LogDirection::Outgoing => "==>",
            LogDirection::Info => "***",
        }
    }
}

/// A single structured diagnostic event.
#[derive(Debug, Clone, Serialize)]
pub struct PeerLogEvent {
    pub direction: LogDirection,
    pub event: &'static str,
    pub detail: String,
}

/// External consumer of peer diagnostic events.
///
/// Implementations must not block; delivery is best-effort and the engine
/// swallows panics from misbehaving sinks.
pub trait DiagnosticsSink: Send + Sync {
    fn peer_log(&self, remote: SocketAddr, event: &PeerLogEvent);
}

/// Default sink forwarding events to `tracing` at debug level.
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn peer_log(&self, remote: SocketAddr, event: &PeerLogEvent) {
        debug!(
            peer = %remote,
            direction = event.direction.arrow(),
            event = event.event,
            detail = %event.detail,
            "peer event"
        );
    }
}

/// Emits an event to the sink, if one is installed. Never panics.
pub(crate) fn emit(
    sink: Option<&Arc<dyn DiagnosticsSink>>,
    remote: SocketAddr,
    direction: LogDirection,
    event: &'static str,
    detail: String,
) {
    let Some(sink) = sink else {
        return; // no sink, event is dropped
    };
    let entry = PeerLogEvent {
        direction,
        event,
        detail,
    };
    let _ = catch_unwind(AssertUnwindSafe(|| sink.peer_log(remote, &entry)));
}
