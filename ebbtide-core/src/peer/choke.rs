//! Bilateral choke/interest flow-control state
//!
//! Four booleans, two per direction. The outgoing pair only flips through
//! the connection's send operations so local state always matches what was
//! actually put on the wire; the incoming pair follows received control
//! messages.

use std::time::Instant;

/// The 2x2 flow-control state for one connection.
#[derive(Debug)]
pub struct ChokeState {
    /// We have choked the peer (suppresses our uploads to them)
    choked: bool,
    /// We are interested in the peer (we want to download from them)
    interesting: bool,
    /// The peer has choked us
    peer_choked: bool,
    /// The peer is interested in us
    peer_interested: bool,
    last_activity: Instant,
    last_unchoke: Option<Instant>,
}

impl ChokeState {
    /// Both sides start choked and uninterested per the wire protocol.
    pub fn new() -> Self {
        Self {
            choked: true,
            interesting: false,
            peer_choked: true,
            peer_interested: false,
            last_activity: Instant::now(),
            last_unchoke: None,
        }
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn is_interesting(&self) -> bool {
        self.interesting
    }

    pub fn has_peer_choked(&self) -> bool {
        self.peer_choked
    }

    pub fn is_peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn time_of_last_unchoke(&self) -> Option<Instant> {
        self.last_unchoke
    }

    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Flips the local choke bit. Returns false when the bit already holds
    /// the requested value, in which case the caller must not send anything.
    pub fn set_choked(&mut self, choked: bool) -> bool {
        if self.choked == choked {
            return false;
        }
        self.choked = choked;
        if !choked {
            self.last_unchoke = Some(Instant::now());
        }
        true
    }

    /// Flips the local interest bit with the same idempotence guard as
    /// `set_choked`.
    pub fn set_interesting(&mut self, interesting: bool) -> bool {
        if self.interesting == interesting {
            return false;
        }
        self.interesting = interesting;
        true
    }

    pub fn on_peer_choke(&mut self) {
        self.record_activity();
        self.peer_choked = true;
    }

    pub fn on_peer_unchoke(&mut self) {
        self.record_activity();
        self.peer_choked = false;
    }

    pub fn on_peer_interested(&mut self) {
        self.record_activity();
        self.peer_interested = true;
    }

    pub fn on_peer_not_interested(&mut self) {
        self.record_activity();
        self.peer_interested = false;
    }
}

impl Default for ChokeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_initial_state_is_mutually_choked() {
        let state = ChokeState::new();
        assert!(state.is_choked());
        assert!(state.has_peer_choked());
        assert!(!state.is_interesting());
        assert!(!state.is_peer_interested());
        assert!(state.time_of_last_unchoke().is_none());
    }

    #[test]
    fn test_redundant_choke_reports_no_change() {
        let mut state = ChokeState::new();
        assert!(!state.set_choked(true)); // already choked
        assert!(state.set_choked(false));
        assert!(!state.set_choked(false)); // already unchoked
        assert!(state.time_of_last_unchoke().is_some());
    }

    #[test]
    fn test_unchoke_stamps_timestamp_once_per_transition() {
        let mut state = ChokeState::new();
        state.set_choked(false);
        let first = state.time_of_last_unchoke();
        assert!(!state.set_choked(false));
        assert_eq!(state.time_of_last_unchoke(), first);
    }

    #[test]
    fn test_peer_side_follows_messages() {
        let mut state = ChokeState::new();
        state.on_peer_unchoke();
        state.on_peer_interested();
        assert!(!state.has_peer_choked());
        assert!(state.is_peer_interested());

        state.on_peer_choke();
        state.on_peer_not_interested();
        assert!(state.has_peer_choked());
        assert!(!state.is_peer_interested());
    }

    proptest! {
        /// For any sequence of requested choke values, a call reports a send
        /// exactly when it changes the bit, and the bit always reflects the
        /// last requested value afterwards.
        #[test]
        fn prop_choke_transitions_match_sends(requests in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut state = ChokeState::new();
            let mut current = true; // wire protocol start
            for requested in requests {
                let sent = state.set_choked(requested);
                prop_assert_eq!(sent, requested != current);
                current = requested;
                prop_assert_eq!(state.is_choked(), current);
            }
        }

        #[test]
        fn prop_interest_transitions_match_sends(requests in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut state = ChokeState::new();
            let mut current = false;
            for requested in requests {
                let sent = state.set_interesting(requested);
                prop_assert_eq!(sent, requested != current);
                current = requested;
                prop_assert_eq!(state.is_interesting(), current);
            }
        }
    }
}
