//! Pure connection state and reconnection decisions
//!
//! Nothing in here touches the network: the coordinator in `coordinator.rs` asks
//! these types what to do next and performs the I/O itself.

use crate::packet::ProtocolVersion;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// First delay of the reconnect loop
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or torn down by the user or by a loss without auto-reconnect
    Disconnected,
    /// Initial connect handshake in progress
    Connecting,
    /// Handshake accepted and workers running
    Connected,
    /// Connection lost; the reconnect loop is running
    Reconnecting,
}

impl ConnectionState {
    /// Whether publish/subscribe/unsubscribe calls are accepted
    ///
    /// While reconnecting, operations keep queueing and are written once the
    /// connection is re-established.
    pub fn accepts_operations(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnecting)
    }
}

/// Lock object for the state shared between the caller and the worker tasks
///
/// Only the connection state and the last-contact timestamp live here, each
/// behind its own lock.
#[derive(Debug)]
pub struct ConnectionStatus {
    state: RwLock<ConnectionState>,
    last_contact: Mutex<Instant>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            last_contact: Mutex::new(Instant::now()),
        }
    }
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the state, returning the previous one
    pub fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *state, next)
    }

    /// Move from `from` to `to` only if the current state is `from`
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Record traffic with the broker
    pub fn touch(&self) {
        *self.last_contact.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn since_last_contact(&self) -> Duration {
        self.last_contact
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// Reconnect delay schedule: 1s, doubling after each failed cycle, capped
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self {
            next: INITIAL_RECONNECT_DELAY.min(max),
            max,
        }
    }

    /// Delay to sleep after the current failed cycle
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}

/// Protocol versions to try against one broker, in order
///
/// A pinned version is tried alone. Unpinned 3.1.1 falls back to 3.1 once
/// when the broker rejects the first attempt.
pub fn protocol_attempts(preferred: ProtocolVersion, pinned: bool) -> Vec<ProtocolVersion> {
    match (preferred, pinned) {
        (ProtocolVersion::V311, false) => vec![ProtocolVersion::V311, ProtocolVersion::V31],
        (version, _) => vec![version],
    }
}

/// Result of one failed connect attempt against one broker with one version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The broker answered with a non-accepted CONNACK
    Rejected,
    /// The transport failed or the handshake timed out
    Unreachable,
}

/// What the broker loop does after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Retry the same broker with the next protocol version
    NextVersion,
    NextBroker,
}

/// Decide the next step given an attempt outcome and whether a fallback
/// version remains for this broker
pub fn next_step(outcome: AttemptOutcome, fallback_remaining: bool) -> NextStep {
    match outcome {
        AttemptOutcome::Rejected if fallback_remaining => NextStep::NextVersion,
        AttemptOutcome::Rejected | AttemptOutcome::Unreachable => NextStep::NextBroker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(10));

        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_backoff_never_decreases_or_exceeds_cap() {
        for cap_secs in [1u64, 3, 7, 60, 600] {
            let cap = Duration::from_secs(cap_secs);
            let mut backoff = Backoff::new(cap);
            let mut previous = Duration::ZERO;
            for _ in 0..40 {
                let delay = backoff.next_delay();
                assert!(delay >= previous, "backoff decreased with cap {cap_secs}s");
                assert!(delay <= cap, "backoff exceeded cap {cap_secs}s");
                previous = delay;
            }
            assert_eq!(previous, cap);
        }
    }

    #[test]
    fn test_backoff_cap_below_initial_delay() {
        let mut backoff = Backoff::new(Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_protocol_attempts() {
        assert_eq!(
            protocol_attempts(ProtocolVersion::V311, false),
            vec![ProtocolVersion::V311, ProtocolVersion::V31]
        );
        assert_eq!(
            protocol_attempts(ProtocolVersion::V311, true),
            vec![ProtocolVersion::V311]
        );
        assert_eq!(
            protocol_attempts(ProtocolVersion::V31, true),
            vec![ProtocolVersion::V31]
        );
    }

    #[test]
    fn test_next_step() {
        assert_eq!(next_step(AttemptOutcome::Rejected, true), NextStep::NextVersion);
        assert_eq!(next_step(AttemptOutcome::Rejected, false), NextStep::NextBroker);
        // transport failures never trigger a version fallback
        assert_eq!(next_step(AttemptOutcome::Unreachable, true), NextStep::NextBroker);
    }

    #[test]
    fn test_state_transitions() {
        let status = ConnectionStatus::new();
        assert_eq!(status.state(), ConnectionState::Disconnected);
        assert!(!status.state().accepts_operations());

        assert!(status.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert!(!status.transition(ConnectionState::Disconnected, ConnectionState::Connected));

        status.set_state(ConnectionState::Reconnecting);
        assert!(status.state().accepts_operations());
    }

    #[test]
    fn test_touch_resets_elapsed() {
        let status = ConnectionStatus::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(status.since_last_contact() >= Duration::from_millis(20));

        status.touch();

        assert!(status.since_last_contact() < Duration::from_millis(20));
    }
}
