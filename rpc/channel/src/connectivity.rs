//! Connectivity states shared by subchannels, load balancers, and channels.

use std::fmt;

/// Connectivity state of a subchannel or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// No connection and none wanted yet.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// A connection is up and can carry calls.
    Ready,
    /// The last attempt failed; waiting out backoff.
    TransientFailure,
    /// Terminal: the component is being torn down.
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        write!(f, "{}", name)
    }
}

/// Aggregate child states the round-robin way: READY if any child is READY,
/// else CONNECTING if any is CONNECTING, else TRANSIENT_FAILURE if all are,
/// else IDLE.
pub fn aggregate(states: &[ConnectivityState]) -> ConnectivityState {
    if states.iter().any(|s| *s == ConnectivityState::Ready) {
        ConnectivityState::Ready
    } else if states.iter().any(|s| *s == ConnectivityState::Connecting) {
        ConnectivityState::Connecting
    } else if !states.is_empty()
        && states
            .iter()
            .all(|s| *s == ConnectivityState::TransientFailure)
    {
        ConnectivityState::TransientFailure
    } else {
        ConnectivityState::Idle
    }
}
