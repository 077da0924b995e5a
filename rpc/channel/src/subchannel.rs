//! Subchannels: one transport connection per backend address.
//!
//! A subchannel owns at most one HTTP/2 session at a time and runs the
//! connectivity state machine: IDLE until demanded, CONNECTING during an
//! attempt, READY while a session is up, TRANSIENT_FAILURE plus backoff on
//! error, SHUTDOWN terminally once nothing references it. Load-balancer
//! holders and active calls are tracked with separate reference counts; the
//! subchannel cannot be torn down while either is positive.

use crate::address::Address;
use crate::backoff::{Backoff, BackoffOptions};
use crate::connectivity::ConnectivityState;
use rpc_h2::{ClientSession, SessionEvent};
use std::collections::HashMap;
use std::io;
use std::time::Instant;

/// Pool-scoped subchannel identifier.
pub type SubchannelId = u64;

/// Opens transport sessions to backend addresses. The HTTP/2 library and
/// any TLS live behind this seam.
pub trait Connector {
    fn connect(&mut self, address: &Address) -> io::Result<Box<dyn ClientSession>>;
}

struct Subchannel {
    address: Address,
    state: ConnectivityState,
    session: Option<Box<dyn ClientSession>>,
    refs: usize,
    call_refs: usize,
    backoff: Backoff,
    backoff_deadline: Option<Instant>,
}

/// Owns the live subchannels of one channel, deduplicated by address.
pub struct SubchannelPool {
    connector: Box<dyn Connector>,
    subchannels: HashMap<SubchannelId, Subchannel>,
    by_address: HashMap<Address, SubchannelId>,
    backoff_options: BackoffOptions,
    state_events: Vec<(SubchannelId, ConnectivityState)>,
    next_id: SubchannelId,
}

impl SubchannelPool {
    pub fn new(connector: Box<dyn Connector>, backoff_options: BackoffOptions) -> Self {
        Self {
            connector,
            subchannels: HashMap::new(),
            by_address: HashMap::new(),
            backoff_options,
            state_events: Vec::new(),
            next_id: 1,
        }
    }

    /// Get or create the subchannel for an address and take an LB
    /// reference on it.
    pub fn acquire(&mut self, address: &Address) -> SubchannelId {
        if let Some(&id) = self.by_address.get(address)
            && let Some(subchannel) = self.subchannels.get_mut(&id)
            && subchannel.state != ConnectivityState::Shutdown
        {
            subchannel.refs += 1;
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        tracing::debug!(target: "rpc_channel::subchannel", id, address = %address, "creating subchannel");
        self.subchannels.insert(
            id,
            Subchannel {
                address: address.clone(),
                state: ConnectivityState::Idle,
                session: None,
                refs: 1,
                call_refs: 0,
                backoff: Backoff::new(self.backoff_options),
                backoff_deadline: None,
            },
        );
        self.by_address.insert(address.clone(), id);
        id
    }

    /// Drop one LB reference; the subchannel shuts down once no LB and no
    /// call holds it.
    pub fn unref(&mut self, id: SubchannelId) {
        if let Some(subchannel) = self.subchannels.get_mut(&id) {
            subchannel.refs = subchannel.refs.saturating_sub(1);
            self.maybe_shutdown(id);
        }
    }

    /// Track a call binding to this subchannel.
    pub fn call_ref(&mut self, id: SubchannelId) {
        if let Some(subchannel) = self.subchannels.get_mut(&id) {
            subchannel.call_refs += 1;
        }
    }

    /// Release a call binding.
    pub fn call_unref(&mut self, id: SubchannelId) {
        if let Some(subchannel) = self.subchannels.get_mut(&id) {
            subchannel.call_refs = subchannel.call_refs.saturating_sub(1);
            self.maybe_shutdown(id);
        }
    }

    fn maybe_shutdown(&mut self, id: SubchannelId) {
        let Some(subchannel) = self.subchannels.get_mut(&id) else {
            return;
        };
        if subchannel.refs > 0 || subchannel.call_refs > 0 {
            return;
        }
        if subchannel.state != ConnectivityState::Shutdown {
            if let Some(session) = subchannel.session.as_mut() {
                session.close();
            }
            subchannel.session = None;
            self.set_state(id, ConnectivityState::Shutdown);
        }
        let address = self.subchannels[&id].address.clone();
        if self.by_address.get(&address) == Some(&id) {
            self.by_address.remove(&address);
        }
        self.subchannels.remove(&id);
    }

    pub fn state(&self, id: SubchannelId) -> ConnectivityState {
        self.subchannels
            .get(&id)
            .map(|s| s.state)
            .unwrap_or(ConnectivityState::Shutdown)
    }

    pub fn ids(&self) -> Vec<SubchannelId> {
        self.subchannels.keys().copied().collect()
    }

    fn set_state(&mut self, id: SubchannelId, state: ConnectivityState) {
        let Some(subchannel) = self.subchannels.get_mut(&id) else {
            return;
        };
        if subchannel.state == state {
            return;
        }
        tracing::debug!(
            target: "rpc_channel::subchannel",
            id,
            address = %subchannel.address,
            from = %subchannel.state,
            to = %state,
            "subchannel state change"
        );
        subchannel.state = state;
        self.state_events.push((id, state));
    }

    /// Demand a connection. IDLE subchannels start connecting; others are
    /// left alone.
    pub fn request_connect(&mut self, id: SubchannelId, now: Instant) {
        if self.state(id) == ConnectivityState::Idle {
            self.attempt_connect(id, now);
        }
    }

    fn attempt_connect(&mut self, id: SubchannelId, now: Instant) {
        let Some(subchannel) = self.subchannels.get_mut(&id) else {
            return;
        };
        let address = subchannel.address.clone();
        self.set_state(id, ConnectivityState::Connecting);
        match self.connector.connect(&address) {
            Ok(session) => {
                let ready = session.is_ready();
                let subchannel = self.subchannels.get_mut(&id).unwrap();
                subchannel.session = Some(session);
                subchannel.backoff_deadline = None;
                if ready {
                    subchannel.backoff.reset();
                    self.set_state(id, ConnectivityState::Ready);
                }
            }
            Err(e) => {
                tracing::debug!(
                    target: "rpc_channel::subchannel",
                    id,
                    address = %address,
                    error = %e,
                    "connection attempt failed"
                );
                let subchannel = self.subchannels.get_mut(&id).unwrap();
                let delay = subchannel.backoff.next_delay();
                subchannel.backoff_deadline = Some(now + delay);
                self.set_state(id, ConnectivityState::TransientFailure);
            }
        }
    }

    /// Restart connection attempts immediately on the next demand.
    pub fn reset_backoff(&mut self, id: SubchannelId, now: Instant) {
        if let Some(subchannel) = self.subchannels.get_mut(&id) {
            subchannel.backoff.reset();
            if subchannel.state == ConnectivityState::TransientFailure {
                subchannel.backoff_deadline = None;
                self.attempt_connect(id, now);
            }
        }
    }

    /// The session under this subchannel went away.
    pub fn on_disconnect(&mut self, id: SubchannelId, graceful: bool, now: Instant) {
        let Some(subchannel) = self.subchannels.get_mut(&id) else {
            return;
        };
        subchannel.session = None;
        if graceful {
            self.set_state(id, ConnectivityState::Idle);
        } else {
            let delay = {
                let subchannel = self.subchannels.get_mut(&id).unwrap();
                subchannel.backoff.next_delay()
            };
            self.subchannels.get_mut(&id).unwrap().backoff_deadline = Some(now + delay);
            self.set_state(id, ConnectivityState::TransientFailure);
        }
    }

    /// Borrow the live session of a READY subchannel.
    pub fn session_mut(&mut self, id: SubchannelId) -> Option<&mut dyn ClientSession> {
        self.subchannels
            .get_mut(&id)
            .and_then(|s| s.session.as_mut())
            .map(|s| &mut **s as &mut dyn ClientSession)
    }

    /// Drain the session events of one subchannel, promoting CONNECTING
    /// sessions that became ready.
    pub fn drain_session_events(&mut self, id: SubchannelId) -> Vec<SessionEvent> {
        let Some(subchannel) = self.subchannels.get_mut(&id) else {
            return Vec::new();
        };
        let Some(session) = subchannel.session.as_mut() else {
            return Vec::new();
        };
        let events = session.poll_events();
        if subchannel.state == ConnectivityState::Connecting && session.is_ready() {
            subchannel.backoff.reset();
            self.set_state(id, ConnectivityState::Ready);
        }
        events
    }

    /// Drain subchannel state transitions for the load-balancer plane.
    pub fn drain_state_events(&mut self) -> Vec<(SubchannelId, ConnectivityState)> {
        std::mem::take(&mut self.state_events)
    }

    /// Earliest backoff deadline.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.subchannels
            .values()
            .filter_map(|s| s.backoff_deadline)
            .min()
    }

    /// Fire due backoff timers: TRANSIENT_FAILURE subchannels re-enter
    /// CONNECTING.
    pub fn on_timeout(&mut self, now: Instant) {
        let due: Vec<SubchannelId> = self
            .subchannels
            .iter()
            .filter(|(_, s)| s.backoff_deadline.is_some_and(|d| d <= now))
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            if let Some(subchannel) = self.subchannels.get_mut(&id) {
                subchannel.backoff_deadline = None;
            }
            self.attempt_connect(id, now);
        }
    }

    /// Close everything; the pool is unusable afterwards.
    pub fn shutdown(&mut self) {
        for (_, subchannel) in self.subchannels.iter_mut() {
            if let Some(session) = subchannel.session.as_mut() {
                session.close();
            }
            subchannel.session = None;
            subchannel.state = ConnectivityState::Shutdown;
        }
        self.subchannels.clear();
        self.by_address.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryNetwork;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn tcp(addr: &str) -> Address {
        Address::Tcp(addr.parse::<SocketAddr>().unwrap())
    }

    fn pool_with_network() -> (SubchannelPool, MemoryNetwork) {
        let network = MemoryNetwork::new();
        let pool = SubchannelPool::new(
            Box::new(network.connector()),
            BackoffOptions {
                jitter: 0.0,
                ..BackoffOptions::default()
            },
        );
        (pool, network)
    }

    #[test]
    fn test_acquire_dedupes_by_address() {
        let (mut pool, _network) = pool_with_network();
        let a = pool.acquire(&tcp("10.0.0.1:443"));
        let b = pool.acquire(&tcp("10.0.0.1:443"));
        let c = pool.acquire(&tcp("10.0.0.2:443"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_connect_reaches_ready() {
        let (mut pool, _network) = pool_with_network();
        let id = pool.acquire(&tcp("10.0.0.1:443"));
        assert_eq!(pool.state(id), ConnectivityState::Idle);
        pool.request_connect(id, Instant::now());
        assert_eq!(pool.state(id), ConnectivityState::Ready);
        let events = pool.drain_state_events();
        let states: Vec<_> = events.iter().map(|(_, s)| *s).collect();
        assert_eq!(
            states,
            [ConnectivityState::Connecting, ConnectivityState::Ready]
        );
    }

    #[test]
    fn test_failed_connect_backs_off_then_retries() {
        let (mut pool, network) = pool_with_network();
        network.refuse_connections(true);
        let id = pool.acquire(&tcp("10.0.0.1:443"));
        let start = Instant::now();
        pool.request_connect(id, start);
        assert_eq!(pool.state(id), ConnectivityState::TransientFailure);

        let deadline = pool.next_timeout().expect("backoff armed");
        assert!(deadline > start);

        network.refuse_connections(false);
        pool.on_timeout(deadline + Duration::from_millis(1));
        assert_eq!(pool.state(id), ConnectivityState::Ready);
    }

    #[test]
    fn test_graceful_disconnect_goes_idle() {
        let (mut pool, _network) = pool_with_network();
        let id = pool.acquire(&tcp("10.0.0.1:443"));
        pool.request_connect(id, Instant::now());
        pool.on_disconnect(id, true, Instant::now());
        assert_eq!(pool.state(id), ConnectivityState::Idle);
    }

    #[test]
    fn test_error_disconnect_goes_transient_failure() {
        let (mut pool, _network) = pool_with_network();
        let id = pool.acquire(&tcp("10.0.0.1:443"));
        pool.request_connect(id, Instant::now());
        pool.on_disconnect(id, false, Instant::now());
        assert_eq!(pool.state(id), ConnectivityState::TransientFailure);
        assert!(pool.next_timeout().is_some());
    }

    #[test]
    fn test_refcounts_defer_shutdown() {
        let (mut pool, _network) = pool_with_network();
        let id = pool.acquire(&tcp("10.0.0.1:443"));
        pool.call_ref(id);
        pool.unref(id);
        // A call still holds it.
        assert_ne!(pool.state(id), ConnectivityState::Shutdown);
        pool.call_unref(id);
        assert_eq!(pool.state(id), ConnectivityState::Shutdown);
        assert!(pool.ids().is_empty());
    }

    #[test]
    fn test_acquire_after_shutdown_creates_fresh() {
        let (mut pool, _network) = pool_with_network();
        let id = pool.acquire(&tcp("10.0.0.1:443"));
        pool.unref(id);
        let fresh = pool.acquire(&tcp("10.0.0.1:443"));
        assert_ne!(id, fresh);
        assert_eq!(pool.state(fresh), ConnectivityState::Idle);
    }
}
