//! The round-robin policy: one subchannel per endpoint, READY children
//! served in rotation.

use crate::address::Endpoint;
use crate::connectivity::{ConnectivityState, aggregate};
use crate::load_balancing::{LbActions, LoadBalancer};
use crate::picker::{FailPicker, PickInfo, PickResult, Picker, QueuePicker};
use crate::subchannel::{SubchannelId, SubchannelPool};
use rpc_wire::Status;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

pub const POLICY_NAME: &str = "round_robin";

pub fn create() -> Box<dyn LoadBalancer> {
    Box::new(RoundRobin::default())
}

/// Rotates across the READY children with a per-picker counter.
struct RoundRobinPicker {
    ready: Vec<SubchannelId>,
    next: AtomicUsize,
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.ready.len();
        PickResult::Complete {
            subchannel: self.ready[index],
            tracker: None,
        }
    }
}

/// Maintains one subchannel per endpoint and keeps them all connected.
#[derive(Default)]
pub struct RoundRobin {
    subchannels: Vec<SubchannelId>,
}

impl RoundRobin {
    fn publish(&self, pool: &SubchannelPool, actions: &mut LbActions) {
        let states: Vec<ConnectivityState> =
            self.subchannels.iter().map(|&id| pool.state(id)).collect();
        let state = aggregate(&states);
        let picker: Arc<dyn Picker> = match state {
            ConnectivityState::Ready => {
                let ready: Vec<SubchannelId> = self
                    .subchannels
                    .iter()
                    .copied()
                    .filter(|&id| pool.state(id) == ConnectivityState::Ready)
                    .collect();
                Arc::new(RoundRobinPicker {
                    ready,
                    next: AtomicUsize::new(0),
                })
            }
            ConnectivityState::TransientFailure => Arc::new(FailPicker::new(
                Status::unavailable("No connection established"),
            )),
            _ => Arc::new(QueuePicker),
        };
        actions.update_state(state, picker);
    }
}

impl LoadBalancer for RoundRobin {
    fn type_name(&self) -> &'static str {
        POLICY_NAME
    }

    fn update_address_list(
        &mut self,
        pool: &mut SubchannelPool,
        endpoints: &[Endpoint],
        _config: &serde_json::Value,
        actions: &mut LbActions,
        now: Instant,
    ) {
        // Acquire the new set before releasing the old so shared
        // subchannels survive the update.
        let old = std::mem::take(&mut self.subchannels);

        // One subchannel per endpoint, on its first address.
        for endpoint in endpoints {
            let Some(address) = endpoint.addresses.first() else {
                continue;
            };
            let id = pool.acquire(address);
            pool.request_connect(id, now);
            self.subchannels.push(id);
        }
        for &stale in &old {
            pool.unref(stale);
        }
        if self.subchannels.is_empty() {
            actions.update_state(
                ConnectivityState::TransientFailure,
                Arc::new(FailPicker::new(Status::unavailable("No addresses resolved"))),
            );
            return;
        }
        self.publish(pool, actions);
    }

    fn on_subchannel_state(
        &mut self,
        pool: &mut SubchannelPool,
        id: SubchannelId,
        state: ConnectivityState,
        actions: &mut LbActions,
        now: Instant,
    ) {
        if !self.subchannels.contains(&id) {
            return;
        }
        if state == ConnectivityState::Idle {
            // Keep every child connected.
            pool.request_connect(id, now);
        }
        if state == ConnectivityState::TransientFailure {
            actions.request_reresolution();
        }
        self.publish(pool, actions);
    }

    fn exit_idle(&mut self, pool: &mut SubchannelPool, _actions: &mut LbActions, now: Instant) {
        for &id in &self.subchannels {
            pool.request_connect(id, now);
        }
    }

    fn reset_backoff(&mut self, pool: &mut SubchannelPool, now: Instant) {
        for &id in &self.subchannels {
            pool.reset_backoff(id, now);
        }
    }

    fn destroy(&mut self, pool: &mut SubchannelPool) {
        for &id in &self.subchannels {
            pool.unref(id);
        }
        self.subchannels.clear();
    }
}
