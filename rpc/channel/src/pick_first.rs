//! The pick-first policy: one connection, addresses tried in order.

use crate::address::{Address, Endpoint};
use crate::connectivity::ConnectivityState;
use crate::load_balancing::{LbActions, LoadBalancer};
use crate::picker::{FailPicker, PickInfo, PickResult, Picker, QueuePicker};
use crate::subchannel::{SubchannelId, SubchannelPool};
use rpc_wire::Status;
use std::sync::Arc;
use std::time::Instant;

pub const POLICY_NAME: &str = "pick_first";

pub fn create() -> Box<dyn LoadBalancer> {
    Box::new(PickFirst::default())
}

/// Picker routing every call to the one READY subchannel.
struct SingleSubchannelPicker {
    subchannel: SubchannelId,
}

impl Picker for SingleSubchannelPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        PickResult::Complete {
            subchannel: self.subchannel,
            tracker: None,
        }
    }
}

/// Maintains one subchannel per address and tries them in order; the first
/// to come up serves all calls. Reconnects after disconnect with the
/// subchannel's own backoff.
#[derive(Default)]
pub struct PickFirst {
    subchannels: Vec<SubchannelId>,
    /// Position of the initial connection sweep.
    sweep: usize,
    current_ready: Option<SubchannelId>,
}

impl PickFirst {
    fn publish(
        &self,
        state: ConnectivityState,
        actions: &mut LbActions,
        status: Option<Status>,
    ) {
        let picker: Arc<dyn Picker> = match state {
            ConnectivityState::Ready => Arc::new(SingleSubchannelPicker {
                subchannel: self.current_ready.expect("ready without subchannel"),
            }),
            ConnectivityState::TransientFailure => Arc::new(FailPicker::new(
                status.unwrap_or_else(|| Status::unavailable("No connection established")),
            )),
            _ => Arc::new(QueuePicker),
        };
        actions.update_state(state, picker);
    }
}

impl LoadBalancer for PickFirst {
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
        let addresses: Vec<Address> = endpoints
            .iter()
            .flat_map(|e| e.addresses.iter().cloned())
            .collect();

        // Acquire the new set before releasing the old so shared
        // subchannels survive the update.
        let old = std::mem::take(&mut self.subchannels);
        self.current_ready = None;
        self.sweep = 0;

        if addresses.is_empty() {
            for &stale in &old {
                pool.unref(stale);
            }
            self.publish(
                ConnectivityState::TransientFailure,
                actions,
                Some(Status::unavailable("No addresses resolved")),
            );
            return;
        }

        self.subchannels = addresses.iter().map(|a| pool.acquire(a)).collect();
        for &stale in &old {
            pool.unref(stale);
        }

        // A shared subchannel may already be up.
        if let Some(&ready) = self
            .subchannels
            .iter()
            .find(|&&id| pool.state(id) == ConnectivityState::Ready)
        {
            self.current_ready = Some(ready);
            self.publish(ConnectivityState::Ready, actions, None);
            return;
        }
        if self
            .subchannels
            .iter()
            .all(|&id| pool.state(id) == ConnectivityState::TransientFailure)
        {
            self.publish(ConnectivityState::TransientFailure, actions, None);
            return;
        }
        if let Some(position) = self
            .subchannels
            .iter()
            .position(|&id| pool.state(id) == ConnectivityState::Idle)
        {
            self.sweep = position;
            pool.request_connect(self.subchannels[position], now);
        }
        self.publish(ConnectivityState::Connecting, actions, None);
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
        match state {
            ConnectivityState::Ready => {
                self.current_ready = Some(id);
                self.publish(ConnectivityState::Ready, actions, None);
            }
            ConnectivityState::Idle => {
                // Graceful close under us: reconnect immediately.
                if self.current_ready == Some(id) {
                    self.current_ready = None;
                }
                if self.current_ready.is_none() {
                    pool.request_connect(id, now);
                    self.publish(ConnectivityState::Connecting, actions, None);
                }
            }
            ConnectivityState::Connecting => {
                if self.current_ready == Some(id) {
                    self.current_ready = None;
                }
                if self.current_ready.is_none() {
                    self.publish(ConnectivityState::Connecting, actions, None);
                }
            }
            ConnectivityState::TransientFailure => {
                if self.current_ready == Some(id) {
                    self.current_ready = None;
                }
                if self.current_ready.is_some() {
                    // Unrelated failure; the serving subchannel stands.
                    return;
                }
                // Advance the initial sweep; once every address has failed,
                // report failure and let per-subchannel backoff retry.
                if self.sweep + 1 < self.subchannels.len()
                    && self.subchannels[self.sweep] == id
                {
                    self.sweep += 1;
                    pool.request_connect(self.subchannels[self.sweep], now);
                    self.publish(ConnectivityState::Connecting, actions, None);
                } else if self
                    .subchannels
                    .iter()
                    .all(|&s| pool.state(s) == ConnectivityState::TransientFailure)
                {
                    self.publish(ConnectivityState::TransientFailure, actions, None);
                    actions.request_reresolution();
                }
            }
            ConnectivityState::Shutdown => {}
        }
    }

    fn exit_idle(&mut self, pool: &mut SubchannelPool, actions: &mut LbActions, now: Instant) {
        if self.current_ready.is_some() {
            return;
        }
        if let Some(&idle) = self
            .subchannels
            .iter()
            .find(|&&id| pool.state(id) == ConnectivityState::Idle)
        {
            pool.request_connect(idle, now);
            self.publish(ConnectivityState::Connecting, actions, None);
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
        self.current_ready = None;
    }
}
