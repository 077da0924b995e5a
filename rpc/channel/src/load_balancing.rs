//! Load-balancer plane: the policy contract, the global policy registry,
//! and the child-policy wrapper used by composing policies.

use crate::address::Endpoint;
use crate::connectivity::ConnectivityState;
use crate::picker::{Picker, PickerUpdate};
use crate::subchannel::{SubchannelId, SubchannelPool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// Outputs a policy hands back to its owner during a callback: at most one
/// (state, picker) publication plus an optional re-resolution request.
#[derive(Default)]
pub struct LbActions {
    update: Option<PickerUpdate>,
    reresolve: bool,
}

impl LbActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new aggregate state and picker.
    pub fn update_state(&mut self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.update = Some(PickerUpdate { state, picker });
    }

    /// Ask the name resolver for fresh addresses.
    pub fn request_reresolution(&mut self) {
        self.reresolve = true;
    }

    pub fn take_update(&mut self) -> Option<PickerUpdate> {
        self.update.take()
    }

    pub fn take_reresolution(&mut self) -> bool {
        std::mem::take(&mut self.reresolve)
    }
}

/// A load-balancing policy instance.
///
/// Policies own subchannel references through the pool and publish
/// (state, picker) pairs through [`LbActions`].
pub trait LoadBalancer {
    /// The registered policy name.
    fn type_name(&self) -> &'static str;

    /// Adopt a new endpoint list and typed policy config.
    fn update_address_list(
        &mut self,
        pool: &mut SubchannelPool,
        endpoints: &[Endpoint],
        config: &serde_json::Value,
        actions: &mut LbActions,
        now: Instant,
    );

    /// A subchannel this policy may hold changed state.
    fn on_subchannel_state(
        &mut self,
        pool: &mut SubchannelPool,
        id: SubchannelId,
        state: ConnectivityState,
        actions: &mut LbActions,
        now: Instant,
    );

    /// Start connecting if idle.
    fn exit_idle(&mut self, pool: &mut SubchannelPool, actions: &mut LbActions, now: Instant);

    /// Clear backoff state so the next attempt is immediate.
    fn reset_backoff(&mut self, pool: &mut SubchannelPool, now: Instant);

    /// Release every held subchannel.
    fn destroy(&mut self, pool: &mut SubchannelPool);
}

type LbFactory = fn() -> Box<dyn LoadBalancer>;

fn registry() -> &'static Mutex<HashMap<String, LbFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, LbFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a policy constructor under its type name. Intended for process
/// startup; later registrations replace earlier ones.
pub fn register_load_balancer(name: &str, factory: LbFactory) {
    registry().lock().unwrap().insert(name.to_owned(), factory);
}

/// Register the built-in policies. Idempotent.
pub fn register_defaults() {
    register_load_balancer(crate::pick_first::POLICY_NAME, crate::pick_first::create);
    register_load_balancer(crate::round_robin::POLICY_NAME, crate::round_robin::create);
}

/// Instantiate a policy by name.
pub fn create_load_balancer(name: &str) -> Option<Box<dyn LoadBalancer>> {
    registry().lock().unwrap().get(name).copied().map(|f| f())
}

/// Check whether a policy name is registered.
pub fn is_supported(name: &str) -> bool {
    registry().lock().unwrap().contains_key(name)
}

/// Wraps a child policy, swapping the instance in place only when the
/// policy *type* changes; otherwise updates are forwarded.
#[derive(Default)]
pub struct ChildPolicyHandler {
    child: Option<Box<dyn LoadBalancer>>,
    child_type: Option<String>,
}

impl ChildPolicyHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_type(&self) -> Option<&str> {
        self.child_type.as_deref()
    }

    /// Forward an address update, creating or replacing the child first if
    /// the policy name changed. Returns false for an unregistered policy.
    pub fn update(
        &mut self,
        pool: &mut SubchannelPool,
        endpoints: &[Endpoint],
        policy_name: &str,
        config: &serde_json::Value,
        actions: &mut LbActions,
        now: Instant,
    ) -> bool {
        if self.child_type.as_deref() != Some(policy_name) {
            let Some(fresh) = create_load_balancer(policy_name) else {
                return false;
            };
            if let Some(mut old) = self.child.take() {
                tracing::debug!(
                    target: "rpc_channel::lb",
                    old = old.type_name(),
                    new = policy_name,
                    "swapping child load-balancing policy"
                );
                old.destroy(pool);
            }
            self.child = Some(fresh);
            self.child_type = Some(policy_name.to_owned());
        }
        if let Some(child) = self.child.as_mut() {
            child.update_address_list(pool, endpoints, config, actions, now);
        }
        true
    }

    pub fn on_subchannel_state(
        &mut self,
        pool: &mut SubchannelPool,
        id: SubchannelId,
        state: ConnectivityState,
        actions: &mut LbActions,
        now: Instant,
    ) {
        if let Some(child) = self.child.as_mut() {
            child.on_subchannel_state(pool, id, state, actions, now);
        }
    }

    pub fn exit_idle(&mut self, pool: &mut SubchannelPool, actions: &mut LbActions, now: Instant) {
        if let Some(child) = self.child.as_mut() {
            child.exit_idle(pool, actions, now);
        }
    }

    pub fn reset_backoff(&mut self, pool: &mut SubchannelPool, now: Instant) {
        if let Some(child) = self.child.as_mut() {
            child.reset_backoff(pool, now);
        }
    }

    pub fn destroy(&mut self, pool: &mut SubchannelPool) {
        if let Some(mut child) = self.child.take() {
            child.destroy(pool);
        }
        self.child_type = None;
    }
}
