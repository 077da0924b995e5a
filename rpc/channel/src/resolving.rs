//! The resolving load balancer: a resolver composed with a child policy.
//!
//! Applies the service-config error-handling algorithm to every resolver
//! event, picks the first supported policy from the config, backs off on
//! resolution failure, and wraps the child's IDLE pickers so that the first
//! pick wakes the whole stack up.

use crate::backoff::{Backoff, BackoffOptions};
use crate::connectivity::ConnectivityState;
use crate::load_balancing::{ChildPolicyHandler, LbActions, is_supported, register_defaults};
use crate::picker::{ExitIdleOnPick, FailPicker, PickerUpdate};
use crate::resolver::{Resolver, ResolverUpdate};
use crate::service_config::ServiceConfig;
use crate::subchannel::{SubchannelId, SubchannelPool};
use rpc_wire::Status;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// What the resolving LB hands up to the channel after a callback.
#[derive(Default)]
pub struct ChannelUpdates {
    /// New aggregate state and picker to publish.
    pub picker: Option<PickerUpdate>,
    /// Newly adopted service config.
    pub service_config: Option<ServiceConfig>,
}

pub struct ResolvingLoadBalancer {
    resolver: Box<dyn Resolver>,
    child: ChildPolicyHandler,
    default_config: ServiceConfig,
    previous_config: Option<ServiceConfig>,
    backoff: Backoff,
    backoff_deadline: Option<Instant>,
    continue_resolving: bool,
    exit_idle_latch: Arc<AtomicBool>,
    latest_update: Option<PickerUpdate>,
}

impl ResolvingLoadBalancer {
    pub fn new(
        resolver: Box<dyn Resolver>,
        default_config: ServiceConfig,
        backoff_options: BackoffOptions,
    ) -> Self {
        register_defaults();
        Self {
            resolver,
            child: ChildPolicyHandler::new(),
            default_config,
            previous_config: None,
            backoff: Backoff::new(backoff_options),
            backoff_deadline: None,
            continue_resolving: false,
            exit_idle_latch: Arc::new(AtomicBool::new(false)),
            latest_update: None,
        }
    }

    /// The adopted service config, if any resolution carried one.
    pub fn current_service_config(&self) -> Option<&ServiceConfig> {
        self.previous_config.as_ref()
    }

    /// Kick resolution (channel creation with demand, first pick on an
    /// IDLE child, `get_connectivity_state(true)`).
    pub fn exit_idle(
        &mut self,
        pool: &mut SubchannelPool,
        updates: &mut ChannelUpdates,
        now: Instant,
    ) {
        self.request_resolution();
        let mut actions = LbActions::new();
        self.child.exit_idle(pool, &mut actions, now);
        self.drain_actions(&mut actions, updates);
    }

    fn request_resolution(&mut self) {
        if self.backoff_deadline.is_some() {
            self.continue_resolving = true;
        } else {
            self.resolver.resolve_now();
        }
    }

    /// Drive resolver updates and the idle latch. Call once per channel
    /// tick.
    pub fn process(
        &mut self,
        pool: &mut SubchannelPool,
        updates: &mut ChannelUpdates,
        now: Instant,
    ) {
        if self.exit_idle_latch.swap(false, Ordering::Relaxed) {
            self.exit_idle(pool, updates, now);
        }
        while let Some(update) = self.resolver.poll_update() {
            match update {
                ResolverUpdate::Resolved {
                    endpoints,
                    service_config,
                } => {
                    let config = match service_config {
                        Some(Ok(config)) => {
                            self.previous_config = Some(config.clone());
                            config
                        }
                        None => {
                            self.previous_config = None;
                            self.default_config.clone()
                        }
                        Some(Err(status)) => match &self.previous_config {
                            Some(previous) => previous.clone(),
                            None => {
                                self.on_resolution_failure(status, updates, now);
                                continue;
                            }
                        },
                    };
                    self.backoff.reset();

                    let (policy, policy_config) = match choose_policy(&config) {
                        Ok(choice) => choice,
                        Err(status) => {
                            tracing::warn!(
                                target: "rpc_channel::resolving",
                                "no compatible load balancer in service config"
                            );
                            self.publish(
                                PickerUpdate {
                                    state: ConnectivityState::TransientFailure,
                                    picker: Arc::new(FailPicker::new(status)),
                                },
                                updates,
                            );
                            continue;
                        }
                    };

                    let mut actions = LbActions::new();
                    self.child.update(
                        pool,
                        &endpoints,
                        &policy,
                        &policy_config,
                        &mut actions,
                        now,
                    );
                    updates.service_config = Some(config);
                    self.drain_actions(&mut actions, updates);
                }
                ResolverUpdate::Failed(status) => {
                    self.on_resolution_failure(status, updates, now);
                }
            }
        }
    }

    fn on_resolution_failure(
        &mut self,
        status: Status,
        updates: &mut ChannelUpdates,
        now: Instant,
    ) {
        tracing::debug!(
            target: "rpc_channel::resolving",
            code = %status.code(),
            details = status.details(),
            "resolution failed"
        );
        // With a child already built the previous picker stays published;
        // otherwise surface the failure.
        if self.child.child_type().is_none() {
            self.publish(
                PickerUpdate {
                    state: ConnectivityState::TransientFailure,
                    picker: Arc::new(FailPicker::new(status)),
                },
                updates,
            );
        }
        if self.backoff_deadline.is_none() {
            self.backoff_deadline = Some(now + self.backoff.next_delay());
        }
    }

    /// A subchannel changed state; route it to the child policy.
    pub fn on_subchannel_state(
        &mut self,
        pool: &mut SubchannelPool,
        id: SubchannelId,
        state: ConnectivityState,
        updates: &mut ChannelUpdates,
        now: Instant,
    ) {
        let mut actions = LbActions::new();
        self.child.on_subchannel_state(pool, id, state, &mut actions, now);
        self.drain_actions(&mut actions, updates);
    }

    pub fn reset_backoff(&mut self, pool: &mut SubchannelPool, now: Instant) {
        self.backoff.reset();
        self.backoff_deadline = None;
        self.child.reset_backoff(pool, now);
    }

    fn drain_actions(&mut self, actions: &mut LbActions, updates: &mut ChannelUpdates) {
        if let Some(update) = actions.take_update() {
            self.publish(update, updates);
        }
        if actions.take_reresolution() {
            self.request_resolution();
        }
    }

    fn publish(&mut self, update: PickerUpdate, updates: &mut ChannelUpdates) {
        self.latest_update = Some(update.clone());
        // An IDLE child waits for demand: the published picker queues the
        // call and raises the exit-idle latch instead.
        let published = if update.state == ConnectivityState::Idle {
            PickerUpdate {
                state: ConnectivityState::Idle,
                picker: Arc::new(ExitIdleOnPick::new(self.exit_idle_latch.clone())),
            }
        } else {
            update
        };
        updates.picker = Some(published);
    }

    /// Earliest resolution-backoff deadline.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.backoff_deadline
    }

    /// Fire the resolution backoff timer: re-resolve if anyone asked
    /// meanwhile, otherwise re-publish the last child state.
    pub fn on_timeout(&mut self, updates: &mut ChannelUpdates, now: Instant) {
        let Some(deadline) = self.backoff_deadline else {
            return;
        };
        if deadline > now {
            return;
        }
        self.backoff_deadline = None;
        if std::mem::take(&mut self.continue_resolving) {
            self.resolver.resolve_now();
        } else if let Some(update) = self.latest_update.clone() {
            self.publish(update, updates);
        }
    }

    pub fn destroy(&mut self, pool: &mut SubchannelPool) {
        self.resolver.destroy();
        self.child.destroy(pool);
    }
}

/// Pick the first supported entry from `loadBalancingConfig`; fall back to
/// the `loadBalancingPolicy` string, then pick-first.
fn choose_policy(config: &ServiceConfig) -> Result<(String, serde_json::Value), Status> {
    if config.load_balancing_config.is_empty() {
        let policy = config
            .load_balancing_policy
            .clone()
            .unwrap_or_else(|| crate::pick_first::POLICY_NAME.to_owned());
        if is_supported(&policy) {
            return Ok((policy, serde_json::Value::Null));
        }
        return Err(Status::unavailable(
            "All load balancer options in service config are not compatible",
        ));
    }
    for entry in &config.load_balancing_config {
        if let Some(name) = entry.policy_name()
            && is_supported(name)
        {
            return Ok((name.to_owned(), entry.config().clone()));
        }
    }
    Err(Status::unavailable(
        "All load balancer options in service config are not compatible",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Endpoint};
    use crate::picker::{PickInfo, PickResult};
    use crate::service_config::LbConfigEntry;
    use crate::testing::MemoryNetwork;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Scripted resolver for driving the resolving LB by hand.
    #[derive(Default)]
    struct Script {
        queued: VecDeque<ResolverUpdate>,
        resolve_calls: usize,
    }

    #[derive(Clone, Default)]
    struct ScriptedResolver {
        script: Rc<RefCell<Script>>,
    }

    impl ScriptedResolver {
        fn push(&self, update: ResolverUpdate) {
            self.script.borrow_mut().queued.push_back(update);
        }

        fn resolve_calls(&self) -> usize {
            self.script.borrow().resolve_calls
        }
    }

    impl Resolver for ScriptedResolver {
        fn resolve_now(&mut self) {
            self.script.borrow_mut().resolve_calls += 1;
        }

        fn poll_update(&mut self) -> Option<ResolverUpdate> {
            self.script.borrow_mut().queued.pop_front()
        }
    }

    fn endpoints() -> Vec<Endpoint> {
        vec![Endpoint::from_address(Address::Tcp(
            "10.0.0.1:443".parse().unwrap(),
        ))]
    }

    fn setup() -> (
        ResolvingLoadBalancer,
        ScriptedResolver,
        SubchannelPool,
        MemoryNetwork,
    ) {
        let network = MemoryNetwork::new();
        let pool = SubchannelPool::new(
            Box::new(network.connector()),
            BackoffOptions {
                jitter: 0.0,
                ..BackoffOptions::default()
            },
        );
        let resolver = ScriptedResolver::default();
        let lb = ResolvingLoadBalancer::new(
            Box::new(resolver.clone()),
            ServiceConfig::default(),
            BackoffOptions {
                jitter: 0.0,
                ..BackoffOptions::default()
            },
        );
        (lb, resolver, pool, network)
    }

    /// Route pool state events through the resolving LB until quiescent.
    fn settle(
        lb: &mut ResolvingLoadBalancer,
        pool: &mut SubchannelPool,
        updates: &mut ChannelUpdates,
        now: Instant,
    ) {
        loop {
            let events = pool.drain_state_events();
            if events.is_empty() {
                break;
            }
            for (id, state) in events {
                lb.on_subchannel_state(pool, id, state, updates, now);
            }
        }
    }

    #[test]
    fn test_resolution_builds_child_and_publishes_ready() {
        let (mut lb, resolver, mut pool, _network) = setup();
        let mut updates = ChannelUpdates::default();
        let now = Instant::now();

        lb.exit_idle(&mut pool, &mut updates, now);
        assert_eq!(resolver.resolve_calls(), 1);
        resolver.push(ResolverUpdate::Resolved {
            endpoints: endpoints(),
            service_config: None,
        });
        lb.process(&mut pool, &mut updates, now);
        settle(&mut lb, &mut pool, &mut updates, now);

        let update = updates.picker.take().unwrap();
        assert_eq!(update.state, ConnectivityState::Ready);
        assert!(matches!(
            update.picker.pick(&PickInfo { path: "/s/m".into() }),
            PickResult::Complete { .. }
        ));
    }

    #[test]
    fn test_service_config_policy_selection() {
        let (mut lb, resolver, mut pool, _network) = setup();
        let mut updates = ChannelUpdates::default();
        let now = Instant::now();
        lb.exit_idle(&mut pool, &mut updates, now);

        let config = ServiceConfig {
            load_balancing_config: vec![
                LbConfigEntry::new("unsupported_fancy_policy", serde_json::json!({})),
                LbConfigEntry::new("round_robin", serde_json::json!({})),
            ],
            ..ServiceConfig::default()
        };
        resolver.push(ResolverUpdate::Resolved {
            endpoints: endpoints(),
            service_config: Some(Ok(config)),
        });
        lb.process(&mut pool, &mut updates, now);

        assert_eq!(lb.child.child_type(), Some("round_robin"));
        assert!(updates.service_config.is_some());
    }

    #[test]
    fn test_no_compatible_policy_fails() {
        let (mut lb, resolver, mut pool, _network) = setup();
        let mut updates = ChannelUpdates::default();
        let now = Instant::now();
        lb.exit_idle(&mut pool, &mut updates, now);

        let config = ServiceConfig {
            load_balancing_config: vec![LbConfigEntry::new(
                "unsupported_fancy_policy",
                serde_json::json!({}),
            )],
            ..ServiceConfig::default()
        };
        resolver.push(ResolverUpdate::Resolved {
            endpoints: endpoints(),
            service_config: Some(Ok(config)),
        });
        lb.process(&mut pool, &mut updates, now);

        let update = updates.picker.take().unwrap();
        assert_eq!(update.state, ConnectivityState::TransientFailure);
        match update.picker.pick(&PickInfo { path: "/s/m".into() }) {
            PickResult::TransientFailure(status) => {
                assert_eq!(
                    status.details(),
                    "All load balancer options in service config are not compatible"
                );
            }
            _ => panic!("expected transient failure"),
        }
    }

    #[test]
    fn test_resolution_failure_without_child_surfaces() {
        let (mut lb, resolver, mut pool, _network) = setup();
        let mut updates = ChannelUpdates::default();
        let now = Instant::now();
        lb.exit_idle(&mut pool, &mut updates, now);

        resolver.push(ResolverUpdate::Failed(Status::unavailable("NXDOMAIN")));
        lb.process(&mut pool, &mut updates, now);

        let update = updates.picker.take().unwrap();
        assert_eq!(update.state, ConnectivityState::TransientFailure);
        assert!(lb.next_timeout().is_some());
    }

    #[test]
    fn test_resolution_failure_keeps_previous_config_and_state() {
        let (mut lb, resolver, mut pool, _network) = setup();
        let mut updates = ChannelUpdates::default();
        let now = Instant::now();
        lb.exit_idle(&mut pool, &mut updates, now);

        let config = ServiceConfig {
            load_balancing_policy: Some("pick_first".to_owned()),
            ..ServiceConfig::default()
        };
        resolver.push(ResolverUpdate::Resolved {
            endpoints: endpoints(),
            service_config: Some(Ok(config.clone())),
        });
        lb.process(&mut pool, &mut updates, now);
        settle(&mut lb, &mut pool, &mut updates, now);
        let ready = updates.picker.take().unwrap();
        assert_eq!(ready.state, ConnectivityState::Ready);

        // Now the resolver reports (null SC, error): previous config stays
        // adopted and nothing is re-published.
        resolver.push(ResolverUpdate::Resolved {
            endpoints: endpoints(),
            service_config: Some(Err(Status::unavailable("TXT lookup failed"))),
        });
        lb.process(&mut pool, &mut updates, now);
        assert_eq!(lb.current_service_config(), Some(&config));
        let update = updates.picker.take().unwrap();
        assert_eq!(update.state, ConnectivityState::Ready);
    }

    #[test]
    fn test_backoff_gates_reresolution() {
        let (mut lb, resolver, mut pool, _network) = setup();
        let mut updates = ChannelUpdates::default();
        let now = Instant::now();
        lb.exit_idle(&mut pool, &mut updates, now);
        assert_eq!(resolver.resolve_calls(), 1);

        resolver.push(ResolverUpdate::Failed(Status::unavailable("NXDOMAIN")));
        lb.process(&mut pool, &mut updates, now);
        let deadline = lb.next_timeout().expect("backoff armed");

        // Requests during backoff only set the flag.
        lb.exit_idle(&mut pool, &mut updates, now);
        assert_eq!(resolver.resolve_calls(), 1);

        lb.on_timeout(&mut updates, deadline);
        assert_eq!(resolver.resolve_calls(), 2);
    }
}
