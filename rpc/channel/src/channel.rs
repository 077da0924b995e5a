//! The client channel: a logical connection to a target URI multiplexing
//! many calls.
//!
//! The channel owns the resolving load balancer, the subchannel pool, the
//! queue of calls awaiting a pick, and the last published (state, picker)
//! pair. Everything runs on the owner's thread: feed inputs, call
//! `process`, drain `poll_events`, and honor `next_timeout`.

use crate::connectivity::ConnectivityState;
use crate::picker::{PickInfo, PickResult, Picker, QueuePicker};
use crate::resolver::{create_resolver, default_authority};
use crate::resolving::{ChannelUpdates, ResolvingLoadBalancer};
use crate::service_config::ServiceConfig;
use crate::subchannel::{Connector, SubchannelId, SubchannelPool};
use crate::backoff::BackoffOptions;
use bytes::Bytes;
use rpc_call::{
    CallEvent, CallInfo, ClientCall, FilterFactory, FilterStack, MessageSizeFilterFactory,
    MessageSizeLimits,
};
use rpc_h2::SessionEvent;
use rpc_wire::{Code, Metadata, Status};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Per-call credentials: a metadata-producing callback given the service
/// URL, invoked on the channel's thread during call attachment.
pub trait CallCredentials {
    fn get_metadata(&self, service_url: &str) -> Result<Metadata, Status>;
}

/// Channel-wide options.
pub struct ChannelOptions {
    /// Override the `:authority` derived from the target.
    pub default_authority: Option<String>,
    /// `user-agent` header sent on every call.
    pub user_agent: String,
    /// Per-call filter factories, applied in order.
    pub filters: Vec<Arc<dyn FilterFactory>>,
    /// Service config used when the resolver provides none.
    pub default_service_config: ServiceConfig,
    /// Backoff tuning for connections and resolution.
    pub backoff: BackoffOptions,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            default_authority: None,
            user_agent: concat!("rpc-rust/", env!("CARGO_PKG_VERSION")).to_owned(),
            filters: Vec::new(),
            default_service_config: ServiceConfig::default(),
            backoff: BackoffOptions::default(),
        }
    }
}

/// Options for one call.
pub struct CallOptions {
    /// Method path, `/<service>/<method>`.
    pub path: String,
    /// Initial metadata.
    pub metadata: Metadata,
    /// Override the channel authority for this call.
    pub host: Option<String>,
    /// Absolute deadline; the method config's timeout applies when unset.
    pub deadline: Option<Instant>,
    /// Queue instead of failing while the channel has no connection.
    pub wait_for_ready: Option<bool>,
    /// Per-call credentials.
    pub credentials: Option<Arc<dyn CallCredentials>>,
}

impl CallOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            metadata: Metadata::new(),
            host: None,
            deadline: None,
            wait_for_ready: None,
            credentials: None,
        }
    }
}

/// Identifier of one call on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

/// Identifier of one connectivity watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Events drained from the channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// An event for one call.
    Call { id: CallId, event: CallEvent },
    /// The channel's aggregate connectivity changed.
    ConnectivityChange {
        previous: ConnectivityState,
        current: ConnectivityState,
    },
    /// A connectivity watch observed a state different from its baseline.
    WatchSatisfied { watch: WatchId, state: ConnectivityState },
    /// A connectivity watch hit its deadline first.
    WatchExpired { watch: WatchId },
}

struct CallRecord {
    call: ClientCall,
    wait_for_ready: bool,
    credentials: Option<Arc<dyn CallCredentials>>,
    subchannel: Option<SubchannelId>,
    tracker: Option<Arc<dyn crate::picker::CallTracker>>,
}

struct Watcher {
    id: WatchId,
    seen: ConnectivityState,
    deadline: Option<Instant>,
}

pub struct Channel {
    authority: String,
    options: ChannelOptions,
    lb: ResolvingLoadBalancer,
    pool: SubchannelPool,
    state: ConnectivityState,
    picker: Arc<dyn Picker>,
    service_config: ServiceConfig,
    calls: HashMap<CallId, CallRecord>,
    pick_queue: Vec<CallId>,
    stream_index: HashMap<(SubchannelId, u32), CallId>,
    watchers: Vec<Watcher>,
    events: Vec<ChannelEvent>,
    next_call_id: u64,
    next_watch_id: u64,
    shutdown: bool,
}

impl Channel {
    /// Create a channel for a target URI. Fails when no resolver accepts
    /// the target.
    pub fn new(
        target: &str,
        connector: Box<dyn Connector>,
        options: ChannelOptions,
    ) -> Result<Self, Status> {
        let (uri, resolver) = create_resolver(target)?;
        let authority = options
            .default_authority
            .clone()
            .unwrap_or_else(|| default_authority(&uri));
        let service_config = options.default_service_config.clone();
        let lb = ResolvingLoadBalancer::new(
            resolver,
            options.default_service_config.clone(),
            options.backoff,
        );
        let pool = SubchannelPool::new(connector, options.backoff);
        tracing::debug!(target: "rpc_channel::channel", uri = %uri, authority, "channel created");
        Ok(Self {
            authority,
            options,
            lb,
            pool,
            state: ConnectivityState::Idle,
            picker: Arc::new(QueuePicker),
            service_config,
            calls: HashMap::new(),
            pick_queue: Vec::new(),
            stream_index: HashMap::new(),
            watchers: Vec::new(),
            events: Vec::new(),
            next_call_id: 1,
            next_watch_id: 1,
            shutdown: false,
        })
    }

    /// Start a call. The call's events surface through `poll_events`.
    pub fn call(&mut self, options: CallOptions, now: Instant) -> Result<CallId, Status> {
        if self.shutdown {
            return Err(Status::unavailable("Channel closed"));
        }
        let method_config = self.service_config.select_method_config(&options.path);
        let deadline = options.deadline.or_else(|| {
            method_config
                .and_then(|mc| mc.timeout_duration())
                .map(|timeout| now + timeout)
        });
        let wait_for_ready = options
            .wait_for_ready
            .or_else(|| method_config.and_then(|mc| mc.wait_for_ready))
            .unwrap_or(false);
        let limits = MessageSizeLimits {
            max_request_bytes: method_config
                .and_then(|mc| mc.max_request_bytes)
                .map(|b| b as usize)
                .unwrap_or(rpc_wire::DEFAULT_MAX_MESSAGE_SIZE),
            max_response_bytes: method_config
                .and_then(|mc| mc.max_response_bytes)
                .map(|b| b as usize)
                .unwrap_or(rpc_wire::DEFAULT_MAX_MESSAGE_SIZE),
        };

        let info = CallInfo {
            path: options.path.clone(),
            authority: options.host.clone().unwrap_or_else(|| self.authority.clone()),
            deadline,
        };
        let mut factories = self.options.filters.clone();
        factories.push(Arc::new(MessageSizeFilterFactory::new(limits)));
        let filters = FilterStack::create(&factories, &info);

        let mut call = ClientCall::new(info, filters, limits.max_response_bytes);
        let started = call.start(options.metadata);

        let id = CallId(self.next_call_id);
        self.next_call_id += 1;
        self.calls.insert(
            id,
            CallRecord {
                call,
                wait_for_ready,
                credentials: options.credentials,
                subchannel: None,
                tracker: None,
            },
        );
        if started.is_ok() {
            if self.state == ConnectivityState::Idle {
                let mut updates = ChannelUpdates::default();
                self.lb.exit_idle(&mut self.pool, &mut updates, now);
                self.apply_updates(updates, now);
            }
            self.try_pick(id, now);
        }
        Ok(id)
    }

    /// Write one message on a call.
    pub fn send_message(&mut self, id: CallId, message: Bytes) {
        let Some(record) = self.calls.get_mut(&id) else {
            return;
        };
        let session = record
            .subchannel
            .and_then(|sub| self.pool.session_mut(sub));
        record.call.send_message(session, message);
    }

    /// The caller is done sending on a call.
    pub fn half_close(&mut self, id: CallId) {
        let Some(record) = self.calls.get_mut(&id) else {
            return;
        };
        let session = record
            .subchannel
            .and_then(|sub| self.pool.session_mut(sub));
        record.call.half_close(session);
    }

    /// Request delivery of the next response message on a call.
    pub fn start_read(&mut self, id: CallId) {
        let Some(record) = self.calls.get_mut(&id) else {
            return;
        };
        let session = record
            .subchannel
            .and_then(|sub| self.pool.session_mut(sub));
        record.call.start_read(session);
    }

    /// Cancel a call. No-op after the call has ended.
    pub fn cancel_call(&mut self, id: CallId, code: Code, details: &str) {
        let Some(record) = self.calls.get_mut(&id) else {
            return;
        };
        let session = record
            .subchannel
            .and_then(|sub| self.pool.session_mut(sub));
        record.call.cancel(session, code, details);
    }

    /// Current aggregate state; with `try_to_connect` an IDLE channel
    /// starts connecting.
    pub fn get_connectivity_state(&mut self, try_to_connect: bool, now: Instant) -> ConnectivityState {
        let state = self.state;
        if try_to_connect && state == ConnectivityState::Idle && !self.shutdown {
            let mut updates = ChannelUpdates::default();
            self.lb.exit_idle(&mut self.pool, &mut updates, now);
            self.apply_updates(updates, now);
        }
        state
    }

    /// Watch for any state other than `current`, with an optional
    /// deadline. Satisfied watches surface as channel events.
    pub fn watch_connectivity_state(
        &mut self,
        current: ConnectivityState,
        deadline: Option<Instant>,
    ) -> WatchId {
        let id = WatchId(self.next_watch_id);
        self.next_watch_id += 1;
        if self.state != current {
            self.events.push(ChannelEvent::WatchSatisfied {
                watch: id,
                state: self.state,
            });
        } else {
            self.watchers.push(Watcher {
                id,
                seen: current,
                deadline,
            });
        }
        id
    }

    /// Drive the channel: resolver progress, session events, subchannel
    /// state fan-out, and call event collection.
    pub fn process(&mut self, now: Instant) {
        if self.shutdown {
            self.collect_call_events();
            return;
        }
        let mut updates = ChannelUpdates::default();
        self.lb.process(&mut self.pool, &mut updates, now);
        self.apply_updates(updates, now);

        self.route_session_events(now);
        self.fan_out_subchannel_states(now);
        self.collect_call_events();
    }

    fn route_session_events(&mut self, now: Instant) {
        for subchannel in self.pool.ids() {
            let events = self.pool.drain_session_events(subchannel);
            let mut disconnected = false;
            for event in events {
                match event {
                    SessionEvent::Headers {
                        stream,
                        fields,
                        end_stream,
                    } => {
                        if let Some(&call_id) =
                            self.stream_index.get(&(subchannel, stream.value()))
                            && let Some(record) = self.calls.get_mut(&call_id)
                        {
                            record.call.on_headers(&fields, end_stream);
                        }
                    }
                    SessionEvent::Data {
                        stream,
                        data,
                        end_stream,
                    } => {
                        if let Some(&call_id) =
                            self.stream_index.get(&(subchannel, stream.value()))
                            && let Some(record) = self.calls.get_mut(&call_id)
                        {
                            let session = self.pool.session_mut(subchannel);
                            record.call.on_data(session, data, end_stream);
                        }
                    }
                    SessionEvent::StreamReset { stream, code } => {
                        if let Some(call_id) =
                            self.stream_index.remove(&(subchannel, stream.value()))
                            && let Some(record) = self.calls.get_mut(&call_id)
                        {
                            record.call.on_reset(code);
                        }
                    }
                    SessionEvent::GoAway { .. } | SessionEvent::Closed => {
                        disconnected = true;
                    }
                    SessionEvent::Ready => {}
                }
            }
            if disconnected {
                self.on_subchannel_disconnected(subchannel, now);
            }
        }
    }

    fn on_subchannel_disconnected(&mut self, subchannel: SubchannelId, now: Instant) {
        // Notify every in-flight call bound to this subchannel.
        let affected: Vec<CallId> = self
            .stream_index
            .iter()
            .filter(|((sub, _), _)| *sub == subchannel)
            .map(|(_, &call_id)| call_id)
            .collect();
        for call_id in affected {
            if let Some(record) = self.calls.get_mut(&call_id) {
                record.call.on_connection_dropped();
            }
        }
        self.stream_index.retain(|(sub, _), _| *sub != subchannel);
        self.pool.on_disconnect(subchannel, true, now);
    }

    fn fan_out_subchannel_states(&mut self, now: Instant) {
        loop {
            let transitions = self.pool.drain_state_events();
            if transitions.is_empty() {
                break;
            }
            for (id, state) in transitions {
                let mut updates = ChannelUpdates::default();
                self.lb
                    .on_subchannel_state(&mut self.pool, id, state, &mut updates, now);
                self.apply_updates(updates, now);
            }
        }
    }

    fn collect_call_events(&mut self) {
        let mut finished = Vec::new();
        for (&id, record) in self.calls.iter_mut() {
            for event in record.call.poll_events() {
                if let CallEvent::Complete(status) = &event {
                    if let Some(subchannel) = record.subchannel.take() {
                        self.stream_index
                            .retain(|(sub, stream), _| {
                                !(*sub == subchannel
                                    && record.call.stream_id().map(|s| s.value())
                                        == Some(*stream))
                            });
                        self.pool.call_unref(subchannel);
                    }
                    if let Some(tracker) = record.tracker.take() {
                        tracker.on_call_ended(status);
                    }
                    finished.push(id);
                }
                self.events.push(ChannelEvent::Call { id, event });
            }
        }
        for id in finished {
            self.calls.remove(&id);
        }
    }

    fn apply_updates(&mut self, mut updates: ChannelUpdates, now: Instant) {
        if let Some(config) = updates.service_config.take() {
            self.service_config = config;
        }
        if let Some(update) = updates.picker.take() {
            self.publish(update.state, update.picker, now);
        }
    }

    fn publish(&mut self, state: ConnectivityState, picker: Arc<dyn Picker>, now: Instant) {
        if state != self.state {
            tracing::debug!(
                target: "rpc_channel::channel",
                from = %self.state,
                to = %state,
                "channel state change"
            );
            let previous = self.state;
            self.state = state;
            self.events.push(ChannelEvent::ConnectivityChange {
                previous,
                current: state,
            });
            let mut satisfied = Vec::new();
            self.watchers.retain(|w| {
                if w.seen != state {
                    satisfied.push((w.id, state));
                    false
                } else {
                    true
                }
            });
            for (watch, state) in satisfied {
                self.events.push(ChannelEvent::WatchSatisfied { watch, state });
            }
        }
        self.picker = picker;

        // Every queued call is re-picked exactly once per publication.
        let queued = std::mem::take(&mut self.pick_queue);
        for id in queued {
            self.try_pick(id, now);
        }
    }

    fn try_pick(&mut self, id: CallId, now: Instant) {
        let Some(record) = self.calls.get(&id) else {
            return;
        };
        if record.call.is_terminated() {
            return;
        }
        let picker = self.picker.clone();
        let info = PickInfo {
            path: record.call.info().path.clone(),
        };
        match picker.pick(&info) {
            PickResult::Complete { subchannel, tracker } => {
                if self.pool.state(subchannel) != ConnectivityState::Ready {
                    // Stale picker; wait for the next publication.
                    self.pick_queue.push(id);
                    return;
                }
                self.attach_call(id, subchannel, tracker, now);
            }
            PickResult::Queue => self.pick_queue.push(id),
            PickResult::TransientFailure(status) => {
                let record = self.calls.get_mut(&id).unwrap();
                if record.wait_for_ready {
                    self.pick_queue.push(id);
                } else {
                    record.call.fail(status);
                }
            }
            PickResult::Drop(status) => {
                self.calls.get_mut(&id).unwrap().call.fail(status);
            }
        }
    }

    fn attach_call(
        &mut self,
        id: CallId,
        subchannel: SubchannelId,
        tracker: Option<Arc<dyn crate::picker::CallTracker>>,
        now: Instant,
    ) {
        let record = self.calls.get_mut(&id).unwrap();

        let credential_metadata = match &record.credentials {
            Some(credentials) => {
                let service_url = service_url(&record.call.info().authority, &record.call.info().path);
                match credentials.get_metadata(&service_url) {
                    Ok(metadata) => metadata,
                    Err(status) => {
                        record.call.fail(status);
                        return;
                    }
                }
            }
            None => Metadata::new(),
        };

        let Some(session) = self.pool.session_mut(subchannel) else {
            self.pick_queue.push(id);
            return;
        };
        let user_agent = self.options.user_agent.clone();
        if record
            .call
            .attach(session, credential_metadata, &user_agent, now)
            .is_ok()
        {
            record.subchannel = Some(subchannel);
            self.pool.call_ref(subchannel);
            if let Some(stream) = record.call.stream_id() {
                self.stream_index.insert((subchannel, stream.value()), id);
            }
            if let Some(tracker) = tracker {
                tracker.on_call_started();
                record.tracker = Some(tracker);
            }
        }
    }

    /// Drain channel events.
    pub fn poll_events(&mut self) -> Vec<ChannelEvent> {
        std::mem::take(&mut self.events)
    }

    /// Earliest pending timer across calls, subchannels, resolution
    /// backoff, and watches.
    pub fn next_timeout(&self) -> Option<Instant> {
        let call_deadlines = self
            .calls
            .values()
            .filter(|r| !r.call.is_terminated())
            .filter_map(|r| r.call.deadline());
        let watch_deadlines = self.watchers.iter().filter_map(|w| w.deadline);
        call_deadlines
            .chain(watch_deadlines)
            .chain(self.pool.next_timeout())
            .chain(self.lb.next_timeout())
            .min()
    }

    /// Fire due timers. Follow with `process` to observe the fallout.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.shutdown {
            return;
        }
        let expired: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, r)| {
                !r.call.is_terminated() && r.call.deadline().is_some_and(|d| d <= now)
            })
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            let record = self.calls.get_mut(&id).unwrap();
            let session = record
                .subchannel
                .and_then(|sub| self.pool.session_mut(sub));
            record.call.on_deadline(session);
        }

        self.pool.on_timeout(now);

        let mut updates = ChannelUpdates::default();
        self.lb.on_timeout(&mut updates, now);
        self.apply_updates(updates, now);

        let mut expired_watches = Vec::new();
        self.watchers.retain(|w| {
            if w.deadline.is_some_and(|d| d <= now) {
                expired_watches.push(w.id);
                false
            } else {
                true
            }
        });
        for watch in expired_watches {
            self.events.push(ChannelEvent::WatchExpired { watch });
        }
    }

    /// Shut the channel down: pending and active calls fail, subchannels
    /// are released, and no new calls are accepted.
    pub fn shutdown(&mut self, now: Instant) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        self.pick_queue.clear();
        let ids: Vec<CallId> = self.calls.keys().copied().collect();
        for id in ids {
            let record = self.calls.get_mut(&id).unwrap();
            let session = record
                .subchannel
                .and_then(|sub| self.pool.session_mut(sub));
            record.call.cancel(session, Code::Unavailable, "Channel closed");
        }
        self.collect_call_events();
        self.lb.destroy(&mut self.pool);
        self.pool.shutdown();
        self.publish(ConnectivityState::Shutdown, Arc::new(QueuePicker), now);
    }
}

/// The URL handed to call-credential providers:
/// `https://<authority-host>/<service>`.
fn service_url(authority: &str, path: &str) -> String {
    let host = authority.split(':').next().unwrap_or(authority);
    let service = path.split('/').nth(1).unwrap_or_default();
    format!("https://{}/{}", host, service)
}
