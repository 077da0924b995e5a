//! rpc-channel - the client channel subsystem.
//!
//! A channel turns a logical target URI into a dynamically evolving set of
//! backend connections governed by a pluggable load-balancing policy and
//! name resolver:
//!
//! - `resolver`: scheme registry and the built-in `dns` / `ipv4` / `ipv6` /
//!   `unix` resolvers
//! - `service_config`: the service-config JSON model, validation, and the
//!   TXT-record canary selection algorithm
//! - `subchannel`: per-address connections with connectivity state,
//!   reference counts, and backoff
//! - `load_balancing`, `pick_first`, `round_robin`: the policy plane
//! - `resolving`: the resolver + child-policy composition
//! - `channel`: the public channel object with its pick queue
//!
//! Everything is sans-io and single-threaded per channel: feed inputs,
//! `process()`, drain `poll_events()`, honor `next_timeout()`.

mod address;
mod backoff;
mod channel;
mod connectivity;
mod load_balancing;
mod pick_first;
mod picker;
mod resolver;
mod resolving;
mod round_robin;
mod service_config;
mod subchannel;
pub mod testing;
mod uri;

pub use address::{Address, Endpoint};
pub use backoff::{Backoff, BackoffOptions};
pub use channel::{
    CallCredentials, CallId, CallOptions, Channel, ChannelEvent, ChannelOptions, WatchId,
};
pub use connectivity::{ConnectivityState, aggregate};
pub use load_balancing::{
    ChildPolicyHandler, LbActions, LoadBalancer, create_load_balancer, is_supported,
    register_defaults, register_load_balancer,
};
pub use picker::{CallTracker, ExitIdleOnPick, FailPicker, PickInfo, PickResult, Picker, QueuePicker};
pub use resolver::{
    DEFAULT_PORT, DEFAULT_SCHEME, DnsResolver, FixedResolver, LookupFn, Resolver, ResolverUpdate,
    create_resolver, default_authority, register_resolver, scheme_supported,
};
pub use resolving::{ChannelUpdates, ResolvingLoadBalancer};
pub use service_config::{
    CLIENT_LANGUAGE, LbConfigEntry, MethodConfig, MethodName, ServiceConfig, ServiceConfigError,
    select_service_config,
};
pub use subchannel::{Connector, SubchannelId, SubchannelPool};
pub use uri::{TargetParseError, TargetUri};
