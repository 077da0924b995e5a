//! rpc-call - per-call state machines for the RPC runtime.
//!
//! This crate drives one RPC over one HTTP/2 stream, on both sides:
//!
//! - `filter`: the per-call filter chain (five asynchronous points composed
//!   send-forward / receive-reverse)
//! - `client`: the client call state machine, from start through metadata,
//!   framed messages, trailers, and a once-latched final status
//! - `server`: the server call state machine, from header parse and
//!   deadline arming through the response sequence
//!
//! Calls are sans-io: the channel (client side) and the dispatcher (server
//! side) feed session events in and drain application events out.

mod client;
mod filter;
mod server;

pub use client::{CallEvent, CallPhase, ClientCall, rst_status};
pub use filter::{
    CallFilter, CallInfo, FilterFactory, FilterResult, FilterStack, MessageSizeFilter,
    MessageSizeFilterFactory, MessageSizeLimits, reclassify_receive_failure,
};
pub use server::ServerCall;
