//! rpc-server - server-side dispatch for the RPC runtime.
//!
//! A [`ServiceRegistry`] maps method paths to handlers; a [`Server`] drives
//! one accepted HTTP/2 session against that registry, turning inbound
//! streams into server calls and deadline timers. Handlers deal in framed
//! bytes; message serialization stays with the application.

mod dispatch;
mod registry;

pub use dispatch::{Responder, Server, ServerOptions};
pub use registry::{
    ActiveCall, MethodHandler, MethodKind, RegistryError, ServiceRegistry, UnaryReply, UnaryResult,
    unary,
};
