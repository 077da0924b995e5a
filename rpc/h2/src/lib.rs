//! rpc-h2 - the HTTP/2 session boundary for the RPC runtime.
//!
//! The HTTP/2 implementation itself is an external collaborator. This crate
//! pins down the slice of it the runtime relies on: stream identifiers, raw
//! header fields, RST_STREAM codes, session traits for the client and server
//! side of one connection, and an in-memory session pair used by tests and
//! the memory connector.

mod mem;
mod session;
mod types;

pub use mem::{MemoryClientSession, MemoryServerSession, memory_pair};
pub use session::{ClientSession, ServerSession, SessionEvent};
pub use types::{HeaderField, RstCode, StreamId};
