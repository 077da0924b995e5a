//! Session traits: the seam between the RPC runtime and an HTTP/2 library.
//!
//! The runtime needs only a small slice of HTTP/2: open a stream with
//! headers, move DATA both ways, receive trailers, reset streams, and learn
//! about connection teardown. Flow control, settings, ping and the rest stay
//! behind this boundary.

use crate::types::{HeaderField, RstCode, StreamId};
use bytes::Bytes;
use std::io;

/// Events produced by a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// Session is ready to carry streams.
    Ready,
    /// Received a header block for a stream. A block with `end_stream` set
    /// after data (or a second block) carries trailers.
    Headers {
        stream: StreamId,
        fields: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Received data for a stream.
    Data {
        stream: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// Stream was reset by the peer.
    StreamReset { stream: StreamId, code: RstCode },
    /// Peer is shutting the connection down; no new streams.
    GoAway { code: RstCode },
    /// Connection is gone.
    Closed,
}

/// Client side of one HTTP/2 connection.
pub trait ClientSession {
    /// Check if the session can open streams.
    fn is_ready(&self) -> bool;

    /// Open a new stream with the given request headers.
    fn open_stream(&mut self, fields: Vec<HeaderField>, end_stream: bool)
    -> io::Result<StreamId>;

    /// Write data on a stream.
    fn send_data(&mut self, stream: StreamId, data: Bytes, end_stream: bool) -> io::Result<()>;

    /// Reset a stream.
    fn reset_stream(&mut self, stream: StreamId, code: RstCode) -> io::Result<()>;

    /// Resume reading a stream after the application consumed a message
    /// (flow-control window release).
    fn resume_stream(&mut self, stream: StreamId);

    /// Drain pending events.
    fn poll_events(&mut self) -> Vec<SessionEvent>;

    /// Close the connection.
    fn close(&mut self);
}

/// Server side of one HTTP/2 connection.
pub trait ServerSession {
    /// Check if the session is up.
    fn is_ready(&self) -> bool;

    /// Send a header block on a stream. With `end_stream` set this is a
    /// trailers (or trailers-only) block.
    fn send_headers(
        &mut self,
        stream: StreamId,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> io::Result<()>;

    /// Write data on a stream.
    fn send_data(&mut self, stream: StreamId, data: Bytes, end_stream: bool) -> io::Result<()>;

    /// Reset a stream.
    fn reset_stream(&mut self, stream: StreamId, code: RstCode) -> io::Result<()>;

    /// Drain pending events.
    fn poll_events(&mut self) -> Vec<SessionEvent>;

    /// Close the connection.
    fn close(&mut self);
}
