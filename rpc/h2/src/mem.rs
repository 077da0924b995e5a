//! In-memory session pair.
//!
//! Both halves share a queue pair and move events synchronously, preserving
//! per-stream ordering. Used by the memory connector and by every
//! integration test; no sockets, no framing.

use crate::session::{ClientSession, ServerSession, SessionEvent};
use crate::types::{HeaderField, RstCode, StreamId};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::rc::Rc;

#[derive(Default)]
struct Shared {
    to_client: Vec<SessionEvent>,
    to_server: Vec<SessionEvent>,
    next_stream_id: u32,
    reset_streams: HashSet<u32>,
    closed: bool,
}

impl Shared {
    fn new() -> Self {
        Self {
            next_stream_id: 1,
            ..Default::default()
        }
    }
}

/// Create a connected client/server session pair.
pub fn memory_pair() -> (MemoryClientSession, MemoryServerSession) {
    let shared = Rc::new(RefCell::new(Shared::new()));
    shared.borrow_mut().to_client.push(SessionEvent::Ready);
    shared.borrow_mut().to_server.push(SessionEvent::Ready);
    (
        MemoryClientSession {
            shared: shared.clone(),
        },
        MemoryServerSession { shared },
    )
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
}

/// Client half of an in-memory session.
pub struct MemoryClientSession {
    shared: Rc<RefCell<Shared>>,
}

impl ClientSession for MemoryClientSession {
    fn is_ready(&self) -> bool {
        !self.shared.borrow().closed
    }

    fn open_stream(
        &mut self,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> io::Result<StreamId> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            return Err(closed_err());
        }
        let stream = StreamId::new(shared.next_stream_id);
        shared.next_stream_id += 2;
        shared.to_server.push(SessionEvent::Headers {
            stream,
            fields,
            end_stream,
        });
        Ok(stream)
    }

    fn send_data(&mut self, stream: StreamId, data: Bytes, end_stream: bool) -> io::Result<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            return Err(closed_err());
        }
        if shared.reset_streams.contains(&stream.value()) {
            return Ok(());
        }
        shared.to_server.push(SessionEvent::Data {
            stream,
            data,
            end_stream,
        });
        Ok(())
    }

    fn reset_stream(&mut self, stream: StreamId, code: RstCode) -> io::Result<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            return Err(closed_err());
        }
        if shared.reset_streams.insert(stream.value()) {
            shared.to_server.push(SessionEvent::StreamReset { stream, code });
        }
        Ok(())
    }

    fn resume_stream(&mut self, _stream: StreamId) {
        // No flow control in memory.
    }

    fn poll_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.shared.borrow_mut().to_client)
    }

    fn close(&mut self) {
        let mut shared = self.shared.borrow_mut();
        if !shared.closed {
            shared.closed = true;
            shared.to_server.push(SessionEvent::Closed);
            shared.to_client.push(SessionEvent::Closed);
        }
    }
}

/// Server half of an in-memory session.
pub struct MemoryServerSession {
    shared: Rc<RefCell<Shared>>,
}

impl ServerSession for MemoryServerSession {
    fn is_ready(&self) -> bool {
        !self.shared.borrow().closed
    }

    fn send_headers(
        &mut self,
        stream: StreamId,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> io::Result<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            return Err(closed_err());
        }
        if shared.reset_streams.contains(&stream.value()) {
            return Ok(());
        }
        shared.to_client.push(SessionEvent::Headers {
            stream,
            fields,
            end_stream,
        });
        Ok(())
    }

    fn send_data(&mut self, stream: StreamId, data: Bytes, end_stream: bool) -> io::Result<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            return Err(closed_err());
        }
        if shared.reset_streams.contains(&stream.value()) {
            return Ok(());
        }
        shared.to_client.push(SessionEvent::Data {
            stream,
            data,
            end_stream,
        });
        Ok(())
    }

    fn reset_stream(&mut self, stream: StreamId, code: RstCode) -> io::Result<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            return Err(closed_err());
        }
        if shared.reset_streams.insert(stream.value()) {
            shared.to_client.push(SessionEvent::StreamReset { stream, code });
        }
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.shared.borrow_mut().to_server)
    }

    fn close(&mut self) {
        let mut shared = self.shared.borrow_mut();
        if !shared.closed {
            shared.closed = true;
            shared.to_client.push(SessionEvent::Closed);
            shared.to_server.push(SessionEvent::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_start_ready() {
        let (mut client, mut server) = memory_pair();
        assert!(client.is_ready());
        assert!(server.is_ready());
        assert!(matches!(client.poll_events()[..], [SessionEvent::Ready]));
        assert!(matches!(server.poll_events()[..], [SessionEvent::Ready]));
    }

    #[test]
    fn test_open_stream_allocates_odd_ids() {
        let (mut client, _server) = memory_pair();
        let first = client.open_stream(vec![], false).unwrap();
        let second = client.open_stream(vec![], false).unwrap();
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 3);
        assert!(first.is_client_initiated());
    }

    #[test]
    fn test_request_reaches_server_in_order() {
        let (mut client, mut server) = memory_pair();
        let stream = client
            .open_stream(vec![HeaderField::new(":path", "/svc/m")], false)
            .unwrap();
        client.send_data(stream, Bytes::from_static(b"a"), false).unwrap();
        client.send_data(stream, Bytes::from_static(b"b"), true).unwrap();

        let events = server.poll_events();
        assert!(matches!(events[0], SessionEvent::Ready));
        assert!(
            matches!(&events[1], SessionEvent::Headers { stream: s, fields, end_stream: false }
                if *s == stream && fields[0].value == b"/svc/m")
        );
        assert!(
            matches!(&events[2], SessionEvent::Data { data, end_stream: false, .. } if &data[..] == b"a")
        );
        assert!(
            matches!(&events[3], SessionEvent::Data { data, end_stream: true, .. } if &data[..] == b"b")
        );
    }

    #[test]
    fn test_response_reaches_client() {
        let (mut client, mut server) = memory_pair();
        let stream = client.open_stream(vec![], true).unwrap();
        server
            .send_headers(stream, vec![HeaderField::new(":status", "200")], false)
            .unwrap();
        server.send_data(stream, Bytes::from_static(b"resp"), false).unwrap();
        server
            .send_headers(stream, vec![HeaderField::new("grpc-status", "0")], true)
            .unwrap();

        let events = client.poll_events();
        assert_eq!(events.len(), 4); // Ready + headers + data + trailers
        assert!(matches!(&events[3], SessionEvent::Headers { end_stream: true, .. }));
    }

    #[test]
    fn test_reset_propagates_and_mutes_stream() {
        let (mut client, mut server) = memory_pair();
        let stream = client.open_stream(vec![], false).unwrap();
        server.reset_stream(stream, RstCode::Cancel).unwrap();

        // Writes after the reset are dropped silently.
        client.send_data(stream, Bytes::from_static(b"late"), false).unwrap();

        let client_events = client.poll_events();
        assert!(client_events.iter().any(
            |e| matches!(e, SessionEvent::StreamReset { code: RstCode::Cancel, stream: s } if *s == stream)
        ));
        let server_events = server.poll_events();
        assert!(
            !server_events.iter().any(|e| matches!(e, SessionEvent::Data { .. })),
            "data after reset must not arrive"
        );
    }

    #[test]
    fn test_close_notifies_both_sides() {
        let (mut client, mut server) = memory_pair();
        client.poll_events();
        server.poll_events();
        client.close();
        assert!(!client.is_ready());
        assert!(!server.is_ready());
        assert!(matches!(server.poll_events()[..], [SessionEvent::Closed]));
        assert!(matches!(client.poll_events()[..], [SessionEvent::Closed]));
        assert!(client.open_stream(vec![], false).is_err());
    }
}
