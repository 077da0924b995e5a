//! Per-connection server dispatcher.
//!
//! One [`Server`] instance drives one accepted HTTP/2 session: it turns
//! inbound streams into [`ServerCall`] machines, routes them to registered
//! handlers by `:path`, arms deadline timers, and sweeps finished calls.

use crate::registry::{ActiveCall, ServiceRegistry};
use bytes::Bytes;
use rpc_call::ServerCall;
use rpc_h2::{HeaderField, ServerSession, SessionEvent, StreamId};
use rpc_wire::{Metadata, Status, encode_status_details};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

/// Server tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub max_request_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_request_bytes: rpc_wire::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// The write half a handler sees: response metadata, messages, and the
/// final status.
pub struct Responder<'a> {
    session: &'a mut dyn ServerSession,
    call: &'a mut ServerCall,
}

impl Responder<'_> {
    pub fn metadata(&self) -> &Metadata {
        self.call.metadata()
    }

    pub fn path(&self) -> &str {
        self.call.path()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.call.deadline()
    }

    /// Emit response headers explicitly (the first message does it
    /// implicitly otherwise).
    pub fn send_metadata(&mut self, metadata: &Metadata) -> Result<(), Status> {
        self.call.send_metadata(self.session, metadata)
    }

    /// Stream one response message.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<(), Status> {
        self.call.send_message(self.session, payload)
    }

    /// End the call. The status's attached metadata rides the trailers.
    pub fn finish(&mut self, status: &Status) {
        if let Err(e) = self.call.finish(self.session, status) {
            tracing::debug!(
                target: "rpc_server",
                path = %self.call.path(),
                error = %e,
                "finish after call end ignored"
            );
        }
    }
}

struct Entry {
    call: ServerCall,
    active: Option<Box<dyn ActiveCall>>,
    buffered: Vec<Bytes>,
}

/// Drives one server-side connection against a method registry.
pub struct Server {
    registry: Rc<ServiceRegistry>,
    session: Box<dyn ServerSession>,
    options: ServerOptions,
    calls: HashMap<u32, Entry>,
    closed: bool,
}

impl Server {
    pub fn new(
        registry: Rc<ServiceRegistry>,
        session: Box<dyn ServerSession>,
        options: ServerOptions,
    ) -> Self {
        Self {
            registry,
            session,
            options,
            calls: HashMap::new(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drain session events and dispatch them.
    pub fn process(&mut self, now: Instant) {
        let events = self.session.poll_events();
        for event in events {
            match event {
                SessionEvent::Headers {
                    stream,
                    fields,
                    end_stream,
                } => self.on_request_headers(stream, &fields, end_stream, now),
                SessionEvent::Data {
                    stream,
                    data,
                    end_stream,
                } => self.on_request_data(stream, data, end_stream),
                SessionEvent::StreamReset { stream, .. } => {
                    if let Some(mut entry) = self.calls.remove(&stream.value()) {
                        entry.call.on_peer_reset();
                        if let (Some(active), Some(status)) =
                            (entry.active.as_mut(), entry.call.cancelled_status())
                        {
                            active.on_cancel(status);
                        }
                    }
                }
                SessionEvent::GoAway { .. } | SessionEvent::Closed => self.on_connection_closed(),
                SessionEvent::Ready => {}
            }
        }
        self.calls.retain(|_, entry| !entry.call.is_ended());
    }

    fn on_request_headers(
        &mut self,
        stream: StreamId,
        fields: &[HeaderField],
        end_stream: bool,
        now: Instant,
    ) {
        let call = match ServerCall::accept(stream, fields, now, self.options.max_request_bytes) {
            Ok(call) => call,
            Err(status) => {
                send_trailers_only(self.session.as_mut(), stream, &status);
                return;
            }
        };

        let Some(handler) = self.registry.lookup(call.path()) else {
            tracing::debug!(target: "rpc_server", path = %call.path(), "no handler for path");
            let mut call = call;
            let _ = call.finish(
                self.session.as_mut(),
                &Status::unimplemented("The server does not implement this method"),
            );
            return;
        };

        let kind = handler.kind();
        let mut entry = Entry {
            call,
            active: None,
            buffered: Vec::new(),
        };
        if kind.starts_immediately() {
            let mut responder = Responder {
                session: self.session.as_mut(),
                call: &mut entry.call,
            };
            entry.active = Some(handler.start(&mut responder));
        }
        self.calls.insert(stream.value(), entry);
        if end_stream {
            self.on_half_close(stream);
        }
    }

    fn on_request_data(&mut self, stream: StreamId, data: Bytes, end_stream: bool) {
        let Some(entry) = self.calls.get_mut(&stream.value()) else {
            return;
        };
        match entry.call.on_data(data, end_stream) {
            Ok(messages) => {
                if entry.active.is_some() {
                    for message in messages {
                        let Some(active) = entry.active.as_mut() else {
                            break;
                        };
                        let mut responder = Responder {
                            session: self.session.as_mut(),
                            call: &mut entry.call,
                        };
                        active.on_message(&mut responder, message);
                        if entry.call.is_ended() {
                            break;
                        }
                    }
                } else {
                    entry.buffered.extend(messages);
                }
            }
            Err(status) => {
                let _ = entry.call.finish(self.session.as_mut(), &status);
                return;
            }
        }
        if end_stream {
            self.on_half_close(stream);
        }
    }

    fn on_half_close(&mut self, stream: StreamId) {
        let Some(entry) = self.calls.get_mut(&stream.value()) else {
            return;
        };
        if entry.call.is_ended() {
            return;
        }
        if entry.active.is_none() {
            // Unary and client-streaming handlers start once the request
            // side is complete.
            let Some(handler) = self.registry.lookup(entry.call.path()) else {
                return;
            };
            let mut responder = Responder {
                session: self.session.as_mut(),
                call: &mut entry.call,
            };
            entry.active = Some(handler.start(&mut responder));
        }
        let Some(active) = entry.active.as_mut() else {
            return;
        };
        for message in std::mem::take(&mut entry.buffered) {
            let mut responder = Responder {
                session: self.session.as_mut(),
                call: &mut entry.call,
            };
            active.on_message(&mut responder, message);
            if entry.call.is_ended() {
                return;
            }
        }
        let mut responder = Responder {
            session: self.session.as_mut(),
            call: &mut entry.call,
        };
        active.on_half_close(&mut responder);
    }

    fn on_connection_closed(&mut self) {
        self.closed = true;
        let status = Status::cancelled("Connection closed");
        for (_, entry) in self.calls.iter_mut() {
            entry.call.on_peer_reset();
            if let Some(active) = entry.active.as_mut() {
                active.on_cancel(&status);
            }
        }
        self.calls.clear();
    }

    /// Earliest armed request deadline.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.calls
            .values()
            .filter(|e| !e.call.is_ended())
            .filter_map(|e| e.call.deadline())
            .min()
    }

    /// Fire due deadlines: the stream resets and the handler learns it
    /// cannot write anymore.
    pub fn on_timeout(&mut self, now: Instant) {
        for (_, entry) in self.calls.iter_mut() {
            if entry.call.is_ended() || !entry.call.deadline().is_some_and(|d| d <= now) {
                continue;
            }
            entry.call.on_deadline(self.session.as_mut());
            if let (Some(active), Some(status)) =
                (entry.active.as_mut(), entry.call.cancelled_status())
            {
                active.on_cancel(status);
            }
        }
        self.calls.retain(|_, entry| !entry.call.is_ended());
    }
}

/// Trailers-only error response for streams that never became a call.
fn send_trailers_only(session: &mut dyn ServerSession, stream: StreamId, status: &Status) {
    let mut fields = vec![
        HeaderField::new(":status", "200"),
        HeaderField::new("content-type", "application/grpc+proto"),
        HeaderField::new("grpc-status", status.code().as_u32().to_string()),
    ];
    if !status.details().is_empty() {
        fields.push(HeaderField::new(
            "grpc-message",
            encode_status_details(status.details()),
        ));
    }
    let _ = session.send_headers(stream, fields, true);
}
