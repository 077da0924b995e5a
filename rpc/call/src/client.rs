//! Client call state machine.
//!
//! Drives one RPC over one HTTP/2 stream: outgoing metadata through the
//! filter chain, length-prefixed writes, read-pulled message delivery, and
//! a final status that latches exactly once. The channel owns instances of
//! [`ClientCall`] and routes session events to them; events for the
//! application are drained with [`ClientCall::poll_events`], which is the
//! deferred tick that keeps listener callbacks out of transport callbacks.

use crate::filter::{CallInfo, FilterResult, FilterStack, reclassify_receive_failure};
use bytes::Bytes;
use rpc_wire::{
    Code, FrameError, MessageDecoder, Metadata, Status, decode_status_details, encode_message,
    format_timeout,
};
use rpc_h2::{ClientSession, HeaderField, RstCode, StreamId};
use std::collections::VecDeque;
use std::time::Instant;

/// Lifecycle of a client call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Created, not yet started.
    NotStarted,
    /// Started; waiting for the channel to produce a subchannel.
    PickPending,
    /// Bound to a transport stream.
    Attached,
    /// We sent our last message.
    HalfClosedLocal,
    /// The peer sent its last frame; trailers may still be pending.
    HalfClosedRemote,
    /// Final status latched.
    Ended,
}

/// Events delivered to the application, in order.
#[derive(Debug)]
pub enum CallEvent {
    /// Response metadata. Delivered before any message.
    Metadata(Metadata),
    /// One response message. Delivered in receive order.
    Message(Bytes),
    /// Final status. Delivered exactly once, after the last message.
    Complete(Status),
}

/// Map an RST_STREAM code to a call status.
pub fn rst_status(code: RstCode) -> Status {
    match code {
        RstCode::RefusedStream => Status::unavailable("Stream refused by server"),
        RstCode::Cancel => Status::cancelled("Call cancelled"),
        RstCode::EnhanceYourCalm => Status::resource_exhausted("Bandwidth exhausted"),
        RstCode::InadequateSecurity => {
            Status::new(Code::PermissionDenied, "Protocol not secure enough")
        }
        other => Status::internal(format!(
            "Received RST_STREAM with code {}",
            other.as_u32()
        )),
    }
}

fn frame_error_status(err: FrameError) -> Status {
    match err {
        FrameError::MessageTooLarge { length, limit } => Status::resource_exhausted(format!(
            "Received message larger than max ({} vs. {})",
            length, limit
        )),
        FrameError::InvalidCompressionFlag(flag) => {
            Status::internal(format!("Invalid compression flag: {}", flag))
        }
    }
}

/// Headers the metadata layer must never surface as response metadata.
const RESERVED_HEADERS: [&str; 3] = ["grpc-encoding", "grpc-accept-encoding", "content-type"];

/// Trailer keys consumed while building the status.
const RESERVED_TRAILERS: [&str; 3] = ["grpc-status", "grpc-message", "content-type"];

pub struct ClientCall {
    info: CallInfo,
    filters: FilterStack,
    phase: CallPhase,

    /// Outgoing metadata, already filtered, waiting for attach.
    outgoing_metadata: Option<Metadata>,
    /// At most one buffered outbound message (the caller is a single-writer
    /// stream, not a queue).
    pending_write: Option<Bytes>,
    half_close_requested: bool,
    half_closed_local: bool,

    stream: Option<StreamId>,
    decoder: MessageDecoder,
    saw_initial_metadata: bool,
    http_status: Option<u16>,

    /// Messages decoded and filtered but not yet pulled by `start_read`.
    unpushed: VecDeque<Bytes>,
    read_pending: bool,

    final_status: Option<Status>,
    status_emitted: bool,
    events: Vec<CallEvent>,
}

impl ClientCall {
    pub fn new(info: CallInfo, filters: FilterStack, max_response_bytes: usize) -> Self {
        Self {
            info,
            filters,
            phase: CallPhase::NotStarted,
            outgoing_metadata: None,
            pending_write: None,
            half_close_requested: false,
            half_closed_local: false,
            stream: None,
            decoder: MessageDecoder::new(max_response_bytes),
            saw_initial_metadata: false,
            http_status: None,
            unpushed: VecDeque::new(),
            read_pending: false,
            final_status: None,
            status_emitted: false,
            events: Vec::new(),
        }
    }

    pub fn phase(&self) -> CallPhase {
        if self.status_emitted {
            return CallPhase::Ended;
        }
        self.phase
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.info.deadline
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream
    }

    /// The final status has latched; no further inputs change the outcome.
    pub fn is_terminated(&self) -> bool {
        self.final_status.is_some()
    }

    /// Run outgoing metadata through the send filters and enter the pick
    /// phase. Filter failures surface synchronously.
    pub fn start(&mut self, metadata: Metadata) -> Result<(), Status> {
        debug_assert_eq!(self.phase, CallPhase::NotStarted);
        match self.filters.send_metadata(metadata) {
            FilterResult::Continue(md) => {
                self.outgoing_metadata = Some(md);
                self.phase = CallPhase::PickPending;
                Ok(())
            }
            FilterResult::Fail(status) => {
                self.end_abruptly(status.clone());
                Err(status)
            }
        }
    }

    /// Bind the call to a READY session: merge credential metadata, build
    /// the request headers, open the stream, and flush any buffered write.
    ///
    /// A duplicated `authorization` entry after the merge is an INTERNAL
    /// error; the caller ends the call with the returned status.
    pub fn attach(
        &mut self,
        session: &mut dyn ClientSession,
        credential_metadata: Metadata,
        user_agent: &str,
        now: Instant,
    ) -> Result<(), Status> {
        if self.is_terminated() {
            return Ok(());
        }
        debug_assert_eq!(self.phase, CallPhase::PickPending);

        let mut metadata = self.outgoing_metadata.take().unwrap_or_default();
        metadata.merge(&credential_metadata);
        if metadata.get("authorization").len() > 1 {
            let status = Status::internal("Duplicate authorization metadata");
            self.end_abruptly(status.clone());
            return Err(status);
        }

        let service = self.info.path.split('/').nth(1).unwrap_or_default();
        tracing::debug!(
            target: "rpc_call::client",
            path = %self.info.path,
            service,
            "attaching call to transport stream"
        );

        let mut fields = vec![
            HeaderField::new(":method", "POST"),
            HeaderField::new(":scheme", "https"),
            HeaderField::new(":path", self.info.path.as_str()),
            HeaderField::new(":authority", self.info.authority.as_str()),
            HeaderField::new("te", "trailers"),
            HeaderField::new("content-type", "application/grpc+proto"),
            HeaderField::new("user-agent", user_agent),
            HeaderField::new("grpc-encoding", "identity"),
        ];
        if let Some(deadline) = self.info.deadline {
            let remaining = deadline.saturating_duration_since(now);
            fields.push(HeaderField::new("grpc-timeout", format_timeout(remaining)));
        }
        for (name, value) in metadata.to_wire() {
            fields.push(HeaderField::new(name, value));
        }

        match session.open_stream(fields, false) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.phase = CallPhase::Attached;
            }
            Err(e) => {
                let status = Status::unavailable(format!("Failed to start stream: {}", e));
                self.end_abruptly(status.clone());
                return Err(status);
            }
        }

        if let Some(framed) = self.pending_write.take() {
            let end = self.half_close_requested;
            self.write_data(session, framed, end);
        } else if self.half_close_requested {
            self.write_data(session, Bytes::new(), true);
        }
        Ok(())
    }

    fn write_data(&mut self, session: &mut dyn ClientSession, data: Bytes, end_stream: bool) {
        let Some(stream) = self.stream else { return };
        if end_stream {
            self.half_closed_local = true;
            if self.phase == CallPhase::Attached {
                self.phase = CallPhase::HalfClosedLocal;
            }
        }
        if let Err(e) = session.send_data(stream, data, end_stream) {
            self.end_abruptly(Status::unavailable(format!("Write failed: {}", e)));
        }
    }

    /// Push one message through the send filters and out. Before attach, a
    /// single message is buffered. A pending half-close is honored only
    /// after the write filter resolves.
    pub fn send_message(&mut self, session: Option<&mut dyn ClientSession>, message: Bytes) {
        if self.is_terminated() || self.half_closed_local {
            return;
        }
        let framed = match self.filters.send_message(message) {
            FilterResult::Continue(m) => encode_message(&m),
            FilterResult::Fail(status) => {
                // Send-chain failures cancel the call locally.
                self.cancel(session, status.code(), status.details());
                return;
            }
        };
        match (self.stream, session) {
            (Some(_), Some(session)) => {
                let end = self.half_close_requested;
                self.write_data(session, framed, end);
            }
            _ => {
                debug_assert!(self.pending_write.is_none(), "single-writer violated");
                self.pending_write = Some(framed);
            }
        }
    }

    /// Mark the local side done sending. Monotonic.
    pub fn half_close(&mut self, session: Option<&mut dyn ClientSession>) {
        if self.is_terminated() || self.half_close_requested {
            return;
        }
        self.half_close_requested = true;
        if self.pending_write.is_none()
            && self.stream.is_some()
            && let Some(session) = session
        {
            self.write_data(session, Bytes::new(), true);
        }
    }

    /// Pull one message up. Buffered messages deliver on this tick;
    /// otherwise the stream's flow-control window is resumed and the next
    /// decoded message delivers directly.
    pub fn start_read(&mut self, session: Option<&mut dyn ClientSession>) {
        if self.status_emitted {
            return;
        }
        if let Some(message) = self.unpushed.pop_front() {
            self.events.push(CallEvent::Message(message));
            self.maybe_emit_status();
            return;
        }
        self.read_pending = true;
        if let (Some(stream), Some(session)) = (self.stream, session) {
            session.resume_stream(stream);
        }
    }

    /// Cancel the call: reset the stream and latch the given status.
    /// A no-op once the call has ended, no matter how often it is called.
    pub fn cancel(&mut self, session: Option<&mut dyn ClientSession>, code: Code, details: &str) {
        if self.is_terminated() {
            return;
        }
        if let (Some(stream), Some(session)) = (self.stream, session) {
            let _ = session.reset_stream(stream, RstCode::Cancel);
        }
        self.end_abruptly(Status::new(code, details));
    }

    /// Deadline timer fired.
    pub fn on_deadline(&mut self, session: Option<&mut dyn ClientSession>) {
        self.cancel(session, Code::DeadlineExceeded, "Deadline exceeded");
    }

    /// Response header block arrived.
    pub fn on_headers(&mut self, fields: &[HeaderField], end_stream: bool) {
        if self.is_terminated() {
            return;
        }
        for field in fields {
            if field.name == b":status"
                && let Ok(text) = std::str::from_utf8(&field.value)
                && let Ok(code) = text.parse::<u16>()
            {
                self.http_status = Some(code);
            }
        }
        let pairs: Vec<(&str, &[u8])> = fields
            .iter()
            .filter_map(|f| {
                std::str::from_utf8(&f.name)
                    .ok()
                    .map(|name| (name, f.value.as_slice()))
            })
            .collect();
        let (mut metadata, decode_errors) = Metadata::from_wire(pairs);
        for err in &decode_errors {
            tracing::warn!(target: "rpc_call::client", %err, "skipping undecodable metadata entry");
        }

        if !self.saw_initial_metadata && !end_stream {
            self.saw_initial_metadata = true;
            for key in RESERVED_HEADERS {
                let _ = metadata.remove(key);
            }
            match self.filters.receive_metadata(metadata) {
                FilterResult::Continue(md) => self.events.push(CallEvent::Metadata(md)),
                FilterResult::Fail(status) => {
                    self.end_abruptly(reclassify_receive_failure(status));
                }
            }
            return;
        }

        // Trailers, or a trailers-only response.
        if matches!(self.phase, CallPhase::Attached | CallPhase::HalfClosedLocal) {
            self.phase = CallPhase::HalfClosedRemote;
        }
        let status = self.status_from_trailers(metadata);
        match self.filters.receive_trailers(status) {
            FilterResult::Continue(status) => self.end_gracefully(status),
            FilterResult::Fail(status) => self.end_abruptly(reclassify_receive_failure(status)),
        }
    }

    fn status_from_trailers(&self, mut trailers: Metadata) -> Status {
        let code = match trailers.get_str("grpc-status").map(str::parse::<u32>) {
            Some(Ok(value)) => Code::from_u32(value),
            _ => match self.http_status {
                Some(http) => Code::from_http_status(http),
                None => Code::Unknown,
            },
        };
        let details = match trailers.get_str("grpc-message") {
            Some(wire) => decode_status_details(wire),
            None if trailers.contains_key("grpc-status") => String::new(),
            None => match self.http_status {
                Some(http) => format!("Received HTTP status code {}", http),
                None => "No status information available".to_owned(),
            },
        };
        for key in RESERVED_TRAILERS {
            let _ = trailers.remove(key);
        }
        Status::with_metadata(code, details, trailers)
    }

    /// DATA arrived: feed the decoder and run each complete frame through
    /// the receive-message filter. Messages either deliver into a pending
    /// read or queue for the next `start_read`.
    pub fn on_data(
        &mut self,
        session: Option<&mut dyn ClientSession>,
        data: Bytes,
        end_stream: bool,
    ) {
        if self.is_terminated() {
            return;
        }
        self.decoder.feed(&data);
        loop {
            match self.decoder.next_message() {
                Ok(Some(message)) => match self.filters.receive_message(message) {
                    FilterResult::Continue(message) => {
                        if self.read_pending {
                            self.read_pending = false;
                            self.events.push(CallEvent::Message(message));
                        } else {
                            self.unpushed.push_back(message);
                        }
                    }
                    FilterResult::Fail(status) => {
                        self.end_abruptly(reclassify_receive_failure(status));
                        return;
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    if let (Some(stream), Some(session)) = (self.stream, session) {
                        let _ = session.reset_stream(stream, RstCode::Cancel);
                    }
                    self.end_abruptly(frame_error_status(err));
                    return;
                }
            }
        }
        if end_stream {
            if matches!(self.phase, CallPhase::Attached | CallPhase::HalfClosedLocal) {
                self.phase = CallPhase::HalfClosedRemote;
            }
            // Stream ended without a trailers block.
            let status = self.status_from_trailers(Metadata::new());
            self.end_gracefully(status);
        }
    }

    /// Peer reset the stream. Trailers received earlier win over the
    /// mapped code because the status has already latched by then.
    pub fn on_reset(&mut self, code: RstCode) {
        if self.is_terminated() {
            return;
        }
        self.end_abruptly(rst_status(code));
    }

    /// The subchannel's connection went away under the call.
    pub fn on_connection_dropped(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.end_abruptly(Status::unavailable("Connection dropped"));
    }

    /// End the call locally, e.g. on a failed pick.
    pub fn fail(&mut self, status: Status) {
        if self.is_terminated() {
            return;
        }
        self.end_abruptly(status);
    }

    /// Graceful end: buffered messages still deliver before the status.
    fn end_gracefully(&mut self, status: Status) {
        if self.final_status.is_some() {
            return;
        }
        self.final_status = Some(status);
        self.maybe_emit_status();
    }

    /// Abrupt end: undelivered messages are dropped so nothing follows the
    /// status.
    fn end_abruptly(&mut self, status: Status) {
        if self.final_status.is_some() {
            return;
        }
        self.final_status = Some(status);
        self.unpushed.clear();
        self.maybe_emit_status();
    }

    /// Status is held back while messages are still queued for delivery.
    fn maybe_emit_status(&mut self) {
        if self.status_emitted || !self.unpushed.is_empty() {
            return;
        }
        if let Some(status) = self.final_status.clone() {
            tracing::debug!(
                target: "rpc_call::client",
                path = %self.info.path,
                code = %status.code(),
                "call complete"
            );
            self.phase = CallPhase::Ended;
            self.status_emitted = true;
            self.events.push(CallEvent::Complete(status));
        }
    }

    /// Drain pending application events. This is the deferred tick: nothing
    /// reaches the application from inside a transport callback.
    pub fn poll_events(&mut self) -> Vec<CallEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_h2::{MemoryServerSession, ServerSession, SessionEvent, memory_pair};

    fn call_info() -> CallInfo {
        CallInfo {
            path: "/echo.Echoer/Say".into(),
            authority: "localhost:50051".into(),
            deadline: None,
        }
    }

    fn new_call() -> ClientCall {
        ClientCall::new(call_info(), FilterStack::empty(), 4 * 1024 * 1024)
    }

    /// Route pending client-session events into the call.
    fn pump(call: &mut ClientCall, session: &mut rpc_h2::MemoryClientSession) {
        for event in session.poll_events() {
            match event {
                SessionEvent::Headers { fields, end_stream, .. } => {
                    call.on_headers(&fields, end_stream)
                }
                SessionEvent::Data { data, end_stream, .. } => {
                    call.on_data(Some(session), data, end_stream)
                }
                SessionEvent::StreamReset { code, .. } => call.on_reset(code),
                SessionEvent::Closed => call.on_connection_dropped(),
                SessionEvent::Ready | SessionEvent::GoAway { .. } => {}
            }
        }
    }

    fn respond_ok(server: &mut MemoryServerSession, stream: StreamId, payload: &[u8]) {
        server
            .send_headers(
                stream,
                vec![
                    HeaderField::new(":status", "200"),
                    HeaderField::new("content-type", "application/grpc+proto"),
                ],
                false,
            )
            .unwrap();
        server
            .send_data(stream, encode_message(payload), false)
            .unwrap();
        server
            .send_headers(stream, vec![HeaderField::new("grpc-status", "0")], true)
            .unwrap();
    }

    fn attach(call: &mut ClientCall, session: &mut rpc_h2::MemoryClientSession) {
        call.start(Metadata::new()).unwrap();
        call.attach(session, Metadata::new(), "rpc-rust-test", Instant::now())
            .unwrap();
    }

    #[test]
    fn test_request_headers_shape() {
        let (mut client, mut server) = memory_pair();
        let mut call = new_call();
        let mut md = Metadata::new();
        md.add("x-custom", "value").unwrap();
        call.start(md).unwrap();
        call.attach(&mut client, Metadata::new(), "rpc-rust/0.1.0", Instant::now())
            .unwrap();

        let events = server.poll_events();
        let SessionEvent::Headers { fields, end_stream, .. } = &events[1] else {
            panic!("expected headers");
        };
        assert!(!end_stream);
        let get = |name: &str| {
            fields
                .iter()
                .find(|f| f.name == name.as_bytes())
                .map(|f| String::from_utf8_lossy(&f.value).into_owned())
        };
        assert_eq!(get(":method").as_deref(), Some("POST"));
        assert_eq!(get(":scheme").as_deref(), Some("https"));
        assert_eq!(get(":path").as_deref(), Some("/echo.Echoer/Say"));
        assert_eq!(get(":authority").as_deref(), Some("localhost:50051"));
        assert_eq!(get("te").as_deref(), Some("trailers"));
        assert_eq!(get("content-type").as_deref(), Some("application/grpc+proto"));
        assert_eq!(get("grpc-encoding").as_deref(), Some("identity"));
        assert_eq!(get("user-agent").as_deref(), Some("rpc-rust/0.1.0"));
        assert_eq!(get("x-custom").as_deref(), Some("value"));
        assert_eq!(get("grpc-timeout"), None);
    }

    #[test]
    fn test_deadline_emits_grpc_timeout() {
        let (mut client, mut server) = memory_pair();
        let now = Instant::now();
        let mut call = ClientCall::new(
            CallInfo {
                deadline: Some(now + std::time::Duration::from_millis(100)),
                ..call_info()
            },
            FilterStack::empty(),
            4 * 1024 * 1024,
        );
        call.start(Metadata::new()).unwrap();
        call.attach(&mut client, Metadata::new(), "ua", now).unwrap();

        let events = server.poll_events();
        let SessionEvent::Headers { fields, .. } = &events[1] else {
            panic!("expected headers");
        };
        let timeout = fields
            .iter()
            .find(|f| f.name == b"grpc-timeout")
            .expect("grpc-timeout present");
        assert_eq!(timeout.value, b"100m");
    }

    #[test]
    fn test_unary_flow_orders_events() {
        let (mut client, mut server) = memory_pair();
        let mut call = new_call();
        attach(&mut call, &mut client);
        call.send_message(Some(&mut client), Bytes::from_static(b"hello"));
        call.half_close(Some(&mut client));
        call.start_read(Some(&mut client));

        // Server sees the framed request then responds.
        let server_events = server.poll_events();
        let SessionEvent::Data { data, .. } = &server_events[2] else {
            panic!("expected request data");
        };
        assert_eq!(&data[..], &[0, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
        let stream = call.stream_id().unwrap();
        respond_ok(&mut server, stream, b"hello");

        pump(&mut call, &mut client);
        let events = call.poll_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], CallEvent::Metadata(_)));
        let CallEvent::Message(ref m) = events[1] else {
            panic!("expected message");
        };
        assert_eq!(&m[..], b"hello");
        let CallEvent::Complete(ref status) = events[2] else {
            panic!("expected status");
        };
        assert_eq!(status.code(), Code::Ok);
    }

    #[test]
    fn test_message_buffered_until_read() {
        let (mut client, mut server) = memory_pair();
        let mut call = new_call();
        attach(&mut call, &mut client);
        call.half_close(Some(&mut client));
        let stream = call.stream_id().unwrap();
        respond_ok(&mut server, stream, b"buffered");

        pump(&mut call, &mut client);
        // No read requested: metadata only, status held back.
        let events = call.poll_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CallEvent::Metadata(_)));

        call.start_read(Some(&mut client));
        let events = call.poll_events();
        assert!(matches!(events[0], CallEvent::Message(_)));
        assert!(matches!(events[1], CallEvent::Complete(_)));
    }

    #[test]
    fn test_final_status_latches_once() {
        let (mut client, mut server) = memory_pair();
        let mut call = new_call();
        attach(&mut call, &mut client);
        call.start_read(Some(&mut client));
        let stream = call.stream_id().unwrap();

        server
            .send_headers(
                stream,
                vec![
                    HeaderField::new(":status", "200"),
                    HeaderField::new("grpc-status", "0"),
                ],
                true,
            )
            .unwrap();
        pump(&mut call, &mut client);
        // Late events after the trailers must be dropped.
        call.on_reset(RstCode::Cancel);
        call.on_data(None, encode_message(b"late"), false);

        let events = call.poll_events();
        let complete: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, CallEvent::Complete(_)))
            .collect();
        assert_eq!(complete.len(), 1);
        assert!(!events.iter().any(|e| matches!(e, CallEvent::Message(_))));
        assert!(call.poll_events().is_empty());
    }

    #[test]
    fn test_trailers_only_response() {
        let (mut client, mut server) = memory_pair();
        let mut call = new_call();
        attach(&mut call, &mut client);
        let stream = call.stream_id().unwrap();
        server
            .send_headers(
                stream,
                vec![
                    HeaderField::new(":status", "200"),
                    HeaderField::new("grpc-status", "12"),
                    HeaderField::new("grpc-message", "The%20server%20does%20not%20implement%20this%20method"),
                ],
                true,
            )
            .unwrap();
        pump(&mut call, &mut client);
        let events = call.poll_events();
        assert_eq!(events.len(), 1);
        let CallEvent::Complete(ref status) = events[0] else {
            panic!("expected status only");
        };
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.details(), "The server does not implement this method");
    }

    #[test]
    fn test_rst_cancel_maps_to_cancelled() {
        let (mut client, mut server) = memory_pair();
        let mut call = new_call();
        attach(&mut call, &mut client);
        let stream = call.stream_id().unwrap();
        server.reset_stream(stream, RstCode::Cancel).unwrap();
        pump(&mut call, &mut client);

        let events = call.poll_events();
        let CallEvent::Complete(ref status) = events[0] else {
            panic!("expected status");
        };
        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(status.details(), "Call cancelled");
    }

    #[test]
    fn test_rst_mapping_table() {
        assert_eq!(rst_status(RstCode::RefusedStream).code(), Code::Unavailable);
        assert_eq!(
            rst_status(RstCode::RefusedStream).details(),
            "Stream refused by server"
        );
        assert_eq!(rst_status(RstCode::Cancel).code(), Code::Cancelled);
        assert_eq!(
            rst_status(RstCode::EnhanceYourCalm).code(),
            Code::ResourceExhausted
        );
        assert_eq!(
            rst_status(RstCode::InadequateSecurity).code(),
            Code::PermissionDenied
        );
        assert_eq!(rst_status(RstCode::ProtocolError).code(), Code::Internal);
    }

    #[test]
    fn test_http_status_fallback_when_no_grpc_status() {
        let (mut client, mut server) = memory_pair();
        let mut call = new_call();
        attach(&mut call, &mut client);
        let stream = call.stream_id().unwrap();
        server
            .send_headers(stream, vec![HeaderField::new(":status", "404")], true)
            .unwrap();
        pump(&mut call, &mut client);
        let events = call.poll_events();
        let CallEvent::Complete(ref status) = events[0] else {
            panic!("expected status");
        };
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.details(), "Received HTTP status code 404");
    }

    #[test]
    fn test_cancel_idempotent() {
        let (mut client, _server) = memory_pair();
        let mut call = new_call();
        attach(&mut call, &mut client);
        call.cancel(Some(&mut client), Code::Cancelled, "Cancelled on client");
        call.cancel(Some(&mut client), Code::Aborted, "second cancel ignored");
        call.cancel(None, Code::Unknown, "third cancel ignored");

        let events = call.poll_events();
        assert_eq!(events.len(), 1);
        let CallEvent::Complete(ref status) = events[0] else {
            panic!("expected status");
        };
        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(status.details(), "Cancelled on client");
    }

    #[test]
    fn test_duplicate_authorization_rejected() {
        let (mut client, _server) = memory_pair();
        let mut call = new_call();
        let mut md = Metadata::new();
        md.add("authorization", "Bearer one").unwrap();
        call.start(md).unwrap();
        let mut creds = Metadata::new();
        creds.add("authorization", "Bearer two").unwrap();

        let err = call
            .attach(&mut client, creds, "ua", Instant::now())
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        let events = call.poll_events();
        assert!(matches!(events[0], CallEvent::Complete(_)));
    }

    #[test]
    fn test_pending_message_flushes_on_attach() {
        let (mut client, mut server) = memory_pair();
        let mut call = new_call();
        call.start(Metadata::new()).unwrap();
        // Not yet attached: message and half-close buffer locally.
        call.send_message(None, Bytes::from_static(b"early"));
        call.half_close(None);
        call.attach(&mut client, Metadata::new(), "ua", Instant::now())
            .unwrap();

        let events = server.poll_events();
        let SessionEvent::Data { data, end_stream, .. } = &events[2] else {
            panic!("expected flushed data");
        };
        assert!(end_stream, "half-close rides the flushed write");
        assert_eq!(&data[5..], b"early");
    }

    #[test]
    fn test_deadline_fires_as_deadline_exceeded() {
        let (mut client, _server) = memory_pair();
        let mut call = new_call();
        attach(&mut call, &mut client);
        call.on_deadline(Some(&mut client));
        let events = call.poll_events();
        let CallEvent::Complete(ref status) = events[0] else {
            panic!("expected status");
        };
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn test_connection_drop_maps_to_unavailable() {
        let (mut client, _server) = memory_pair();
        let mut call = new_call();
        attach(&mut call, &mut client);
        call.on_connection_dropped();
        let events = call.poll_events();
        let CallEvent::Complete(ref status) = events[0] else {
            panic!("expected status");
        };
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.details(), "Connection dropped");
    }

    #[test]
    fn test_streaming_messages_preserve_order() {
        let (mut client, mut server) = memory_pair();
        let mut call = new_call();
        attach(&mut call, &mut client);
        let stream = call.stream_id().unwrap();
        server
            .send_headers(stream, vec![HeaderField::new(":status", "200")], false)
            .unwrap();
        for payload in [&b"one"[..], b"two", b"three"] {
            server.send_data(stream, encode_message(payload), false).unwrap();
        }
        server
            .send_headers(stream, vec![HeaderField::new("grpc-status", "0")], true)
            .unwrap();

        pump(&mut call, &mut client);
        for _ in 0..3 {
            call.start_read(Some(&mut client));
        }
        let events = call.poll_events();
        let messages: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CallEvent::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(messages.len(), 3);
        assert_eq!(&messages[0][..], b"one");
        assert_eq!(&messages[1][..], b"two");
        assert_eq!(&messages[2][..], b"three");
        // Status arrives last.
        assert!(matches!(events.last(), Some(CallEvent::Complete(_))));
    }

    struct RejectingReceiveFilter;

    impl crate::filter::CallFilter for RejectingReceiveFilter {
        fn receive_message(&mut self, _message: Bytes) -> FilterResult<Bytes> {
            FilterResult::Fail(Status::invalid_argument("filter rejected"))
        }
    }

    #[test]
    fn test_receive_filter_failure_becomes_internal() {
        let (mut client, mut server) = memory_pair();
        let stack = FilterStack::from_filters(vec![Box::new(RejectingReceiveFilter)]);
        let mut call = ClientCall::new(call_info(), stack, 4 * 1024 * 1024);
        attach_with(&mut call, &mut client);
        let stream = call.stream_id().unwrap();
        server
            .send_headers(stream, vec![HeaderField::new(":status", "200")], false)
            .unwrap();
        server.send_data(stream, encode_message(b"x"), false).unwrap();
        pump(&mut call, &mut client);

        let events = call.poll_events();
        let Some(CallEvent::Complete(status)) = events.last() else {
            panic!("expected status");
        };
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.details(), "filter rejected");
    }

    fn attach_with(call: &mut ClientCall, session: &mut rpc_h2::MemoryClientSession) {
        call.start(Metadata::new()).unwrap();
        call.attach(session, Metadata::new(), "ua", Instant::now())
            .unwrap();
    }
}
