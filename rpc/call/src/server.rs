//! Server call state machine.
//!
//! One instance per inbound stream: parses request headers into metadata
//! and a deadline, deframes request data, and owns the response sequence
//! (headers once, data, trailers once). Cancellation from any trigger stops
//! all further writes.

use bytes::Bytes;
use rpc_wire::{
    Code, FrameError, MessageDecoder, Metadata, Status, encode_message, encode_status_details,
    parse_timeout,
};
use rpc_h2::{HeaderField, RstCode, ServerSession, StreamId};
use std::io;
use std::time::Instant;

/// Request headers consumed by the call layer, not surfaced as metadata.
const CONSUMED_HEADERS: [&str; 5] = [
    "grpc-timeout",
    "grpc-encoding",
    "grpc-accept-encoding",
    "content-type",
    "te",
];

#[derive(Debug)]
pub struct ServerCall {
    stream: StreamId,
    path: String,
    metadata: Metadata,
    deadline: Option<Instant>,
    decoder: MessageDecoder,
    half_closed_remote: bool,
    sent_metadata: bool,
    ended: bool,
    cancelled: Option<Status>,
}

impl ServerCall {
    /// Accept an inbound stream from its request header block.
    ///
    /// An invalid `grpc-timeout` value yields OUT_OF_RANGE; the dispatcher
    /// ends the call with it.
    pub fn accept(
        stream: StreamId,
        fields: &[HeaderField],
        now: Instant,
        max_request_bytes: usize,
    ) -> Result<Self, Status> {
        let mut path = String::new();
        for field in fields {
            if field.name == b":path" {
                path = String::from_utf8_lossy(&field.value).into_owned();
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
            tracing::warn!(target: "rpc_call::server", %err, "skipping undecodable metadata entry");
        }

        let deadline = match metadata.get_str("grpc-timeout") {
            Some(wire) => match parse_timeout(wire) {
                Ok(timeout) => Some(now + timeout),
                Err(e) => return Err(Status::out_of_range(e.to_string())),
            },
            None => None,
        };
        for key in CONSUMED_HEADERS {
            let _ = metadata.remove(key);
        }

        Ok(Self {
            stream,
            path,
            metadata,
            deadline,
            decoder: MessageDecoder::new(max_request_bytes),
            half_closed_remote: false,
            sent_metadata: false,
            ended: false,
            cancelled: None,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_half_closed_remote(&self) -> bool {
        self.half_closed_remote
    }

    /// Trailers sent or call cancelled; nothing more will be written.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn cancelled_status(&self) -> Option<&Status> {
        self.cancelled.as_ref()
    }

    /// Feed request DATA; returns the complete messages it finished.
    pub fn on_data(&mut self, data: Bytes, end_stream: bool) -> Result<Vec<Bytes>, Status> {
        if end_stream {
            self.half_closed_remote = true;
        }
        self.decoder.feed(&data);
        let mut messages = Vec::new();
        loop {
            match self.decoder.next_message() {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(FrameError::MessageTooLarge { length, limit }) => {
                    return Err(Status::resource_exhausted(format!(
                        "Received message larger than max ({} vs. {})",
                        length, limit
                    )));
                }
                Err(FrameError::InvalidCompressionFlag(flag)) => {
                    return Err(Status::internal(format!(
                        "Invalid compression flag: {}",
                        flag
                    )));
                }
            }
        }
        Ok(messages)
    }

    /// Peer reset the stream; the call is dead and must not emit.
    pub fn on_peer_reset(&mut self) {
        if !self.ended {
            self.ended = true;
            self.cancelled = Some(Status::cancelled("Cancelled by client"));
        }
    }

    /// Deadline timer fired; the stream is reset and the call marked dead.
    pub fn on_deadline(&mut self, session: &mut dyn ServerSession) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.cancelled = Some(Status::deadline_exceeded("Deadline exceeded"));
        let _ = session.reset_stream(self.stream, RstCode::Cancel);
    }

    /// Emit response headers. Idempotent; the first outbound write calls
    /// this implicitly.
    pub fn send_metadata(
        &mut self,
        session: &mut dyn ServerSession,
        metadata: &Metadata,
    ) -> Result<(), Status> {
        self.check_writable()?;
        if self.sent_metadata {
            return Ok(());
        }
        self.sent_metadata = true;
        let mut fields = vec![
            HeaderField::new(":status", "200"),
            HeaderField::new("content-type", "application/grpc+proto"),
            HeaderField::new("grpc-encoding", "identity"),
        ];
        for (name, value) in metadata.to_wire() {
            fields.push(HeaderField::new(name, value));
        }
        self.io_write(session.send_headers(self.stream, fields, false))
    }

    /// Stream one response message.
    pub fn send_message(
        &mut self,
        session: &mut dyn ServerSession,
        payload: &[u8],
    ) -> Result<(), Status> {
        self.check_writable()?;
        if !self.sent_metadata {
            self.send_metadata(session, &Metadata::new())?;
        }
        let framed = encode_message(payload);
        self.io_write(session.send_data(self.stream, framed, false))
    }

    /// Finish the call: emit `grpc-status`/`grpc-message` trailers plus the
    /// status's trailing metadata. If nothing was sent yet this becomes a
    /// trailers-only response.
    pub fn finish(&mut self, session: &mut dyn ServerSession, status: &Status) -> Result<(), Status> {
        self.check_writable()?;
        self.ended = true;
        tracing::debug!(
            target: "rpc_call::server",
            path = %self.path,
            code = %status.code(),
            "finishing call"
        );

        let mut fields = if self.sent_metadata {
            Vec::new()
        } else {
            vec![
                HeaderField::new(":status", "200"),
                HeaderField::new("content-type", "application/grpc+proto"),
            ]
        };
        fields.push(HeaderField::new(
            "grpc-status",
            status.code().as_u32().to_string(),
        ));
        if !status.details().is_empty() {
            fields.push(HeaderField::new(
                "grpc-message",
                encode_status_details(status.details()),
            ));
        }
        for (name, value) in status.metadata().to_wire() {
            fields.push(HeaderField::new(name, value));
        }
        self.io_write(session.send_headers(self.stream, fields, true))
    }

    fn check_writable(&self) -> Result<(), Status> {
        if let Some(status) = &self.cancelled {
            return Err(status.clone());
        }
        if self.ended {
            return Err(Status::internal("Call already ended"));
        }
        Ok(())
    }

    fn io_write(&mut self, result: io::Result<()>) -> Result<(), Status> {
        result.map_err(|e| {
            Status::new(Code::Unavailable, format!("Transport write failed: {}", e))
        })
    }
}
