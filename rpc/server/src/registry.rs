//! Method handler registration.
//!
//! Message payloads are framed bytes end to end; handlers own their own
//! serialization, the way the rest of the runtime leaves protobuf to the
//! application.

use crate::dispatch::Responder;
use bytes::Bytes;
use rpc_wire::{Metadata, Status};
use std::collections::HashMap;

/// The four method shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ClientStream,
    ServerStream,
    Bidi,
}

impl MethodKind {
    /// Whether the handler is started as soon as request headers arrive.
    pub fn starts_immediately(self) -> bool {
        matches!(self, MethodKind::ServerStream | MethodKind::Bidi)
    }
}

/// A registered method implementation.
pub trait MethodHandler {
    fn kind(&self) -> MethodKind;

    /// Begin one call. For streaming-response methods this runs when the
    /// request headers arrive; for unary and client-streaming methods it
    /// runs once the request is complete.
    fn start(&self, responder: &mut Responder<'_>) -> Box<dyn ActiveCall>;
}

/// Per-call handler state.
pub trait ActiveCall {
    fn on_message(&mut self, responder: &mut Responder<'_>, message: Bytes);

    /// The client finished sending.
    fn on_half_close(&mut self, responder: &mut Responder<'_>);

    /// The call died (peer reset, deadline); nothing can be written.
    fn on_cancel(&mut self, _status: &Status) {}
}

/// Registration failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("method {0:?} is already registered")]
    DuplicatePath(String),
    #[error("method path {0:?} is not of the form /service/method")]
    MalformedPath(String),
}

/// Maps `:path` to handlers. Built once at startup, then read-only.
#[derive(Default)]
pub struct ServiceRegistry {
    methods: HashMap<String, Box<dyn MethodHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method path. Duplicate paths fail.
    pub fn register(
        &mut self,
        path: &str,
        handler: Box<dyn MethodHandler>,
    ) -> Result<(), RegistryError> {
        let mut parts = path.split('/');
        let well_formed = parts.next() == Some("")
            && parts.next().is_some_and(|s| !s.is_empty())
            && parts.next().is_some_and(|m| !m.is_empty())
            && parts.next().is_none();
        if !well_formed {
            return Err(RegistryError::MalformedPath(path.to_owned()));
        }
        if self.methods.contains_key(path) {
            return Err(RegistryError::DuplicatePath(path.to_owned()));
        }
        self.methods.insert(path.to_owned(), handler);
        Ok(())
    }

    pub fn lookup(&self, path: &str) -> Option<&dyn MethodHandler> {
        self.methods.get(path).map(|h| h.as_ref())
    }
}

/// A unary response: payload plus trailing metadata.
pub struct UnaryReply {
    pub response: Bytes,
    pub trailers: Metadata,
}

impl UnaryReply {
    pub fn new(response: impl Into<Bytes>) -> Self {
        Self {
            response: response.into(),
            trailers: Metadata::new(),
        }
    }

    pub fn with_trailers(mut self, trailers: Metadata) -> Self {
        self.trailers = trailers;
        self
    }
}

/// Outcome of a unary handler. An error's attached metadata wins over any
/// reply trailers.
pub type UnaryResult = Result<UnaryReply, Status>;

type SharedUnaryFn = std::rc::Rc<dyn Fn(&Metadata, Bytes) -> UnaryResult>;

struct UnaryAdapter {
    handler: SharedUnaryFn,
}

/// Wrap a `(metadata, request) -> UnaryResult` function as a unary method
/// handler. The dispatcher buffers the single request message and calls
/// the function at half-close.
pub fn unary<F>(handler: F) -> Box<dyn MethodHandler>
where
    F: Fn(&Metadata, Bytes) -> UnaryResult + 'static,
{
    Box::new(UnaryAdapter {
        handler: std::rc::Rc::new(handler),
    })
}

impl MethodHandler for UnaryAdapter {
    fn kind(&self) -> MethodKind {
        MethodKind::Unary
    }

    fn start(&self, _responder: &mut Responder<'_>) -> Box<dyn ActiveCall> {
        Box::new(BufferedUnary {
            handler: self.handler.clone(),
            request: None,
        })
    }
}

struct BufferedUnary {
    handler: SharedUnaryFn,
    request: Option<Bytes>,
}

impl ActiveCall for BufferedUnary {
    fn on_message(&mut self, responder: &mut Responder<'_>, message: Bytes) {
        if self.request.replace(message).is_some() {
            responder.finish(&Status::internal("Too many request messages for unary call"));
        }
    }

    fn on_half_close(&mut self, responder: &mut Responder<'_>) {
        let Some(request) = self.request.take() else {
            responder.finish(&Status::internal("Request stream ended without a message"));
            return;
        };
        let metadata = responder.metadata().clone();
        match (self.handler)(&metadata, request) {
            Ok(reply) => {
                if responder.send_message(&reply.response).is_ok() {
                    responder.finish(&Status::with_metadata(
                        rpc_wire::Code::Ok,
                        "",
                        reply.trailers,
                    ));
                }
            }
            // A non-null error wins wholesale, trailing metadata included.
            Err(status) => responder.finish(&status),
        }
    }
}
