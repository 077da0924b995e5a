//! Per-call filter chain.
//!
//! A filter is five transforms over the data flowing through one call:
//! outgoing metadata, outgoing message, incoming metadata, incoming message,
//! and incoming trailers. A stack composes filters so that send-direction
//! transforms run in registration order and receive-direction transforms run
//! in reverse. Filter factories build one filter instance per call, so
//! filters may hold per-call state.

use bytes::Bytes;
use rpc_wire::{Code, Metadata, Status};
use std::sync::Arc;
use std::time::Instant;

/// Static facts about one call, available to filter factories.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Method path, `/<service>/<method>`.
    pub path: String,
    /// The `:authority` this call targets.
    pub authority: String,
    /// Absolute deadline, if any.
    pub deadline: Option<Instant>,
}

/// Outcome of one filter transform.
#[derive(Debug)]
pub enum FilterResult<T> {
    /// Pass the (possibly rewritten) value to the next stage.
    Continue(T),
    /// Abort the chain with the given status.
    Fail(Status),
}

/// One per-call filter. All transforms default to pass-through.
pub trait CallFilter {
    fn send_metadata(&mut self, metadata: Metadata) -> FilterResult<Metadata> {
        FilterResult::Continue(metadata)
    }

    fn receive_metadata(&mut self, metadata: Metadata) -> FilterResult<Metadata> {
        FilterResult::Continue(metadata)
    }

    fn send_message(&mut self, message: Bytes) -> FilterResult<Bytes> {
        FilterResult::Continue(message)
    }

    fn receive_message(&mut self, message: Bytes) -> FilterResult<Bytes> {
        FilterResult::Continue(message)
    }

    fn receive_trailers(&mut self, status: Status) -> FilterResult<Status> {
        FilterResult::Continue(status)
    }
}

/// Creates one filter instance per call.
pub trait FilterFactory {
    fn create_filter(&self, info: &CallInfo) -> Box<dyn CallFilter>;
}

/// An ordered composition of per-call filters.
pub struct FilterStack {
    filters: Vec<Box<dyn CallFilter>>,
}

macro_rules! run_chain {
    ($filters:expr, $method:ident, $value:expr) => {{
        let mut value = $value;
        for filter in $filters {
            match filter.$method(value) {
                FilterResult::Continue(next) => value = next,
                FilterResult::Fail(status) => return FilterResult::Fail(status),
            }
        }
        FilterResult::Continue(value)
    }};
}

impl FilterStack {
    /// Instantiate a stack from factories for one call.
    pub fn create(factories: &[Arc<dyn FilterFactory>], info: &CallInfo) -> Self {
        Self {
            filters: factories.iter().map(|f| f.create_filter(info)).collect(),
        }
    }

    /// A stack with no filters.
    pub fn empty() -> Self {
        Self { filters: Vec::new() }
    }

    /// Build a stack from already-created filter instances.
    pub fn from_filters(filters: Vec<Box<dyn CallFilter>>) -> Self {
        Self { filters }
    }

    pub fn send_metadata(&mut self, metadata: Metadata) -> FilterResult<Metadata> {
        run_chain!(self.filters.iter_mut(), send_metadata, metadata)
    }

    pub fn send_message(&mut self, message: Bytes) -> FilterResult<Bytes> {
        run_chain!(self.filters.iter_mut(), send_message, message)
    }

    pub fn receive_metadata(&mut self, metadata: Metadata) -> FilterResult<Metadata> {
        run_chain!(self.filters.iter_mut().rev(), receive_metadata, metadata)
    }

    pub fn receive_message(&mut self, message: Bytes) -> FilterResult<Bytes> {
        run_chain!(self.filters.iter_mut().rev(), receive_message, message)
    }

    pub fn receive_trailers(&mut self, status: Status) -> FilterResult<Status> {
        run_chain!(self.filters.iter_mut().rev(), receive_trailers, status)
    }
}

/// Message-size limits from the active method config.
#[derive(Debug, Clone, Copy)]
pub struct MessageSizeLimits {
    pub max_request_bytes: usize,
    pub max_response_bytes: usize,
}

impl Default for MessageSizeLimits {
    fn default() -> Self {
        Self {
            max_request_bytes: rpc_wire::DEFAULT_MAX_MESSAGE_SIZE,
            max_response_bytes: rpc_wire::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Built-in filter enforcing per-direction message size limits.
pub struct MessageSizeFilter {
    limits: MessageSizeLimits,
}

impl MessageSizeFilter {
    pub fn new(limits: MessageSizeLimits) -> Self {
        Self { limits }
    }
}

impl CallFilter for MessageSizeFilter {
    fn send_message(&mut self, message: Bytes) -> FilterResult<Bytes> {
        if message.len() > self.limits.max_request_bytes {
            FilterResult::Fail(Status::resource_exhausted(format!(
                "Sent message larger than max ({} vs. {})",
                message.len(),
                self.limits.max_request_bytes
            )))
        } else {
            FilterResult::Continue(message)
        }
    }

    fn receive_message(&mut self, message: Bytes) -> FilterResult<Bytes> {
        if message.len() > self.limits.max_response_bytes {
            FilterResult::Fail(Status::resource_exhausted(format!(
                "Received message larger than max ({} vs. {})",
                message.len(),
                self.limits.max_response_bytes
            )))
        } else {
            FilterResult::Continue(message)
        }
    }
}

/// Factory for [`MessageSizeFilter`].
pub struct MessageSizeFilterFactory {
    limits: MessageSizeLimits,
}

impl MessageSizeFilterFactory {
    pub fn new(limits: MessageSizeLimits) -> Self {
        Self { limits }
    }
}

impl FilterFactory for MessageSizeFilterFactory {
    fn create_filter(&self, _info: &CallInfo) -> Box<dyn CallFilter> {
        Box::new(MessageSizeFilter::new(self.limits))
    }
}

/// Reclassify a receive-chain failure: the peer is never told about local
/// filter problems, the call just ends with INTERNAL.
pub fn reclassify_receive_failure(status: Status) -> Status {
    Status::new(Code::Internal, status.details().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TagFilter {
        tag: &'static str,
    }

    impl CallFilter for TagFilter {
        fn send_metadata(&mut self, mut metadata: Metadata) -> FilterResult<Metadata> {
            metadata.add("order", self.tag).unwrap();
            FilterResult::Continue(metadata)
        }

        fn receive_metadata(&mut self, mut metadata: Metadata) -> FilterResult<Metadata> {
            metadata.add("order", self.tag).unwrap();
            FilterResult::Continue(metadata)
        }
    }

    struct TagFactory {
        tag: &'static str,
    }

    impl FilterFactory for TagFactory {
        fn create_filter(&self, _info: &CallInfo) -> Box<dyn CallFilter> {
            Box::new(TagFilter { tag: self.tag })
        }
    }

    fn info() -> CallInfo {
        CallInfo {
            path: "/test.Service/Method".into(),
            authority: "localhost".into(),
            deadline: None,
        }
    }

    fn tags(result: FilterResult<Metadata>) -> Vec<String> {
        let FilterResult::Continue(md) = result else {
            panic!("chain failed");
        };
        md.get("order")
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect()
    }

    #[test]
    fn test_send_direction_runs_in_registration_order() {
        let factories: Vec<Arc<dyn FilterFactory>> = vec![
            Arc::new(TagFactory { tag: "first" }),
            Arc::new(TagFactory { tag: "second" }),
        ];
        let mut stack = FilterStack::create(&factories, &info());
        assert_eq!(tags(stack.send_metadata(Metadata::new())), ["first", "second"]);
    }

    #[test]
    fn test_receive_direction_runs_in_reverse() {
        let factories: Vec<Arc<dyn FilterFactory>> = vec![
            Arc::new(TagFactory { tag: "first" }),
            Arc::new(TagFactory { tag: "second" }),
        ];
        let mut stack = FilterStack::create(&factories, &info());
        assert_eq!(
            tags(stack.receive_metadata(Metadata::new())),
            ["second", "first"]
        );
    }

    struct FailingFilter;

    impl CallFilter for FailingFilter {
        fn send_message(&mut self, _message: Bytes) -> FilterResult<Bytes> {
            FilterResult::Fail(Status::invalid_argument("rejected"))
        }
    }

    #[test]
    fn test_failure_short_circuits() {
        let mut stack = FilterStack {
            filters: vec![Box::new(FailingFilter), Box::new(TagFilter { tag: "x" })],
        };
        match stack.send_message(Bytes::from_static(b"m")) {
            FilterResult::Fail(status) => assert_eq!(status.code(), Code::InvalidArgument),
            FilterResult::Continue(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_message_size_filter_send_limit() {
        let mut filter = MessageSizeFilter::new(MessageSizeLimits {
            max_request_bytes: 4,
            max_response_bytes: 100,
        });
        match filter.send_message(Bytes::from_static(b"12345")) {
            FilterResult::Fail(status) => {
                assert_eq!(status.code(), Code::ResourceExhausted);
                assert!(status.details().contains("5 vs. 4"));
            }
            FilterResult::Continue(_) => panic!("expected failure"),
        }
        assert!(matches!(
            filter.send_message(Bytes::from_static(b"1234")),
            FilterResult::Continue(_)
        ));
    }

    #[test]
    fn test_message_size_filter_receive_limit() {
        let mut filter = MessageSizeFilter::new(MessageSizeLimits {
            max_request_bytes: 100,
            max_response_bytes: 2,
        });
        assert!(matches!(
            filter.receive_message(Bytes::from_static(b"123")),
            FilterResult::Fail(_)
        ));
    }

    #[test]
    fn test_reclassify_receive_failure() {
        let status = reclassify_receive_failure(Status::invalid_argument("went wrong"));
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.details(), "went wrong");
    }
}
