//! rpc-wire - wire-level codecs for the RPC runtime.
//!
//! This crate holds everything with a bit-level contract and nothing that
//! owns a connection:
//!
//! - RPC status codes, the `Status` type, and the HTTP `:status` fallback
//!   mapping
//! - the metadata container and its header/trailer serialization rules
//! - the `grpc-timeout` header codec
//! - length-prefixed message framing
//!
//! Message payload encoding (protobuf or otherwise) is left to the
//! application; this crate deals in framed bytes.

mod frame;
mod metadata;
mod status;
mod timeout;

pub use frame::{
    DEFAULT_MAX_MESSAGE_SIZE, FRAME_PREFIX_SIZE, FrameError, MessageDecoder, encode_message,
};
pub use metadata::{Metadata, MetadataDecodeError, MetadataError, MetadataValue};
pub use status::{Code, Status, decode_status_details, encode_status_details};
pub use timeout::{MAX_TIMEOUT_DIGITS, TimeoutError, format_timeout, parse_timeout};
