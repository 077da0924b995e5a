//! Stream-level types shared across the session boundary.

/// Stream identifier (31 bits, high bit reserved).
///
/// Client-initiated streams use odd numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Create a new stream ID, masking the reserved bit.
    #[inline]
    pub fn new(id: u32) -> Self {
        StreamId(id & 0x7FFF_FFFF)
    }

    /// Get the raw stream ID value.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Check if this is a client-initiated stream (odd numbers).
    #[inline]
    pub fn is_client_initiated(self) -> bool {
        self.0 % 2 == 1
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        StreamId::new(id)
    }
}

/// A single header name/value pair as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    /// Create a new header field.
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// RST_STREAM error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RstCode {
    /// Graceful shutdown.
    NoError = 0x0,
    /// Protocol error detected.
    ProtocolError = 0x1,
    /// Implementation fault.
    InternalError = 0x2,
    /// Flow control limits exceeded.
    FlowControlError = 0x3,
    /// Settings not acknowledged in time.
    SettingsTimeout = 0x4,
    /// Frame received for closed stream.
    StreamClosed = 0x5,
    /// Frame size incorrect.
    FrameSizeError = 0x6,
    /// Stream not processed.
    RefusedStream = 0x7,
    /// Stream cancelled.
    Cancel = 0x8,
    /// Compression state not updated.
    CompressionError = 0x9,
    /// TCP connection error.
    ConnectError = 0xa,
    /// Processing capacity exceeded.
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS requirements not met.
    InadequateSecurity = 0xc,
    /// HTTP/1.1 required.
    Http11Required = 0xd,
}

impl RstCode {
    /// Convert a wire value to an error code, mapping unknowns to
    /// `InternalError`.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => RstCode::NoError,
            0x1 => RstCode::ProtocolError,
            0x2 => RstCode::InternalError,
            0x3 => RstCode::FlowControlError,
            0x4 => RstCode::SettingsTimeout,
            0x5 => RstCode::StreamClosed,
            0x6 => RstCode::FrameSizeError,
            0x7 => RstCode::RefusedStream,
            0x8 => RstCode::Cancel,
            0x9 => RstCode::CompressionError,
            0xa => RstCode::ConnectError,
            0xb => RstCode::EnhanceYourCalm,
            0xc => RstCode::InadequateSecurity,
            0xd => RstCode::Http11Required,
            _ => RstCode::InternalError,
        }
    }

    /// Get the wire value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}
