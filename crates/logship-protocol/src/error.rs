//! Error types for the wire protocol

use thiserror::Error;

/// Result type alias using [`ProtocolError`]
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Codec and framing errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O errors from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not enough bytes to decode a complete structure
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        /// What was being decoded
        what: &'static str,
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// Frame length outside the accepted range
    #[error("frame length invalid: max {max} got {got}")]
    FrameLength {
        /// Largest accepted frame
        max: usize,
        /// Declared frame length
        got: usize,
    },

    /// Reply tag byte is not a known reply
    #[error("unknown reply tag: {0:#04x}")]
    UnknownReplyTag(u8),

    /// Frame header disagrees with its payload
    #[error("frame header mismatch: {0}")]
    HeaderMismatch(String),

    /// Records inside a payload are not strictly increasing
    #[error("non-increasing instant in payload: {previous} then {got}")]
    NonIncreasingInstant {
        /// Instant of the preceding record
        previous: u64,
        /// Offending instant
        got: u64,
    },
}

impl ProtocolError {
    pub(crate) fn truncated(what: &'static str, needed: usize, available: usize) -> Self {
        Self::Truncated {
            what,
            needed,
            available,
        }
    }

    pub(crate) fn header_mismatch(msg: impl Into<String>) -> Self {
        Self::HeaderMismatch(msg.into())
    }

    /// True when the error came from the stream rather than the bytes on it
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
