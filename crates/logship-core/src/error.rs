//! Error types for Logship Core

use logship_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Result type alias using Logship Error
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the replication master
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed replication configuration
    #[error("Bad replication config: {0}")]
    BadConfig(String),

    /// A sub-step of `start_master` failed; partial state was rolled back
    #[error("Replication startup failed: {0}")]
    StartupFailed(String),

    /// Record does not fit in the remaining buffer capacity (transient)
    #[error("Replication log buffer full: need {needed} bytes, {available} available")]
    BufferFull {
        /// Serialized size of the rejected record
        needed: usize,
        /// Free bytes at the time of the attempt
        available: usize,
    },

    /// Record is larger than the whole buffer (permanent)
    #[error("Log record too large: {size} bytes exceeds buffer capacity {capacity}")]
    RecordTooLarge {
        /// Serialized size of the rejected record
        size: usize,
        /// Total buffer capacity
        capacity: usize,
    },

    /// Producer handed over an instant that does not follow the previous one
    #[error("Non-monotonic log instant: {got} after {previous}")]
    NonMonotonicInstant {
        /// Last admitted instant
        previous: u64,
        /// Rejected instant
        got: u64,
    },

    /// Offsets or lengths of a record span fall outside the source array
    #[error("Invalid log record: {0}")]
    InvalidRecord(String),

    /// Transport to the slave is down
    #[error("Disconnected from slave: {0}")]
    Disconnected(String),

    /// Slave violated or rejected the protocol
    #[error("Replication protocol error ({code}): {message}")]
    Protocol {
        /// Error code reported by the slave, or detected locally
        code: ErrorCode,
        /// Diagnostic
        message: String,
    },

    /// A synchronous flush did not see its ack in time
    #[error("Flush timed out waiting for ack of instant {instant}")]
    FlushTimeout {
        /// Instant the caller waited for
        instant: u64,
    },

    /// Component already closed or stopping
    #[error("Replication closed: {0}")]
    Closed(String),

    /// Unrecoverable failure; the controller is FAILED
    #[error("Fatal replication error: {0}")]
    Fatal(String),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        /// States the operation accepts
        expected: String,
        /// Current state
        actual: String,
    },

    /// I/O errors from the network
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a bad config error
    pub fn bad_config(msg: impl Into<String>) -> Self {
        Self::BadConfig(msg.into())
    }

    /// Create a startup failure
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::StartupFailed(msg.into())
    }

    /// Create an invalid record error
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }

    /// Create a disconnected error
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: msg.into(),
        }
    }

    /// Create a closed error
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(expected: impl Into<String>, actual: impl std::fmt::Debug) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: format!("{:?}", actual),
        }
    }

    /// True for transport failures the shipper retries after reconnecting
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Disconnected(_) => true,
            Self::Io(io_error) => matches!(
                io_error.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(io_error) => Self::Io(io_error),
            other => Self::protocol(ErrorCode::MalformedFrame, other.to_string()),
        }
    }
}
