//! Logship wire protocol
//!
//! The master ships batches of serialized log records to the slave and the
//! slave answers every batch with a one-message reply.
//!
//! ```text
//! master -> slave   [length:u32][first_instant:u64][record_count:u32][payload:N]
//!                   payload = { [instant:u64][data_len:u32][opt_len:u32][data][opt] }*
//!
//! slave -> master   [0x01][ack_instant:u64]
//!                   [0x02][code:u16][message .. EOF]
//! ```
//!
//! All integers are big-endian. `length` counts every byte after the
//! length field itself. An error reply is the last thing the slave writes
//! on a connection, so its message runs to end of stream.
//!
//! Every message type has a blocking (`std::io`) and an async
//! (`tokio::io`) reader/writer.

pub mod error;
pub mod frame;
pub mod record;
pub mod reply;

pub use error::{ProtocolError, Result};
pub use frame::{BatchFrame, FRAME_FIXED_LEN, MAX_FRAME_BYTES};
pub use record::{LogRecord, RECORD_HEADER_LEN, encoded_len};
pub use reply::{ErrorCode, MAX_ERROR_MESSAGE_BYTES, SlaveReply};
