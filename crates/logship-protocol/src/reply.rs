//! Slave replies
//!
//! Ack: `[0x01][ack_instant:u64]`
//! Error: `[0x02][code:u16][message .. EOF]`

use crate::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{ErrorKind, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reply tag for an acknowledgment
pub const TAG_ACK: u8 = 0x01;

/// Reply tag for an error
pub const TAG_ERROR: u8 = 0x02;

/// Longest error message a reader keeps
pub const MAX_ERROR_MESSAGE_BYTES: usize = 4096;

/// Error codes carried by an error reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Slave could not parse the frame
    MalformedFrame,
    /// Batch does not continue from the slave's last durable instant
    InstantGap,
    /// Slave failed to make the batch durable
    StorageFailure,
    /// Slave does not support the requested operation or mode
    Unsupported,
    /// Any code outside the known set
    Unknown(u16),
}

impl ErrorCode {
    /// Wire value
    pub fn as_u16(self) -> u16 {
        match self {
            Self::MalformedFrame => 1,
            Self::InstantGap => 2,
            Self::StorageFailure => 3,
            Self::Unsupported => 4,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            1 => Self::MalformedFrame,
            2 => Self::InstantGap,
            3 => Self::StorageFailure,
            4 => Self::Unsupported,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedFrame => write!(f, "malformed-frame"),
            Self::InstantGap => write!(f, "instant-gap"),
            Self::StorageFailure => write!(f, "storage-failure"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

/// Reply from the slave to one batch frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlaveReply {
    /// Everything up to and including `instant` is durable on the slave
    Ack {
        /// Highest durable instant
        instant: u64,
    },
    /// The slave rejected the batch; the connection closes after this
    Error {
        /// Error code
        code: ErrorCode,
        /// Free-form diagnostic
        message: String,
    },
}

impl SlaveReply {
    /// Encode reply to bytes
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Ack { instant } => {
                let mut buf = BytesMut::with_capacity(9);
                buf.put_u8(TAG_ACK);
                buf.put_u64(*instant);
                buf.freeze()
            }
            Self::Error { code, message } => {
                let message = truncate_message(message.as_bytes());
                let mut buf = BytesMut::with_capacity(3 + message.len());
                buf.put_u8(TAG_ERROR);
                buf.put_u16(code.as_u16());
                buf.put_slice(message);
                buf.freeze()
            }
        }
    }

    /// Write reply to a blocking stream
    pub fn write_to_sync<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        writer.flush()?;
        Ok(())
    }

    /// Read reply from a blocking stream
    pub fn read_from_sync<R: Read>(reader: &mut R) -> Result<Self> {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;
        match tag[0] {
            TAG_ACK => {
                let mut instant = [0u8; 8];
                reader.read_exact(&mut instant)?;
                Ok(Self::Ack {
                    instant: u64::from_be_bytes(instant),
                })
            }
            TAG_ERROR => {
                let mut code = [0u8; 2];
                reader.read_exact(&mut code)?;
                let message = read_message_sync(reader);
                Ok(Self::error_from_parts(code, &message))
            }
            other => Err(ProtocolError::UnknownReplyTag(other)),
        }
    }

    /// Write reply to an async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read reply from an async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let tag = reader.read_u8().await?;
        match tag {
            TAG_ACK => Ok(Self::Ack {
                instant: reader.read_u64().await?,
            }),
            TAG_ERROR => {
                let code = reader.read_u16().await?.to_be_bytes();
                let mut message = Vec::new();
                reader
                    .take(MAX_ERROR_MESSAGE_BYTES as u64)
                    .read_to_end(&mut message)
                    .await?;
                Ok(Self::error_from_parts(code, &message))
            }
            other => Err(ProtocolError::UnknownReplyTag(other)),
        }
    }

    fn error_from_parts(code: [u8; 2], message: &[u8]) -> Self {
        Self::Error {
            code: ErrorCode::from(u16::from_be_bytes(code)),
            message: String::from_utf8_lossy(message).into_owned(),
        }
    }
}

/// Message bytes up to EOF or the cap
///
/// The tag and code already decide the reply, so a read that stalls or
/// fails part way keeps what arrived instead of failing the reply.
fn read_message_sync<R: Read>(reader: &mut R) -> Vec<u8> {
    let mut message = Vec::new();
    let mut chunk = [0u8; 512];
    while message.len() < MAX_ERROR_MESSAGE_BYTES {
        let want = chunk.len().min(MAX_ERROR_MESSAGE_BYTES - message.len());
        match reader.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => message.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    message
}

fn truncate_message(message: &[u8]) -> &[u8] {
    &message[..message.len().min(MAX_ERROR_MESSAGE_BYTES)]
}
