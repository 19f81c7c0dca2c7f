//! Batch frames
//!
//! Format: `[length:u32][first_instant:u64][record_count:u32][payload:N]`
//! where `length = 12 + N`.

use crate::record::LogRecord;
use crate::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes covered by `length` before the payload starts
pub const FRAME_FIXED_LEN: usize = 12;

/// Largest frame a reader accepts (64 MiB)
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// A batch of serialized log records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFrame {
    /// Instant of the first record in the payload
    pub first_instant: u64,
    /// Number of records in the payload
    pub record_count: u32,
    /// Concatenated serialized records
    pub payload: Bytes,
}

impl BatchFrame {
    /// Build a frame from already-serialized records
    pub fn new(first_instant: u64, record_count: u32, payload: Bytes) -> Self {
        Self {
            first_instant,
            record_count,
            payload,
        }
    }

    /// Build a frame from decoded records
    pub fn from_records(records: &[LogRecord]) -> Result<Self> {
        let first = records
            .first()
            .ok_or_else(|| ProtocolError::header_mismatch("empty batch"))?;
        let mut payload = BytesMut::with_capacity(records.iter().map(|r| r.encoded_len()).sum());
        for record in records {
            record.encode_into(&mut payload);
        }
        Ok(Self::new(
            first.instant,
            records.len() as u32,
            payload.freeze(),
        ))
    }

    /// Value of the leading length field
    pub fn body_len(&self) -> usize {
        FRAME_FIXED_LEN + self.payload.len()
    }

    /// Total encoded size including the length field
    pub fn encoded_len(&self) -> usize {
        4 + self.body_len()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.body_len() as u32);
        buf.put_u64(self.first_instant);
        buf.put_u32(self.record_count);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame from a complete buffer
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(ProtocolError::truncated("frame length", 4, buf.len()));
        }
        let mut cursor = buf;
        let length = cursor.get_u32() as usize;
        check_length(length)?;
        if cursor.len() < length {
            return Err(ProtocolError::truncated("frame body", length, cursor.len()));
        }
        Self::decode_body(Bytes::copy_from_slice(&cursor[..length]))
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        let first_instant = body.get_u64();
        let record_count = body.get_u32();
        Ok(Self::new(first_instant, record_count, body))
    }

    /// Decode the payload, checking it against the header
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        let records = LogRecord::decode_all(self.payload.clone())?;
        if records.len() != self.record_count as usize {
            return Err(ProtocolError::header_mismatch(format!(
                "record_count {} but payload holds {}",
                self.record_count,
                records.len()
            )));
        }
        if let Some(first) = records.first() {
            if first.instant != self.first_instant {
                return Err(ProtocolError::header_mismatch(format!(
                    "first_instant {} but payload starts at {}",
                    self.first_instant, first.instant
                )));
            }
        }
        Ok(records)
    }

    /// Write frame to a blocking stream
    pub fn write_to_sync<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut header = [0u8; 4 + FRAME_FIXED_LEN];
        self.write_header(&mut header);
        writer.write_all(&header)?;
        writer.write_all(&self.payload)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a frame from a blocking stream
    ///
    /// Returns `Ok(None)` on a clean end of stream before any header byte.
    pub fn read_from_sync<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        if !read_exact_or_eof(reader, &mut len_buf)? {
            return Ok(None);
        }
        let length = u32::from_be_bytes(len_buf) as usize;
        check_length(length)?;
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body)?;
        Self::decode_body(Bytes::from(body)).map(Some)
    }

    /// Write frame to an async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut header = [0u8; 4 + FRAME_FIXED_LEN];
        self.write_header(&mut header);
        writer.write_all(&header).await?;
        writer.write_all(&self.payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a frame from an async stream
    ///
    /// Returns `Ok(None)` on a clean end of stream before any header byte.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let length = u32::from_be_bytes(len_buf) as usize;
        check_length(length)?;
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        Self::decode_body(Bytes::from(body)).map(Some)
    }

    fn write_header(&self, header: &mut [u8; 4 + FRAME_FIXED_LEN]) {
        let mut cursor = &mut header[..];
        cursor.put_u32(self.body_len() as u32);
        cursor.put_u64(self.first_instant);
        cursor.put_u32(self.record_count);
    }
}

fn check_length(length: usize) -> Result<()> {
    if !(FRAME_FIXED_LEN..=MAX_FRAME_BYTES).contains(&length) {
        return Err(ProtocolError::FrameLength {
            max: MAX_FRAME_BYTES,
            got: length,
        });
    }
    Ok(())
}

/// `read_exact` that reports a clean EOF at offset zero as `false`
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0usize;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(false),
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame header truncated",
                )
                .into());
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
