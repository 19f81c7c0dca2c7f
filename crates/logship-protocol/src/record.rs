//! Serialized log record layout
//!
//! `[instant:u64][data_len:u32][opt_len:u32][data][opt]`, big-endian. The
//! replication log buffer stores records in exactly this form so a batch
//! payload is a plain byte copy out of the buffer.

use crate::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes};

/// Size of the fixed record header
pub const RECORD_HEADER_LEN: usize = 16;

/// Serialized size of a record with the given span lengths
pub fn encoded_len(data_len: usize, opt_len: usize) -> usize {
    RECORD_HEADER_LEN + data_len + opt_len
}

/// A decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log instant assigned by the master's log manager
    pub instant: u64,
    /// Required data span
    pub data: Bytes,
    /// Optional data span (empty when absent)
    pub optional: Bytes,
}

impl LogRecord {
    /// Create a record from owned spans
    pub fn new(instant: u64, data: impl Into<Bytes>, optional: impl Into<Bytes>) -> Self {
        Self {
            instant,
            data: data.into(),
            optional: optional.into(),
        }
    }

    /// Serialized size of this record
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.data.len(), self.optional.len())
    }

    /// Append the serialized record to `buf`
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        write_header(buf, self.instant, self.data.len(), self.optional.len());
        buf.put_slice(&self.data);
        buf.put_slice(&self.optional);
    }

    /// Decode one record from the front of `buf`, advancing it
    pub fn decode_from(buf: &mut Bytes) -> Result<Self> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(ProtocolError::truncated(
                "record header",
                RECORD_HEADER_LEN,
                buf.len(),
            ));
        }
        let instant = buf.get_u64();
        let data_len = buf.get_u32() as usize;
        let opt_len = buf.get_u32() as usize;
        if buf.len() < data_len + opt_len {
            return Err(ProtocolError::truncated(
                "record body",
                data_len + opt_len,
                buf.len(),
            ));
        }
        let data = buf.split_to(data_len);
        let optional = buf.split_to(opt_len);
        Ok(Self {
            instant,
            data,
            optional,
        })
    }

    /// Decode a whole payload, checking that instants strictly increase
    pub fn decode_all(mut payload: Bytes) -> Result<Vec<Self>> {
        let mut records = Vec::new();
        let mut previous: Option<u64> = None;
        while payload.has_remaining() {
            let record = Self::decode_from(&mut payload)?;
            if let Some(previous) = previous {
                if record.instant <= previous {
                    return Err(ProtocolError::NonIncreasingInstant {
                        previous,
                        got: record.instant,
                    });
                }
            }
            previous = Some(record.instant);
            records.push(record);
        }
        Ok(records)
    }
}

/// Write a record header
pub fn write_header<B: BufMut>(buf: &mut B, instant: u64, data_len: usize, opt_len: usize) {
    buf.put_u64(instant);
    buf.put_u32(data_len as u32);
    buf.put_u32(opt_len as u32);
}

/// Read a record header from the front of a slice: `(instant, data_len, opt_len)`
pub fn read_header(mut header: &[u8]) -> Result<(u64, usize, usize)> {
    if header.len() < RECORD_HEADER_LEN {
        return Err(ProtocolError::truncated(
            "record header",
            RECORD_HEADER_LEN,
            header.len(),
        ));
    }
    let instant = header.get_u64();
    let data_len = header.get_u32() as usize;
    let opt_len = header.get_u32() as usize;
    Ok((instant, data_len, opt_len))
}
