//! Stored record representation and body serialization.

use crate::heap::constants::{DATA_START, RECORD_SLOT_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use keystone_common::page::PAGE_SIZE;
use keystone_common::value::{date_time_to_ticks, ticks_to_date_time};
use keystone_common::{ColumnType, KeystoneError, Result, Value};

/// Location of a record inside its heap file.
///
/// The value is the byte offset of the record's slot descriptor, so it fits
/// in the `u32` payload of a B+ tree entry and stays stable for the life of
/// the record (until defragmentation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordOffset(pub u32);

impl RecordOffset {
    /// Largest page number whose slots are still addressable.
    pub const MAX_PAGE_NUM: u32 = (u32::MAX as u64 / PAGE_SIZE as u64) as u32 - 1;

    /// Builds the offset of a slot.
    pub fn from_slot(page_num: u32, slot: u16) -> Self {
        let offset = page_num as u64 * PAGE_SIZE as u64
            + DATA_START as u64
            + slot as u64 * RECORD_SLOT_SIZE as u64;
        Self(offset as u32)
    }

    /// Page holding the slot.
    pub fn page_num(&self) -> u32 {
        self.0 / PAGE_SIZE as u32
    }

    /// Slot index within the page, or None if the offset does not point at
    /// a slot descriptor.
    pub fn slot(&self) -> Option<u16> {
        let within = (self.0 % PAGE_SIZE as u32) as usize;
        if within < DATA_START || (within - DATA_START) % RECORD_SLOT_SIZE != 0 {
            return None;
        }
        Some(((within - DATA_START) / RECORD_SLOT_SIZE) as u16)
    }
}

impl std::fmt::Display for RecordOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Header stored in front of every record body.
///
/// Layout (8 bytes):
/// - flags: 2 bytes
/// - data_len: 2 bytes
/// - record_id: 4 bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordHeader {
    pub flags: RecordFlags,
    /// Length of the body in bytes.
    pub data_len: u16,
    /// Table-unique record ID.
    pub record_id: u32,
}

impl RecordHeader {
    /// Size of the record header in bytes.
    pub const SIZE: usize = 8;

    /// Creates a header for a live record.
    pub fn new(record_id: u32, data_len: u16) -> Self {
        Self {
            flags: RecordFlags::empty(),
            data_len,
            record_id,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.flags.0.to_le_bytes());
        buf[2..4].copy_from_slice(&self.data_len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.record_id.to_le_bytes());
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            flags: RecordFlags(u16::from_le_bytes([buf[0], buf[1]])),
            data_len: u16::from_le_bytes([buf[2], buf[3]]),
            record_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Flags for record state.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFlags(pub u16);

impl RecordFlags {
    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Record has been deleted (tombstone).
    pub const DELETED: u16 = 0x0001;

    /// Returns true if the deleted flag is set.
    pub fn is_deleted(&self) -> bool {
        self.0 & Self::DELETED != 0
    }

    /// Sets the deleted flag.
    pub fn set_deleted(&mut self, deleted: bool) {
        if deleted {
            self.0 |= Self::DELETED;
        } else {
            self.0 &= !Self::DELETED;
        }
    }
}

/// A record read back from a heap file.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub header: RecordHeader,
    pub body: Bytes,
}

impl StoredRecord {
    /// Returns the record ID.
    pub fn id(&self) -> u32 {
        self.header.record_id
    }

    /// Returns true if this record is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.header.flags.is_deleted()
    }
}

/// Encodes column values into a record body.
///
/// Body layout: a null bitmap (one bit per column, set = null) followed by
/// the non-null values in column order. Integers, doubles and tick counts are
/// little-endian; `String` carries a 2-byte length prefix, `LongString` and
/// `Blob` a 4-byte one.
pub fn encode_values(types: &[ColumnType], values: &[Value]) -> Result<Bytes> {
    if types.len() != values.len() {
        return Err(KeystoneError::InvalidParameter {
            name: "values".to_string(),
            value: format!("{} values for {} columns", values.len(), types.len()),
        });
    }

    let bitmap_len = types.len().div_ceil(8);
    let mut bitmap = vec![0u8; bitmap_len];
    let mut buf = BytesMut::with_capacity(64);

    for (idx, (column_type, value)) in types.iter().zip(values).enumerate() {
        match (column_type, value) {
            (_, Value::Null) => bitmap[idx / 8] |= 1 << (idx % 8),
            (ColumnType::Integer, Value::Integer(v)) => buf.put_i32_le(*v),
            (ColumnType::Double, Value::Double(v)) => buf.put_f64_le(*v),
            (ColumnType::DateTime, Value::DateTime(v)) => buf.put_i64_le(date_time_to_ticks(v)?),
            (ColumnType::String, Value::String(s)) => {
                let len = u16::try_from(s.len()).map_err(|_| KeystoneError::RecordTooLarge {
                    size: s.len(),
                    max: u16::MAX as usize,
                })?;
                buf.put_u16_le(len);
                buf.put_slice(s.as_bytes());
            }
            (ColumnType::LongString, Value::LongString(s)) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            (ColumnType::Blob, Value::Blob(b)) => {
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
            (expected, actual) => {
                return Err(KeystoneError::TypeMismatch {
                    expected: expected.to_string(),
                    actual: actual.type_name().to_string(),
                })
            }
        }
    }

    let mut body = BytesMut::with_capacity(bitmap_len + buf.len());
    body.put_slice(&bitmap);
    body.put_slice(&buf);
    Ok(body.freeze())
}

fn truncated(what: &str) -> KeystoneError {
    KeystoneError::IoError(format!("record body truncated while reading {}", what))
}

fn take_string(buf: &mut Bytes, len: usize) -> Result<String> {
    if buf.remaining() < len {
        return Err(truncated("string"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| KeystoneError::IoError(format!("invalid UTF-8 in record body: {}", e)))
}

/// Decodes a record body produced by [`encode_values`].
pub fn decode_values(types: &[ColumnType], body: &Bytes) -> Result<Vec<Value>> {
    let mut buf = body.clone();
    let bitmap_len = types.len().div_ceil(8);
    if buf.remaining() < bitmap_len {
        return Err(truncated("null bitmap"));
    }
    let bitmap = buf.split_to(bitmap_len);

    let mut values = Vec::with_capacity(types.len());
    for (idx, column_type) in types.iter().enumerate() {
        if bitmap[idx / 8] & (1 << (idx % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let value = match column_type {
            ColumnType::Integer => {
                if buf.remaining() < 4 {
                    return Err(truncated("integer"));
                }
                Value::Integer(buf.get_i32_le())
            }
            ColumnType::Double => {
                if buf.remaining() < 8 {
                    return Err(truncated("double"));
                }
                Value::Double(buf.get_f64_le())
            }
            ColumnType::DateTime => {
                if buf.remaining() < 8 {
                    return Err(truncated("datetime"));
                }
                let ticks = buf.get_i64_le();
                Value::DateTime(ticks_to_date_time(ticks).ok_or_else(|| {
                    KeystoneError::IoError(format!("datetime ticks out of range: {}", ticks))
                })?)
            }
            ColumnType::String => {
                if buf.remaining() < 2 {
                    return Err(truncated("string length"));
                }
                let len = buf.get_u16_le() as usize;
                Value::String(take_string(&mut buf, len)?)
            }
            ColumnType::LongString => {
                if buf.remaining() < 4 {
                    return Err(truncated("string length"));
                }
                let len = buf.get_u32_le() as usize;
                Value::LongString(take_string(&mut buf, len)?)
            }
            ColumnType::Blob => {
                if buf.remaining() < 4 {
                    return Err(truncated("blob length"));
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(truncated("blob"));
                }
                Value::Blob(buf.split_to(len).to_vec())
            }
        };
        values.push(value);
    }

    Ok(values)
}
