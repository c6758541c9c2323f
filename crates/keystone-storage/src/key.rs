//! Fixed-length key codecs for B+ tree indexes.
//!
//! Every codec produces keys of a constant byte width. Encodings are order
//! preserving: integers and tick counts are stored big-endian with the sign
//! bit flipped, doubles use the IEEE total-order trick, so comparing two
//! encoded keys is a plain byte comparison.
//!
//! String keys are reduced to a CRC-32 hash of their UTF-8 bytes. Distinct
//! strings can share a hash, so a hit on a string key only means "maybe";
//! callers must check the stored value before trusting it.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use keystone_common::value::date_time_to_ticks;
use keystone_common::{ColumnType, KeystoneError, Result, Value};
use std::cmp::Ordering;

const STRING_KEY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Hash used as the key of a string value.
pub fn string_key_hash(s: &str) -> u32 {
    STRING_KEY_CRC.checksum(s.as_bytes())
}

/// A decoded key component.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Int(i32),
    Double(f64),
    /// Tick count.
    DateTime(i64),
    /// Hash of the original string; the string itself is not recoverable.
    StringHash(u32),
    Compound(Vec<KeyValue>),
    /// A compound key followed by an associated payload.
    WithValue(Box<KeyValue>, Box<KeyValue>),
}

impl KeyValue {
    /// Converts a column value to its key component. `Null` maps to the
    /// key of the type's default value.
    pub fn from_value(value: &Value, column_type: ColumnType) -> Result<Self> {
        let value = match value {
            Value::Null => Value::default_for(column_type),
            other => other.clone().coerce_to(column_type)?,
        };
        match value {
            Value::Integer(v) => Ok(KeyValue::Int(v)),
            Value::Double(v) => Ok(KeyValue::Double(v)),
            Value::DateTime(dt) => Ok(KeyValue::DateTime(date_time_to_ticks(&dt)?)),
            Value::String(s) => Ok(KeyValue::StringHash(string_key_hash(&s))),
            other => Err(KeystoneError::ColumnNotIndexable(other.type_name().to_string())),
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            KeyValue::Int(_) => "Int",
            KeyValue::Double(_) => "Double",
            KeyValue::DateTime(_) => "DateTime",
            KeyValue::StringHash(_) => "String",
            KeyValue::Compound(_) => "Compound",
            KeyValue::WithValue(_, _) => "CompoundWithValue",
        }
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::StringHash(string_key_hash(v))
    }
}

/// Codec for one index's keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCodec {
    /// 4-byte signed integer.
    Int,
    /// 8-byte IEEE double.
    Double,
    /// 8-byte tick count.
    DateTime,
    /// 4-byte hash of a string.
    String,
    /// Concatenation of component keys in index-column order.
    Compound(Vec<KeyCodec>),
    /// A key followed by a payload component.
    CompoundWithValue {
        key: Box<KeyCodec>,
        value: Box<KeyCodec>,
    },
}

impl KeyCodec {
    /// Selects the codec for a single indexed column.
    pub fn for_column(column_type: ColumnType) -> Result<Self> {
        match column_type {
            ColumnType::Integer => Ok(KeyCodec::Int),
            ColumnType::Double => Ok(KeyCodec::Double),
            ColumnType::DateTime => Ok(KeyCodec::DateTime),
            ColumnType::String => Ok(KeyCodec::String),
            ColumnType::LongString | ColumnType::Blob => {
                Err(KeystoneError::ColumnNotIndexable(column_type.to_string()))
            }
        }
    }

    /// Selects the codec for an index over the given column types.
    /// A single column yields a scalar codec, several a compound one.
    pub fn for_columns(column_types: &[ColumnType]) -> Result<Self> {
        match column_types {
            [] => Err(KeystoneError::InvalidParameter {
                name: "columns".to_string(),
                value: "[]".to_string(),
            }),
            [single] => Self::for_column(*single),
            many => Ok(KeyCodec::Compound(
                many.iter()
                    .map(|t| Self::for_column(*t))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    /// Fixed byte width of every key this codec produces.
    pub fn key_size(&self) -> usize {
        match self {
            KeyCodec::Int | KeyCodec::String => 4,
            KeyCodec::Double | KeyCodec::DateTime => 8,
            KeyCodec::Compound(parts) => parts.iter().map(|p| p.key_size()).sum(),
            KeyCodec::CompoundWithValue { key, value } => key.key_size() + value.key_size(),
        }
    }

    /// Number of top-level components (1 for scalar codecs).
    pub fn component_count(&self) -> usize {
        match self {
            KeyCodec::Compound(parts) => parts.len(),
            KeyCodec::CompoundWithValue { .. } => 2,
            _ => 1,
        }
    }

    fn mismatch(&self, value: &KeyValue) -> KeystoneError {
        KeystoneError::TypeMismatch {
            expected: format!("{:?}", self),
            actual: value.variant_name().to_string(),
        }
    }

    /// Serializes a key value, appending exactly `key_size()` bytes.
    pub fn write(&self, value: &KeyValue, buf: &mut BytesMut) -> Result<()> {
        match (self, value) {
            (KeyCodec::Int, KeyValue::Int(v)) => buf.put_u32((*v as u32) ^ 0x8000_0000),
            (KeyCodec::Double, KeyValue::Double(v)) => {
                // -0.0 and 0.0 compare equal and must share a key.
                let v = if *v == 0.0 { 0.0f64 } else { *v };
                let bits = v.to_bits();
                let ordered = if bits & (1 << 63) != 0 {
                    !bits
                } else {
                    bits ^ (1 << 63)
                };
                buf.put_u64(ordered);
            }
            (KeyCodec::DateTime, KeyValue::DateTime(t)) => buf.put_u64((*t as u64) ^ (1 << 63)),
            (KeyCodec::String, KeyValue::StringHash(h)) => buf.put_u32(*h),
            (KeyCodec::Compound(parts), KeyValue::Compound(values)) => {
                if parts.len() != values.len() {
                    return Err(KeystoneError::InvalidParameter {
                        name: "key".to_string(),
                        value: format!("{} components for {}", values.len(), parts.len()),
                    });
                }
                for (codec, part) in parts.iter().zip(values) {
                    codec.write(part, buf)?;
                }
            }
            (KeyCodec::CompoundWithValue { key, value: payload }, KeyValue::WithValue(k, v)) => {
                key.write(k, buf)?;
                payload.write(v, buf)?;
            }
            (codec, other) => return Err(codec.mismatch(other)),
        }
        Ok(())
    }

    /// Serializes a key value into a fresh buffer.
    pub fn encode(&self, value: &KeyValue) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.key_size());
        self.write(value, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Deserializes a key produced by `write`.
    pub fn read(&self, bytes: &[u8]) -> Result<KeyValue> {
        if bytes.len() < self.key_size() {
            return Err(KeystoneError::KeySizeMismatch {
                stored: bytes.len(),
                expected: self.key_size(),
            });
        }
        let value = match self {
            KeyCodec::Int => {
                let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                KeyValue::Int((raw ^ 0x8000_0000) as i32)
            }
            KeyCodec::Double => {
                let ordered = read_u64(bytes);
                let bits = if ordered & (1 << 63) != 0 {
                    ordered ^ (1 << 63)
                } else {
                    !ordered
                };
                KeyValue::Double(f64::from_bits(bits))
            }
            KeyCodec::DateTime => KeyValue::DateTime((read_u64(bytes) ^ (1 << 63)) as i64),
            KeyCodec::String => {
                KeyValue::StringHash(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            KeyCodec::Compound(parts) => {
                let mut values = Vec::with_capacity(parts.len());
                let mut at = 0;
                for codec in parts {
                    values.push(codec.read(&bytes[at..])?);
                    at += codec.key_size();
                }
                KeyValue::Compound(values)
            }
            KeyCodec::CompoundWithValue { key, value } => {
                let k = key.read(bytes)?;
                let v = value.read(&bytes[key.key_size()..])?;
                KeyValue::WithValue(Box::new(k), Box::new(v))
            }
        };
        Ok(value)
    }

    /// Orders two encoded keys.
    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn write_prefix(&self, prefix: &[KeyValue], pad: u8, buf: &mut BytesMut) -> Result<()> {
        let start = buf.len();
        match self {
            KeyCodec::Compound(parts) => {
                if prefix.len() > parts.len() {
                    return Err(KeystoneError::InvalidParameter {
                        name: "prefix".to_string(),
                        value: format!("{} components for {}", prefix.len(), parts.len()),
                    });
                }
                for (codec, part) in parts.iter().zip(prefix) {
                    codec.write(part, buf)?;
                }
            }
            KeyCodec::CompoundWithValue { key, .. } => {
                if let Some(first) = prefix.first() {
                    key.write(first, buf)?;
                }
            }
            scalar => {
                if let Some(first) = prefix.first() {
                    scalar.write(first, buf)?;
                }
            }
        }
        let written = buf.len() - start;
        buf.put_bytes(pad, self.key_size() - written);
        Ok(())
    }

    /// Writes the smallest key starting with `prefix`.
    pub fn write_prefix_low(&self, prefix: &[KeyValue], buf: &mut BytesMut) -> Result<()> {
        self.write_prefix(prefix, 0x00, buf)
    }

    /// Writes the largest key starting with `prefix`.
    pub fn write_prefix_high(&self, prefix: &[KeyValue], buf: &mut BytesMut) -> Result<()> {
        self.write_prefix(prefix, 0xFF, buf)
    }

    /// Returns the inclusive `[low, high]` key range covering `prefix`.
    pub fn prefix_range(&self, prefix: &[KeyValue]) -> Result<(Bytes, Bytes)> {
        let mut low = BytesMut::with_capacity(self.key_size());
        let mut high = BytesMut::with_capacity(self.key_size());
        self.write_prefix_low(prefix, &mut low)?;
        self.write_prefix_high(prefix, &mut high)?;
        Ok((low.freeze(), high.freeze()))
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(codec: &KeyCodec, value: KeyValue) -> Bytes {
        codec.encode(&value).unwrap()
    }

    #[test]
    fn test_key_sizes() {
        assert_eq!(KeyCodec::Int.key_size(), 4);
        assert_eq!(KeyCodec::String.key_size(), 4);
        assert_eq!(KeyCodec::Double.key_size(), 8);
        assert_eq!(KeyCodec::DateTime.key_size(), 8);
        let compound = KeyCodec::Compound(vec![KeyCodec::String, KeyCodec::Int]);
        assert_eq!(compound.key_size(), 8);
        let with_value = KeyCodec::CompoundWithValue {
            key: Box::new(compound),
            value: Box::new(KeyCodec::DateTime),
        };
        assert_eq!(with_value.key_size(), 16);
    }

    #[test]
    fn test_for_columns() {
        assert_eq!(
            KeyCodec::for_columns(&[ColumnType::Integer]).unwrap(),
            KeyCodec::Int
        );
        assert_eq!(
            KeyCodec::for_columns(&[ColumnType::String, ColumnType::Integer]).unwrap(),
            KeyCodec::Compound(vec![KeyCodec::String, KeyCodec::Int])
        );
        assert!(matches!(
            KeyCodec::for_column(ColumnType::Blob),
            Err(KeystoneError::ColumnNotIndexable(_))
        ));
        assert!(KeyCodec::for_columns(&[]).is_err());
    }

    #[test]
    fn test_int_order_preserved() {
        let codec = KeyCodec::Int;
        let values = [i32::MIN, -100, -1, 0, 1, 31, 777, i32::MAX];
        let keys: Vec<Bytes> = values.iter().map(|v| enc(&codec, KeyValue::Int(*v))).collect();
        for pair in keys.windows(2) {
            assert_eq!(codec.compare(&pair[0], &pair[1]), Ordering::Less);
        }
        for (v, k) in values.iter().zip(&keys) {
            assert_eq!(codec.read(k).unwrap(), KeyValue::Int(*v));
        }
    }

    #[test]
    fn test_double_order_preserved() {
        let codec = KeyCodec::Double;
        let values = [f64::NEG_INFINITY, -1e10, -2.5, -1e-9, 0.0, 1e-9, 3.25, f64::INFINITY];
        let keys: Vec<Bytes> = values
            .iter()
            .map(|v| enc(&codec, KeyValue::Double(*v)))
            .collect();
        for pair in keys.windows(2) {
            assert_eq!(codec.compare(&pair[0], &pair[1]), Ordering::Less);
        }
        assert_eq!(codec.read(&keys[2]).unwrap(), KeyValue::Double(-2.5));
    }

    #[test]
    fn test_double_zero_sign_ignored() {
        let codec = KeyCodec::Double;
        let negative = enc(&codec, KeyValue::Double(-0.0));
        let positive = enc(&codec, KeyValue::Double(0.0));
        assert_eq!(negative, positive);
        assert_eq!(codec.read(&negative).unwrap(), KeyValue::Double(0.0));
    }

    #[test]
    fn test_datetime_order_preserved() {
        let codec = KeyCodec::DateTime;
        let early = enc(&codec, KeyValue::DateTime(-5_000_000));
        let late = enc(&codec, KeyValue::DateTime(1_300_000_000_000_000));
        assert!(early < late);
        assert_eq!(codec.read(&late).unwrap(), KeyValue::DateTime(1_300_000_000_000_000));
    }

    #[test]
    fn test_string_key_is_hash() {
        let codec = KeyCodec::String;
        let key = enc(&codec, KeyValue::from("Sergey"));
        assert_eq!(key.len(), 4);
        assert_eq!(
            codec.read(&key).unwrap(),
            KeyValue::StringHash(string_key_hash("Sergey"))
        );
        assert_ne!(string_key_hash("Sergey"), string_key_hash("Misha"));
        // Standard CRC-32 check value.
        assert_eq!(string_key_hash("123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_compound_orders_by_first_component() {
        let codec = KeyCodec::Compound(vec![KeyCodec::Int, KeyCodec::Int]);
        let a = enc(&codec, KeyValue::Compound(vec![1.into(), 999.into()]));
        let b = enc(&codec, KeyValue::Compound(vec![2.into(), (-5).into()]));
        let c = enc(&codec, KeyValue::Compound(vec![2.into(), 0.into()]));
        assert!(a < b && b < c);
        assert_eq!(
            codec.read(&b).unwrap(),
            KeyValue::Compound(vec![KeyValue::Int(2), KeyValue::Int(-5)])
        );
    }

    #[test]
    fn test_compound_with_value() {
        let codec = KeyCodec::CompoundWithValue {
            key: Box::new(KeyCodec::Compound(vec![KeyCodec::Int, KeyCodec::String])),
            value: Box::new(KeyCodec::Int),
        };
        let value = KeyValue::WithValue(
            Box::new(KeyValue::Compound(vec![7.into(), "x".into()])),
            Box::new(KeyValue::Int(42)),
        );
        let key = enc(&codec, value.clone());
        assert_eq!(key.len(), 12);
        assert_eq!(codec.read(&key).unwrap(), value);
    }

    #[test]
    fn test_write_rejects_wrong_variant() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            KeyCodec::Int.write(&KeyValue::Double(1.0), &mut buf),
            Err(KeystoneError::TypeMismatch { .. })
        ));
        let codec = KeyCodec::Compound(vec![KeyCodec::Int, KeyCodec::Int]);
        assert!(codec
            .write(&KeyValue::Compound(vec![1.into()]), &mut buf)
            .is_err());
    }

    #[test]
    fn test_read_short_buffer() {
        assert!(matches!(
            KeyCodec::Double.read(&[0u8; 4]),
            Err(KeystoneError::KeySizeMismatch { .. })
        ));
    }

    #[test]
    fn test_prefix_range_brackets_all_suffixes() {
        let codec = KeyCodec::Compound(vec![KeyCodec::String, KeyCodec::Int]);
        let (low, high) = codec.prefix_range(&[KeyValue::from("Serg")]).unwrap();
        assert_eq!(low.len(), 8);
        assert_eq!(high.len(), 8);

        for age in [i32::MIN, 0, 31, i32::MAX] {
            let key = enc(
                &codec,
                KeyValue::Compound(vec!["Serg".into(), age.into()]),
            );
            assert!(low <= key && key <= high);
        }
        let other = enc(&codec, KeyValue::Compound(vec!["Misha".into(), 31.into()]));
        assert!(other < low || other > high);
    }

    #[test]
    fn test_empty_prefix_covers_everything() {
        let (low, high) = KeyCodec::Int.prefix_range(&[]).unwrap();
        assert_eq!(&low[..], &[0u8; 4]);
        assert_eq!(&high[..], &[0xFFu8; 4]);
    }

    #[test]
    fn test_key_value_from_value() {
        assert_eq!(
            KeyValue::from_value(&Value::Integer(5), ColumnType::Integer).unwrap(),
            KeyValue::Int(5)
        );
        assert_eq!(
            KeyValue::from_value(&Value::Null, ColumnType::String).unwrap(),
            KeyValue::StringHash(string_key_hash(""))
        );
        assert_eq!(
            KeyValue::from_value(&Value::Integer(2), ColumnType::Double).unwrap(),
            KeyValue::Double(2.0)
        );
        assert!(KeyValue::from_value(&Value::from("x"), ColumnType::Integer).is_err());
    }
}
