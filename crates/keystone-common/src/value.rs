//! Column values.

use crate::error::{KeystoneError, Result};
use crate::types::ColumnType;
use chrono::{DateTime, NaiveDateTime};

/// A single column value of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value (nullable columns only).
    Null,
    Integer(i32),
    Double(f64),
    String(String),
    DateTime(NaiveDateTime),
    LongString(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Returns the value a fresh record holds for a column of this type.
    pub fn default_for(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Integer => Value::Integer(0),
            ColumnType::Double => Value::Double(0.0),
            ColumnType::String => Value::String(String::new()),
            ColumnType::DateTime => Value::DateTime(NaiveDateTime::default()),
            ColumnType::LongString => Value::LongString(String::new()),
            ColumnType::Blob => Value::Blob(Vec::new()),
        }
    }

    /// Returns true if this is `Value::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Integer(_) => "INTEGER",
            Value::Double(_) => "DOUBLE",
            Value::String(_) => "STRING",
            Value::DateTime(_) => "DATETIME",
            Value::LongString(_) => "LONGSTRING",
            Value::Blob(_) => "BLOB",
        }
    }

    /// Converts the value to the representation a column of `column_type`
    /// stores. Strings move freely between `String` and `LongString`;
    /// integers widen to doubles. `Null` passes through unchanged.
    pub fn coerce_to(self, column_type: ColumnType) -> Result<Value> {
        match (column_type, self) {
            (_, Value::Null) => Ok(Value::Null),
            (ColumnType::Integer, v @ Value::Integer(_)) => Ok(v),
            (ColumnType::Double, v @ Value::Double(_)) => Ok(v),
            (ColumnType::Double, Value::Integer(i)) => Ok(Value::Double(i as f64)),
            (ColumnType::String, Value::String(s) | Value::LongString(s)) => Ok(Value::String(s)),
            (ColumnType::LongString, Value::String(s) | Value::LongString(s)) => {
                Ok(Value::LongString(s))
            }
            (ColumnType::DateTime, v @ Value::DateTime(_)) => Ok(v),
            (ColumnType::Blob, v @ Value::Blob(_)) => Ok(v),
            (expected, actual) => Err(KeystoneError::TypeMismatch {
                expected: expected.to_string(),
                actual: actual.type_name().to_string(),
            }),
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::LongString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date_time(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }
}

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Converts a timestamp to the 64-bit tick count used on disk (nanoseconds
/// since the Unix epoch). Timestamps outside roughly 1677..2262 have no
/// tick count.
pub fn date_time_to_ticks(dt: &NaiveDateTime) -> Result<i64> {
    dt.and_utc()
        .timestamp_nanos_opt()
        .ok_or_else(|| KeystoneError::InvalidParameter {
            name: "datetime".to_string(),
            value: dt.to_string(),
        })
}

/// Converts a stored tick count back to a timestamp.
pub fn ticks_to_date_time(ticks: i64) -> Option<NaiveDateTime> {
    let secs = ticks.div_euclid(NANOS_PER_SEC);
    let nanos = ticks.rem_euclid(NANOS_PER_SEC) as u32;
    DateTime::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) | Value::LongString(s) => write!(f, "{}", s),
            Value::DateTime(dt) => write!(f, "{}", dt),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2004, 2, 29)
            .unwrap()
            .and_hms_micro_opt(13, 45, 10, 250)
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Value::default_for(ColumnType::Integer), Value::Integer(0));
        assert_eq!(
            Value::default_for(ColumnType::String),
            Value::String(String::new())
        );
        assert_eq!(Value::default_for(ColumnType::Blob), Value::Blob(Vec::new()));
        assert_eq!(
            Value::default_for(ColumnType::DateTime),
            Value::DateTime(NaiveDateTime::default())
        );
    }

    #[test]
    fn test_coerce_to() {
        assert_eq!(
            Value::from("abc").coerce_to(ColumnType::LongString).unwrap(),
            Value::LongString("abc".to_string())
        );
        assert_eq!(
            Value::from(3).coerce_to(ColumnType::Double).unwrap(),
            Value::Double(3.0)
        );
        assert_eq!(Value::Null.coerce_to(ColumnType::Integer).unwrap(), Value::Null);

        let err = Value::from("abc").coerce_to(ColumnType::Integer).unwrap_err();
        match err {
            KeystoneError::TypeMismatch { expected, actual } => {
                assert_eq!(expected, "INTEGER");
                assert_eq!(actual, "STRING");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Integer(7).as_int(), Some(7));
        assert_eq!(Value::Integer(7).as_double(), Some(7.0));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(vec![1u8, 2]).as_blob(), Some(&[1u8, 2][..]));
        assert_eq!(Value::from("x").as_int(), None);
        assert!(Value::from(None::<i32>).is_null());
    }

    #[test]
    fn test_ticks_roundtrip() {
        let dt = sample_time();
        let ticks = date_time_to_ticks(&dt).unwrap();
        assert_eq!(ticks_to_date_time(ticks), Some(dt));
        assert_eq!(date_time_to_ticks(&NaiveDateTime::default()).unwrap(), 0);
    }

    #[test]
    fn test_ticks_keep_nanoseconds() {
        let base = sample_time();
        let a = base + chrono::Duration::nanoseconds(1);
        let b = base + chrono::Duration::nanoseconds(2);
        let (ta, tb) = (date_time_to_ticks(&a).unwrap(), date_time_to_ticks(&b).unwrap());
        assert_eq!(tb - ta, 1);
        assert_eq!(ticks_to_date_time(ta), Some(a));

        let before_epoch = NaiveDateTime::default() - chrono::Duration::nanoseconds(5);
        let ticks = date_time_to_ticks(&before_epoch).unwrap();
        assert_eq!(ticks, -5);
        assert_eq!(ticks_to_date_time(ticks), Some(before_epoch));
    }

    #[test]
    fn test_ticks_out_of_range() {
        let far = chrono::NaiveDate::from_ymd_opt(3000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert!(matches!(
            date_time_to_ticks(&far),
            Err(KeystoneError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_ticks_preserve_order() {
        let earlier = sample_time();
        let later = earlier + chrono::Duration::seconds(1);
        assert!(date_time_to_ticks(&earlier).unwrap() < date_time_to_ticks(&later).unwrap());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Integer(-5).to_string(), "-5");
        assert_eq!(Value::from("Serg").to_string(), "Serg");
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::Blob(vec![0; 3]).to_string(), "<3 bytes>");
    }
}
