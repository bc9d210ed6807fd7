//! Textual form of column values.
//!
//! Numbers are decimal, datetimes are `%Y-%m-%d %H:%M:%S` in UTC, blobs are
//! lowercase hex and NULL is the bare word `NULL`.

use chrono::{DateTime, NaiveDateTime};

use super::{EncodingError, Value, ValueType};

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const NULL: &str = "NULL";

pub fn encode(value: &Value) -> Result<String, EncodingError> {
    let text = match value {
        Value::Null => NULL.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::String(s) => s.clone(),
        Value::Blob(b) => hex::encode(b),
        Value::DateTime(secs) => DateTime::from_timestamp(*secs, 0)
            .ok_or_else(|| EncodingError::InvalidFormat(format!("timestamp {secs} out of range")))?
            .format(DATETIME_FORMAT)
            .to_string(),
        Value::Bitmap(v) => v.to_string(),
    };
    Ok(text)
}

pub fn decode(ty: ValueType, text: &str) -> Result<Value, EncodingError> {
    let invalid = |what: &str| EncodingError::InvalidFormat(format!("{what}: {text:?}"));
    let value = match ty {
        ValueType::Int => Value::Int(text.trim().parse().map_err(|_| invalid("int"))?),
        ValueType::BigInt => Value::BigInt(text.trim().parse().map_err(|_| invalid("bigint"))?),
        ValueType::Double => Value::Double(text.trim().parse().map_err(|_| invalid("double"))?),
        ValueType::String => Value::String(text.to_string()),
        ValueType::Blob => Value::Blob(hex::decode(text.trim()).map_err(|_| invalid("blob"))?),
        ValueType::DateTime => {
            let parsed = NaiveDateTime::parse_from_str(text.trim(), DATETIME_FORMAT)
                .map_err(|_| invalid("datetime"))?;
            Value::DateTime(parsed.and_utc().timestamp())
        }
        ValueType::Bitmap => Value::Bitmap(text.trim().parse().map_err(|_| invalid("bitmap"))?),
    };
    Ok(value)
}

/// Decodes a column that may be absent or NULL.
pub fn decode_nullable(ty: ValueType, text: Option<&str>) -> Result<Value, EncodingError> {
    match text {
        None | Some(NULL) => Ok(Value::Null),
        Some(text) => decode(ty, text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_text_form() {
        let text = encode(&Value::DateTime(0)).unwrap();
        assert_eq!(text, "1970-01-01 00:00:00");
        assert_eq!(
            decode(ValueType::DateTime, "2024-03-01 12:30:05").unwrap(),
            Value::DateTime(1_709_296_205)
        );
    }

    #[test]
    fn test_blob_is_hex() {
        assert_eq!(encode(&Value::Blob(vec![0xde, 0xad])).unwrap(), "dead");
        assert_eq!(decode(ValueType::Blob, "00ff").unwrap(), Value::Blob(vec![0, 255]));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(ValueType::Int, "twelve"),
            Err(EncodingError::InvalidFormat(_))
        ));
        assert!(decode(ValueType::DateTime, "yesterday").is_err());
    }

    #[test]
    fn test_nullable() {
        assert_eq!(decode_nullable(ValueType::Int, None).unwrap(), Value::Null);
        assert_eq!(decode_nullable(ValueType::String, Some("NULL")).unwrap(), Value::Null);
        assert_eq!(encode(&Value::Null).unwrap(), "NULL");
        assert_eq!(decode_nullable(ValueType::Int, Some(" 42")).unwrap(), Value::Int(42));
    }
}
