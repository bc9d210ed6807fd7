//! Formats column values and rows for dumps and logs.

use itertools::Itertools as _;

use super::{text, Value};

/// Formats values and named rows.
pub trait Formatter {
    /// Formats a single value.
    fn value(value: &Value) -> String;

    /// Formats a `name=value` pair.
    fn column(name: &str, value: &Value) -> String {
        format!("{name}={}", Self::value(value))
    }

    /// Formats a row of named columns.
    fn row<'a, I>(columns: I) -> String
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        columns
            .into_iter()
            .map(|(name, value)| Self::column(name, value))
            .join(" ")
    }
}

/// Formats values the way they are written to text backends, quoting and
/// escaping strings so control characters stay on one line.
pub struct Raw;

impl Raw {
    /// Formats raw bytes as escaped ASCII strings.
    pub fn bytes(bytes: &[u8]) -> String {
        let escaped = bytes
            .iter()
            .copied()
            .flat_map(std::ascii::escape_default)
            .collect_vec();
        format!("\"{}\"", String::from_utf8_lossy(&escaped))
    }
}

impl Formatter for Raw {
    fn value(value: &Value) -> String {
        match value {
            Value::String(s) => Self::bytes(s.as_bytes()),
            other => text::encode(other).unwrap_or_else(|e| format!("<{e}>")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_formatting() {
        let user = Value::from("alice");
        let expires = Value::DateTime(0);
        let path = Value::Null;
        let row = Raw::row([
            ("username", &user),
            ("expires", &expires),
            ("path", &path),
        ]);
        assert_eq!(
            row,
            "username=\"alice\" expires=1970-01-01 00:00:00 path=NULL"
        );
    }

    #[test]
    fn test_strings_are_escaped() {
        assert_eq!(Raw::value(&Value::from("a\"b\n")), "\"a\\\"b\\n\"");
    }
}
