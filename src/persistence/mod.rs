//! Uniform typed-column CRUD contract the location store persists through.
//!
//! Backends are selected by URL with [`connect`]: `mem://` keeps tables in
//! process memory, `file://<dir>` keeps one checksummed append-only journal
//! per table under `<dir>`.

pub mod journal;
pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::encoding::Value;
use crate::error::{Error, Result};

pub use journal::JournalAdapter;
pub use memory::{MemoryAdapter, MemoryStore};

/// A stored row, keyed by column name. Missing columns read as NULL.
pub type Row = BTreeMap<String, Value>;

/// Comparison applied between a stored column and a match value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Op {
    /// NULL equals only NULL under `Eq` and is unordered otherwise.
    pub fn matches(&self, stored: &Value, wanted: &Value) -> bool {
        use std::cmp::Ordering::*;
        let ord = stored.compare(wanted);
        match self {
            Op::Eq => ord == Some(Equal),
            Op::Ne => matches!(ord, Some(Less | Greater)) || (stored.is_null() != wanted.is_null()),
            Op::Lt => ord == Some(Less),
            Op::Gt => ord == Some(Greater),
            Op::Le => matches!(ord, Some(Less | Equal)) && !stored.is_null(),
            Op::Ge => matches!(ord, Some(Greater | Equal)) && !stored.is_null(),
        }
    }
}

/// One `column op value` predicate; a filter is the conjunction of its
/// conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub op: Op,
    pub value: Value,
}

impl Condition {
    /// Zips parallel key/op/value slices. An empty `ops` slice means every
    /// comparison is `Eq`.
    pub fn build(keys: &[&str], ops: &[Op], values: &[Value]) -> Result<Vec<Condition>> {
        if keys.len() != values.len() || (!ops.is_empty() && ops.len() != keys.len()) {
            return Err(Error::InvalidOperation(format!(
                "mismatched filter: {} keys, {} ops, {} values",
                keys.len(),
                ops.len(),
                values.len()
            )));
        }
        Ok(keys
            .iter()
            .zip(values)
            .enumerate()
            .map(|(i, (key, value))| Condition {
                column: key.to_string(),
                op: ops.get(i).copied().unwrap_or(Op::Eq),
                value: value.clone(),
            })
            .collect())
    }

    pub fn matches(&self, row: &Row) -> bool {
        let stored = row.get(&self.column).unwrap_or(&Value::Null);
        self.op.matches(stored, &self.value)
    }
}

pub(crate) fn matches_all(conditions: &[Condition], row: &Row) -> bool {
    conditions.iter().all(|c| c.matches(row))
}

/// Builds a row from parallel key/value slices.
pub(crate) fn build_row(keys: &[&str], values: &[Value]) -> Result<Row> {
    if keys.len() != values.len() {
        return Err(Error::InvalidOperation(format!(
            "mismatched row: {} keys, {} values",
            keys.len(),
            values.len()
        )));
    }
    Ok(keys
        .iter()
        .zip(values)
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect())
}

/// Result of a query: the selected columns and one value vector per row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value at (`row`, `column`), NULL when the column was not selected.
    pub fn get(&self, row: usize, column: &str) -> &Value {
        self.column_index(column)
            .and_then(|i| self.rows.get(row)?.get(i))
            .unwrap_or(&Value::Null)
    }
}

/// CRUD operations against the currently selected table.
pub trait PersistenceAdapter: Send {
    /// Selects the table subsequent operations apply to.
    fn use_table(&mut self, name: &str) -> Result<()>;

    fn insert(&mut self, keys: &[&str], values: &[Value]) -> Result<()>;

    /// Returns the number of rows changed.
    fn update(
        &mut self,
        match_keys: &[&str],
        match_ops: &[Op],
        match_values: &[Value],
        set_keys: &[&str],
        set_values: &[Value],
    ) -> Result<usize>;

    /// Returns the number of rows removed.
    fn delete(&mut self, match_keys: &[&str], match_ops: &[Op], match_values: &[Value])
        -> Result<usize>;

    /// Selects `columns` of matching rows, optionally ordered ascending by
    /// `order_by`. An empty `columns` slice selects every column seen.
    fn query(
        &mut self,
        match_keys: &[&str],
        match_ops: &[Op],
        match_values: &[Value],
        columns: &[&str],
        order_by: Option<&str>,
    ) -> Result<RowSet>;

    fn close(&mut self) -> Result<()>;
}

/// Opens the backend named by `url`.
pub fn connect(url: &str) -> Result<Box<dyn PersistenceAdapter>> {
    if url.starts_with("mem://") {
        return Ok(Box::new(MemoryAdapter::new(MemoryStore::new())));
    }
    if let Some(dir) = url.strip_prefix("file://") {
        if dir.is_empty() {
            return Err(Error::InvalidConfig("file:// url needs a directory".into()));
        }
        return Ok(Box::new(JournalAdapter::open(dir)?));
    }
    Err(Error::InvalidConfig(format!("unsupported database url: {url}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_null_semantics() {
        assert!(Op::Eq.matches(&Value::Null, &Value::Null));
        assert!(!Op::Eq.matches(&Value::Null, &Value::Int(0)));
        assert!(Op::Ne.matches(&Value::Null, &Value::Int(0)));
        assert!(!Op::Lt.matches(&Value::Null, &Value::Int(0)));
        assert!(!Op::Le.matches(&Value::Null, &Value::Null));
        assert!(Op::Ge.matches(&Value::DateTime(10), &Value::DateTime(10)));
    }

    #[test]
    fn test_condition_build_defaults_to_eq() {
        let conds = Condition::build(&["username", "contact"], &[], &["a".into(), "b".into()])
            .unwrap();
        assert!(conds.iter().all(|c| c.op == Op::Eq));

        let err = Condition::build(&["username"], &[Op::Eq, Op::Ne], &["a".into()]);
        assert!(matches!(err, Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_connect_by_scheme() {
        assert!(connect("mem://").is_ok());
        assert!(matches!(connect("mysql://db"), Err(Error::InvalidConfig(_))));
        assert!(matches!(connect("file://"), Err(Error::InvalidConfig(_))));

        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().display());
        let mut conn = connect(&url).unwrap();
        conn.close().unwrap();
    }
}
