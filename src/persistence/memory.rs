use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;

use super::{build_row, matches_all, Condition, Op, PersistenceAdapter, Row, RowSet};
use crate::encoding::Value;
use crate::error::{Error, Result};

/// One table of rows, ordered by insertion id.
#[derive(Debug, Default)]
pub struct Table {
    rows: SkipMap<u64, Row>,
    next_id: AtomicU64,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn insert(&self, row: Row) -> u64 {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        self.rows.insert(id, row);
        id
    }

    pub fn update(&self, filter: &[Condition], set: &[(String, Value)]) -> usize {
        let matched: Vec<(u64, Row)> = self
            .rows
            .iter()
            .filter(|e| matches_all(filter, e.value()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (id, mut row) in matched.iter().cloned() {
            for (column, value) in set {
                row.insert(column.clone(), value.clone());
            }
            self.rows.insert(id, row);
        }
        matched.len()
    }

    pub fn delete(&self, filter: &[Condition]) -> usize {
        let doomed: Vec<u64> = self
            .rows
            .iter()
            .filter(|e| matches_all(filter, e.value()))
            .map(|e| *e.key())
            .collect();
        for id in &doomed {
            self.rows.remove(id);
        }
        doomed.len()
    }

    pub fn select(&self, filter: &[Condition], columns: &[&str], order_by: Option<&str>) -> RowSet {
        let mut matched: Vec<Row> = self
            .rows
            .iter()
            .filter(|e| matches_all(filter, e.value()))
            .map(|e| e.value().clone())
            .collect();

        if let Some(key) = order_by {
            matched.sort_by(|a, b| {
                let a = a.get(key).unwrap_or(&Value::Null);
                let b = b.get(key).unwrap_or(&Value::Null);
                match (a.is_null(), b.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
                }
            });
        }

        let columns: Vec<String> = if columns.is_empty() {
            matched
                .iter()
                .flat_map(|row| row.keys().cloned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            columns.iter().map(|c| c.to_string()).collect()
        };

        let rows = matched
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        RowSet { columns, rows }
    }

    /// Snapshot of every row in insertion order.
    pub fn rows(&self) -> Vec<Row> {
        self.rows.iter().map(|e| e.value().clone()).collect()
    }
}

/// Named tables shared by every [`MemoryAdapter`] opened on the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<HashMap<String, Arc<Table>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the table, creating it empty if needed.
    pub fn table(&self, name: &str) -> Arc<Table> {
        self.tables
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Table::new()))
            .clone()
    }
}

/// In-process backend. Clones of the [`MemoryStore`] observe the same rows.
pub struct MemoryAdapter {
    store: MemoryStore,
    current: Option<Arc<Table>>,
}

impl MemoryAdapter {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            current: None,
        }
    }

    fn table(&self) -> Result<&Arc<Table>> {
        self.current
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no table selected".into()))
    }
}

impl PersistenceAdapter for MemoryAdapter {
    fn use_table(&mut self, name: &str) -> Result<()> {
        self.current = Some(self.store.table(name));
        Ok(())
    }

    fn insert(&mut self, keys: &[&str], values: &[Value]) -> Result<()> {
        let row = build_row(keys, values)?;
        self.table()?.insert(row);
        Ok(())
    }

    fn update(
        &mut self,
        match_keys: &[&str],
        match_ops: &[Op],
        match_values: &[Value],
        set_keys: &[&str],
        set_values: &[Value],
    ) -> Result<usize> {
        let filter = Condition::build(match_keys, match_ops, match_values)?;
        let set: Vec<(String, Value)> = build_row(set_keys, set_values)?.into_iter().collect();
        Ok(self.table()?.update(&filter, &set))
    }

    fn delete(
        &mut self,
        match_keys: &[&str],
        match_ops: &[Op],
        match_values: &[Value],
    ) -> Result<usize> {
        let filter = Condition::build(match_keys, match_ops, match_values)?;
        Ok(self.table()?.delete(&filter))
    }

    fn query(
        &mut self,
        match_keys: &[&str],
        match_ops: &[Op],
        match_values: &[Value],
        columns: &[&str],
        order_by: Option<&str>,
    ) -> Result<RowSet> {
        let filter = Condition::build(match_keys, match_ops, match_values)?;
        Ok(self.table()?.select(&filter, columns, order_by))
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> MemoryAdapter {
        let mut db = MemoryAdapter::new(MemoryStore::new());
        db.use_table("location").unwrap();
        db
    }

    #[test]
    fn test_requires_table() {
        let mut db = MemoryAdapter::new(MemoryStore::new());
        let err = db.insert(&["username"], &["alice".into()]);
        assert!(matches!(err, Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_update_and_delete_with_ops() -> Result<()> {
        let mut db = adapter();
        for (user, expires) in [("alice", 100), ("bob", 200), ("carol", 0)] {
            db.insert(
                &["username", "expires"],
                &[user.into(), Value::DateTime(expires)],
            )?;
        }

        let changed = db.update(
            &["username"],
            &[],
            &["bob".into()],
            &["expires"],
            &[Value::DateTime(300)],
        )?;
        assert_eq!(changed, 1);

        // Expired and not permanent.
        let removed = db.delete(
            &["expires", "expires"],
            &[Op::Lt, Op::Ne],
            &[Value::DateTime(150), Value::DateTime(0)],
        )?;
        assert_eq!(removed, 1);

        let rows = db.query(&[], &[], &[], &["username", "expires"], Some("username"))?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.get(0, "username"), &Value::from("bob"));
        assert_eq!(rows.get(0, "expires"), &Value::DateTime(300));
        assert_eq!(rows.get(1, "username"), &Value::from("carol"));
        Ok(())
    }

    #[test]
    fn test_query_missing_columns_are_null() -> Result<()> {
        let mut db = adapter();
        db.insert(&["username"], &["alice".into()])?;
        let rows = db.query(&["username"], &[Op::Eq], &["alice".into()], &["path"], None)?;
        assert_eq!(rows.len(), 1);
        assert!(rows.get(0, "path").is_null());

        let all = db.query(&[], &[], &[], &[], None)?;
        assert_eq!(all.columns, vec!["username".to_string()]);
        Ok(())
    }

    #[test]
    fn test_store_is_shared_between_adapters() -> Result<()> {
        let store = MemoryStore::new();
        let mut writer = MemoryAdapter::new(store.clone());
        writer.use_table("location")?;
        writer.insert(&["username"], &["alice".into()])?;

        let mut reader = MemoryAdapter::new(store.clone());
        reader.use_table("location")?;
        assert_eq!(reader.query(&[], &[], &[], &[], None)?.len(), 1);
        assert!(store.table("other").is_empty());
        Ok(())
    }
}
