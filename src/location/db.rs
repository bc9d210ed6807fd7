//! Mapping between contacts and persisted rows. Each domain persists to the
//! table named after it, one row per (AoR, contact URI).

use parking_lot::Mutex;

use super::contact::{ContactData, ContactInfo, Methods, Q, Source};
use crate::config::ColumnNames;
use crate::encoding::{text, Value, ValueType};
use crate::error::{Error, Result};
use crate::persistence::{Op, PersistenceAdapter, RowSet};

/// A contact row read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredContact {
    pub aor: String,
    pub uri: String,
    pub info: ContactInfo,
}

pub(crate) struct Db {
    conn: Mutex<Box<dyn PersistenceAdapter>>,
    columns: ColumnNames,
}

fn persistence(e: Error) -> Error {
    match e {
        Error::Persistence(_) => e,
        other => Error::Persistence(other.to_string()),
    }
}

fn opt_str(s: &str) -> Value {
    if s.is_empty() {
        Value::Null
    } else {
        Value::String(s.to_string())
    }
}

impl Db {
    pub(crate) fn new(conn: Box<dyn PersistenceAdapter>, columns: ColumnNames) -> Self {
        Self {
            conn: Mutex::new(conn),
            columns,
        }
    }

    fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut dyn PersistenceAdapter) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        conn.use_table(table).map_err(persistence)?;
        f(&mut **conn).map_err(persistence)
    }

    fn contact_values(&self, aor: &str, data: &ContactData) -> (Vec<&str>, Vec<Value>) {
        let c = &self.columns;
        let keys = vec![
            c.aor.as_str(),
            c.contact.as_str(),
            c.expires.as_str(),
            c.q.as_str(),
            c.callid.as_str(),
            c.cseq.as_str(),
            c.flags.as_str(),
            c.cflags.as_str(),
            c.user_agent.as_str(),
            c.received.as_str(),
            c.path.as_str(),
            c.socket.as_str(),
            c.methods.as_str(),
            c.last_modified.as_str(),
            c.ruid.as_str(),
            c.instance.as_str(),
            c.reg_id.as_str(),
            c.server_id.as_str(),
            c.connection_id.as_str(),
        ];
        let values = vec![
            Value::from(aor),
            Value::from(data.uri.as_str()),
            Value::DateTime(data.expires),
            data.q.as_f64().map_or(Value::Null, Value::Double),
            Value::from(data.callid.as_str()),
            Value::Int(data.cseq),
            Value::Bitmap(data.flags),
            Value::Bitmap(data.cflags),
            Value::from(data.user_agent.as_str()),
            data.received
                .as_ref()
                .map_or(Value::Null, |s| Value::String(s.to_string())),
            opt_str(&data.path),
            opt_str(&data.socket),
            Value::Bitmap(data.methods.bits()),
            Value::DateTime(data.last_modified),
            opt_str(&data.ruid),
            opt_str(&data.instance),
            Value::BigInt(data.reg_id as i64),
            Value::Int(data.server_id),
            Value::from(data.connection_id),
        ];
        (keys, values)
    }

    pub(crate) fn insert_contact(&self, table: &str, aor: &str, data: &ContactData, is_3gpp: bool) -> Result<()> {
        let (mut keys, mut values) = self.contact_values(aor, data);
        keys.push(self.columns.is_3gpp.as_str());
        values.push(Value::Int(is_3gpp as i32));
        self.with_table(table, |conn| conn.insert(&keys, &values))
    }

    pub(crate) fn update_contact(&self, table: &str, aor: &str, data: &ContactData) -> Result<usize> {
        let (keys, values) = self.contact_values(aor, data);
        let match_keys = [self.columns.aor.as_str(), self.columns.contact.as_str()];
        let match_values = [Value::from(aor), Value::from(data.uri.as_str())];
        // AoR and URI are the match keys; the rest is rewritten.
        self.with_table(table, |conn| {
            conn.update(&match_keys, &[], &match_values, &keys[2..], &values[2..])
        })
    }

    pub(crate) fn delete_contact(&self, table: &str, aor: &str, uri: &str) -> Result<usize> {
        let keys = [self.columns.aor.as_str(), self.columns.contact.as_str()];
        let values = [Value::from(aor), Value::from(uri)];
        self.with_table(table, |conn| conn.delete(&keys, &[], &values))
    }

    pub(crate) fn delete_record(&self, table: &str, aor: &str) -> Result<usize> {
        let keys = [self.columns.aor.as_str()];
        let values = [Value::from(aor)];
        self.with_table(table, |conn| conn.delete(&keys, &[], &values))
    }

    /// Removes rows that expired before `now`, leaving permanent ones.
    pub(crate) fn delete_expired(&self, table: &str, now: i64) -> Result<usize> {
        let expires = self.columns.expires.as_str();
        self.with_table(table, |conn| {
            conn.delete(
                &[expires, expires],
                &[Op::Lt, Op::Ne],
                &[Value::DateTime(now), Value::DateTime(0)],
            )
        })
    }

    pub(crate) fn load_record(&self, table: &str, aor: &str) -> Result<Vec<StoredContact>> {
        let keys = [self.columns.aor.as_str()];
        let values = [Value::from(aor)];
        let rows = self.with_table(table, |conn| {
            conn.query(&keys, &[], &values, &[], Some(self.columns.last_modified.as_str()))
        })?;
        Ok(self.decode(&rows))
    }

    pub(crate) fn load_all(&self, table: &str) -> Result<Vec<StoredContact>> {
        let rows = self.with_table(table, |conn| {
            conn.query(&[], &[], &[], &[], Some(self.columns.aor.as_str()))
        })?;
        Ok(self.decode(&rows))
    }

    pub(crate) fn close(&self) -> Result<()> {
        self.conn.lock().close().map_err(persistence)
    }

    /// Rows missing their AoR or contact, or with an unparsable received
    /// address, are skipped.
    fn decode(&self, rows: &RowSet) -> Vec<StoredContact> {
        let c = &self.columns;
        // Text-oriented backends hand every column back as a string.
        let typed = |i: usize, col: &str, ty: ValueType| match rows.get(i, col) {
            Value::String(raw) => text::decode_nullable(ty, Some(raw)).unwrap_or(Value::Null),
            value => value.clone(),
        };
        let string = |i: usize, col: &str| rows.get(i, col).as_str().map(str::to_string);
        let int = |i: usize, col: &str| typed(i, col, ValueType::BigInt).as_i64().unwrap_or(0);
        let time = |i: usize, col: &str| typed(i, col, ValueType::DateTime).as_i64().unwrap_or(0);

        (0..rows.len())
            .filter_map(|i| {
                let aor = string(i, &c.aor)?;
                let uri = string(i, &c.contact)?;
                Some((i, aor, uri))
            })
            .filter_map(|(i, aor, uri)| {
                let received = match rows.get(i, &c.received).as_str().map(str::parse::<Source>) {
                    Some(Ok(source)) => Some(source),
                    Some(Err(e)) => {
                        tracing::warn!(%aor, contact = %uri, error = %e, "Skipping stored contact");
                        return None;
                    }
                    None => None,
                };
                let info = ContactInfo {
                    expires: time(i, &c.expires),
                    q: typed(i, &c.q, ValueType::Double)
                        .as_f64()
                        .map_or(Q::UNSPECIFIED, Q::from_f64),
                    callid: string(i, &c.callid),
                    cseq: int(i, &c.cseq) as i32,
                    path: string(i, &c.path),
                    received,
                    user_agent: string(i, &c.user_agent),
                    methods: typed(i, &c.methods, ValueType::Bitmap)
                        .as_i64()
                        .map(|m| Methods::from_bits_truncate(m as u32)),
                    flags: int(i, &c.flags) as u32,
                    cflags: int(i, &c.cflags) as u32,
                    ruid: string(i, &c.ruid),
                    instance: string(i, &c.instance),
                    reg_id: int(i, &c.reg_id) as u32,
                    socket: string(i, &c.socket),
                    last_modified: time(i, &c.last_modified),
                    server_id: int(i, &c.server_id) as i32,
                    connection_id: typed(i, &c.connection_id, ValueType::Int)
                        .as_i64()
                        .map(|id| id as i32),
                    is_3gpp: int(i, &c.is_3gpp) != 0,
                };
                Some(StoredContact { aor, uri, info })
            })
            .collect()
    }
}
