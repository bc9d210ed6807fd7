//! File-backed backend: one append-only journal per table.
//!
//! Each journal is a sequence of frames `[length:u32][checksum:u64][entry]`
//! where the entry is a bincode-encoded [`Entry`] and the checksum is the
//! CRC-64 of the entry bytes. Opening a table replays its journal into an
//! in-memory [`Table`]; closing rewrites the journal as one insert per live
//! row.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use super::memory::Table;
use super::{build_row, Condition, Op, PersistenceAdapter, Row, RowSet};
use crate::encoding::{bincode, Value};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::hasher::frame_checksum;

const JOURNAL_EXT: &str = "journal";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entry {
    Insert(Row),
    Update {
        filter: Vec<Condition>,
        set: Vec<(String, Value)>,
    },
    Delete(Vec<Condition>),
}

impl Entry {
    fn apply(self, table: &Table) {
        match self {
            Entry::Insert(row) => {
                table.insert(row);
            }
            Entry::Update { filter, set } => {
                table.update(&filter, &set);
            }
            Entry::Delete(filter) => {
                table.delete(&filter);
            }
        }
    }
}

/// Append-only framed log of [`Entry`] values.
pub struct Journal {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Journal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self { file, writer, path })
    }

    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        let bytes = bincode::serialize(entry)?;
        self.writer.write_u32::<BigEndian>(bytes.len() as u32)?;
        self.writer.write_u64::<BigEndian>(frame_checksum(&bytes))?;
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn iter(&self) -> Result<JournalIter> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(JournalIter { file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct JournalIter {
    file: File,
}

impl JournalIter {
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.file.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let truncated = |e: io::Error| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::CorruptedJournal("truncated frame".into())
            } else {
                e.into()
            }
        };
        let stored = self.file.read_u64::<BigEndian>().map_err(truncated)?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).map_err(truncated)?;

        if frame_checksum(&buf) != stored {
            return Err(Error::ChecksumMismatch);
        }
        Ok(Some(buf))
    }
}

impl Iterator for JournalIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_frame() {
            Ok(Some(buf)) => Some(bincode::deserialize(&buf)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

struct JournalTable {
    table: Table,
    journal: Journal,
}

impl JournalTable {
    fn open(path: PathBuf) -> Result<Self> {
        let journal = Journal::open(path)?;
        let table = Table::new();
        let mut replayed = 0usize;
        for entry in journal.iter()? {
            entry?.apply(&table);
            replayed += 1;
        }
        tracing::debug!(
            path = %journal.path().display(),
            entries = replayed,
            rows = table.len(),
            "Journal replayed"
        );
        Ok(Self { table, journal })
    }

    fn record(&mut self, entry: Entry) -> Result<()> {
        self.journal.append(&entry)?;
        entry.apply(&self.table);
        Ok(())
    }

    /// Rewrites the journal so it holds one insert per live row.
    fn compact(&mut self) -> Result<()> {
        let path = self.journal.path().to_path_buf();
        let tmp = path.with_extension("compact");
        let _ = fs::remove_file(&tmp);
        {
            let mut fresh = Journal::open(&tmp)?;
            for row in self.table.rows() {
                fresh.append(&Entry::Insert(row))?;
            }
            fresh.sync()?;
        }
        fs::rename(&tmp, &path)?;
        self.journal = Journal::open(path)?;
        Ok(())
    }
}

/// Journal-per-table backend rooted at a directory.
pub struct JournalAdapter {
    dir: PathBuf,
    tables: HashMap<String, JournalTable>,
    current: Option<String>,
    _lock: FileLock,
}

impl JournalAdapter {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let lock = FileLock::lock(dir.join("LOCK"))?;
        Ok(Self {
            dir,
            tables: HashMap::new(),
            current: None,
            _lock: lock,
        })
    }

    fn table(&mut self) -> Result<&mut JournalTable> {
        let name = self
            .current
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no table selected".into()))?;
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::InvalidState(format!("table {name} not open")))
    }
}

fn valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.')
}

impl PersistenceAdapter for JournalAdapter {
    fn use_table(&mut self, name: &str) -> Result<()> {
        if !valid_table_name(name) {
            return Err(Error::InvalidOperation(format!("invalid table name {name:?}")));
        }
        if !self.tables.contains_key(name) {
            let path = self.dir.join(format!("{name}.{JOURNAL_EXT}"));
            let table = JournalTable::open(path)?;
            self.tables.insert(name.to_string(), table);
        }
        self.current = Some(name.to_string());
        Ok(())
    }

    fn insert(&mut self, keys: &[&str], values: &[Value]) -> Result<()> {
        let row = build_row(keys, values)?;
        self.table()?.record(Entry::Insert(row))
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
        let table = self.table()?;
        let changed = table.table.select(&filter, &[], None).len();
        if changed > 0 {
            table.record(Entry::Update { filter, set })?;
        }
        Ok(changed)
    }

    fn delete(
        &mut self,
        match_keys: &[&str],
        match_ops: &[Op],
        match_values: &[Value],
    ) -> Result<usize> {
        let filter = Condition::build(match_keys, match_ops, match_values)?;
        let table = self.table()?;
        let removed = table.table.select(&filter, &[], None).len();
        if removed > 0 {
            table.record(Entry::Delete(filter))?;
        }
        Ok(removed)
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
        Ok(self.table()?.table.select(&filter, columns, order_by))
    }

    fn close(&mut self) -> Result<()> {
        for (name, table) in self.tables.iter_mut() {
            table.compact()?;
            tracing::debug!(table = %name, rows = table.table.len(), "Journal compacted");
        }
        self.tables.clear();
        self.current = None;
        Ok(())
    }
}
