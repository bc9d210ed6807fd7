//! A served domain: records sharded by AoR hash, plus the contact table.
//!
//! Record operations go through a [`ShardGuard`], so holding the guard is
//! proof the shard lock is held. Contact-table locks are only ever taken
//! after the record shard lock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::callbacks::CallbackKind;
use super::contact::{host_port, Contact, ContactQuery, Methods, Source, Transport};
use super::contacts::ContactTable;
use super::db::Db;
use super::record::{Record, RecordMut};
use super::registry::Shared;
use super::unix_now;
use crate::config::{LocationConfig, SyncMode};
use crate::error::{Error, Result};
use crate::hasher::{key_hash, shard_of};

#[derive(Default)]
pub(crate) struct Shard {
    pub(crate) records: Vec<Record>,
    /// Db-only mode: the record loaded for the current lock holder.
    transient: Option<Record>,
}

/// Running counters, read by the metrics task.
#[derive(Debug, Default)]
pub(crate) struct DomainStats {
    pub(crate) sweeps: AtomicU64,
    pub(crate) contacts_expired: AtomicU64,
    pub(crate) contacts_freed: AtomicU64,
    pub(crate) records_deleted: AtomicU64,
    pub(crate) rows_flushed: AtomicU64,
    pub(crate) persistence_errors: AtomicU64,
}

pub struct Domain {
    name: Arc<str>,
    shards: Vec<Mutex<Shard>>,
    contacts: ContactTable,
    shared: Arc<Shared>,
    /// Write-back deletes waiting for the next sweep, as (AoR, contact URI).
    pending_deletes: Mutex<Vec<(String, String)>>,
    max_collisions: AtomicUsize,
    pub(crate) stats: DomainStats,
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .field("contacts", &self.contacts.len())
            .finish_non_exhaustive()
    }
}

/// One contact as exported for replication or fail-over.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactExport {
    pub aor: String,
    pub uri: String,
    pub received: Option<Source>,
    pub path: Option<String>,
    pub socket: Option<String>,
    pub cflags: u32,
    pub methods: Methods,
    pub ruid: String,
    pub instance: String,
    pub reg_id: u32,
    pub expires: i64,
}

impl ContactExport {
    fn new(aor: &str, contact: &Contact) -> Self {
        let data = contact.data();
        Self {
            aor: aor.to_string(),
            uri: data.uri.clone(),
            received: data.received.clone(),
            path: data.path().map(str::to_string),
            socket: (!data.socket.is_empty()).then(|| data.socket.clone()),
            cflags: data.cflags,
            methods: data.methods,
            ruid: data.ruid.clone(),
            instance: data.instance.clone(),
            reg_id: data.reg_id,
            expires: data.expires,
        }
    }
}

impl Domain {
    pub(crate) fn new(name: &str, shared: Arc<Shared>) -> Result<Self> {
        let config = &shared.config;
        let mut shards = Vec::new();
        shards.try_reserve_exact(config.record_shards).map_err(|e| {
            Error::AllocationFailure(format!("domain {name}: {} shards: {e}", config.record_shards))
        })?;
        shards.extend((0..config.record_shards).map(|_| Mutex::new(Shard::default())));
        let contacts = ContactTable::new(config.contact_shards, config.contact_budget)?;

        tracing::debug!(
            domain = %name,
            record_shards = config.record_shards,
            contact_shards = config.contact_shards,
            "Domain created"
        );
        Ok(Self {
            name: name.into(),
            shards,
            contacts,
            shared,
            pending_deletes: Mutex::new(Vec::new()),
            max_collisions: AtomicUsize::new(0),
            stats: DomainStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn config(&self) -> &LocationConfig {
        &self.shared.config
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn contacts(&self) -> &ContactTable {
        &self.contacts
    }

    pub fn size(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index(&self, aor: &str) -> usize {
        shard_of(key_hash(aor), self.shards.len())
    }

    /// Longest record shard seen by a sweep.
    pub fn max_collisions(&self) -> usize {
        self.max_collisions.load(Ordering::Relaxed)
    }

    pub(crate) fn observe_collisions(&self, observed: usize) {
        self.max_collisions.fetch_max(observed, Ordering::Relaxed);
    }

    /// Locks record shard `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`Domain::size`].
    pub fn lock_shard(&self, index: usize) -> ShardGuard<'_> {
        ShardGuard {
            domain: self,
            index,
            shard: self.shards[index].lock(),
        }
    }

    pub fn lock_aor(&self, aor: &str) -> ShardGuard<'_> {
        self.lock_shard(self.shard_index(aor))
    }

    pub fn record_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().records.len()).sum()
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    /// Runs a storage write when the sync mode writes synchronously.
    ///
    /// Returns whether the write happened. Failures are logged and swallowed
    /// in write-through mode and returned in db-only mode.
    pub(crate) fn write_through<F>(&self, op: F) -> Result<bool>
    where
        F: FnOnce(&Db, &str) -> Result<()>,
    {
        let mode = self.config().sync_mode;
        if !matches!(mode, SyncMode::WriteThrough | SyncMode::DbOnly) {
            return Ok(false);
        }
        let Some(db) = &self.shared.db else {
            return Ok(false);
        };
        match op(db, &self.name) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.stats.persistence_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(domain = %self.name, error = %e, "Storage write failed");
                if mode == SyncMode::DbOnly {
                    Err(e)
                } else {
                    Ok(false)
                }
            }
        }
    }

    pub(crate) fn queue_delete(&self, aor: &str, uri: &str) {
        self.pending_deletes
            .lock()
            .push((aor.to_string(), uri.to_string()));
    }

    pub(crate) fn pending_delete_count(&self) -> usize {
        self.pending_deletes.lock().len()
    }

    /// Drops a queued delete for a row that is being written again.
    pub(crate) fn cancel_delete(&self, aor: &str, uri: &str) {
        self.pending_deletes
            .lock()
            .retain(|(a, u)| !(a == aor && u == uri));
    }

    pub(crate) fn take_pending_deletes(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.pending_deletes.lock())
    }

    /// Finds a live contact by URI across every record of the domain.
    pub fn find_contact(&self, query: &ContactQuery<'_>) -> Option<Arc<Contact>> {
        self.contacts
            .find(query, self.config().matching, unix_now())
    }

    /// Finds the live contact a request from `host:port` over `transport`
    /// belongs to. The received source wins over the contact URI.
    pub fn get_contact_by_source(&self, host: &str, port: u16, transport: Transport) -> Option<Arc<Contact>> {
        let now = unix_now();
        let target = format!("{host}:{port}");
        (0..self.contacts.size()).find_map(|i| {
            let slot = self.contacts.lock_slot(i);
            slot.contacts()
                .iter()
                .find(|c| {
                    let data = c.data();
                    data.is_live(now)
                        && match &data.received {
                            Some(src) => src.host == host && src.port == port && src.transport == transport,
                            None => host_port(&data.uri) == target,
                        }
                })
                .cloned()
        })
    }

    /// Exports the live contacts of partition `part_idx` out of
    /// `part_count`, keeping those whose branch flags include `flags`.
    ///
    /// Partitions split record shards, so they are disjoint and together
    /// cover every contact. More than `limit` matches fails with
    /// [`Error::BufferTooSmall`] carrying the needed size.
    pub fn get_all_contacts(
        &self,
        limit: usize,
        flags: u32,
        part_idx: usize,
        part_count: usize,
    ) -> Result<Vec<ContactExport>> {
        if part_count == 0 || part_idx >= part_count {
            return Err(Error::InvalidOperation(format!(
                "partition {part_idx} of {part_count}"
            )));
        }
        let now = unix_now();
        let mut out = Vec::new();

        if self.config().sync_mode == SyncMode::DbOnly {
            let Some(db) = &self.shared.db else {
                return Ok(out);
            };
            for row in db.load_all(&self.name)? {
                let live = row.info.expires == 0 || row.info.expires > now;
                if live
                    && row.info.cflags & flags == flags
                    && self.shard_index(&row.aor) % part_count == part_idx
                {
                    let contact = self
                        .contacts
                        .transient(self.name_arc(), row.aor.as_str().into(), &row.uri, &row.info, now);
                    out.push(ContactExport::new(&row.aor, &contact));
                }
            }
        } else {
            for index in (part_idx..self.shards.len()).step_by(part_count) {
                let shard = self.lock_shard(index);
                for record in shard.records() {
                    for contact in record.contacts() {
                        let keep = {
                            let data = contact.data();
                            data.is_live(now) && data.cflags & flags == flags
                        };
                        if keep {
                            out.push(ContactExport::new(record.aor(), contact));
                        }
                    }
                }
            }
        }

        if out.len() > limit {
            return Err(Error::BufferTooSmall { needed: out.len() });
        }
        Ok(out)
    }

    /// Loads every persisted row into memory. Used at startup by the caching
    /// sync modes; db-only mode keeps nothing in memory.
    pub fn preload(&self) -> Result<usize> {
        let mode = self.config().sync_mode;
        if !mode.uses_db() || mode == SyncMode::DbOnly {
            return Ok(0);
        }
        let Some(db) = &self.shared.db else {
            return Ok(0);
        };

        let rows = db.load_all(&self.name)?;
        let mut loaded = 0;
        for row in &rows {
            let mut shard = self.lock_aor(&row.aor);
            let mut record = shard.insert_record(&row.aor)?;
            match record.restore_contact(&row.uri, &row.info) {
                Ok(_) => loaded += 1,
                Err(e) => {
                    tracing::warn!(domain = %self.name, aor = %row.aor, error = %e, "Skipping stored contact");
                }
            }
        }
        tracing::info!(domain = %self.name, contacts = loaded, "Preloaded contacts");
        Ok(loaded)
    }

    /// Db-only mode: builds the record for `aor` from its stored rows.
    fn load_record(&self, aor: &str) -> Result<Option<Record>> {
        let Some(db) = &self.shared.db else {
            return Ok(None);
        };
        let rows = db.load_record(&self.name, aor)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let now = unix_now();
        let mut record = Record::new(aor, self.name_arc());
        for row in &rows {
            let contact = self
                .contacts
                .transient(self.name_arc(), record.aor_arc(), &row.uri, &row.info, now);
            contact.data().mark_synced();
            record.contacts.push(contact);
        }
        Ok(Some(record))
    }

    /// Drops a record leaving memory, releasing its subscription.
    pub(crate) fn retire(&self, record: Record) {
        if let Some(subscription) = &record.subscription {
            self.shared.subscriptions.release(subscription);
        }
    }

    pub(crate) fn fire(
        &self,
        kind: CallbackKind,
        aor: &str,
        record: Option<&Record>,
        contact: Option<&Contact>,
    ) {
        self.shared.callbacks.fire(kind, &self.name, aor, record, contact);
    }
}

/// Exclusive access to one record shard; dropping it unlocks.
pub struct ShardGuard<'a> {
    domain: &'a Domain,
    index: usize,
    pub(crate) shard: MutexGuard<'a, Shard>,
}

impl Drop for ShardGuard<'_> {
    fn drop(&mut self) {
        if let Some(record) = self.shard.transient.take() {
            self.domain.retire(record);
        }
    }
}

impl<'a> ShardGuard<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn domain(&self) -> &'a Domain {
        self.domain
    }

    pub fn len(&self) -> usize {
        self.shard.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shard.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.shard.records.iter()
    }

    pub fn unlock(self) {}

    /// Hash of `aor`, rejecting AoRs that belong to another shard.
    fn hash_for(&self, aor: &str) -> Result<u32> {
        let hash = key_hash(aor);
        if shard_of(hash, self.domain.size()) != self.index {
            return Err(Error::InvalidOperation(format!(
                "{aor} does not hash to shard {}",
                self.index
            )));
        }
        Ok(hash)
    }

    fn position(&self, aor: &str, hash: u32) -> Option<usize> {
        self.shard.records.iter().position(|r| r.matches(aor, hash))
    }

    pub(crate) fn record_at(&mut self, pos: usize) -> RecordMut<'_> {
        RecordMut {
            domain: self.domain,
            record: &mut self.shard.records[pos],
        }
    }

    /// Returns the record for `aor`, creating it if absent.
    pub fn insert_record(&mut self, aor: &str) -> Result<RecordMut<'_>> {
        let hash = self.hash_for(aor)?;
        if self.domain.config().sync_mode == SyncMode::DbOnly {
            return self.db_record(aor, hash, true);
        }
        let pos = match self.position(aor, hash) {
            Some(pos) => pos,
            None => {
                self.shard.records.try_reserve(1).map_err(|e| {
                    Error::AllocationFailure(format!("record {aor}: {e}"))
                })?;
                self.shard
                    .records
                    .push(Record::new(aor, self.domain.name_arc()));
                tracing::debug!(domain = %self.domain.name(), %aor, "Record created");
                self.domain
                    .fire(CallbackKind::RECORD_INSERT, aor, self.shard.records.last(), None);
                self.shard.records.len() - 1
            }
        };
        Ok(self.record_at(pos))
    }

    pub fn get_record(&mut self, aor: &str) -> Result<RecordMut<'_>> {
        let hash = self.hash_for(aor)?;
        if self.domain.config().sync_mode == SyncMode::DbOnly {
            return self.db_record(aor, hash, false);
        }
        let pos = self.position(aor, hash).ok_or(Error::NotFound)?;
        Ok(self.record_at(pos))
    }

    /// Deletes the record and every link it holds.
    pub fn delete_record(&mut self, aor: &str) -> Result<()> {
        let hash = self.hash_for(aor)?;
        if self.domain.config().sync_mode == SyncMode::DbOnly {
            if let Some(record) = self.shard.transient.take() {
                self.domain.retire(record);
            }
            self.domain
                .write_through(|db, table| db.delete_record(table, aor).map(|_| ()))?;
            self.domain.fire(CallbackKind::RECORD_DELETE, aor, None, None);
            return Ok(());
        }

        let pos = self.position(aor, hash).ok_or(Error::NotFound)?;
        {
            let mut record = self.record_at(pos);
            let links = record.contacts().to_vec();
            for contact in &links {
                record.delete_contact(contact)?;
            }
        }
        self.remove_at(pos);
        Ok(())
    }

    /// Removes the record at `pos`, which must hold no links.
    pub(crate) fn remove_at(&mut self, pos: usize) {
        let record = self.shard.records.swap_remove(pos);
        tracing::debug!(domain = %self.domain.name(), aor = %record.aor(), "Record deleted");
        self.domain
            .fire(CallbackKind::RECORD_DELETE, record.aor(), Some(&record), None);
        self.domain.retire(record);
    }

    fn db_record(&mut self, aor: &str, hash: u32, create: bool) -> Result<RecordMut<'_>> {
        let record = match self.shard.transient.take() {
            Some(record) if record.matches(aor, hash) => record,
            other => {
                if let Some(stale) = other {
                    self.domain.retire(stale);
                }
                match self.domain.load_record(aor)? {
                    Some(record) => record,
                    None if create => {
                        let record = Record::new(aor, self.domain.name_arc());
                        self.domain
                            .fire(CallbackKind::RECORD_INSERT, aor, Some(&record), None);
                        record
                    }
                    None => return Err(Error::NotFound),
                }
            }
        };
        Ok(RecordMut {
            domain: self.domain,
            record: self.shard.transient.insert(record),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::contact::ContactInfo;
    use crate::location::testing::{store, store_with};
    use crate::location::Location;
    use crate::persistence::MemoryStore;
    use std::collections::BTreeSet;

    fn config() -> LocationConfig {
        LocationConfig::new().record_shards(8).contact_shards(8)
    }

    fn live() -> ContactInfo {
        ContactInfo::new(unix_now() + 3600)
    }

    fn register(domain: &Domain, aor: &str, uri: &str, info: &ContactInfo) -> Result<Arc<Contact>> {
        let mut shard = domain.lock_aor(aor);
        let mut record = shard.insert_record(aor)?;
        record.insert_contact(uri, info)
    }

    #[test]
    fn test_records_live_in_their_hash_shard() -> Result<()> {
        let location = store(config());
        let domain = location.domain("location")?;
        let aor = "alice@example.com";
        let index = domain.shard_index(aor);
        assert_eq!(index, key_hash(aor) as usize & 7);

        let mut wrong = domain.lock_shard((index + 1) % domain.size());
        assert!(matches!(wrong.insert_record(aor), Err(Error::InvalidOperation(_))));
        wrong.unlock();

        let mut shard = domain.lock_shard(index);
        shard.insert_record(aor)?;
        shard.insert_record(aor)?;
        assert_eq!(shard.len(), 1);
        drop(shard);
        assert_eq!(domain.record_count(), 1);
        Ok(())
    }

    #[test]
    fn test_get_and_delete_missing_record() -> Result<()> {
        let location = store(config());
        let domain = location.domain("location")?;
        let mut shard = domain.lock_aor("nobody@example.com");
        assert!(matches!(shard.get_record("nobody@example.com"), Err(Error::NotFound)));
        assert!(matches!(shard.delete_record("nobody@example.com"), Err(Error::NotFound)));
        Ok(())
    }

    #[test]
    fn test_delete_record_unreferences_contacts() -> Result<()> {
        let location = store(config());
        let domain = location.domain("location")?;
        let contact = register(&domain, "alice@example.com", "sip:alice@h", &live())?;
        assert_eq!(contact.refs(), 1);

        domain.lock_aor("alice@example.com").delete_record("alice@example.com")?;
        assert_eq!(contact.refs(), 0);
        assert_eq!(domain.record_count(), 0);
        assert!(domain.find_contact(&ContactQuery::new("sip:alice@h")).is_none());
        Ok(())
    }

    #[test]
    fn test_cross_record_lookups() -> Result<()> {
        let location = store(config());
        let domain = location.domain("location")?;
        let contact = register(
            &domain,
            "alice@example.com",
            "sip:alice@10.0.0.1:5060",
            &live().received(Source::new("192.0.2.7", 40000, Transport::Tcp)),
        )?;
        register(&domain, "bob@example.com", "sip:bob@10.0.0.2:5070", &live())?;

        let found = domain.find_contact(&ContactQuery::new("sip:alice@10.0.0.1:5060"));
        assert!(found.is_some_and(|f| Arc::ptr_eq(&f, &contact)));

        let by_source = domain.get_contact_by_source("192.0.2.7", 40000, Transport::Tcp);
        assert!(by_source.is_some_and(|f| Arc::ptr_eq(&f, &contact)));
        assert!(domain
            .get_contact_by_source("192.0.2.7", 40000, Transport::Udp)
            .is_none());

        let bob = domain.get_contact_by_source("10.0.0.2", 5070, Transport::Udp);
        assert!(bob.is_some_and(|c| c.aor() == "bob@example.com"));
        Ok(())
    }

    #[test]
    fn test_partitioned_export_covers_everything_once() -> Result<()> {
        let location = store(config());
        let domain = location.domain("location")?;
        for i in 0..20 {
            let cflags = if i % 2 == 0 { 0b10 } else { 0 };
            register(
                &domain,
                &format!("user{i}@example.com"),
                &format!("sip:user{i}@h"),
                &live().cflags(cflags),
            )?;
        }

        let mut seen = BTreeSet::new();
        let mut total = 0;
        for part in 0..3 {
            for export in domain.get_all_contacts(100, 0, part, 3)? {
                total += 1;
                seen.insert(export.uri);
            }
        }
        assert_eq!(total, 20);
        assert_eq!(seen.len(), 20);

        let flagged = domain.get_all_contacts(100, 0b10, 0, 1)?;
        assert_eq!(flagged.len(), 10);

        assert!(matches!(
            domain.get_all_contacts(5, 0, 0, 1),
            Err(Error::BufferTooSmall { needed: 20 })
        ));
        assert!(matches!(
            domain.get_all_contacts(5, 0, 3, 3),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_preload_restores_rows() -> Result<()> {
        let rows = MemoryStore::new();
        let config = config().sync_mode(SyncMode::WriteThrough);
        {
            let location = store_with(config.clone(), &rows);
            let domain = location.domain("location")?;
            register(&domain, "alice@example.com", "sip:alice@h1", &live().cseq(3))?;
            register(&domain, "alice@example.com", "sip:alice@h2", &live())?;
            register(&domain, "bob@example.com", "sip:bob@h", &live())?;
            location.close()?;
        }

        let location = store_with(config, &rows);
        assert_eq!(location.preload()?, 3);
        let domain = location.domain("location")?;
        assert_eq!(domain.record_count(), 2);

        let mut shard = domain.lock_aor("alice@example.com");
        let record = shard.get_record("alice@example.com")?;
        let contact = record.get_contact(&ContactQuery::new("sip:alice@h1"))?;
        assert_eq!(contact.cseq(), 3);
        assert_eq!(contact.refs(), 1);
        assert!(contact.snapshot().is_persisted());
        Ok(())
    }

    #[test]
    fn test_failed_write_through_keeps_memory() -> Result<()> {
        use crate::persistence::{PersistenceAdapter, RowSet};

        struct Broken;
        impl PersistenceAdapter for Broken {
            fn use_table(&mut self, _: &str) -> Result<()> {
                Ok(())
            }
            fn insert(&mut self, _: &[&str], _: &[crate::encoding::Value]) -> Result<()> {
                Err(Error::Persistence("disk full".into()))
            }
            fn update(
                &mut self,
                _: &[&str],
                _: &[crate::persistence::Op],
                _: &[crate::encoding::Value],
                _: &[&str],
                _: &[crate::encoding::Value],
            ) -> Result<usize> {
                Err(Error::Persistence("disk full".into()))
            }
            fn delete(
                &mut self,
                _: &[&str],
                _: &[crate::persistence::Op],
                _: &[crate::encoding::Value],
            ) -> Result<usize> {
                Err(Error::Persistence("disk full".into()))
            }
            fn query(
                &mut self,
                _: &[&str],
                _: &[crate::persistence::Op],
                _: &[crate::encoding::Value],
                _: &[&str],
                _: Option<&str>,
            ) -> Result<RowSet> {
                Err(Error::Persistence("disk full".into()))
            }
            fn close(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let mut location = Location::with_adapter(config().sync_mode(SyncMode::WriteThrough), Box::new(Broken))?;
        let domain = location.register_domain("location")?;
        let contact = register(&domain, "alice@example.com", "sip:alice@h", &live())?;
        assert_eq!(contact.sync_state(), crate::location::SyncState::New);
        assert_eq!(domain.metrics().persistence_errors, 1);

        let mut location = Location::with_adapter(config().sync_mode(SyncMode::DbOnly), Box::new(Broken))?;
        let domain = location.register_domain("location")?;
        let err = register(&domain, "alice@example.com", "sip:alice@h", &live());
        assert!(matches!(err, Err(Error::Persistence(_))));
        Ok(())
    }
}
