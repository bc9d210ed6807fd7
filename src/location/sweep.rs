//! Periodic expiry and synchronization.
//!
//! An expired contact moves through the lifecycle over several passes:
//!
//! ```text
//! contact pass   Valid ──expired──▶ ExpirePendingNotify   (sweep takes a hold)
//! record pass    ExpirePendingNotify ──▶ NotifyReady       (RECORD_DELETE_CONTACT)
//! final pass     NotifyReady ──▶ Deleted                   (hold dropped)
//! record pass    Deleted: link removed ──▶ DelayedDelete   (once unreferenced)
//! final pass     DelayedDelete, grace over ──▶ freed
//! ```
//!
//! A contact unlinked from its record while `ExpirePendingNotify` goes
//! straight to `NotifyReady` when its link reference is released.
//!
//! Record shards are split across workers; the contact table and storage
//! passes run on worker 0 only.

use std::ops::AddAssign;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::callbacks::CallbackKind;
use super::contact::{Contact, ContactState, PendingWrite};
use super::contacts::Release;
use super::domain::{Domain, ShardGuard};
use super::record::{RecordMut, RegState};
use crate::config::SyncMode;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub shards: usize,
    /// Contacts found expired this pass.
    pub expired: usize,
    pub deleted: usize,
    pub freed: usize,
    pub unlinked: usize,
    /// Unlinks put off because the contact slot was busy.
    pub deferred: usize,
    pub records_deleted: usize,
    pub records_unregistered: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_deleted: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self
            == SweepReport {
                shards: self.shards,
                ..SweepReport::default()
            }
    }
}

impl AddAssign for SweepReport {
    fn add_assign(&mut self, other: Self) {
        self.shards += other.shards;
        self.expired += other.expired;
        self.deleted += other.deleted;
        self.freed += other.freed;
        self.unlinked += other.unlinked;
        self.deferred += other.deferred;
        self.records_deleted += other.records_deleted;
        self.records_unregistered += other.records_unregistered;
        self.rows_inserted += other.rows_inserted;
        self.rows_updated += other.rows_updated;
        self.rows_deleted += other.rows_deleted;
        self.failures += other.failures;
    }
}

impl Domain {
    /// Runs worker `worker`'s share of a sweep at time `now`.
    pub fn sweep(&self, worker: usize, workers: usize, now: i64) -> SweepReport {
        let workers = workers.max(1);
        let mut report = SweepReport::default();
        let mut scratch = Vec::new();

        if worker == 0 {
            self.sweep_storage(now, &mut report);
            self.sweep_contacts(now, &mut scratch, &mut report);
        }
        for index in (worker..self.size()).step_by(workers) {
            let mut shard = self.lock_shard(index);
            self.observe_collisions(shard.len());
            shard.sweep(now, &mut report);
            report.shards += 1;
        }
        if worker == 0 {
            self.finish_contacts(scratch, now, &mut report);
        }

        let stats = &self.stats;
        stats.sweeps.fetch_add(1, Ordering::Relaxed);
        stats.contacts_expired.fetch_add(report.expired as u64, Ordering::Relaxed);
        stats.contacts_freed.fetch_add(report.freed as u64, Ordering::Relaxed);
        stats.records_deleted.fetch_add(report.records_deleted as u64, Ordering::Relaxed);
        stats.rows_flushed.fetch_add(
            (report.rows_inserted + report.rows_updated + report.rows_deleted) as u64,
            Ordering::Relaxed,
        );

        if !report.is_idle() {
            tracing::debug!(domain = %self.name(), worker, ?report, "Sweep finished");
        }
        report
    }

    /// Writes every pending write-back change now, without expiring anything.
    pub fn synchronize(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if self.config().sync_mode != SyncMode::WriteBack {
            return report;
        }
        self.sweep_storage(0, &mut report);
        for index in 0..self.size() {
            let mut shard = self.lock_shard(index);
            for pos in 0..shard.len() {
                let record = shard.record_at(pos);
                let links = record.contacts().to_vec();
                for contact in &links {
                    record.flush_contact(contact, &mut report);
                }
            }
        }
        report
    }

    /// Storage-side cleanup: queued write-back deletes, or expired rows in
    /// db-only mode.
    fn sweep_storage(&self, now: i64, report: &mut SweepReport) {
        let Some(db) = &self.shared().db else {
            return;
        };
        match self.config().sync_mode {
            SyncMode::DbOnly => match db.delete_expired(self.name(), now) {
                Ok(rows) => report.rows_deleted += rows,
                Err(e) => {
                    report.failures += 1;
                    self.stats.persistence_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(domain = %self.name(), error = %e, "Failed to delete expired rows");
                }
            },
            SyncMode::WriteBack => {
                for (aor, uri) in self.take_pending_deletes() {
                    match db.delete_contact(self.name(), &aor, &uri) {
                        Ok(rows) => report.rows_deleted += rows,
                        Err(e) => {
                            report.failures += 1;
                            self.stats.persistence_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(domain = %self.name(), %aor, error = %e, "Failed to delete contact row");
                            self.queue_delete(&aor, &uri);
                        }
                    }
                }
            }
            SyncMode::NoDb | SyncMode::WriteThrough => {}
        }
    }

    /// Contact table pass: flags newly expired contacts and collects those
    /// ready for deletion or freeing into the bounded scratch list.
    fn sweep_contacts(&self, now: i64, scratch: &mut Vec<Arc<Contact>>, report: &mut SweepReport) {
        let capacity = self.config().expired_scratch_len();
        let table = self.contacts();
        let mut longest = 0;
        let mut expired = Vec::new();

        'slots: for index in 0..table.size() {
            let mut slot = table.lock_slot(index);
            longest = longest.max(slot.len());
            let mut full = false;
            for contact in slot.contacts().to_vec() {
                let mut data = contact.data();
                let state = data.state;
                match state {
                    ContactState::Valid if data.is_expired(now) => {
                        data.state = ContactState::ExpirePendingNotify;
                        slot.hold_locked(&mut data);
                        drop(data);
                        report.expired += 1;
                        expired.push(contact);
                    }
                    ContactState::NotifyReady => {
                        drop(data);
                        full = !collect(scratch, capacity, contact);
                    }
                    ContactState::DelayedDelete if data.refs == 0 && data.is_expired(now) => {
                        drop(data);
                        full = !collect(scratch, capacity, contact);
                    }
                    ContactState::Valid
                    | ContactState::ExpirePendingNotify
                    | ContactState::Deleted
                    | ContactState::DelayedDelete => {}
                }
                if full {
                    break;
                }
            }
            drop(slot);

            for contact in expired.drain(..) {
                tracing::debug!(contact_id = contact.id(), aor = %contact.aor(), "Contact expired");
                self.fire(CallbackKind::CONTACT_EXPIRE, contact.aor(), None, Some(&contact));
            }
            if full {
                tracing::warn!(
                    domain = %self.name(),
                    capacity,
                    "Expired contact list full, remaining contacts wait for the next sweep"
                );
                break 'slots;
            }
        }
        table.observe_collisions(longest);
    }

    /// Final pass over the contacts collected by [`Domain::sweep_contacts`].
    fn finish_contacts(&self, scratch: Vec<Arc<Contact>>, now: i64, report: &mut SweepReport) {
        let grace = self.config().contact_delete_delay.as_secs() as i64;
        for contact in scratch {
            let Some(mut slot) = self.contacts().lock_for(&contact) else {
                continue;
            };
            let step = {
                let mut data = contact.data();
                let state = data.state;
                match state {
                    ContactState::NotifyReady => {
                        data.state = ContactState::Deleted;
                        Some(ContactState::Deleted)
                    }
                    ContactState::DelayedDelete if data.refs == 0 => Some(ContactState::DelayedDelete),
                    // Changed since it was collected.
                    ContactState::Valid
                    | ContactState::ExpirePendingNotify
                    | ContactState::Deleted
                    | ContactState::DelayedDelete => None,
                }
            };
            match step {
                Some(ContactState::Deleted) => {
                    report.deleted += 1;
                    if let Release::Freed(_) = slot.unhold(&contact, now, grace) {
                        report.freed += 1;
                    }
                }
                Some(_) => {
                    if slot.remove(&contact).is_some() {
                        tracing::debug!(contact_id = contact.id(), "Contact freed");
                        report.freed += 1;
                    }
                }
                None => {}
            }
        }
    }
}

/// Pushes onto the scratch list unless it is full.
fn collect(scratch: &mut Vec<Arc<Contact>>, capacity: usize, contact: Arc<Contact>) -> bool {
    if scratch.len() >= capacity {
        return false;
    }
    scratch.push(contact);
    true
}

impl ShardGuard<'_> {
    /// Record pass over one locked shard.
    pub(crate) fn sweep(&mut self, now: i64, report: &mut SweepReport) {
        let mut pos = 0;
        while pos < self.len() {
            let remove = self.record_at(pos).sweep(now, report);
            if remove {
                self.remove_at(pos);
                report.records_deleted += 1;
            } else {
                pos += 1;
            }
        }
    }
}

impl RecordMut<'_> {
    /// Returns whether the record should be deleted.
    fn sweep(&mut self, now: i64, report: &mut SweepReport) -> bool {
        let domain = self.domain;
        let config = domain.config();
        let grace = config.contact_delete_delay.as_secs() as i64;
        let mut notify = Vec::new();

        let mut pos = 0;
        while pos < self.record.contacts.len() {
            let contact = self.record.contacts[pos].clone();
            let state = {
                let mut data = contact.data();
                if data.state == ContactState::ExpirePendingNotify {
                    data.state = ContactState::NotifyReady;
                    ContactState::ExpirePendingNotify
                } else {
                    data.state
                }
            };
            match state {
                ContactState::ExpirePendingNotify => {
                    notify.push(contact);
                    pos += 1;
                }
                ContactState::Deleted | ContactState::DelayedDelete => {
                    match domain.contacts().try_lock_for(&contact) {
                        Some(None) => {
                            tracing::debug!(contact_id = contact.id(), "Contact slot busy, unlink deferred");
                            report.deferred += 1;
                            pos += 1;
                        }
                        Some(Some(mut slot)) => {
                            if let Err(e) = self.forget_row(&contact) {
                                report.failures += 1;
                                tracing::error!(aor = %self.record.aor(), error = %e, "Failed to delete contact row");
                            }
                            self.record.contacts.remove(pos);
                            report.unlinked += 1;
                            if let Release::Freed(_) = slot.release(&contact, now, grace) {
                                report.freed += 1;
                            }
                        }
                        None => {
                            self.record.contacts.remove(pos);
                            report.unlinked += 1;
                        }
                    }
                }
                ContactState::Valid | ContactState::NotifyReady => {
                    if config.sync_mode == SyncMode::WriteBack {
                        self.flush_contact(&contact, report);
                    }
                    pos += 1;
                }
            }
        }

        for contact in &notify {
            self.fire(CallbackKind::RECORD_DELETE_CONTACT, Some(contact));
        }

        if self.record.contacts.is_empty() {
            return !self.record.is_unregistered_hold(now);
        }
        let live = self.record.contacts.iter().any(|c| c.is_live(now));
        if !live && self.record.subscription.is_some() && self.record.reg_state == RegState::Registered {
            self.record.reg_state = RegState::Unregistered;
            self.record.expires = now + config.unreg_validity.as_secs() as i64;
            report.records_unregistered += 1;
            tracing::debug!(aor = %self.record.aor(), "Record unregistered, no contacts left");
            self.fire(CallbackKind::RECORD_UNREG_NO_CONTACTS, None);
        }
        false
    }

    /// Write-back: stores a `New` or `Dirty` contact this record owns.
    pub(crate) fn flush_contact(&self, contact: &Arc<Contact>, report: &mut SweepReport) {
        let domain = self.domain;
        let Some(db) = &domain.shared().db else {
            return;
        };
        if contact.aor() != self.record.aor() {
            return;
        }
        let (pending, data) = {
            let data = contact.data();
            (data.pending_write(), data.clone())
        };
        let Some(pending) = pending else {
            return;
        };

        // Upsert either way: a queued delete for the same row may have been
        // cancelled by a re-registration.
        let result = db
            .update_contact(domain.name(), contact.aor(), &data)
            .and_then(|rows| match rows {
                0 => db.insert_contact(domain.name(), contact.aor(), &data, contact.is_3gpp()),
                _ => Ok(()),
            });
        match result {
            Ok(()) => {
                contact.data().mark_synced();
                match pending {
                    PendingWrite::Insert => report.rows_inserted += 1,
                    PendingWrite::Update => report.rows_updated += 1,
                }
            }
            Err(e) => {
                report.failures += 1;
                domain.stats.persistence_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(aor = %self.record.aor(), error = %e, "Failed to flush contact");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocationConfig;
    use crate::error::{Error, Result};
    use crate::location::contact::{ContactInfo, ContactQuery};
    use crate::location::record::RecordUpdate;
    use crate::location::subscription::{PublicIdentity, ServiceProfile, SubscriptionData};
    use crate::location::testing::{store, store_with};
    use crate::location::{unix_now, Location};
    use crate::persistence::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    const AOR: &str = "alice@example.com";

    fn config() -> LocationConfig {
        LocationConfig::new().record_shards(8).contact_shards(8)
    }

    fn counter(location: &Location, kind: CallbackKind) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let count = hits.clone();
        location.callbacks().register(kind, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        hits
    }

    fn register(location: &Location, aor: &str, uri: &str, info: &ContactInfo) -> Result<Arc<Contact>> {
        let domain = location.domain("location")?;
        let mut shard = domain.lock_aor(aor);
        let mut record = shard.insert_record(aor)?;
        record.insert_contact(uri, info)
    }

    #[test]
    fn test_expired_contact_lifecycle() -> Result<()> {
        let location = store(config());
        let expired = counter(&location, CallbackKind::CONTACT_EXPIRE);
        let unlinked = counter(&location, CallbackKind::RECORD_DELETE_CONTACT);
        let deleted = counter(&location, CallbackKind::RECORD_DELETE);

        let t0 = unix_now() + 100;
        let contact = register(&location, AOR, "sip:alice@h", &ContactInfo::new(t0))?;
        let domain = location.domain("location")?;

        let report = location.sweep_at(t0 + 1);
        assert_eq!(report.expired, 1);
        assert_eq!(contact.state(), ContactState::NotifyReady);
        assert_eq!(contact.refs(), 2);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert_eq!(unlinked.load(Ordering::SeqCst), 1);
        {
            let mut shard = domain.lock_aor(AOR);
            let record = shard.get_record(AOR)?;
            assert!(matches!(
                record.get_contact(&ContactQuery::new("sip:alice@h")),
                Err(Error::NotFound)
            ));
        }

        let report = location.sweep_at(t0 + 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(contact.state(), ContactState::Deleted);
        assert_eq!(contact.refs(), 1);

        let report = location.sweep_at(t0 + 3);
        assert_eq!(report.unlinked, 1);
        assert_eq!(report.records_deleted, 1);
        assert_eq!(contact.state(), ContactState::DelayedDelete);
        assert_eq!(contact.refs(), 0);
        assert_eq!(domain.record_count(), 0);
        assert_eq!(deleted.load(Ordering::SeqCst), 1);

        // Still inside the delete grace period.
        assert_eq!(location.sweep_at(t0 + 4).freed, 0);
        assert_eq!(domain.contact_count(), 1);

        let grace = config().contact_delete_delay.as_secs() as i64;
        assert_eq!(location.sweep_at(t0 + 4 + grace).freed, 1);
        assert_eq!(domain.contact_count(), 0);
        Ok(())
    }

    #[test]
    fn test_registered_record_held_as_unregistered() -> Result<()> {
        let location = store(config());
        let unreg = counter(&location, CallbackKind::RECORD_UNREG_NO_CONTACTS);
        let domain = location.domain("location")?;

        let t0 = unix_now() + 100;
        {
            let mut shard = domain.lock_aor(AOR);
            let mut record = shard.insert_record(AOR)?;
            record.insert_contact("sip:alice@h", &ContactInfo::new(t0))?;
            record.update(RecordUpdate {
                reg_state: Some(RegState::Registered),
                subscription: Some(SubscriptionData::new("alice@ims").profile(ServiceProfile {
                    public_identities: vec![PublicIdentity::new("sip:alice@ims")],
                    ..Default::default()
                })),
                ..Default::default()
            })?;
        }

        let report = location.sweep_at(t0 + 1);
        assert_eq!(report.records_unregistered, 1);
        assert_eq!(unreg.load(Ordering::SeqCst), 1);

        location.sweep_at(t0 + 2);
        location.sweep_at(t0 + 3);
        {
            let mut shard = domain.lock_aor(AOR);
            let record = shard.get_record(AOR)?;
            assert_eq!(record.contact_count(), 0);
            assert_eq!(record.reg_state(), RegState::Unregistered);
        }

        let validity = config().unreg_validity.as_secs() as i64;
        let report = location.sweep_at(t0 + 2 + validity);
        assert_eq!(report.records_deleted, 1);
        assert!(location.subscriptions().is_empty());
        assert_eq!(location.subscriptions().freed(), 1);
        Ok(())
    }

    #[test]
    fn test_write_back_flushes_on_sweep() -> Result<()> {
        let rows = MemoryStore::new();
        let location = store_with(config().sync_mode(SyncMode::WriteBack), &rows);
        let table = rows.table("location");
        let domain = location.domain("location")?;
        let now = unix_now();

        let contact = register(&location, AOR, "sip:alice@h", &ContactInfo::new(now + 3600).cseq(1))?;
        assert!(table.is_empty());

        let report = location.sweep_at(now);
        assert_eq!(report.rows_inserted, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(contact.sync_state(), crate::location::SyncState::Sync);

        {
            let mut shard = domain.lock_aor(AOR);
            let mut record = shard.get_record(AOR)?;
            record.update_contact(&contact, &ContactInfo::new(now + 7200).cseq(2))?;
        }
        assert_eq!(contact.sync_state(), crate::location::SyncState::Dirty);
        assert_eq!(location.sweep_at(now).rows_updated, 1);

        {
            let mut shard = domain.lock_aor(AOR);
            let mut record = shard.get_record(AOR)?;
            record.delete_contact(&contact)?;
        }
        assert_eq!(table.len(), 1);
        assert_eq!(location.sweep_at(now).rows_deleted, 1);
        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn test_write_back_reregistration_cancels_queued_delete() -> Result<()> {
        let rows = MemoryStore::new();
        let location = store_with(config().sync_mode(SyncMode::WriteBack), &rows);
        let domain = location.domain("location")?;
        let now = unix_now();

        let first = register(&location, AOR, "sip:alice@h", &ContactInfo::new(now + 3600))?;
        location.synchronize();
        {
            let mut shard = domain.lock_aor(AOR);
            let mut record = shard.get_record(AOR)?;
            record.delete_contact(&first)?;
            record.insert_contact("sip:alice@h", &ContactInfo::new(now + 3600).cseq(9))?;
        }

        let report = location.sweep_at(now);
        assert_eq!(report.rows_deleted, 0);
        let stored = rows.table("location").rows();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].get("cseq"), Some(&crate::encoding::Value::Int(9)));
        Ok(())
    }

    #[test]
    fn test_db_only_deletes_expired_rows() -> Result<()> {
        let rows = MemoryStore::new();
        let location = store_with(config().sync_mode(SyncMode::DbOnly), &rows);
        let now = unix_now();

        register(&location, AOR, "sip:alice@h", &ContactInfo::new(now + 100))?;
        register(&location, AOR, "sip:alice@permanent", &ContactInfo::new(0))?;

        let report = location.sweep_at(now + 200);
        assert_eq!(report.rows_deleted, 1);
        let stored = rows.table("location").rows();
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].get("contact"),
            Some(&crate::encoding::Value::from("sip:alice@permanent"))
        );
        Ok(())
    }

    #[test]
    fn test_busy_contact_slot_defers_unlink() -> Result<()> {
        let location = store(config());
        let domain = location.domain("location")?;
        let aor = (0..)
            .map(|i| format!("user{i}@example.com"))
            .find(|aor| domain.shard_index(aor) != 0)
            .ok_or(Error::NotFound)?;
        let index = domain.shard_index(&aor);

        let contact = register(&location, &aor, "sip:user@h", &ContactInfo::new(0))?;
        contact.data().state = ContactState::Deleted;

        // Worker `index` of `size` owns only this record shard and skips the
        // contact table pass.
        let slot = domain.contacts().lock_for(&contact);
        let report = domain.sweep(index, domain.size(), unix_now());
        assert_eq!(report.deferred, 1);
        assert_eq!(report.unlinked, 0);
        drop(slot);

        let report = domain.sweep(index, domain.size(), unix_now());
        assert_eq!(report.unlinked, 1);
        assert_eq!(report.records_deleted, 1);
        Ok(())
    }

    #[test]
    fn test_contact_deleted_before_record_pass_is_freed() -> Result<()> {
        let location = store(config());
        let domain = location.domain("location")?;
        let aor = (0..)
            .map(|i| format!("user{i}@example.com"))
            .find(|aor| domain.shard_index(aor) % 2 == 1)
            .ok_or(Error::NotFound)?;

        let t0 = unix_now() + 100;
        let contact = register(&location, &aor, "sip:user@h", &ContactInfo::new(t0))?;

        // Worker 0 of 2 runs the contact pass but not this record's shard.
        let report = domain.sweep(0, 2, t0 + 1);
        assert_eq!(report.expired, 1);
        assert_eq!(contact.state(), ContactState::ExpirePendingNotify);
        assert_eq!(contact.refs(), 2);

        {
            let mut shard = domain.lock_aor(&aor);
            let mut record = shard.get_record(&aor)?;
            record.delete_contact(&contact)?;
        }
        assert_eq!(contact.state(), ContactState::NotifyReady);
        assert_eq!(contact.refs(), 1);

        assert_eq!(location.sweep_at(t0 + 2).deleted, 1);
        assert_eq!(contact.state(), ContactState::DelayedDelete);
        assert_eq!(contact.refs(), 0);

        let grace = config().contact_delete_delay.as_secs() as i64;
        assert_eq!(location.sweep_at(t0 + 3 + grace).freed, 1);
        assert_eq!(domain.contact_count(), 0);
        Ok(())
    }

    #[test]
    fn test_scratch_list_is_bounded() -> Result<()> {
        let location = store(config().contact_shards(2));
        let t0 = unix_now() + 100;
        for i in 0..6 {
            register(&location, AOR, &format!("sip:c{i}@h"), &ContactInfo::new(t0))?;
        }

        assert_eq!(location.sweep_at(t0 + 1).expired, 6);
        // Twice the contact shard count fits per pass.
        assert_eq!(location.sweep_at(t0 + 2).deleted, 4);
        let report = location.sweep_at(t0 + 3);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.unlinked, 4);
        Ok(())
    }
}
