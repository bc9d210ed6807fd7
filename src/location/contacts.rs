//! Per-domain sharded table owning every contact.
//!
//! The table is the only place contacts are created and freed. Records link
//! to contacts and account for those links in the contact's reference count,
//! which may only change while the contact's slot is locked through a
//! [`SlotGuard`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::contact::{Contact, ContactData, ContactInfo, ContactQuery, ContactState};
use crate::config::MatchingMode;
use crate::error::{Error, Result};
use crate::hasher::{key_hash, shard_of};

/// Outcome of dropping one reference.
#[derive(Debug)]
pub enum Release {
    /// Other references remain.
    Held,
    /// Last reference dropped; the contact is now `DelayedDelete` and will be
    /// freed by a later sweep once its grace period ends.
    Scheduled,
    /// Last reference dropped on a `DelayedDelete` contact; it has been
    /// removed from the table.
    Freed(Arc<Contact>),
}

pub struct ContactTable {
    slots: Vec<Mutex<Vec<Arc<Contact>>>>,
    next_id: AtomicU64,
    live: AtomicUsize,
    budget: Option<usize>,
    max_collisions: AtomicUsize,
}

impl ContactTable {
    pub fn new(size: usize, budget: Option<usize>) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(size).map_err(|e| {
            Error::AllocationFailure(format!("contact table of {size} slots: {e}"))
        })?;
        slots.extend((0..size).map(|_| Mutex::new(Vec::new())));
        Ok(Self {
            slots,
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            budget,
            max_collisions: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of contacts currently held by the table, in any state.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_collisions(&self) -> usize {
        self.max_collisions.load(Ordering::Relaxed)
    }

    pub(crate) fn observe_collisions(&self, observed: usize) {
        self.max_collisions.fetch_max(observed, Ordering::Relaxed);
    }

    pub fn slot_for(&self, uri: &str) -> usize {
        shard_of(key_hash(uri), self.slots.len())
    }

    pub fn lock_slot(&self, index: usize) -> SlotGuard<'_> {
        SlotGuard {
            index,
            table: self,
            contacts: self.slots[index].lock(),
        }
    }

    pub fn try_lock_slot(&self, index: usize) -> Option<SlotGuard<'_>> {
        self.slots[index].try_lock().map(|contacts| SlotGuard {
            index,
            table: self,
            contacts,
        })
    }

    /// Locks the slot owning `contact`; `None` for transient contacts.
    pub fn lock_for(&self, contact: &Contact) -> Option<SlotGuard<'_>> {
        contact.slot().map(|slot| self.lock_slot(slot))
    }

    pub fn try_lock_for(&self, contact: &Contact) -> Option<Option<SlotGuard<'_>>> {
        contact.slot().map(|slot| self.try_lock_slot(slot))
    }

    /// Allocates a contact in the slot for `uri`. The new contact starts
    /// with no references; linking it to a record takes the first.
    pub fn create(
        &self,
        domain: Arc<str>,
        aor: Arc<str>,
        uri: &str,
        info: &ContactInfo,
        now: i64,
    ) -> Result<Arc<Contact>> {
        let index = self.slot_for(uri);
        let mut slot = self.lock_slot(index);

        self.reserve()?;
        if let Err(e) = slot.contacts.try_reserve(1) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::AllocationFailure(format!("contact slot {index}: {e}")));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let contact = Arc::new(Contact::new(id, domain, aor, uri, info, Some(index), now));
        slot.contacts.push(contact.clone());
        Ok(contact)
    }

    /// Counts one more live contact, failing when that would exceed the
    /// budget. Other slots create concurrently, so the check and the
    /// increment are one atomic step.
    fn reserve(&self) -> Result<()> {
        let Some(budget) = self.budget else {
            self.live.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        };
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < budget).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| Error::AllocationFailure(format!("contact budget of {budget} exhausted")))
    }

    /// Builds a contact outside the table, for db-only mode.
    pub fn transient(
        &self,
        domain: Arc<str>,
        aor: Arc<str>,
        uri: &str,
        info: &ContactInfo,
        now: i64,
    ) -> Arc<Contact> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Contact::new(id, domain, aor, uri, info, None, now))
    }

    /// Finds a live contact by URI across every record of the domain.
    pub fn find(&self, query: &ContactQuery<'_>, mode: MatchingMode, now: i64) -> Option<Arc<Contact>> {
        let matching = |data: &ContactData| data.matches(query, mode) && data.is_live(now);
        match mode {
            // The URI decides the slot only when it is compared verbatim.
            MatchingMode::ContactPortIp => (0..self.size()).find_map(|i| {
                let slot = self.lock_slot(i);
                slot.find(matching)
            }),
            _ => self.lock_slot(self.slot_for(query.uri)).find(matching),
        }
    }
}

/// Exclusive access to one contact slot.
pub struct SlotGuard<'a> {
    index: usize,
    table: &'a ContactTable,
    contacts: MutexGuard<'a, Vec<Arc<Contact>>>,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn contacts(&self) -> &[Arc<Contact>] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    fn find<F>(&self, pred: F) -> Option<Arc<Contact>>
    where
        F: Fn(&ContactData) -> bool,
    {
        self.contacts.iter().find(|c| pred(&*c.data())).cloned()
    }

    fn owns(&self, contact: &Contact) -> bool {
        if contact.slot() == Some(self.index) {
            return true;
        }
        tracing::error!(
            contact_id = contact.id(),
            slot = self.index,
            owner = ?contact.slot(),
            "Reference change attempted under the wrong contact slot"
        );
        false
    }

    pub fn reference(&mut self, contact: &Contact) {
        if self.owns(contact) {
            Self::reference_locked(&mut contact.data());
        }
    }

    pub(crate) fn reference_locked(data: &mut ContactData) {
        data.refs += 1;
    }

    /// Drops one reference. Reaching zero frees a `DelayedDelete` contact and
    /// otherwise moves it to `DelayedDelete` with a grace expiry of
    /// `now + grace`.
    pub fn release(&mut self, contact: &Arc<Contact>, now: i64, grace: i64) -> Release {
        if !self.owns(contact) {
            return Release::Held;
        }
        let outcome = Self::release_locked(&mut contact.data(), now, grace);
        match outcome {
            Unref::Held => Release::Held,
            Unref::Scheduled => Release::Scheduled,
            Unref::Free => match self.remove(contact) {
                Some(freed) => Release::Freed(freed),
                None => Release::Held,
            },
        }
    }

    /// Reference bookkeeping with the contact's data lock already held.
    fn release_locked(data: &mut ContactData, now: i64, grace: i64) -> Unref {
        if data.refs == 0 {
            tracing::warn!(uri = %data.uri, "Contact reference released below zero");
            return Unref::Held;
        }
        data.refs -= 1;
        if data.refs > 0 {
            // Unlinked before its record pass: only the sweep's hold is left
            // and no record pass will advance it.
            if data.refs == 1 && data.swept && data.state == ContactState::ExpirePendingNotify {
                data.state = ContactState::NotifyReady;
            }
            return Unref::Held;
        }
        match data.state {
            ContactState::DelayedDelete => Unref::Free,
            ContactState::Valid
            | ContactState::ExpirePendingNotify
            | ContactState::NotifyReady
            | ContactState::Deleted => {
                data.state = ContactState::DelayedDelete;
                data.expires = now + grace;
                tracing::debug!(uri = %data.uri, "Contact unreferenced, delete scheduled");
                Unref::Scheduled
            }
        }
    }

    /// Takes the sweep's hold on a contact about to expire.
    pub(crate) fn hold_locked(&mut self, data: &mut ContactData) {
        if !data.swept {
            data.swept = true;
            Self::reference_locked(data);
        }
    }

    /// Drops the sweep's hold, if it has one.
    pub(crate) fn unhold(&mut self, contact: &Arc<Contact>, now: i64, grace: i64) -> Release {
        {
            let mut data = contact.data();
            if !data.swept {
                return Release::Held;
            }
            data.swept = false;
        }
        self.release(contact, now, grace)
    }

    /// Unlinks `contact` from the table. Its memory goes when the last
    /// `Arc` does.
    pub(crate) fn remove(&mut self, contact: &Contact) -> Option<Arc<Contact>> {
        let pos = self
            .contacts
            .iter()
            .position(|c| std::ptr::eq(Arc::as_ptr(c), contact))?;
        let removed = self.contacts.swap_remove(pos);
        self.table.live.fetch_sub(1, Ordering::SeqCst);
        Some(removed)
    }
}

enum Unref {
    Held,
    Scheduled,
    Free,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ContactTable {
        ContactTable::new(8, None).unwrap()
    }

    fn create(table: &ContactTable, uri: &str) -> Arc<Contact> {
        table
            .create("location".into(), "alice@example.com".into(), uri, &ContactInfo::new(0), 100)
            .unwrap()
    }

    #[test]
    fn test_create_places_contact_in_its_slot() {
        let table = table();
        let c = create(&table, "sip:alice@10.0.0.1");
        assert_eq!(c.slot(), Some(table.slot_for("sip:alice@10.0.0.1")));
        assert_eq!(table.len(), 1);
        assert_eq!(c.refs(), 0);
        let found = table.find(
            &ContactQuery::new("sip:alice@10.0.0.1"),
            MatchingMode::ContactOnly,
            100,
        );
        assert!(found.is_some_and(|f| Arc::ptr_eq(&f, &c)));
    }

    #[test]
    fn test_last_release_schedules_then_frees() {
        let table = table();
        let c = create(&table, "sip:alice@10.0.0.1");
        let mut slot = table.lock_for(&c).unwrap();
        slot.reference(&c);
        slot.reference(&c);

        assert!(matches!(slot.release(&c, 100, 30), Release::Held));
        assert!(matches!(slot.release(&c, 100, 30), Release::Scheduled));
        assert_eq!(c.state(), ContactState::DelayedDelete);
        assert_eq!(c.expires(), 130);
        assert_eq!(slot.len(), 1);

        slot.reference(&c);
        match slot.release(&c, 200, 30) {
            Release::Freed(freed) => assert!(Arc::ptr_eq(&freed, &c)),
            other => panic!("expected free, got {other:?}"),
        }
        assert_eq!(slot.len(), 0);
        drop(slot);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_release_never_goes_negative() {
        let table = table();
        let c = create(&table, "sip:alice@10.0.0.1");
        let mut slot = table.lock_for(&c).unwrap();
        assert!(matches!(slot.release(&c, 0, 0), Release::Held));
        assert_eq!(c.refs(), 0);
    }

    #[test]
    fn test_budget_exhaustion() {
        let table = ContactTable::new(4, Some(1)).unwrap();
        create(&table, "sip:a@h");
        let err = table.create("d".into(), "a".into(), "sip:b@h", &ContactInfo::new(0), 0);
        assert!(matches!(err, Err(Error::AllocationFailure(_))));
    }

    #[test]
    fn test_budget_holds_under_concurrent_creates() {
        let table = Arc::new(ContactTable::new(16, Some(10)).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|i| {
                            let uri = format!("sip:t{t}-{i}@h");
                            table
                                .create("d".into(), "a".into(), &uri, &ContactInfo::new(0), 0)
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();
        let created: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(created, 10);
        assert_eq!(table.len(), 10);
        let stored: usize = (0..table.size()).map(|i| table.lock_slot(i).len()).sum();
        assert_eq!(stored, 10);
    }

    #[test]
    fn test_find_skips_dead_contacts() {
        let table = table();
        let c = create(&table, "sip:alice@10.0.0.1");
        c.data().expires = 50;
        let query = ContactQuery::new("sip:alice@10.0.0.1");
        assert!(table.find(&query, MatchingMode::ContactOnly, 100).is_none());
        assert!(table.find(&query, MatchingMode::ContactOnly, 40).is_some());
    }

    #[test]
    fn test_transient_contacts_have_no_slot() {
        let table = table();
        let c = table.transient("d".into(), "a".into(), "sip:a@h", &ContactInfo::new(0), 0);
        assert!(c.slot().is_none());
        assert!(table.lock_for(&c).is_none());
        assert!(table.is_empty());
    }
}
