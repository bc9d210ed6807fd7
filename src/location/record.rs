use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::callbacks::CallbackKind;
use super::contact::{preference_order, Contact, ContactData, ContactInfo, ContactQuery, PendingWrite};
use super::contacts::Release;
use super::domain::Domain;
use super::subscription::{Subscription, SubscriptionData};
use super::unix_now;
use crate::config::{CapacityPolicy, SyncMode};
use crate::error::{Error, Result};
use crate::hasher::key_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegState {
    #[default]
    NotRegistered,
    Registered,
    Unregistered,
}

impl fmt::Display for RegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegState::NotRegistered => "not-registered",
            RegState::Registered => "registered",
            RegState::Unregistered => "unregistered",
        };
        f.write_str(s)
    }
}

/// Charging collection and event function addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChargingAddresses {
    pub ccf1: Option<String>,
    pub ccf2: Option<String>,
    pub ecf1: Option<String>,
    pub ecf2: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMechanism {
    Ipsec,
    Tls,
}

/// Security association negotiated with the user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityAssociation {
    pub mechanism: SecurityMechanism,
    pub spi_client: u32,
    pub spi_server: u32,
    pub port_client: u16,
    pub port_server: u16,
    pub algorithm: String,
    pub encryption: String,
}

/// Fields refreshed by [`RecordMut::update`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub reg_state: Option<RegState>,
    pub barring: Option<bool>,
    pub primary: Option<bool>,
    pub send_sar_on_delete: Option<bool>,
    pub charging: Option<ChargingAddresses>,
    pub service_routes: Option<Vec<String>>,
    pub security: Option<SecurityAssociation>,
    /// Only applied while the record has no aliases yet.
    pub aliases: Option<Vec<String>>,
    pub subscription: Option<SubscriptionData>,
}

/// One address-of-record and the contacts it can be reached at.
pub struct Record {
    aor: Arc<str>,
    hash: u32,
    domain: Arc<str>,
    /// Links in insertion order, oldest first.
    pub(crate) contacts: Vec<Arc<Contact>>,
    pub(crate) subscription: Option<Arc<Subscription>>,
    pub(crate) reg_state: RegState,
    pub(crate) barring: bool,
    pub(crate) primary: bool,
    pub(crate) send_sar_on_delete: bool,
    pub(crate) charging: ChargingAddresses,
    pub(crate) service_routes: Vec<String>,
    pub(crate) security: Option<SecurityAssociation>,
    pub(crate) aliases: Vec<String>,
    /// Unregistered-state expiry, unix seconds; 0 when not applicable.
    pub(crate) expires: i64,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("aor", &self.aor)
            .field("contacts", &self.contacts.len())
            .field("reg_state", &self.reg_state)
            .finish_non_exhaustive()
    }
}

impl Record {
    pub(crate) fn new(aor: &str, domain: Arc<str>) -> Self {
        Self {
            aor: aor.into(),
            hash: key_hash(aor),
            domain,
            contacts: Vec::new(),
            subscription: None,
            reg_state: RegState::NotRegistered,
            barring: false,
            primary: false,
            send_sar_on_delete: false,
            charging: ChargingAddresses::default(),
            service_routes: Vec::new(),
            security: None,
            aliases: Vec::new(),
            expires: 0,
        }
    }

    pub fn aor(&self) -> &str {
        &self.aor
    }

    pub(crate) fn aor_arc(&self) -> Arc<str> {
        self.aor.clone()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Linked contacts in insertion order, including ones awaiting expiry.
    pub fn contacts(&self) -> &[Arc<Contact>] {
        &self.contacts
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    pub fn count_3gpp(&self) -> usize {
        self.contacts.iter().filter(|c| c.is_3gpp()).count()
    }

    pub fn subscription(&self) -> Option<&Arc<Subscription>> {
        self.subscription.as_ref()
    }

    pub fn reg_state(&self) -> RegState {
        self.reg_state
    }

    pub fn barring(&self) -> bool {
        self.barring
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn send_sar_on_delete(&self) -> bool {
        self.send_sar_on_delete
    }

    pub fn charging(&self) -> &ChargingAddresses {
        &self.charging
    }

    pub fn service_routes(&self) -> &[String] {
        &self.service_routes
    }

    pub fn security(&self) -> Option<&SecurityAssociation> {
        self.security.as_ref()
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn expires(&self) -> i64 {
        self.expires
    }

    pub(crate) fn matches(&self, aor: &str, hash: u32) -> bool {
        self.hash == hash && &*self.aor == aor
    }

    fn position(&self, contact: &Arc<Contact>) -> Option<usize> {
        self.contacts.iter().position(|c| Arc::ptr_eq(c, contact))
    }

    /// Live contacts in forking order.
    pub fn routable_contacts(&self, now: i64, desc_time_order: bool) -> Vec<Arc<Contact>> {
        // Newest first before the stable sort, so equal keys favor recency.
        let mut keyed: Vec<(ContactData, Arc<Contact>)> = self
            .contacts
            .iter()
            .rev()
            .map(|c| (c.snapshot(), c.clone()))
            .filter(|(data, _)| data.is_live(now))
            .collect();
        keyed.sort_by(|a, b| preference_order(&a.0, &b.0, desc_time_order));
        keyed.into_iter().map(|(_, c)| c).collect()
    }

    /// Whether the record is held without contacts as an unregistered
    /// placeholder.
    pub(crate) fn is_unregistered_hold(&self, now: i64) -> bool {
        self.reg_state == RegState::Unregistered && self.expires > now
    }
}

/// A record borrowed from its locked shard. Every mutation goes through
/// here, so the type proves the shard lock is held.
pub struct RecordMut<'g> {
    pub(crate) domain: &'g Domain,
    pub(crate) record: &'g mut Record,
}

impl Deref for RecordMut<'_> {
    type Target = Record;

    fn deref(&self) -> &Record {
        self.record
    }
}

impl RecordMut<'_> {
    fn grace(&self) -> i64 {
        self.domain.config().contact_delete_delay.as_secs() as i64
    }

    pub(crate) fn fire(&self, kind: CallbackKind, contact: Option<&Contact>) {
        self.domain.fire(kind, self.record.aor(), Some(&*self.record), contact);
    }

    /// Creates a contact and links it to this record.
    pub fn insert_contact(&mut self, uri: &str, info: &ContactInfo) -> Result<Arc<Contact>> {
        let now = unix_now();
        self.make_room(info.is_3gpp, now)?;

        let domain = self.domain;
        let contact = if domain.config().sync_mode == SyncMode::DbOnly {
            domain
                .contacts()
                .transient(domain.name_arc(), self.record.aor_arc(), uri, info, now)
        } else {
            domain
                .contacts()
                .create(domain.name_arc(), self.record.aor_arc(), uri, info, now)?
        };
        self.attach(&contact);
        if domain.config().sync_mode == SyncMode::WriteBack {
            domain.cancel_delete(self.record.aor(), uri);
        }

        if let Err(e) = self.write_contact(&contact) {
            if let Some(pos) = self.record.position(&contact) {
                let contact = self.record.contacts.remove(pos);
                self.release_link(&contact, now);
            }
            return Err(e);
        }

        tracing::debug!(aor = %self.record.aor(), contact = %uri, "Contact inserted");
        self.fire(CallbackKind::CONTACT_INSERT, Some(&contact));
        self.fire(CallbackKind::RECORD_NEW_CONTACT, Some(&contact));
        Ok(contact)
    }

    /// Re-creates a stored contact at startup: no capacity check, no
    /// callbacks, already in sync with storage.
    pub(crate) fn restore_contact(&mut self, uri: &str, info: &ContactInfo) -> Result<Arc<Contact>> {
        let domain = self.domain;
        let contact =
            domain
                .contacts()
                .create(domain.name_arc(), self.record.aor_arc(), uri, info, unix_now())?;
        contact.data().mark_synced();
        self.attach(&contact);
        Ok(contact)
    }

    /// Links an existing contact, typically one shared by several records of
    /// the same identity.
    pub fn link_contact(&mut self, contact: &Arc<Contact>) -> Result<()> {
        if self.record.position(contact).is_some() {
            return Ok(());
        }
        if contact.domain() != self.domain.name() {
            return Err(Error::InvalidOperation(format!(
                "contact belongs to domain {}",
                contact.domain()
            )));
        }
        if !contact.is_live(unix_now()) {
            return Err(Error::InvalidState("cannot link an expired contact".into()));
        }
        self.make_room(contact.is_3gpp(), unix_now())?;
        self.attach(contact);
        self.fire(CallbackKind::RECORD_NEW_CONTACT, Some(contact));
        Ok(())
    }

    /// Removes the link without touching storage.
    pub fn unlink_contact(&mut self, contact: &Arc<Contact>) -> Result<()> {
        let pos = self.record.position(contact).ok_or(Error::NotFound)?;
        let contact = self.record.contacts.remove(pos);
        self.release_link(&contact, unix_now());
        Ok(())
    }

    pub fn update_contact(&mut self, contact: &Arc<Contact>, info: &ContactInfo) -> Result<()> {
        if self.record.position(contact).is_none() {
            return Err(Error::NotFound);
        }
        contact.update(info, unix_now());
        if let Some(instance) = &info.instance {
            tracing::trace!(aor = %self.record.aor(), %instance, "Contact refreshed by instance");
        }
        self.write_contact(contact)?;
        self.fire(CallbackKind::CONTACT_UPDATE, Some(contact));
        Ok(())
    }

    pub fn delete_contact(&mut self, contact: &Arc<Contact>) -> Result<()> {
        let pos = self.record.position(contact).ok_or(Error::NotFound)?;
        self.forget_row(contact)?;
        let contact = self.record.contacts.remove(pos);
        self.fire(CallbackKind::CONTACT_DELETE, Some(&contact));
        self.release_link(&contact, unix_now());
        tracing::debug!(aor = %self.record.aor(), contact_id = contact.id(), "Contact deleted");
        Ok(())
    }

    /// Finds the contact matching `query` under the configured matching mode.
    ///
    /// When the query carries a CSeq and the stored call-id matches (or the
    /// query has none), a lower CSeq is `Invalid` and an equal one is a
    /// `Retransmission` inside the CSeq delay window, `Invalid` after it.
    pub fn get_contact(&self, query: &ContactQuery<'_>) -> Result<Arc<Contact>> {
        let config = self.domain.config();
        let now = unix_now();
        let delay = config.cseq_delay.as_secs() as i64;

        for contact in &self.record.contacts {
            let data = contact.data();
            if !data.is_live(now) || !data.matches(query, config.matching) {
                continue;
            }
            if let Some(cseq) = query.cseq {
                let same_dialog = query.callid.map_or(true, |cid| data.callid == cid);
                if same_dialog && cseq < data.cseq {
                    return Err(Error::Invalid);
                }
                if same_dialog && cseq == data.cseq {
                    if data.last_modified + delay > now {
                        return Err(Error::Retransmission);
                    }
                    return Err(Error::Invalid);
                }
            }
            return Ok(contact.clone());
        }
        Err(Error::NotFound)
    }

    /// Live contacts in forking order.
    pub fn contacts_by_preference(&self) -> Vec<Arc<Contact>> {
        self.record
            .routable_contacts(unix_now(), self.domain.config().desc_time_order)
    }

    pub fn update(&mut self, update: RecordUpdate) -> Result<()> {
        let now = unix_now();
        if let Some(state) = update.reg_state {
            self.record.reg_state = state;
            self.record.expires = match state {
                RegState::Unregistered => {
                    now + self.domain.config().unreg_validity.as_secs() as i64
                }
                RegState::Registered | RegState::NotRegistered => 0,
            };
        }
        if let Some(barring) = update.barring {
            self.record.barring = barring;
        }
        if let Some(primary) = update.primary {
            self.record.primary = primary;
        }
        if let Some(send) = update.send_sar_on_delete {
            self.record.send_sar_on_delete = send;
        }
        if let Some(charging) = update.charging {
            self.record.charging = charging;
        }
        if let Some(routes) = update.service_routes {
            self.record.service_routes = routes;
        }
        if let Some(security) = update.security {
            self.record.security = Some(security);
        }
        if let Some(aliases) = update.aliases {
            if self.record.aliases.is_empty() {
                self.record.aliases = aliases;
            }
        }
        if let Some(data) = &update.subscription {
            self.set_subscription(data)?;
        }
        self.fire(CallbackKind::RECORD_UPDATE, None);
        Ok(())
    }

    fn set_subscription(&mut self, data: &SubscriptionData) -> Result<()> {
        let table = &self.domain.shared().subscriptions;
        let (subscription, _) = table.acquire(data)?;
        match &self.record.subscription {
            Some(current) if Arc::ptr_eq(current, &subscription) => {
                // Already linked; drop the reference acquire took.
                table.release(&subscription);
            }
            _ => {
                if let Some(old) = self.record.subscription.replace(subscription) {
                    table.release(&old);
                }
            }
        }
        Ok(())
    }

    /// Makes room for one more contact of the given class, rejecting or
    /// evicting the oldest linked contact per the capacity policy.
    fn make_room(&mut self, is_3gpp: bool, now: i64) -> Result<()> {
        let config = self.domain.config();
        let class_full = is_3gpp
            && config.max_contacts_3gpp > 0
            && self.record.count_3gpp() >= config.max_contacts_3gpp;
        let total_full = config.max_contacts > 0 && self.record.contacts.len() >= config.max_contacts;
        if !class_full && !total_full {
            return Ok(());
        }

        let exceeded = || Error::CapacityExceeded {
            aor: self.record.aor().to_string(),
        };
        match config.capacity_policy {
            CapacityPolicy::Reject => {
                tracing::debug!(aor = %self.record.aor(), "Contact limit reached, rejecting");
                Err(exceeded())
            }
            CapacityPolicy::OverwriteOldest => {
                let victim = if class_full {
                    self.record.contacts.iter().position(|c| c.is_3gpp())
                } else {
                    Some(0)
                };
                let Some(pos) = victim.filter(|&p| p < self.record.contacts.len()) else {
                    return Err(exceeded());
                };
                let evicted = self.record.contacts[pos].clone();
                self.forget_row(&evicted)?;
                self.record.contacts.remove(pos);
                tracing::info!(
                    aor = %self.record.aor(),
                    contact_id = evicted.id(),
                    "Contact limit reached, evicting oldest"
                );
                self.fire(CallbackKind::CONTACT_DELETE, Some(&evicted));
                self.release_link(&evicted, now);
                Ok(())
            }
        }
    }

    fn attach(&mut self, contact: &Arc<Contact>) {
        if let Some(mut slot) = self.domain.contacts().lock_for(contact) {
            slot.reference(contact);
        }
        self.record.contacts.push(contact.clone());
    }

    /// Drops the reference this record's link held.
    pub(crate) fn release_link(&self, contact: &Arc<Contact>, now: i64) {
        let grace = self.grace();
        if let Some(mut slot) = self.domain.contacts().lock_for(contact) {
            if let Release::Freed(freed) = slot.release(contact, now, grace) {
                tracing::debug!(contact_id = freed.id(), "Contact freed");
            }
        }
    }

    /// Writes the contact's pending change through, when this record owns
    /// the contact's row and the sync mode writes synchronously.
    fn write_contact(&self, contact: &Arc<Contact>) -> Result<()> {
        if contact.aor() != self.record.aor() {
            return Ok(());
        }
        let (pending, data) = {
            let data = contact.data();
            (data.pending_write(), data.clone())
        };
        let Some(pending) = pending else {
            return Ok(());
        };
        let is_3gpp = contact.is_3gpp();
        let written = self.domain.write_through(|db, table| match pending {
            PendingWrite::Insert => db.insert_contact(table, contact.aor(), &data, is_3gpp),
            PendingWrite::Update => {
                if db.update_contact(table, contact.aor(), &data)? == 0 {
                    db.insert_contact(table, contact.aor(), &data, is_3gpp)?;
                }
                Ok(())
            }
        })?;
        if written {
            contact.data().mark_synced();
        }
        Ok(())
    }

    /// Removes the contact's row, now or at the next write-back flush.
    pub(crate) fn forget_row(&self, contact: &Arc<Contact>) -> Result<()> {
        if contact.aor() != self.record.aor() {
            return Ok(());
        }
        let (persisted, uri) = {
            let data = contact.data();
            (data.is_persisted(), data.uri.clone())
        };
        if !persisted {
            return Ok(());
        }
        if self.domain.config().sync_mode == SyncMode::WriteBack {
            self.domain.queue_delete(contact.aor(), &uri);
            return Ok(());
        }
        self.domain
            .write_through(|db, table| db.delete_contact(table, contact.aor(), &uri).map(|_| ()))?;
        Ok(())
    }
}
