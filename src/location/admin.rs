//! Operator commands. Thin wrappers over the record and domain operations,
//! off the registration hot path.

use std::io::Write;
use std::sync::Arc;

use super::contact::{Contact, ContactData, ContactInfo, ContactQuery, Methods, Q};
use super::registry::Location;
use super::sweep::SweepReport;
use super::unix_now;
use crate::encoding::format::{Formatter, Raw};
use crate::encoding::Value;
use crate::error::{Error, Result};

/// Call-ID stamped on contacts added by hand.
pub const ADMIN_CALLID: &str = "locdb-admin";

/// Contact fields accepted by [`Location::add_contact`].
#[derive(Debug, Clone, Default)]
pub struct AddContact {
    /// Lifetime in seconds from now; 0 registers a permanent contact.
    pub expires: i64,
    pub q: Q,
    pub path: Option<String>,
    pub flags: u32,
    pub cflags: u32,
    pub methods: Option<Methods>,
    pub socket: Option<String>,
}

/// Totals written by [`Location::dump`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DumpSummary {
    pub domains: usize,
    pub records: usize,
    pub contacts: usize,
}

fn contact_row(data: &ContactData) -> String {
    let columns = [
        ("contact", Value::from(data.uri.as_str())),
        ("expires", Value::DateTime(data.expires)),
        ("q", data.q.as_f64().map_or(Value::Null, Value::Double)),
        ("callid", Value::from(data.callid.as_str())),
        ("cseq", Value::Int(data.cseq)),
        ("user_agent", Value::from(data.user_agent.as_str())),
        ("path", data.path().map_or(Value::Null, Value::from)),
        (
            "received",
            data.received
                .as_ref()
                .map_or(Value::Null, |s| Value::String(s.to_string())),
        ),
        ("methods", Value::Bitmap(data.methods.bits())),
        ("flags", Value::Bitmap(data.flags)),
        ("cflags", Value::Bitmap(data.cflags)),
        ("state", Value::String(data.state.to_string())),
        ("sync", Value::String(data.sync.to_string())),
        ("refs", Value::BigInt(data.refs as i64)),
    ];
    Raw::row(columns.iter().map(|(name, value)| (*name, value)))
}

impl Location {
    /// Rejects AoRs without a domain part when domains are in use.
    pub fn check_aor(&self, aor: &str) -> Result<()> {
        if aor.is_empty() {
            return Err(Error::InvalidOperation("empty AoR".into()));
        }
        if self.config().use_domain && !aor.contains('@') {
            return Err(Error::InvalidOperation(format!("AoR {aor} has no domain part")));
        }
        Ok(())
    }

    /// Writes every domain, record and contact to `out`.
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<DumpSummary> {
        let mut summary = DumpSummary::default();
        for domain in self.domains() {
            summary.domains += 1;
            writeln!(
                out,
                "Domain: {} shards={} contacts={} max_collisions={}",
                domain.name(),
                domain.size(),
                domain.contact_count(),
                domain.max_collisions()
            )?;
            for index in 0..domain.size() {
                let shard = domain.lock_shard(index);
                for record in shard.records() {
                    summary.records += 1;
                    writeln!(
                        out,
                        "\tAoR: {} hash={} state={} contacts={}",
                        Raw::bytes(record.aor().as_bytes()),
                        record.hash(),
                        record.reg_state(),
                        record.contact_count()
                    )?;
                    for contact in record.contacts() {
                        summary.contacts += 1;
                        writeln!(out, "\t\t{}", contact_row(&contact.snapshot()))?;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Forces a sweep of every partition plus a write-back flush.
    pub fn flush(&self) -> SweepReport {
        let mut report = self.sweep();
        report += self.synchronize();
        report
    }

    pub fn remove_aor(&self, domain: &str, aor: &str) -> Result<()> {
        self.check_aor(aor)?;
        let domain = self.domain(domain)?;
        let mut shard = domain.lock_aor(aor);
        shard.delete_record(aor)
    }

    /// Deletes the contact with URI `uri` from `aor`.
    pub fn remove_contact(&self, domain: &str, aor: &str, uri: &str) -> Result<()> {
        self.check_aor(aor)?;
        let domain = self.domain(domain)?;
        let mut shard = domain.lock_aor(aor);
        let mut record = shard.get_record(aor)?;
        let contact = record
            .contacts()
            .iter()
            .find(|c| c.data().uri == uri)
            .cloned()
            .ok_or(Error::NotFound)?;
        record.delete_contact(&contact)
    }

    /// Adds a contact to `aor`, or refreshes it when already present.
    pub fn add_contact(&self, domain: &str, aor: &str, uri: &str, add: AddContact) -> Result<Arc<Contact>> {
        self.check_aor(aor)?;
        let domain = self.domain(domain)?;
        let mut info = ContactInfo::new(match add.expires {
            0 => 0,
            secs => unix_now() + secs,
        })
        .q(add.q)
        .callid(ADMIN_CALLID)
        .flags(add.flags)
        .cflags(add.cflags);
        info.path = add.path;
        info.methods = add.methods;
        info.socket = add.socket;

        let mut shard = domain.lock_aor(aor);
        let mut record = shard.insert_record(aor)?;
        match record.get_contact(&ContactQuery::new(uri).callid(ADMIN_CALLID)) {
            Ok(contact) => {
                info.cseq = contact.cseq() + 1;
                record.update_contact(&contact, &info)?;
                Ok(contact)
            }
            Err(Error::NotFound) => {
                info.cseq = 1;
                record.insert_contact(uri, &info)
            }
            Err(e) => Err(e),
        }
    }

    /// Live contacts of `aor` whose URI is `uri`.
    pub fn show_contact(&self, domain: &str, aor: &str, uri: &str) -> Result<Vec<ContactData>> {
        let contacts: Vec<_> = self
            .lookup(domain, aor)?
            .into_iter()
            .filter(|data| data.uri == uri)
            .collect();
        if contacts.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(contacts)
    }

    /// Live contacts of `aor` in forking order.
    pub fn lookup(&self, domain: &str, aor: &str) -> Result<Vec<ContactData>> {
        self.check_aor(aor)?;
        let domain = self.domain(domain)?;
        let mut shard = domain.lock_aor(aor);
        let record = shard.get_record(aor)?;
        let contacts: Vec<_> = record
            .contacts_by_preference()
            .iter()
            .map(|c| c.snapshot())
            .collect();
        if contacts.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(contacts)
    }
}
