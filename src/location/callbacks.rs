//! Notification hooks fired as records and contacts change.
//!
//! Callbacks run while the record's shard is locked and must not lock it
//! again. The event carries the locked record for reading instead. A
//! callback may register further callbacks; those see later events only.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;

use super::contact::Contact;
use super::record::Record;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallbackKind: u32 {
        const CONTACT_INSERT = 1 << 0;
        const CONTACT_UPDATE = 1 << 1;
        const CONTACT_DELETE = 1 << 2;
        const CONTACT_EXPIRE = 1 << 3;
        const RECORD_INSERT = 1 << 4;
        const RECORD_UPDATE = 1 << 5;
        const RECORD_DELETE = 1 << 6;
        const RECORD_NEW_CONTACT = 1 << 7;
        const RECORD_DELETE_CONTACT = 1 << 8;
        const RECORD_UNREG_NO_CONTACTS = 1 << 9;
    }
}

pub struct Event<'a> {
    pub kind: CallbackKind,
    pub domain: &'a str,
    pub aor: &'a str,
    /// The record, when the event fires under its shard lock.
    pub record: Option<&'a Record>,
    pub contact: Option<&'a Contact>,
}

pub type Callback = Arc<dyn Fn(&Event<'_>) + Send + Sync>;

#[derive(Default)]
pub struct Callbacks {
    entries: RwLock<Vec<(CallbackKind, Callback)>>,
    mask: AtomicU32,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every kind in `kinds`.
    pub fn register<F>(&self, kinds: CallbackKind, callback: F)
    where
        F: Fn(&Event<'_>) + Send + Sync + 'static,
    {
        self.entries.write().push((kinds, Arc::new(callback)));
        self.mask.fetch_or(kinds.bits(), Ordering::SeqCst);
    }

    pub fn has(&self, kind: CallbackKind) -> bool {
        CallbackKind::from_bits_truncate(self.mask.load(Ordering::Relaxed)).intersects(kind)
    }

    pub(crate) fn fire(
        &self,
        kind: CallbackKind,
        domain: &str,
        aor: &str,
        record: Option<&Record>,
        contact: Option<&Contact>,
    ) {
        if !self.has(kind) {
            return;
        }
        let matching: Vec<Callback> = self
            .entries
            .read()
            .iter()
            .filter(|(kinds, _)| kinds.intersects(kind))
            .map(|(_, callback)| callback.clone())
            .collect();
        let event = Event {
            kind,
            domain,
            aor,
            record,
            contact,
        };
        for callback in matching {
            callback(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fire_respects_mask() {
        let callbacks = Callbacks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        callbacks.register(
            CallbackKind::CONTACT_INSERT | CallbackKind::CONTACT_DELETE,
            move |event| {
                assert_eq!(event.aor, "alice@example.com");
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert!(callbacks.has(CallbackKind::CONTACT_DELETE));
        assert!(!callbacks.has(CallbackKind::RECORD_UPDATE));

        callbacks.fire(CallbackKind::CONTACT_INSERT, "location", "alice@example.com", None, None);
        callbacks.fire(CallbackKind::RECORD_UPDATE, "location", "alice@example.com", None, None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_can_register_another() {
        let callbacks = Arc::new(Callbacks::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let registry = callbacks.clone();
        let counter = hits.clone();
        callbacks.register(CallbackKind::RECORD_INSERT, move |_| {
            let counter = counter.clone();
            registry.register(CallbackKind::RECORD_DELETE, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        callbacks.fire(CallbackKind::RECORD_INSERT, "location", "alice@example.com", None, None);
        assert!(callbacks.has(CallbackKind::RECORD_DELETE));
        callbacks.fire(CallbackKind::RECORD_DELETE, "location", "alice@example.com", None, None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_reads_locked_record() -> crate::error::Result<()> {
        let location = crate::location::testing::store(
            crate::config::LocationConfig::new().record_shards(8).contact_shards(8),
        );
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = seen.clone();
        location.callbacks().register(
            CallbackKind::CONTACT_INSERT | CallbackKind::RECORD_INSERT,
            move |event| {
                let record = event.record.map(|r| (r.aor().to_string(), r.contact_count()));
                log.lock().push((event.kind, record));
            },
        );

        let domain = location.domain("location")?;
        {
            let mut shard = domain.lock_aor("alice@example.com");
            let mut record = shard.insert_record("alice@example.com")?;
            record.insert_contact("sip:alice@h", &crate::location::contact::ContactInfo::new(0))?;
        }

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (CallbackKind::RECORD_INSERT, Some(("alice@example.com".to_string(), 0))),
                (CallbackKind::CONTACT_INSERT, Some(("alice@example.com".to_string(), 1))),
            ]
        );
        Ok(())
    }
}
