use std::sync::atomic::Ordering;

use super::domain::Domain;
use super::registry::Location;
use crate::error::Result;

/// Point-in-time statistics of one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainMetrics {
    pub name: String,
    pub records: usize,
    pub contacts: usize,
    pub max_collisions: usize,
    pub contact_max_collisions: usize,
    pub sweeps: u64,
    pub contacts_expired: u64,
    pub contacts_freed: u64,
    pub records_deleted: u64,
    pub rows_flushed: u64,
    pub persistence_errors: u64,
    pub pending_deletes: usize,
}

impl Domain {
    pub fn metrics(&self) -> DomainMetrics {
        let stats = &self.stats;
        DomainMetrics {
            name: self.name().to_string(),
            records: self.record_count(),
            contacts: self.contact_count(),
            max_collisions: self.max_collisions(),
            contact_max_collisions: self.contacts().max_collisions(),
            sweeps: stats.sweeps.load(Ordering::Relaxed),
            contacts_expired: stats.contacts_expired.load(Ordering::Relaxed),
            contacts_freed: stats.contacts_freed.load(Ordering::Relaxed),
            records_deleted: stats.records_deleted.load(Ordering::Relaxed),
            rows_flushed: stats.rows_flushed.load(Ordering::Relaxed),
            persistence_errors: stats.persistence_errors.load(Ordering::Relaxed),
            pending_deletes: self.pending_delete_count(),
        }
    }
}

/// Collect metrics from every domain and log them
pub fn collect_metrics(location: &Location) -> Result<()> {
    for domain in location.domains() {
        let m = domain.metrics();
        tracing::info!(
            domain = %m.name,
            records = m.records,
            contacts = m.contacts,
            max_collisions = m.max_collisions,
            contact_max_collisions = m.contact_max_collisions,
            sweeps = m.sweeps,
            contacts_expired = m.contacts_expired,
            contacts_freed = m.contacts_freed,
            records_deleted = m.records_deleted,
            rows_flushed = m.rows_flushed,
            persistence_errors = m.persistence_errors,
            pending_deletes = m.pending_deletes,
            "Location metrics"
        );
    }

    let subscriptions = location.subscriptions();
    tracing::info!(
        subscriptions = subscriptions.len(),
        created = subscriptions.created(),
        freed = subscriptions.freed(),
        max_collisions = subscriptions.max_collisions(),
        "Subscription metrics"
    );
    Ok(())
}
