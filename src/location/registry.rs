//! The process root owning every domain.
//!
//! Domains are registered while the `Location` is still exclusively owned;
//! once it is shared (typically behind an `Arc`) the domain list is
//! read-only and lookups take no lock.

use std::sync::Arc;

use super::callbacks::Callbacks;
use super::db::Db;
use super::domain::Domain;
use super::subscription::SubscriptionTable;
use super::sweep::SweepReport;
use super::unix_now;
use crate::config::LocationConfig;
use crate::error::{Error, Result};
use crate::persistence::{self, PersistenceAdapter};

/// State every domain of one store shares.
pub(crate) struct Shared {
    pub(crate) config: LocationConfig,
    pub(crate) db: Option<Db>,
    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) callbacks: Callbacks,
}

pub struct Location {
    shared: Arc<Shared>,
    domains: Vec<Arc<Domain>>,
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Location")
            .field("domains", &self.domains)
            .field("sync_mode", &self.shared.config.sync_mode)
            .finish_non_exhaustive()
    }
}

impl Location {
    /// Opens a store, connecting to `db_url` when the sync mode needs
    /// storage.
    pub fn open(config: LocationConfig) -> Result<Self> {
        config.validate()?;
        let db = match &config.db_url {
            Some(url) if config.sync_mode.uses_db() => {
                Some(Db::new(persistence::connect(url)?, config.columns.clone()))
            }
            _ => None,
        };
        Self::build(config, db)
    }

    /// Opens a store over an already connected adapter; `db_url` is ignored.
    pub fn with_adapter(config: LocationConfig, adapter: Box<dyn PersistenceAdapter>) -> Result<Self> {
        config.validate_layout()?;
        let db = Db::new(adapter, config.columns.clone());
        Self::build(config, Some(db))
    }

    fn build(config: LocationConfig, db: Option<Db>) -> Result<Self> {
        let subscriptions = SubscriptionTable::new(config.subscription_shards)?;
        tracing::info!(
            sync_mode = ?config.sync_mode,
            matching = ?config.matching,
            record_shards = config.record_shards,
            "Location store opened"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                db,
                subscriptions,
                callbacks: Callbacks::new(),
            }),
            domains: Vec::new(),
        })
    }

    pub fn config(&self) -> &LocationConfig {
        &self.shared.config
    }

    /// Returns the domain called `name`, creating it on first use.
    pub fn register_domain(&mut self, name: &str) -> Result<Arc<Domain>> {
        if let Some(domain) = self.find_domain(name) {
            return Ok(domain);
        }
        self.domains
            .try_reserve(1)
            .map_err(|e| Error::AllocationFailure(format!("domain {name}: {e}")))?;
        let domain = Arc::new(Domain::new(name, self.shared.clone())?);
        self.domains.push(domain.clone());
        tracing::info!(domain = %name, "Domain registered");
        Ok(domain)
    }

    pub fn find_domain(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains.iter().find(|d| d.name() == name).cloned()
    }

    pub fn domain(&self, name: &str) -> Result<Arc<Domain>> {
        self.find_domain(name)
            .ok_or_else(|| Error::UnknownDomain(name.to_string()))
    }

    pub fn domains(&self) -> &[Arc<Domain>] {
        &self.domains
    }

    pub fn for_each_domain<F>(&self, mut f: F)
    where
        F: FnMut(&Domain),
    {
        for domain in &self.domains {
            f(domain);
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.shared.subscriptions
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.shared.callbacks
    }

    /// Loads persisted contacts into every domain.
    pub fn preload(&self) -> Result<usize> {
        let mut total = 0;
        for domain in &self.domains {
            total += domain.preload()?;
        }
        Ok(total)
    }

    /// One sweep worker's pass over every domain.
    pub fn sweep_worker(&self, worker: usize, now: i64) -> SweepReport {
        let workers = self.shared.config.sweep_workers;
        let mut report = SweepReport::default();
        for domain in &self.domains {
            report += domain.sweep(worker, workers, now);
        }
        if worker == 0 {
            let longest = self.shared.subscriptions.observe_collisions();
            tracing::trace!(longest, "Subscription table swept");
        }
        report
    }

    /// Full sweep of every partition at time `now`.
    pub fn sweep_at(&self, now: i64) -> SweepReport {
        let mut report = SweepReport::default();
        for worker in 0..self.shared.config.sweep_workers {
            report += self.sweep_worker(worker, now);
        }
        if !report.is_idle() {
            tracing::info!(
                expired = report.expired,
                freed = report.freed,
                records_deleted = report.records_deleted,
                failures = report.failures,
                "Sweep completed"
            );
        }
        report
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(unix_now())
    }

    /// Flushes every pending write-back change.
    pub fn synchronize(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for domain in &self.domains {
            report += domain.synchronize();
        }
        report
    }

    /// Final synchronization, then closes the storage connection.
    pub fn close(&self) -> Result<()> {
        let report = self.synchronize();
        if report.failures > 0 {
            tracing::warn!(failures = report.failures, "Unsynchronized changes at close");
        }
        if let Some(db) = &self.shared.db {
            db.close()?;
        }
        tracing::info!("Location store closed");
        Ok(())
    }
}
