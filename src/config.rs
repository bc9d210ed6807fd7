use std::time::Duration;

use crate::error::{Error, Result};

/// How an incoming contact is matched against the contacts already stored
/// for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchingMode {
    /// Contact URI only.
    #[default]
    ContactOnly,
    /// Contact URI and Call-ID.
    ContactCallId,
    /// Contact URI and Path; behaves as `ContactOnly` when no path is given.
    ContactPath,
    /// Host and port part of the contact URI.
    ContactPortIp,
}

/// What happens when a record is already at its contact limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityPolicy {
    #[default]
    Reject,
    OverwriteOldest,
}

/// When the persistence adapter is invoked relative to in-memory mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Memory only.
    #[default]
    NoDb,
    /// Every mutation is written synchronously; failures are logged.
    WriteThrough,
    /// Mutations are flushed by the periodic sweep.
    WriteBack,
    /// No in-memory cache; every read is a query.
    DbOnly,
}

impl SyncMode {
    pub fn uses_db(&self) -> bool {
        !matches!(self, SyncMode::NoDb)
    }
}

/// Column names used when mapping contacts to persistent rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnNames {
    pub aor: String,
    pub contact: String,
    pub expires: String,
    pub q: String,
    pub callid: String,
    pub cseq: String,
    pub flags: String,
    pub cflags: String,
    pub user_agent: String,
    pub received: String,
    pub path: String,
    pub socket: String,
    pub methods: String,
    pub last_modified: String,
    pub ruid: String,
    pub instance: String,
    pub reg_id: String,
    pub server_id: String,
    pub connection_id: String,
    pub is_3gpp: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            aor: "username".into(),
            contact: "contact".into(),
            expires: "expires".into(),
            q: "q".into(),
            callid: "callid".into(),
            cseq: "cseq".into(),
            flags: "flags".into(),
            cflags: "cflags".into(),
            user_agent: "user_agent".into(),
            received: "received".into(),
            path: "path".into(),
            socket: "socket".into(),
            methods: "methods".into(),
            last_modified: "last_modified".into(),
            ruid: "ruid".into(),
            instance: "instance".into(),
            reg_id: "reg_id".into(),
            server_id: "server_id".into(),
            connection_id: "connection_id".into(),
            is_3gpp: "is_3gpp".into(),
        }
    }
}

/// Configuration for the location store
#[derive(Debug, Clone)]
pub struct LocationConfig {
    /// Record shards per domain, a power of two (default: 1024)
    pub record_shards: usize,

    /// Contact table shards per domain, a power of two (default: 1024)
    pub contact_shards: usize,

    /// Subscription table shards, a power of two (default: 512)
    pub subscription_shards: usize,

    pub matching: MatchingMode,

    /// How often the expiry sweep runs (default: 60s)
    pub timer_interval: Duration,

    /// Number of sweep partitions (default: 1)
    pub sweep_workers: usize,

    /// Maximum contacts per record, 0 for unlimited (default: 0)
    pub max_contacts: usize,

    /// Maximum 3GPP-class contacts per record, 0 for unlimited (default: 0)
    pub max_contacts_3gpp: usize,

    pub capacity_policy: CapacityPolicy,

    pub sync_mode: SyncMode,

    /// Persistence URL, `mem://` or `file://<dir>` (default: None)
    pub db_url: Option<String>,

    /// Window in which an equal CSeq counts as a retransmission (default: 20s)
    pub cseq_delay: Duration,

    /// Grace period between logical deletion and freeing (default: 30s)
    pub contact_delete_delay: Duration,

    /// How long an unregistered record is kept without contacts (default: 30m)
    pub unreg_validity: Duration,

    /// Order contacts by recency only instead of q-value (default: false)
    pub desc_time_order: bool,

    /// Require AoRs to carry a domain part (default: false)
    pub use_domain: bool,

    /// Upper bound on live contacts per domain, None for unbounded
    pub contact_budget: Option<usize>,

    /// How often the metrics task logs store statistics (default: 60s)
    pub metrics_interval: Duration,

    pub columns: ColumnNames,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            record_shards: 1024,
            contact_shards: 1024,
            subscription_shards: 512,
            matching: MatchingMode::default(),
            timer_interval: Duration::from_secs(60),
            sweep_workers: 1,
            max_contacts: 0,
            max_contacts_3gpp: 0,
            capacity_policy: CapacityPolicy::default(),
            sync_mode: SyncMode::default(),
            db_url: None,
            cseq_delay: Duration::from_secs(20),
            contact_delete_delay: Duration::from_secs(30),
            unreg_validity: Duration::from_secs(1800),
            desc_time_order: false,
            use_domain: false,
            contact_budget: None,
            metrics_interval: Duration::from_secs(60),
            columns: ColumnNames::default(),
        }
    }
}

impl LocationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set record shard count
    pub fn record_shards(mut self, count: usize) -> Self {
        self.record_shards = count;
        self
    }

    /// Set contact table shard count
    pub fn contact_shards(mut self, count: usize) -> Self {
        self.contact_shards = count;
        self
    }

    /// Set subscription table shard count
    pub fn subscription_shards(mut self, count: usize) -> Self {
        self.subscription_shards = count;
        self
    }

    pub fn matching(mut self, mode: MatchingMode) -> Self {
        self.matching = mode;
        self
    }

    /// Set sweep interval
    pub fn timer_interval(mut self, interval: Duration) -> Self {
        self.timer_interval = interval;
        self
    }

    pub fn sweep_workers(mut self, workers: usize) -> Self {
        self.sweep_workers = workers;
        self
    }

    /// Set per-record contact limit
    pub fn max_contacts(mut self, max: usize) -> Self {
        self.max_contacts = max;
        self
    }

    /// Set per-record 3GPP contact limit
    pub fn max_contacts_3gpp(mut self, max: usize) -> Self {
        self.max_contacts_3gpp = max;
        self
    }

    pub fn capacity_policy(mut self, policy: CapacityPolicy) -> Self {
        self.capacity_policy = policy;
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn db_url(mut self, url: impl Into<String>) -> Self {
        self.db_url = Some(url.into());
        self
    }

    pub fn cseq_delay(mut self, delay: Duration) -> Self {
        self.cseq_delay = delay;
        self
    }

    pub fn contact_delete_delay(mut self, delay: Duration) -> Self {
        self.contact_delete_delay = delay;
        self
    }

    pub fn unreg_validity(mut self, validity: Duration) -> Self {
        self.unreg_validity = validity;
        self
    }

    pub fn desc_time_order(mut self, enabled: bool) -> Self {
        self.desc_time_order = enabled;
        self
    }

    pub fn use_domain(mut self, enabled: bool) -> Self {
        self.use_domain = enabled;
        self
    }

    /// Cap the number of live contacts a single domain may hold
    pub fn contact_budget(mut self, budget: usize) -> Self {
        self.contact_budget = Some(budget);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn columns(mut self, columns: ColumnNames) -> Self {
        self.columns = columns;
        self
    }

    /// Check the invariants the store relies on.
    pub fn validate(&self) -> Result<()> {
        self.validate_layout()?;
        if self.sync_mode.uses_db() && self.db_url.is_none() {
            return Err(Error::InvalidConfig(format!(
                "sync mode {:?} requires a db_url",
                self.sync_mode
            )));
        }
        Ok(())
    }

    /// Table geometry and timers, everything but the storage location.
    pub(crate) fn validate_layout(&self) -> Result<()> {
        for (name, count) in [
            ("record_shards", self.record_shards),
            ("contact_shards", self.contact_shards),
            ("subscription_shards", self.subscription_shards),
        ] {
            if !count.is_power_of_two() {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be a power of two, got {count}"
                )));
            }
        }
        if self.sweep_workers == 0 {
            return Err(Error::InvalidConfig("sweep_workers must be at least 1".into()));
        }
        if self.timer_interval.is_zero() {
            return Err(Error::InvalidConfig("timer_interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Size of the sweep's bounded scratch list.
    pub(crate) fn expired_scratch_len(&self) -> usize {
        self.contact_shards * 2
    }
}
