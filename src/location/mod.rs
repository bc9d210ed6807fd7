//! In-memory registrar location store.
//!
//! # Layout
//!
//! ```text
//! Location ─┬─ SubscriptionTable   (shared by every domain, keyed by IMPI)
//!           ├─ Callbacks
//!           ├─ Db                  (optional storage connection)
//!           └─ Domain ─┬─ record shards  [Mutex<Shard>; N] ── Record ──links──┐
//!                      └─ ContactTable   [Mutex<Vec<Arc<Contact>>>; M] ◀──────┘
//! ```
//!
//! # Locking
//!
//! Locks are always taken in this order, and never the reverse:
//!
//! 1. record shard ([`ShardGuard`])
//! 2. contact slot ([`contacts::SlotGuard`]) or subscription table shard
//! 3. the contact's or subscription's own data lock
//!
//! The storage connection lock is a leaf. Callbacks run with the record
//! shard held and must not lock it again; they read the record through
//! [`callbacks::Event::record`].
//!
//! # Persistence
//!
//! Contacts are persisted one row per (AoR, contact URI) in a table named
//! after the domain, under the AoR that created them. See
//! [`SyncMode`](crate::config::SyncMode) for when rows are written.

pub mod admin;
pub mod callbacks;
pub mod contact;
pub mod contacts;
mod db;
pub mod domain;
pub mod metrics;
pub mod record;
pub mod registry;
pub mod subscription;
pub mod sweep;
pub mod tasks;

pub use admin::{AddContact, DumpSummary};
pub use callbacks::{CallbackKind, Callbacks, Event};
pub use contact::{Contact, ContactData, ContactInfo, ContactQuery, ContactState, Methods, Q, Source, SyncState, Transport};
pub use db::StoredContact;
pub use domain::{ContactExport, Domain, ShardGuard};
pub use metrics::DomainMetrics;
pub use record::{ChargingAddresses, Record, RecordMut, RecordUpdate, RegState, SecurityAssociation, SecurityMechanism};
pub use registry::Location;
pub use subscription::{FilterCriteria, PublicIdentity, ServiceProfile, Subscription, SubscriptionData};
pub use sweep::SweepReport;

/// Current time in unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
