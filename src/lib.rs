pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod location;
pub mod persistence;
pub mod scheduler;

pub use config::{CapacityPolicy, ColumnNames, LocationConfig, MatchingMode, SyncMode};
pub use error::{Error, Result};
pub use location::{Domain, Location};
pub use persistence::PersistenceAdapter;
