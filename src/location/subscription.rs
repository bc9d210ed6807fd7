//! Identity-wide subscription profiles shared by every record of one private
//! identity.
//!
//! Profiles live in their own sharded table keyed by private identity. The
//! reference count sits behind the profile's lock and only changes while the
//! owning table shard is also locked, so the last release removes the profile
//! from the table exactly once.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::hasher::{key_hash, shard_of};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublicIdentity {
    pub uri: String,
    pub barred: bool,
    /// Wildcarded identity pattern, when the identity is a wildcard.
    pub wildcard: Option<String>,
}

impl PublicIdentity {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn barred(mut self, barred: bool) -> Self {
        self.barred = barred;
        self
    }
}

/// Initial filter criterion routing matching requests to an application
/// server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCriteria {
    pub priority: i32,
    pub trigger: String,
    pub application_server: String,
    /// Continue the session when the application server is unreachable.
    pub session_continued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceProfile {
    pub public_identities: Vec<PublicIdentity>,
    pub filter_criteria: Vec<FilterCriteria>,
    pub cn_service_auth: Option<i32>,
}

/// Profile contents as delivered by the home subscriber server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriptionData {
    pub private_identity: String,
    pub service_profiles: Vec<ServiceProfile>,
}

impl SubscriptionData {
    pub fn new(private_identity: impl Into<String>) -> Self {
        Self {
            private_identity: private_identity.into(),
            service_profiles: Vec::new(),
        }
    }

    pub fn profile(mut self, profile: ServiceProfile) -> Self {
        self.service_profiles.push(profile);
        self
    }

    fn identity_set(&self) -> BTreeSet<&str> {
        identity_set(&self.service_profiles)
    }
}

fn identity_set(profiles: &[ServiceProfile]) -> BTreeSet<&str> {
    profiles
        .iter()
        .flat_map(|p| p.public_identities.iter())
        .map(|id| id.uri.as_str())
        .collect()
}

struct Inner {
    service_profiles: Vec<ServiceProfile>,
    refs: u32,
}

pub struct Subscription {
    private_identity: String,
    hash: u32,
    slot: usize,
    generation: u64,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("private_identity", &self.private_identity)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn private_identity(&self) -> &str {
        &self.private_identity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ref_count(&self) -> u32 {
        self.inner.lock().refs
    }

    pub fn service_profiles(&self) -> Vec<ServiceProfile> {
        self.inner.lock().service_profiles.clone()
    }

    /// Public identities across all service profiles, optionally skipping
    /// barred ones.
    pub fn public_identities(&self, include_barred: bool) -> Vec<String> {
        self.inner
            .lock()
            .service_profiles
            .iter()
            .flat_map(|p| p.public_identities.iter())
            .filter(|id| include_barred || !id.barred)
            .map(|id| id.uri.clone())
            .collect()
    }

    pub fn has_public_identity(&self, uri: &str) -> bool {
        self.inner
            .lock()
            .service_profiles
            .iter()
            .flat_map(|p| p.public_identities.iter())
            .any(|id| id.uri == uri)
    }
}

/// Whether `new` describes the same set of public identities as `old`.
pub fn compare(new: &SubscriptionData, old: &Subscription) -> bool {
    let inner = old.inner.lock();
    new.identity_set() == identity_set(&inner.service_profiles)
}

pub struct SubscriptionTable {
    slots: Vec<Mutex<Vec<Arc<Subscription>>>>,
    next_generation: AtomicU64,
    created: AtomicUsize,
    freed: AtomicUsize,
    max_collisions: AtomicUsize,
}

impl SubscriptionTable {
    pub fn new(size: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(size).map_err(|e| {
            Error::AllocationFailure(format!("subscription table of {size} slots: {e}"))
        })?;
        slots.extend((0..size).map(|_| Mutex::new(Vec::new())));
        Ok(Self {
            slots,
            next_generation: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            max_collisions: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Profiles currently in the table.
    pub fn len(&self) -> usize {
        self.slots.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Profiles whose last reference has been released.
    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    pub fn max_collisions(&self) -> usize {
        self.max_collisions.load(Ordering::Relaxed)
    }

    fn slot_of(&self, private_identity: &str) -> (u32, usize) {
        let hash = key_hash(private_identity);
        (hash, shard_of(hash, self.slots.len()))
    }

    /// Returns the profile for `data.private_identity` with one reference
    /// taken for the caller, creating it if absent. A profile whose public
    /// identities differ from `data` is replaced in the table by a new
    /// generation; holders of the old generation keep it until they release
    /// it. The flag is true when a new profile was created.
    pub fn acquire(&self, data: &SubscriptionData) -> Result<(Arc<Subscription>, bool)> {
        let (hash, index) = self.slot_of(&data.private_identity);
        let mut slot = self.slots[index].lock();

        let existing = slot
            .iter()
            .position(|s| s.hash == hash && s.private_identity == data.private_identity);

        if let Some(pos) = existing {
            let current = &slot[pos];
            if compare(data, current) {
                current.inner.lock().refs += 1;
                return Ok((current.clone(), false));
            }
            tracing::debug!(
                impi = %data.private_identity,
                generation = current.generation,
                "Subscription changed, installing new generation"
            );
            slot.remove(pos);
        }

        slot.try_reserve(1).map_err(|e| {
            Error::AllocationFailure(format!("subscription slot {index}: {e}"))
        })?;
        let subscription = Arc::new(Subscription {
            private_identity: data.private_identity.clone(),
            hash,
            slot: index,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(Inner {
                service_profiles: data.service_profiles.clone(),
                refs: 1,
            }),
        });
        slot.push(subscription.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok((subscription, true))
    }

    /// Looks up a profile, taking a reference for the caller.
    pub fn get(&self, private_identity: &str) -> Option<Arc<Subscription>> {
        let (hash, index) = self.slot_of(private_identity);
        let slot = self.slots[index].lock();
        let found = slot
            .iter()
            .find(|s| s.hash == hash && s.private_identity == private_identity)?;
        found.inner.lock().refs += 1;
        Some(found.clone())
    }

    pub fn reference(&self, subscription: &Subscription) {
        let _slot = self.slots[subscription.slot].lock();
        subscription.inner.lock().refs += 1;
    }

    /// Drops one reference; the last one removes the profile from the table.
    /// Returns true when this call released the last reference.
    pub fn release(&self, subscription: &Arc<Subscription>) -> bool {
        let mut slot = self.slots[subscription.slot].lock();
        let mut inner = subscription.inner.lock();
        if inner.refs == 0 {
            tracing::warn!(
                impi = %subscription.private_identity,
                "Subscription reference released below zero"
            );
            return false;
        }
        inner.refs -= 1;
        if inner.refs > 0 {
            return false;
        }
        drop(inner);

        if let Some(pos) = slot.iter().position(|s| Arc::ptr_eq(s, subscription)) {
            slot.remove(pos);
        }
        self.freed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(impi = %subscription.private_identity, "Subscription freed");
        true
    }

    /// Recomputes the longest slot chain.
    pub fn observe_collisions(&self) -> usize {
        let longest = self.slots.iter().map(|s| s.lock().len()).max().unwrap_or(0);
        self.max_collisions.fetch_max(longest, Ordering::Relaxed);
        longest
    }
}
