//! Concurrent storage of token buckets keyed by policy and identity.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::bucket::TokenBucket;
use super::policy::Policy;

/// A bucket shared between the registry and in-flight checks.
pub type SharedBucket = Arc<Mutex<TokenBucket>>;

/// Uniquely identifies one bucket: a policy plus the caller identity.
///
/// Identities are opaque and compared byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Canonical policy name
    pub policy: String,
    /// Caller identity (IP address, email, ...)
    pub identity: String,
}

impl BucketKey {
    pub fn new(policy: &str, identity: &str) -> Self {
        Self {
            policy: policy.to_string(),
            identity: identity.to_string(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.policy, self.identity)
    }
}

/// Registry holding exactly one bucket per (policy, identity).
///
/// The map is sharded, and each bucket carries its own lock, so checks for
/// different keys never wait on each other. Shard guards are always released
/// before a bucket lock is taken.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    buckets: DashMap<BucketKey, SharedBucket>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bucket for `identity` under `policy`, creating a full one
    /// if none exists.
    ///
    /// Concurrent first-time callers for the same key all receive the same
    /// bucket; only the winner of the insertion race constructs one.
    pub fn get_or_create(&self, policy: &Arc<Policy>, identity: &str, now: Instant) -> SharedBucket {
        let key = BucketKey::new(policy.name(), identity);

        if let Some(bucket) = self.buckets.get(&key).map(|entry| Arc::clone(entry.value())) {
            return bucket;
        }

        let entry = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(
                key = %key,
                capacity = policy.capacity(),
                refill_amount = policy.refill_amount(),
                refill_interval = ?policy.refill_interval(),
                "Creating new token bucket"
            );
            Arc::new(Mutex::new(TokenBucket::new(Arc::clone(policy), now)))
        });
        Arc::clone(entry.value())
    }

    /// Look up an existing bucket without creating one.
    pub fn get(&self, policy: &str, identity: &str) -> Option<SharedBucket> {
        self.buckets
            .get(&BucketKey::new(policy, identity))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Drop one bucket so the next access starts from full capacity.
    ///
    /// Returns whether a bucket was present.
    pub fn reset(&self, policy: &str, identity: &str) -> bool {
        self.buckets.remove(&BucketKey::new(policy, identity)).is_some()
    }

    /// Drop every bucket belonging to `policy`, returning how many were removed.
    pub fn clear_policy(&self, policy: &str) -> usize {
        let mut removed = 0;
        self.buckets.retain(|key, _| {
            let keep = key.policy != policy;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Drop every bucket under every policy.
    pub fn clear_all(&self) {
        self.buckets.clear();
    }

    /// Drop buckets untouched for `multiplier` refill intervals (or the time
    /// they need to refill completely, whichever is longer).
    ///
    /// Buckets locked by an in-flight check are kept. Dropped buckets are
    /// marked evicted under their lock, so a check that looked one up just
    /// before the sweep sees the mark and moves to a fresh bucket instead of
    /// spending from the orphan.
    pub fn evict_idle(&self, now: Instant, multiplier: u32) -> usize {
        let mut evicted = 0;
        self.buckets.retain(|_, bucket| match bucket.try_lock() {
            Some(mut bucket) if bucket.is_idle(now, multiplier) => {
                bucket.mark_evicted();
                evicted += 1;
                false
            }
            _ => true,
        });
        evicted
    }

    /// Number of live buckets across all policies.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
