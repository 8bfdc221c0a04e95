//! Rate limiter facade used by request handlers.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::policy::{Caller, Policy, PolicySet};
use super::registry::{BucketRegistry, SharedBucket};
use crate::error::{AuthguardError, Result};

/// State shared between the limiter and its administrative handle.
struct Shared {
    policies: PolicySet,
    registry: BucketRegistry,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn resolve(&self, name: &str) -> Result<&Arc<Policy>> {
        self.policies
            .resolve(name)
            .ok_or_else(|| AuthguardError::UnknownPolicy(name.to_string()))
    }
}

/// Decides whether a caller may perform a rate limited action right now.
///
/// Construct one at startup and hand clones (or an `Arc`) to request
/// handlers. Every clone shares the same buckets. Checks are synchronous,
/// never block on I/O, and only contend with other checks for the same
/// policy and identity.
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    /// Create a limiter over `policies` using the system clock.
    pub fn new(policies: PolicySet) -> Self {
        Self::with_clock(policies, Arc::new(SystemClock::new()))
    }

    /// Create a limiter that reads time from `clock`.
    pub fn with_clock(policies: PolicySet, clock: Arc<dyn Clock>) -> Self {
        info!(
            policies = policies.len(),
            names = ?policies.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "Rate limiter initialized"
        );
        Self {
            shared: Arc::new(Shared {
                policies,
                registry: BucketRegistry::new(),
                clock,
            }),
        }
    }

    /// Create a limiter together with the administrative handle for it.
    ///
    /// This is the only way to obtain a [`LimiterAdmin`]; keep it away from
    /// request handling code.
    pub fn with_admin(policies: PolicySet, clock: Arc<dyn Clock>) -> (Self, LimiterAdmin) {
        let limiter = Self::with_clock(policies, clock);
        let admin = LimiterAdmin {
            shared: Arc::clone(&limiter.shared),
        };
        (limiter, admin)
    }

    /// Consume one unit of `policy` quota for `identity`.
    ///
    /// Returns `false` when the quota for the current window is used up.
    ///
    /// # Panics
    ///
    /// Panics if `policy` is not configured on this limiter. That is a wiring
    /// mistake, not something a request can trigger; use [`try_allow`] to
    /// check names at startup.
    ///
    /// [`try_allow`]: RateLimiter::try_allow
    pub fn allow(&self, policy: &str, identity: &str) -> bool {
        self.try_allow(policy, identity)
            .unwrap_or_else(|err| panic!("rate limiter misconfigured: {}", err))
    }

    /// Like [`allow`](RateLimiter::allow), but reports unknown policies as an error.
    pub fn try_allow(&self, policy: &str, identity: &str) -> Result<bool> {
        let policy = self.shared.resolve(policy)?;
        Ok(self.consume(policy, identity))
    }

    /// Consume quota for `caller`, keyed by whichever identity the policy uses.
    pub fn allow_caller(&self, policy: &str, caller: &Caller) -> Result<bool> {
        let policy = self.shared.resolve(policy)?;
        let source = policy.identity_source();
        let identity = source
            .select(caller)
            .ok_or_else(|| AuthguardError::MissingIdentity {
                policy: policy.name().to_string(),
                identity: source,
            })?;
        Ok(self.consume(policy, identity))
    }

    /// Tokens `identity` could spend right now, without spending any.
    pub fn remaining(&self, policy: &str, identity: &str) -> Result<u32> {
        let policy = self.shared.resolve(policy)?;
        let remaining = match self.shared.registry.get(policy.name(), identity) {
            Some(bucket) => bucket.lock().available(self.shared.clock.now()),
            None => policy.capacity(),
        };
        Ok(remaining)
    }

    /// How long `identity` must wait before `policy` grants it anything again.
    ///
    /// `None` if a token is available now or the identity was never seen.
    /// Never creates a bucket.
    pub fn retry_after(&self, policy: &str, identity: &str) -> Result<Option<Duration>> {
        let policy = self.shared.resolve(policy)?;
        let Some(bucket) = self.shared.registry.get(policy.name(), identity) else {
            return Ok(None);
        };

        let bucket = bucket.lock();
        let now = self.shared.clock.now();
        if bucket.available(now) > 0 {
            Ok(None)
        } else {
            Ok(Some(bucket.duration_until_refill(now)))
        }
    }

    /// The configured policies.
    pub fn policies(&self) -> &PolicySet {
        &self.shared.policies
    }

    fn consume(&self, policy: &Arc<Policy>, identity: &str) -> bool {
        let bucket = self
            .shared
            .registry
            .get_or_create(policy, identity, self.shared.clock.now());
        self.consume_from(policy, identity, bucket)
    }

    /// Spend from `bucket`, following it to its replacement if the sweeper
    /// unlinked it between lookup and lock.
    fn consume_from(&self, policy: &Arc<Policy>, identity: &str, mut bucket: SharedBucket) -> bool {
        let mut guard = bucket.lock();
        while guard.is_evicted() {
            drop(guard);
            bucket = self
                .shared
                .registry
                .get_or_create(policy, identity, self.shared.clock.now());
            guard = bucket.lock();
        }

        let allowed = guard.try_consume(self.shared.clock.now());

        trace!(
            policy = policy.name(),
            identity = identity,
            allowed = allowed,
            remaining = guard.tokens(),
            "Checked rate limit"
        );
        if !allowed {
            debug!(
                policy = policy.name(),
                identity = identity,
                "Rate limit exceeded"
            );
        }
        allowed
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(PolicySet::default())
    }
}

/// Administrative operations on a limiter's buckets.
///
/// Only [`RateLimiter::with_admin`] hands one out. Request handlers hold a
/// [`RateLimiter`] and cannot reach these operations through it.
#[derive(Clone)]
pub struct LimiterAdmin {
    shared: Arc<Shared>,
}

impl LimiterAdmin {
    /// Forget `identity`'s bucket under `policy`; its next check starts full.
    ///
    /// Returns whether a bucket existed.
    pub fn reset(&self, policy: &str, identity: &str) -> Result<bool> {
        let policy = self.shared.resolve(policy)?;
        let removed = self.shared.registry.reset(policy.name(), identity);
        debug!(
            policy = policy.name(),
            identity = identity,
            removed = removed,
            "Reset rate limit bucket"
        );
        Ok(removed)
    }

    /// Forget every bucket under `policy`.
    pub fn clear_policy(&self, policy: &str) -> Result<usize> {
        let policy = self.shared.resolve(policy)?;
        let removed = self.shared.registry.clear_policy(policy.name());
        debug!(policy = policy.name(), removed = removed, "Cleared policy buckets");
        Ok(removed)
    }

    /// Forget every bucket under every policy.
    pub fn clear_all(&self) {
        let removed = self.shared.registry.len();
        self.shared.registry.clear_all();
        debug!(removed = removed, "Cleared all rate limit buckets");
    }

    /// Drop buckets idle for at least `multiplier` refill intervals.
    pub fn evict_idle(&self, multiplier: u32) -> usize {
        let evicted = self
            .shared
            .registry
            .evict_idle(self.shared.clock.now(), multiplier);
        if evicted > 0 {
            info!(
                evicted = evicted,
                remaining = self.shared.registry.len(),
                "Evicted idle rate limit buckets"
            );
        }
        evicted
    }

    /// Number of live buckets across all policies.
    pub fn bucket_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn policies(&self) -> &PolicySet {
        &self.shared.policies
    }
}
