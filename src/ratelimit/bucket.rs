//! Token bucket with fixed-window discrete refill.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::policy::Policy;

/// Per-identity quota state for one policy.
///
/// Tokens are replenished in whole jumps of the policy's refill amount, once
/// per elapsed refill interval, never proportionally within a window. A
/// caller can therefore spend a full window's quota at once and then waits
/// for the next boundary.
///
/// The bucket itself is not synchronized; the registry wraps each one in a
/// mutex so the refill-then-consume sequence runs as a unit.
#[derive(Debug)]
pub struct TokenBucket {
    /// The policy this bucket enforces
    policy: Arc<Policy>,
    /// Remaining tokens, always within `0..=capacity`
    tokens: u32,
    /// Start of the current refill window
    window_start: Instant,
    /// Last time anyone consulted this bucket
    last_access: Instant,
    /// Set once the registry has unlinked this bucket
    evicted: bool,
}

impl TokenBucket {
    /// Create a full bucket whose first window starts at `now`.
    pub fn new(policy: Arc<Policy>, now: Instant) -> Self {
        Self {
            tokens: policy.capacity(),
            policy,
            window_start: now,
            last_access: now,
            evicted: false,
        }
    }

    /// Take one token if one is available.
    ///
    /// Returns `true` and decrements the count when a token was available,
    /// `false` otherwise. Any refill owed for elapsed windows is applied first.
    ///
    /// Every call, allowed or denied, refreshes the idle clock used by
    /// [`is_idle`](TokenBucket::is_idle), so a caller that keeps getting
    /// denied keeps its bucket alive.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.last_access = now;

        if self.tokens >= 1 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens that would be available at `now`, without consuming any.
    pub fn available(&self, now: Instant) -> u32 {
        self.refilled(now).0
    }

    /// Time until the next window boundary adds tokens.
    ///
    /// Zero if a boundary has already been crossed and the refill is pending.
    pub fn duration_until_refill(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.window_start);
        self.policy.refill_interval().saturating_sub(elapsed)
    }

    /// Whether the bucket has been untouched long enough to be dropped.
    ///
    /// The threshold is never shorter than the time an empty bucket needs to
    /// refill completely, so a bucket recreated after eviction holds exactly
    /// the tokens the evicted one would have had.
    pub fn is_idle(&self, now: Instant, multiplier: u32) -> bool {
        let windows = multiplier.max(self.policy.intervals_to_full());
        let threshold = self
            .policy
            .refill_interval()
            .checked_mul(windows)
            .unwrap_or(Duration::MAX);
        now.saturating_duration_since(self.last_access) >= threshold
    }

    /// Flag the bucket as no longer reachable from the registry.
    ///
    /// Holders of a stale handle must look the bucket up again instead of
    /// spending from this one.
    pub fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    /// Remaining tokens as of the last operation.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.policy.capacity()
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    fn refill(&mut self, now: Instant) {
        let (tokens, advance) = self.refilled(now);
        self.tokens = tokens;
        self.window_start += advance;
    }

    /// Token count after crediting every whole window elapsed by `now`, and
    /// how far the window start moves to stay aligned to its original phase.
    fn refilled(&self, now: Instant) -> (u32, Duration) {
        let elapsed = now.saturating_duration_since(self.window_start);
        let interval = self.policy.refill_interval();

        if elapsed < interval {
            return (self.tokens, Duration::ZERO);
        }

        let interval_nanos = interval.as_nanos();
        let windows = elapsed.as_nanos() / interval_nanos;
        // Remainder is below the interval, which validation keeps within u64.
        let remainder = Duration::from_nanos((elapsed.as_nanos() % interval_nanos) as u64);

        let capacity = u128::from(self.policy.capacity());
        let credited = windows.saturating_mul(u128::from(self.policy.refill_amount()));
        let tokens = u128::from(self.tokens).saturating_add(credited).min(capacity) as u32;

        (tokens, elapsed - remainder)
    }
}
