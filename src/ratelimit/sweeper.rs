//! Background eviction of idle buckets.

use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::limiter::LimiterAdmin;

/// Periodically drop idle buckets until `shutdown` resolves.
///
/// Each sweep evicts buckets untouched for `multiplier` refill intervals
/// (see [`LimiterAdmin::evict_idle`]). Returns the total number evicted.
pub async fn run_eviction_loop<F>(
    admin: LimiterAdmin,
    every: Duration,
    multiplier: u32,
    shutdown: F,
) -> usize
where
    F: Future<Output = ()>,
{
    info!(
        every = ?every,
        multiplier = multiplier,
        "Starting idle bucket sweeper"
    );

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can be idle yet.
    ticker.tick().await;

    tokio::pin!(shutdown);
    let mut total = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let evicted = admin.evict_idle(multiplier);
                debug!(
                    evicted = evicted,
                    buckets = admin.bucket_count(),
                    "Idle bucket sweep finished"
                );
                total += evicted;
            }
        }
    }

    info!(evicted = total, "Idle bucket sweeper stopped");
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::MockClock;
    use crate::ratelimit::policy::{names, PolicySet};
    use crate::ratelimit::RateLimiter;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_sweeper_evicts_and_stops() {
        let clock = MockClock::new(Instant::now());
        let (limiter, admin) =
            RateLimiter::with_admin(PolicySet::default(), Arc::new(clock.clone()));

        limiter.allow(names::LOGIN, "10.0.0.1");
        limiter.allow(names::LOGIN, "10.0.0.2");
        clock.advance(Duration::from_secs(4 * 15 * 60));

        let (tx, rx) = oneshot::channel::<()>();
        let sweeper = tokio::spawn(run_eviction_loop(
            admin.clone(),
            Duration::from_millis(10),
            4,
            async move {
                let _ = rx.await;
            },
        ));

        for _ in 0..200 {
            if admin.bucket_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(admin.bucket_count(), 0);

        tx.send(()).unwrap();
        let total = sweeper.await.unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_sweeper_stops_immediately_on_shutdown() {
        let (_limiter, admin) =
            RateLimiter::with_admin(PolicySet::default(), Arc::new(MockClock::default()));

        let total = run_eviction_loop(admin, Duration::from_secs(3600), 4, async {}).await;
        assert_eq!(total, 0);
    }
}
