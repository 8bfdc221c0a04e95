//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod limiter;
mod policy;
mod registry;
mod rules;
mod sweeper;

pub use bucket::TokenBucket;
pub use clock::{Clock, MockClock, SystemClock};
pub use limiter::{LimiterAdmin, RateLimiter};
pub use policy::{names, Caller, IdentitySource, Policy, PolicySet};
pub use registry::{BucketKey, BucketRegistry, SharedBucket};
pub use rules::{PolicyFile, PolicyRule, TimeUnit};
pub use sweeper::run_eviction_loop;
