//! kubemux queue: deduplicating, level-triggered work queue with delayed and
//! rate-limited re-insertion.
//!
//! Items are identified by value. Adding an item that is already pending is a no-op;
//! adding one that is in flight schedules exactly one more pass after the current one.
//! The queue therefore keeps the latest request per item, never every request.

#![forbid(unsafe_code)]

mod delay;
mod limiter;
mod rate_limited;
mod work;

pub use delay::DelayingQueue;
pub use limiter::{
    default_controller_rate_limiter, BackoffPolicy, BucketRateLimiter, ExponentialFailureRateLimiter,
    FastSlowRateLimiter, MaxOfRateLimiter, RateLimiter,
};
pub use rate_limited::RateLimitingQueue;
pub use work::WorkQueue;
