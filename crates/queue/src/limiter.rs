use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Decides how long an item waits before being retried.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`. Records the attempt.
    fn when(&self, item: &T) -> Duration;
    /// Clear retry state for `item`.
    fn forget(&self, item: &T);
    /// Retries recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &T) -> usize;
}

/// `base * 2^failures`, capped at `max`.
pub struct ExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T: Eq + Hash> ExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<T: Clone + Eq + Hash + Send> RateLimiter<T> for ExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let n = failures.entry(item.clone()).or_insert(0);
            let exp = *n;
            *n = n.saturating_add(1);
            exp
        };
        let backoff = self.base.as_secs_f64() * 2f64.powi(exp.min(1023) as i32);
        if !backoff.is_finite() || backoff > self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(backoff)
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> usize {
        self.failures.lock().get(item).copied().unwrap_or(0) as usize
    }
}

/// `fast` for the first `max_fast_attempts` retries, `slow` afterwards.
pub struct FastSlowRateLimiter<T> {
    fast: Duration,
    slow: Duration,
    max_fast_attempts: u32,
    attempts: Mutex<FxHashMap<T, u32>>,
}

impl<T: Eq + Hash> FastSlowRateLimiter<T> {
    pub fn new(fast: Duration, slow: Duration, max_fast_attempts: u32) -> Self {
        Self { fast, slow, max_fast_attempts, attempts: Mutex::new(FxHashMap::default()) }
    }
}

impl<T: Clone + Eq + Hash + Send> RateLimiter<T> for FastSlowRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut attempts = self.attempts.lock();
        let n = attempts.entry(item.clone()).or_insert(0);
        *n = n.saturating_add(1);
        if *n <= self.max_fast_attempts {
            self.fast
        } else {
            self.slow
        }
    }

    fn forget(&self, item: &T) {
        self.attempts.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> usize {
        self.attempts.lock().get(item).copied().unwrap_or(0) as usize
    }
}

/// Overall token bucket shared by every item: `qps` refill, `burst` capacity.
/// Each call reserves a token; the returned delay is how long until that token exists.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<(f64, Instant)>,
}

impl BucketRateLimiter {
    /// A non-positive `qps` disables limiting.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps, burst, bucket: Mutex::new((burst, Instant::now())) }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        if self.qps <= 0.0 {
            return Duration::ZERO;
        }
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let (tokens, last) = *bucket;
        let refilled = (tokens + now.duration_since(last).as_secs_f64() * self.qps).min(self.burst);
        let left = refilled - 1.0;
        *bucket = (left, now);
        if left >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-left / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> usize {
        0
    }
}

/// Worst case of several limiters.
///
/// An item's delay never shrinks between retries: a shared limiter can push one delay
/// above the item's own backoff, and the next delay starts from there. `forget` resets it.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
    last: Mutex<FxHashMap<T, Duration>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters, last: Mutex::new(FxHashMap::default()) }
    }
}

impl<T: Clone + Eq + Hash + Send> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let computed = self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO);
        let mut last = self.last.lock();
        let delay = last.get(item).map_or(computed, |prev| computed.max(*prev));
        last.insert(item.clone(), delay);
        delay
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters {
            l.forget(item);
        }
        self.last.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> usize {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Retry backoff configuration: per-item exponential backoff combined with an overall
/// token bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// First retry delay (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single item's delay (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Overall retry rate across all items; `0` disables the bucket
    #[serde(default = "default_qps")]
    pub qps: f64,

    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl BackoffPolicy {
    pub fn build<T>(&self) -> MaxOfRateLimiter<T>
    where
        T: Clone + Eq + Hash + Send + 'static,
    {
        MaxOfRateLimiter::new(vec![
            Box::new(ExponentialFailureRateLimiter::new(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

/// 5ms..1000s exponential per item, 10 qps / 100 burst overall.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    BackoffPolicy::default().build()
}

fn default_base_delay_ms() -> u64 {
    5
}
fn default_max_delay_ms() -> u64 {
    1_000_000
}
fn default_qps() -> f64 {
    10.0
}
fn default_burst() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let l = ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_millis(30));
        assert_eq!(l.when(&"a"), Duration::from_millis(5));
        assert_eq!(l.when(&"a"), Duration::from_millis(10));
        assert_eq!(l.when(&"a"), Duration::from_millis(20));
        assert_eq!(l.when(&"a"), Duration::from_millis(30));
        assert_eq!(l.when(&"a"), Duration::from_millis(30));
        assert_eq!(l.num_requeues(&"a"), 5);
        // other items are independent
        assert_eq!(l.when(&"b"), Duration::from_millis(5));
        l.forget(&"a");
        assert_eq!(l.num_requeues(&"a"), 0);
        assert_eq!(l.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn exponential_is_non_decreasing_for_many_failures() {
        let l = ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1000));
        let mut prev = Duration::ZERO;
        for _ in 0..2000 {
            let d = l.when(&1u8);
            assert!(d >= prev);
            prev = d;
        }
        assert_eq!(prev, Duration::from_secs(1000));
    }

    #[test]
    fn fast_slow_switches_after_threshold() {
        let l = FastSlowRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1), 2);
        assert_eq!(l.when(&"x"), Duration::from_millis(1));
        assert_eq!(l.when(&"x"), Duration::from_millis(1));
        assert_eq!(l.when(&"x"), Duration::from_secs(1));
        assert_eq!(l.num_requeues(&"x"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_out() {
        let l = BucketRateLimiter::new(10.0, 2);
        assert_eq!(RateLimiter::<u8>::when(&l, &0), Duration::ZERO);
        assert_eq!(RateLimiter::<u8>::when(&l, &0), Duration::ZERO);
        let d = RateLimiter::<u8>::when(&l, &0);
        assert!(d > Duration::from_millis(90) && d <= Duration::from_millis(100), "{:?}", d);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<u8>::when(&l, &0), Duration::ZERO);
    }

    #[test]
    fn max_of_takes_worst_case() {
        let l: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1))),
            Box::new(FastSlowRateLimiter::new(Duration::from_millis(3), Duration::from_millis(50), 1)),
        ]);
        assert_eq!(l.when(&"k"), Duration::from_millis(3));
        assert_eq!(l.when(&"k"), Duration::from_millis(50));
        assert_eq!(l.num_requeues(&"k"), 2);
        l.forget(&"k");
        assert_eq!(l.num_requeues(&"k"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn item_backoff_never_shrinks_after_shared_bucket_drains() {
        let l = BackoffPolicy::default().build::<String>();
        let a = "ns/a".to_string();
        assert_eq!(l.when(&a), Duration::from_millis(5));
        // a failure storm on other keys empties the shared bucket
        for i in 0..150 {
            l.when(&format!("ns/other-{}", i));
        }
        let throttled = l.when(&a);
        assert!(throttled > Duration::from_secs(1), "{:?}", throttled);
        tokio::time::advance(throttled).await;
        let next = l.when(&a);
        assert!(next >= throttled, "backoff decreased: {:?} -> {:?}", throttled, next);

        l.forget(&a);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(l.when(&a), Duration::from_millis(5));
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let p: BackoffPolicy = serde_json::from_str(r#"{"base_delay_ms": 50}"#).unwrap();
        assert_eq!(p.base_delay_ms, 50);
        assert_eq!(p.max_delay_ms, 1_000_000);
        assert_eq!(p.burst, 100);
    }
}
