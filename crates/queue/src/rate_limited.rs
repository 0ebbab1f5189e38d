use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::{DelayingQueue, RateLimiter};

/// Work queue with retry backoff: the queue the dispatcher drains.
pub struct RateLimitingQueue<T> {
    delaying: DelayingQueue<T>,
    limiter: Arc<dyn RateLimiter<T>>,
}

impl<T> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self { delaying: self.delaying.clone(), limiter: Arc::clone(&self.limiter) }
    }
}

impl<T> RateLimitingQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    /// Must be called inside a tokio runtime.
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self { delaying: DelayingQueue::new(), limiter: Arc::new(limiter) }
    }

    pub fn add(&self, item: T) {
        self.delaying.queue().add(item);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        self.delaying.add_after(item, delay);
    }

    /// Re-add `item` after the limiter's delay for it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        self.delaying.add_after(item, delay);
    }

    pub async fn get(&self) -> Option<T> {
        self.delaying.queue().get().await
    }

    pub fn done(&self, item: &T) {
        self.delaying.queue().done(item);
    }

    /// Clear backoff state for `item`; its requeue count starts over.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> usize {
        self.limiter.num_requeues(item)
    }

    pub fn shutdown(&self) {
        self.delaying.queue().shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.delaying.queue().is_shutting_down()
    }

    pub fn len(&self) -> usize {
        self.delaying.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.delaying.queue().is_empty()
    }
}
