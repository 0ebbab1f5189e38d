use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::EventKind;

/// The single side-effecting boundary the dispatcher calls into.
///
/// `retries` is the number of failed attempts for this queue item since it was last
/// forgotten (0 on the first try). Errors are retried per the dispatcher's policy.
#[async_trait::async_trait]
pub trait Handler<K>: Send + Sync {
    async fn handle(&self, ctx: &CancellationToken, event: EventKind, obj: Arc<K>, retries: usize) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<K, F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(CancellationToken, EventKind, Arc<K>, usize) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait::async_trait]
impl<K, F, Fut> Handler<K> for HandlerFn<F>
where
    K: Send + Sync + 'static,
    F: Fn(CancellationToken, EventKind, Arc<K>, usize) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &CancellationToken, event: EventKind, obj: Arc<K>, retries: usize) -> anyhow::Result<()> {
        (self.f)(ctx.clone(), event, obj, retries).await
    }
}
