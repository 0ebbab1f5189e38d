use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use kubemux_core::{DispatchError, EventDescriptor, EventKind, WatchedKey};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::Shared;

enum Outcome {
    Handled,
    /// Nothing left to deliver for this item.
    Stale(DispatchError),
    Failed(anyhow::Error),
}

impl<K: Send + Sync + 'static> Shared<K> {
    /// Drain loop of one consumer. Re-enters at most once per poll interval until `ctx` fires.
    pub(crate) async fn worker(self: Arc<Self>, id: usize, ctx: CancellationToken) {
        debug!(worker = id, "worker started");
        loop {
            while self.process_next_item(&ctx).await {}
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        debug!(worker = id, "worker stopped");
    }

    /// Take one item off the queue and see it through. Returns false once the queue is closed.
    pub(crate) async fn process_next_item(&self, ctx: &CancellationToken) -> bool {
        let Some(item) = self.queue.get().await else {
            return false;
        };
        let retries = self.queue.num_requeues(&item);
        let watched = item.watched_key();
        // the capture this pass delivers, if any; only that generation gets purged
        let captured = match item.kind {
            EventKind::Delete => self.shadows.get(&watched),
            _ => None,
        };
        let generation = captured.as_ref().map(|(g, _)| *g);

        let outcome = self.dispatch(ctx, &item, captured.map(|(_, o)| o), retries).await;
        self.settle(&item, &watched, generation, retries, outcome);
        self.queue.done(&item);
        true
    }

    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        item: &EventDescriptor,
        shadow: Option<Arc<K>>,
        retries: usize,
    ) -> Outcome {
        let Some(watch) = self.registry.get(item.watch) else {
            error!(item = %item, "event for unknown watch index");
            return Outcome::Stale(DispatchError::Stale(item.watched_key()));
        };
        let live = match watch.cache.get_by_key(&item.key) {
            Ok(v) => v,
            Err(e) => return Outcome::Failed(anyhow!(e).context(format!("looking up {} in {}", item.key, watch.name))),
        };
        // level-triggered: whatever the item says, deliver the state the mirror holds now
        let (kind, obj) = match (live, item.kind, shadow) {
            (Some(obj), kind, _) => (kind, obj),
            (None, EventKind::Delete, Some(obj)) => (EventKind::Delete, obj),
            (None, EventKind::Delete, None) => {
                warn!(item = %item, watch = %watch.name, "no last known state found; dropping delete");
                return Outcome::Stale(DispatchError::Stale(item.watched_key()));
            }
            // object gone before processing; its pending delete carries the state
            (None, _, _) => return Outcome::Stale(DispatchError::Stale(item.watched_key())),
        };

        let started = Instant::now();
        let call = self.handler.handle(ctx, kind, obj, retries);
        let res = match self.config.handler_timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => Err(anyhow!("handler timed out after {:?}", limit)),
            },
            None => call.await,
        };
        histogram!("kubemux_handler_ms", started.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(()) => Outcome::Handled,
            Err(e) => Outcome::Failed(e),
        }
    }

    fn settle(
        &self,
        item: &EventDescriptor,
        watched: &WatchedKey,
        generation: Option<u64>,
        retries: usize,
        outcome: Outcome,
    ) {
        match outcome {
            Outcome::Handled => {}
            Outcome::Stale(e) => {
                debug!(item = %item, error = %e, "dropping stale event");
                counter!("kubemux_stale_events", 1);
            }
            Outcome::Failed(e) if self.config.should_retry(retries) => {
                warn!(item = %item, retries, max_retries = self.config.max_retries, error = ?e, "handler failed; retrying");
                counter!("kubemux_handler_retries", 1);
                // keeps the shadow and the item's backoff
                self.queue.add_rate_limited(item.clone());
                return;
            }
            Outcome::Failed(e) => {
                error!(item = %item, retries, max_retries = self.config.max_retries, error = ?e, "handler failed; giving up");
                counter!("kubemux_handler_failures", 1);
            }
        }
        self.queue.forget(item);
        if let Some(g) = generation {
            self.shadows.purge(watched, g);
        }
    }
}
