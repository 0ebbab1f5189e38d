//! kubemux dispatcher: fans many watches into one deduplicating, retrying queue
//! and a single caller-supplied handler.
//!
//! Every cache notification becomes an [`EventDescriptor`] `(watch, key, kind)`. The queue
//! collapses equal descriptors, so a burst of updates to one object is processed once, and
//! processing always reads the object's current state from the cache instead of the state
//! that triggered the event. Deletions are delivered from a shadow copy captured when the
//! cache reported them, since by then the cache no longer holds the object.
//!
//! Delivery is at-least-once. Ordering holds only per descriptor.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kubemux_core::{
    CacheError, CacheFactory, DispatchError, EventDescriptor, Handler, ResourceResolver, WatchIndex, WatchSpec,
    WatchedKey,
};
use kubemux_queue::RateLimitingQueue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod registry;
mod shadow;
mod worker;

pub use config::DispatcherConfig;
pub use registry::{Watch, WatchHandle, WatchRegistry};
pub use shadow::ShadowMap;

use registry::WatchSink;

const SYNC_POLL: Duration = Duration::from_millis(100);

/// Cache tasks, each yielding the index of its watch.
type CacheTasks = JoinSet<(WatchIndex, Result<(), CacheError>)>;

pub struct Dispatcher<K> {
    shared: Arc<Shared<K>>,
    resolver: Arc<dyn ResourceResolver>,
    factory: Arc<dyn CacheFactory<K>>,
    running: AtomicBool,
}

/// State the workers share with the dispatcher.
pub(crate) struct Shared<K> {
    config: DispatcherConfig,
    handler: Arc<dyn Handler<K>>,
    queue: RateLimitingQueue<EventDescriptor>,
    shadows: Arc<ShadowMap<K>>,
    registry: WatchRegistry<K>,
}

impl<K: Send + Sync + 'static> Dispatcher<K> {
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: DispatcherConfig,
        resolver: Arc<dyn ResourceResolver>,
        factory: Arc<dyn CacheFactory<K>>,
        handler: Arc<dyn Handler<K>>,
    ) -> Self {
        let queue = RateLimitingQueue::new(config.backoff.build());
        Self {
            shared: Arc::new(Shared {
                config,
                handler,
                queue,
                shadows: Arc::new(ShadowMap::new()),
                registry: WatchRegistry::default(),
            }),
            resolver,
            factory,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Resolve `spec`, build its cache and wire the cache into the queue.
    ///
    /// Fails with a configuration error when the type cannot be resolved or `run` has
    /// already started.
    pub async fn register(&self, spec: WatchSpec) -> Result<WatchHandle, DispatchError> {
        if self.running.load(Ordering::Acquire) {
            return Err(DispatchError::Configuration("cannot register watches after run started".into()));
        }
        let resource = self.resolver.resolve(&spec.api_version, &spec.kind).await.map_err(|source| {
            DispatchError::UnresolvedResource { api_version: spec.api_version.clone(), kind: spec.kind.clone(), source }
        })?;
        let namespace = spec.namespace.as_deref().filter(|ns| resource.namespaced && !ns.is_empty());
        let selector = spec.selector.as_deref().filter(|s| !s.is_empty());
        let cache = self.factory.construct(&resource, namespace, selector, spec.resync);
        let name = format!("{}/{} {}", namespace.unwrap_or("*"), resource.plural, selector.unwrap_or(""))
            .trim_end()
            .to_string();

        let shared = &self.shared;
        let watch = shared.registry.register(|index| {
            cache.add_event_handler(Arc::new(WatchSink {
                index,
                queue: shared.queue.clone(),
                shadows: Arc::clone(&shared.shadows),
            }));
            Watch { index, name, resource, cache }
        });
        info!(watch = %watch.name, index = %watch.index, "watch registered");
        Ok(WatchHandle { index: watch.index, name: watch.name.clone(), resource: watch.resource.clone() })
    }

    pub fn watches(&self) -> Vec<WatchHandle> {
        self.shared
            .registry
            .snapshot()
            .iter()
            .map(|w| WatchHandle { index: w.index, name: w.name.clone(), resource: w.resource.clone() })
            .collect()
    }

    /// Items waiting in the queue (excluding in-flight and delayed ones).
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Whether a deleted object's last state is still held for `key`.
    pub fn has_shadow(&self, key: &WatchedKey) -> bool {
        self.shared.shadows.contains(key)
    }

    pub fn shadow_count(&self) -> usize {
        self.shared.shadows.len()
    }

    /// Start every watch, wait until all of them have synced, then process events until
    /// `ctx` is cancelled.
    ///
    /// A sync timeout, a cache failing before it synced, or cancellation during the
    /// barrier stops everything and returns the error; nothing is dispatched in that case.
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), DispatchError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(DispatchError::AlreadyRunning);
        }
        let watches = self.shared.registry.snapshot();
        let stop = ctx.child_token();
        let mut caches = CacheTasks::new();
        for w in &watches {
            info!(watch = %w.name, index = %w.index, "watching");
            let cache = Arc::clone(&w.cache);
            let index = w.index;
            let stop = stop.clone();
            caches.spawn(async move { (index, cache.run(stop).await) });
        }

        if let Err(e) = self.wait_for_sync(&ctx, &watches, &mut caches).await {
            error!(error = %e, "caches failed to sync; aborting");
            stop.cancel();
            self.shared.queue.shutdown();
            caches.shutdown().await;
            return Err(e);
        }
        info!(watches = watches.len(), "all caches synced");

        let mut workers = JoinSet::new();
        for id in 0..self.shared.config.workers.max(1) {
            workers.spawn(Arc::clone(&self.shared).worker(id, ctx.clone()));
        }

        tokio::select! {
            _ = ctx.cancelled() => {}
            Some((index, res)) = join_cache(&mut caches) => {
                // a cache that stops on its own leaves its watch frozen; keep serving the rest
                let name = watch_name(&watches, index);
                match res {
                    Ok(()) => warn!(watch = %name, "watch stopped"),
                    Err(e) => error!(watch = %name, error = %e, "watch failed"),
                }
                ctx.cancelled().await;
            }
        }

        stop.cancel();
        self.shared.queue.shutdown();
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker panicked");
            }
        }
        while let Some((index, res)) = join_cache(&mut caches).await {
            if let Err(e) = res {
                warn!(watch = %watch_name(&watches, index), error = %e, "watch ended with error");
            }
        }
        info!("stopped all watches");
        Ok(())
    }

    async fn wait_for_sync(
        &self,
        ctx: &CancellationToken,
        watches: &[Arc<Watch<K>>],
        caches: &mut CacheTasks,
    ) -> Result<(), DispatchError> {
        let timeout = self.shared.config.sync_timeout();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut poll = tokio::time::interval(SYNC_POLL);
        loop {
            let pending: Vec<String> =
                watches.iter().filter(|w| !w.cache.has_synced()).map(|w| w.name.clone()).collect();
            if pending.is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(DispatchError::Cancelled),
                _ = sleep_until(deadline) => {
                    return Err(DispatchError::SyncTimeout { after: timeout.unwrap_or_default(), pending });
                }
                Some((index, res)) = join_cache(caches) => {
                    let synced = index.and_then(|i| watches.get(i.0)).is_some_and(|w| w.cache.has_synced());
                    if !synced {
                        let source = res.err().unwrap_or_else(|| {
                            CacheError::Watch(anyhow::anyhow!("stopped before initial sync"))
                        });
                        return Err(DispatchError::CacheFailed { watch: watch_name(watches, index), source });
                    }
                    // synced already; its watch stays frozen but the barrier goes on
                    match res {
                        Ok(()) => warn!(watch = %watch_name(watches, index), "watch stopped during sync barrier"),
                        Err(e) => warn!(watch = %watch_name(watches, index), error = %e, "watch failed during sync barrier"),
                    }
                }
                _ = poll.tick() => {}
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Next finished cache task; a panicked task is reported as a watch error without an index.
async fn join_cache(caches: &mut CacheTasks) -> Option<(Option<WatchIndex>, Result<(), CacheError>)> {
    let res = caches.join_next().await?;
    Some(match res {
        Ok((index, r)) => (Some(index), r),
        Err(e) => (None, Err(CacheError::Watch(anyhow::anyhow!(e)))),
    })
}

fn watch_name<K>(watches: &[Arc<Watch<K>>], index: Option<WatchIndex>) -> String {
    index
        .and_then(|i| watches.get(i.0))
        .map(|w| w.name.clone())
        .unwrap_or_else(|| "<panicked>".to_string())
}
