#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubemux_core::{
    CacheError, CacheFactory, EventKind, Handler, Notification, NotificationSink, ObjectKey, ResolveError,
    ResolvedResource, ResourceCache, ResourceResolver,
};
use kubemux_dispatch::{Dispatcher, DispatcherConfig};
use kubemux_queue::BackoffPolicy;
use tokio_util::sync::CancellationToken;

/// How a fake cache behaves once started.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Syncs,
    Never,
    Fails,
    /// Reports synced, then its watch fails.
    SyncsThenFails,
}

/// In-memory mirror; mutations emit notifications like an informer would.
pub struct MemoryCache {
    mode: SyncMode,
    objects: Mutex<HashMap<ObjectKey, Arc<String>>>,
    sinks: Mutex<Vec<Arc<dyn NotificationSink<String>>>>,
    synced: AtomicBool,
}

impl MemoryCache {
    pub fn new(mode: SyncMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            objects: Mutex::new(HashMap::new()),
            sinks: Mutex::new(Vec::new()),
            synced: AtomicBool::new(false),
        })
    }

    fn emit(&self, n: Notification<String>) {
        for s in self.sinks.lock().unwrap().iter() {
            s.notify(n.clone());
        }
    }

    pub fn upsert(&self, key: &str, state: &str) {
        let key = ObjectKey::from(key);
        let obj = Arc::new(state.to_string());
        let existed = self.objects.lock().unwrap().insert(key.clone(), obj.clone()).is_some();
        self.emit(if existed { Notification::Update(key, obj) } else { Notification::Add(key, obj) });
    }

    pub fn delete(&self, key: &str) {
        let key = ObjectKey::from(key);
        let last = self.objects.lock().unwrap().remove(&key);
        if let Some(obj) = last {
            self.emit(Notification::Delete(key, obj));
        }
    }
}

#[async_trait::async_trait]
impl ResourceCache<String> for MemoryCache {
    async fn run(&self, stop: CancellationToken) -> Result<(), CacheError> {
        match self.mode {
            SyncMode::Syncs => self.synced.store(true, Ordering::Release),
            SyncMode::Never => {}
            SyncMode::Fails => return Err(CacheError::Watch(anyhow::anyhow!("list forbidden"))),
            SyncMode::SyncsThenFails => {
                self.synced.store(true, Ordering::Release);
                return Err(CacheError::Watch(anyhow::anyhow!("watch expired")));
            }
        }
        stop.cancelled().await;
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<String>>, CacheError> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    fn add_event_handler(&self, sink: Arc<dyn NotificationSink<String>>) {
        self.sinks.lock().unwrap().push(sink);
    }
}

/// Serves a fixed set of kinds; `Node` is cluster-scoped.
pub struct FakeResolver;

#[async_trait::async_trait]
impl ResourceResolver for FakeResolver {
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<ResolvedResource, ResolveError> {
        let (plural, namespaced) = match kind {
            "ConfigMap" => ("configmaps", true),
            "Secret" => ("secrets", true),
            "Node" => ("nodes", false),
            _ => {
                return Err(ResolveError::NotFound { api_version: api_version.to_string(), kind: kind.to_string() })
            }
        };
        Ok(ResolvedResource {
            group: String::new(),
            version: api_version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constructed {
    pub plural: String,
    pub namespace: Option<String>,
    pub selector: Option<String>,
    pub resync: Option<Duration>,
}

/// Hands out pre-built caches by kind and records construction arguments.
#[derive(Default)]
pub struct FakeFactory {
    caches: Mutex<HashMap<String, Arc<MemoryCache>>>,
    pub constructed: Mutex<Vec<Constructed>>,
}

impl FakeFactory {
    pub fn with(mut self, kind: &str, cache: Arc<MemoryCache>) -> Self {
        self.caches.get_mut().unwrap().insert(kind.to_string(), cache);
        self
    }
}

impl CacheFactory<String> for FakeFactory {
    fn construct(
        &self,
        resource: &ResolvedResource,
        namespace: Option<&str>,
        selector: Option<&str>,
        resync: Option<Duration>,
    ) -> Arc<dyn ResourceCache<String>> {
        self.constructed.lock().unwrap().push(Constructed {
            plural: resource.plural.clone(),
            namespace: namespace.map(str::to_string),
            selector: selector.map(str::to_string),
            resync,
        });
        let cache = self
            .caches
            .lock()
            .unwrap()
            .entry(resource.kind.clone())
            .or_insert_with(|| MemoryCache::new(SyncMode::Syncs))
            .clone();
        cache
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: EventKind,
    pub state: String,
    pub retries: usize,
}

type FailWhen = Box<dyn Fn(&Call, usize) -> bool + Send + Sync>;

/// Handler recording every call. `fail` gets the call and how many calls with the same
/// state came before it.
pub struct Recorder {
    pub calls: Mutex<Vec<Call>>,
    fail: FailWhen,
    delay: Option<Duration>,
}

impl Recorder {
    pub fn ok() -> Arc<Self> {
        Self::failing(|_, _| false)
    }

    pub fn failing(fail: impl Fn(&Call, usize) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()), fail: Box::new(fail), delay: None })
    }

    /// First attempt of every item sleeps for `delay`.
    pub fn slow_first(delay: Duration) -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()), fail: Box::new(|_, _| false), delay: Some(delay) })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Handler<String> for Recorder {
    async fn handle(&self, _ctx: &CancellationToken, event: EventKind, obj: Arc<String>, retries: usize) -> anyhow::Result<()> {
        let call = Call { kind: event, state: obj.as_str().to_string(), retries };
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            let seen = calls.iter().filter(|c| c.state == call.state).count();
            calls.push(call.clone());
            seen
        };
        if let Some(d) = self.delay {
            if retries == 0 {
                tokio::time::sleep(d).await;
            }
        }
        if (self.fail)(&call, seen) {
            anyhow::bail!("handler rejected {}", call.state);
        }
        Ok(())
    }
}

pub fn config(max_retries: i64) -> DispatcherConfig {
    DispatcherConfig {
        max_retries,
        backoff: BackoffPolicy { base_delay_ms: 1, max_delay_ms: 4, qps: 0.0, burst: 1 },
        workers: 1,
        poll_interval_ms: 10,
        sync_timeout_ms: Some(2_000),
        handler_timeout_ms: None,
    }
}

pub fn dispatcher(config: DispatcherConfig, factory: Arc<FakeFactory>, handler: Arc<Recorder>) -> Arc<Dispatcher<String>> {
    Arc::new(Dispatcher::new(config, Arc::new(FakeResolver), factory, handler))
}

/// Runs the dispatcher in the background until stopped.
pub struct Running {
    pub ctx: CancellationToken,
    pub task: tokio::task::JoinHandle<Result<(), kubemux_core::DispatchError>>,
}

pub fn start(d: &Arc<Dispatcher<String>>) -> Running {
    let ctx = CancellationToken::new();
    let task = tokio::spawn({
        let d = Arc::clone(d);
        let ctx = ctx.clone();
        async move { d.run(ctx).await }
    });
    Running { ctx, task }
}

impl Running {
    pub async fn stop(self) -> Result<(), kubemux_core::DispatchError> {
        self.ctx.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("dispatcher did not stop")
            .expect("dispatcher task panicked")
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
