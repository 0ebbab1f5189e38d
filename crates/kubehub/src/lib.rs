//! kubemux kubehub – discovery-backed type resolution and list+watch caches

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::{
        reflector::store::Writer,
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use kubemux_core::{
    CacheError, CacheFactory, Notification, NotificationSink, ObjectKey, ResolveError, ResolvedResource,
    ResourceCache, ResourceResolver,
};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod mirror;
mod relist;

pub use relist::relist_notifications;

use mirror::Mirror;

/// Split an apiVersion into `(group, version)`. Core kinds have an empty group.
pub fn parse_api_version(api_version: &str) -> Result<(String, String), ResolveError> {
    let parts: Vec<_> = api_version.split('/').collect();
    match parts.as_slice() {
        [version] if !version.is_empty() => Ok((String::new(), version.to_string())),
        [group, version] if !group.is_empty() && !version.is_empty() => Ok((group.to_string(), version.to_string())),
        _ => Err(ResolveError::InvalidApiVersion(api_version.to_string())),
    }
}

/// `namespace/name` key of an object, `None` when the object carries no name.
pub fn object_key(obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.as_deref()?;
    Some(ObjectKey::from_parts(obj.metadata.namespace.as_deref(), name))
}

fn strip_managed_fields(obj: &mut DynamicObject) {
    if cfg!(feature = "strip-managed-fields") {
        obj.metadata.managed_fields = None;
    }
}

/// Resolves apiVersion/kind through API discovery.
#[derive(Clone)]
pub struct KubeResolver {
    client: Client,
}

impl KubeResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ResourceResolver for KubeResolver {
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<ResolvedResource, ResolveError> {
        let (group, version) = parse_api_version(api_version)?;
        let gvk = GroupVersionKind::gvk(&group, &version, kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk).await.map_err(|e| match e {
            kube::Error::Discovery(_) => {
                ResolveError::NotFound { api_version: api_version.to_string(), kind: kind.to_string() }
            }
            other => ResolveError::Discovery(anyhow!(other)),
        })?;
        let resolved = ResolvedResource {
            group: ar.group,
            version: ar.version,
            kind: ar.kind,
            plural: ar.plural,
            namespaced: matches!(caps.scope, Scope::Namespaced),
        };
        debug!(plural = %resolved.plural, namespaced = resolved.namespaced, "resolved {}/{}", api_version, kind);
        Ok(resolved)
    }
}

/// Builds [`KubeResourceCache`]s sharing one client.
#[derive(Clone)]
pub struct KubeCacheFactory {
    client: Client,
}

impl KubeCacheFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl CacheFactory<DynamicObject> for KubeCacheFactory {
    fn construct(
        &self,
        resource: &ResolvedResource,
        namespace: Option<&str>,
        selector: Option<&str>,
        resync: Option<Duration>,
    ) -> Arc<dyn ResourceCache<DynamicObject>> {
        Arc::new(KubeResourceCache::new(self.client.clone(), resource, namespace, selector, resync))
    }
}

fn api_resource(r: &ResolvedResource) -> ApiResource {
    ApiResource {
        group: r.group.clone(),
        version: r.version.clone(),
        api_version: r.api_version(),
        kind: r.kind.clone(),
        plural: r.plural.clone(),
    }
}

/// List+watch mirror of one collection, kept in a reflector store.
pub struct KubeResourceCache {
    api: Api<DynamicObject>,
    config: watcher::Config,
    resync: Option<Duration>,
    mirror: Mirror,
    writer: Mutex<Option<Writer<DynamicObject>>>,
    synced: AtomicBool,
    sinks: RwLock<Vec<Arc<dyn NotificationSink<DynamicObject>>>>,
}

impl KubeResourceCache {
    pub fn new(
        client: Client,
        resource: &ResolvedResource,
        namespace: Option<&str>,
        selector: Option<&str>,
        resync: Option<Duration>,
    ) -> Self {
        let ar = api_resource(resource);
        let api: Api<DynamicObject> = match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) if resource.namespaced => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        let mut config = watcher::Config::default();
        if let Some(sel) = selector.filter(|s| !s.is_empty()) {
            config = config.labels(sel);
        }
        let writer = Writer::new(ar.clone());
        let name = format!(
            "{}/{} {}",
            namespace.filter(|_| resource.namespaced).unwrap_or("*"),
            resource.plural,
            selector.unwrap_or("")
        );
        Self {
            api,
            config,
            resync: resync.filter(|d| !d.is_zero()),
            mirror: Mirror::new(name.trim_end().to_string(), ar, writer.as_reader()),
            writer: Mutex::new(Some(writer)),
            synced: AtomicBool::new(false),
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.mirror.name()
    }

    fn emit(&self, notifications: Vec<Notification<DynamicObject>>) {
        let sinks = self.sinks.read();
        for n in notifications {
            counter!("kubemux_watch_notifications", 1, "kind" => n.kind().as_str());
            for sink in sinks.iter() {
                sink.notify(n.clone());
            }
        }
    }

    fn apply(&self, writer: &mut Writer<DynamicObject>, event: Event<DynamicObject>) {
        let relisted = match &event {
            Event::Restarted(list) => Some(list.len()),
            _ => None,
        };
        self.emit(self.mirror.apply(writer, event));
        if let Some(objects) = relisted {
            if !self.synced.swap(true, Ordering::AcqRel) {
                info!(watch = %self.name(), objects, "initial list synced");
            }
        }
    }
}

#[async_trait::async_trait]
impl ResourceCache<DynamicObject> for KubeResourceCache {
    async fn run(&self, stop: CancellationToken) -> Result<(), CacheError> {
        let mut writer = self.writer.lock().take().ok_or(CacheError::AlreadyRunning)?;
        let stream = watcher::watcher(self.api.clone(), self.config.clone()).default_backoff();
        futures::pin_mut!(stream);
        let mut resync = self
            .resync
            .map(|every| tokio::time::interval_at(tokio::time::Instant::now() + every, every));
        info!(watch = %self.name(), "watcher started");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                ev = stream.next() => match ev {
                    Some(Ok(ev)) => self.apply(&mut writer, ev),
                    Some(Err(e)) => warn!(watch = %self.name(), error = %e, "watch error; backing off"),
                    None => {
                        warn!(watch = %self.name(), "watcher stream ended");
                        return Err(CacheError::Watch(anyhow!("watch stream for {} ended", self.name())));
                    }
                },
                _ = async {
                    match resync.as_mut() {
                        Some(t) => { t.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if self.has_synced() {
                        self.emit(self.mirror.resync());
                    }
                }
            }
        }
        info!(watch = %self.name(), "watcher stopped");
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<DynamicObject>>, CacheError> {
        if key.as_str().is_empty() {
            return Err(CacheError::InvalidKey(String::new()));
        }
        Ok(self.mirror.get(key))
    }

    fn add_event_handler(&self, sink: Arc<dyn NotificationSink<DynamicObject>>) {
        self.sinks.write().push(sink);
    }
}
