use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{CacheError, ObjectKey, ResolveError};

/// Change notification emitted by a resource cache. The key is extracted once, at the cache
/// boundary; a Delete carries the last state the mirror held for the object.
#[derive(Debug, Clone)]
pub enum Notification<K> {
    Add(ObjectKey, Arc<K>),
    Update(ObjectKey, Arc<K>),
    Delete(ObjectKey, Arc<K>),
}

impl<K> Notification<K> {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Notification::Add(k, _) | Notification::Update(k, _) | Notification::Delete(k, _) => k,
        }
    }

    pub fn kind(&self) -> crate::EventKind {
        match self {
            Notification::Add(..) => crate::EventKind::Add,
            Notification::Update(..) => crate::EventKind::Update,
            Notification::Delete(..) => crate::EventKind::Delete,
        }
    }
}

/// Receiver of cache notifications. Called from the cache's own task; must not block.
pub trait NotificationSink<K>: Send + Sync {
    fn notify(&self, n: Notification<K>);
}

/// Local key-indexed mirror of one remote collection.
#[async_trait::async_trait]
pub trait ResourceCache<K>: Send + Sync {
    /// Run list+watch until `stop` fires. Returns early only on unrecoverable failure.
    async fn run(&self, stop: CancellationToken) -> Result<(), CacheError>;

    /// True once the initial list has been mirrored.
    fn has_synced(&self) -> bool;

    /// Current state for `key`, if mirrored.
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, CacheError>;

    /// Attach a sink. Must be called before `run`.
    fn add_event_handler(&self, sink: Arc<dyn NotificationSink<K>>);
}

/// Result of resolving an apiVersion/kind against the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name, e.g. `deployments`
    pub plural: String,
    pub namespaced: bool,
}

impl ResolvedResource {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

#[async_trait::async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<ResolvedResource, ResolveError>;
}

/// Builds a cache for a resolved resource. `namespace` is already cleared for cluster-scoped kinds.
pub trait CacheFactory<K>: Send + Sync {
    fn construct(
        &self,
        resource: &ResolvedResource,
        namespace: Option<&str>,
        selector: Option<&str>,
        resync: Option<Duration>,
    ) -> Arc<dyn ResourceCache<K>>;
}
