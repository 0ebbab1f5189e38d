use std::sync::Arc;

use kubemux_core::{
    EventDescriptor, EventKind, Notification, NotificationSink, ResolvedResource, ResourceCache, WatchIndex,
    WatchedKey,
};
use kubemux_queue::RateLimitingQueue;
use parking_lot::RwLock;
use serde::Serialize;

use crate::ShadowMap;

/// A registered watch: its index, the resolved resource and the cache mirroring it.
pub struct Watch<K> {
    pub index: WatchIndex,
    pub name: String,
    pub resource: ResolvedResource,
    pub cache: Arc<dyn ResourceCache<K>>,
}

/// Returned by registration.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WatchHandle {
    pub index: WatchIndex,
    pub name: String,
    pub resource: ResolvedResource,
}

/// Append-only table of watches. Indexes are positions, so they are sequential and stable.
pub struct WatchRegistry<K> {
    watches: RwLock<Vec<Arc<Watch<K>>>>,
}

impl<K> Default for WatchRegistry<K> {
    fn default() -> Self {
        Self { watches: RwLock::new(Vec::new()) }
    }
}

impl<K> WatchRegistry<K> {
    /// Allocate the next index and store the watch `build` makes for it.
    pub fn register(&self, build: impl FnOnce(WatchIndex) -> Watch<K>) -> Arc<Watch<K>> {
        let mut watches = self.watches.write();
        let watch = Arc::new(build(WatchIndex(watches.len())));
        watches.push(Arc::clone(&watch));
        watch
    }

    pub fn get(&self, index: WatchIndex) -> Option<Arc<Watch<K>>> {
        self.watches.read().get(index.0).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Watch<K>>> {
        self.watches.read().clone()
    }

    pub fn len(&self) -> usize {
        self.watches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Attached to a watch's cache; turns notifications into queue items.
pub(crate) struct WatchSink<K> {
    pub(crate) index: WatchIndex,
    pub(crate) queue: RateLimitingQueue<EventDescriptor>,
    pub(crate) shadows: Arc<ShadowMap<K>>,
}

impl<K: Send + Sync> NotificationSink<K> for WatchSink<K> {
    fn notify(&self, n: Notification<K>) {
        match n {
            Notification::Add(key, _) => self.queue.add(EventDescriptor::new(self.index, key, EventKind::Add)),
            Notification::Update(key, _) => self.queue.add(EventDescriptor::new(self.index, key, EventKind::Update)),
            Notification::Delete(key, obj) => {
                // capture before the descriptor becomes visible to a worker
                self.shadows.capture(WatchedKey { watch: self.index, key: key.clone() }, obj);
                self.queue.add(EventDescriptor::new(self.index, key, EventKind::Delete));
            }
        }
    }
}
