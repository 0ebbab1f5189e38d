use std::sync::Arc;

use kube::{
    core::{ApiResource, DynamicObject},
    runtime::{
        reflector::{store::Writer, ObjectRef, Store},
        watcher::Event,
    },
};
use kubemux_core::{Notification, ObjectKey};
use tracing::{debug, warn};

use crate::{object_key, relist_notifications, strip_managed_fields};

/// Read side of one reflector store plus the watch-event diffing that turns store writes
/// into notifications.
pub(crate) struct Mirror {
    name: String,
    ar: ApiResource,
    reader: Store<DynamicObject>,
}

impl Mirror {
    pub(crate) fn new(name: String, ar: ApiResource, reader: Store<DynamicObject>) -> Self {
        Self { name, ar, reader }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        let (ns, name) = key.split();
        let r = ObjectRef::new_with(name, self.ar.clone());
        let r = match ns {
            Some(ns) => r.within(ns),
            None => r,
        };
        self.reader.get(&r)
    }

    fn keyed(&self, objs: impl IntoIterator<Item = Arc<DynamicObject>>) -> Vec<(ObjectKey, Arc<DynamicObject>)> {
        objs.into_iter()
            .filter_map(|o| match object_key(&o) {
                Some(k) => Some((k, o)),
                None => {
                    warn!(watch = %self.name, "skipping object without metadata.name");
                    None
                }
            })
            .collect()
    }

    /// Write `event` through `writer` and return what changed. `writer` must feed this
    /// mirror's store.
    pub(crate) fn apply(
        &self,
        writer: &mut Writer<DynamicObject>,
        mut event: Event<DynamicObject>,
    ) -> Vec<Notification<DynamicObject>> {
        match &mut event {
            Event::Applied(o) | Event::Deleted(o) => strip_managed_fields(o),
            Event::Restarted(list) => list.iter_mut().for_each(strip_managed_fields),
        }
        match &event {
            Event::Applied(o) => {
                let Some(key) = object_key(o) else {
                    warn!(watch = %self.name, "skipping object without metadata.name");
                    return Vec::new();
                };
                let known = self.get(&key).is_some();
                writer.apply_watcher_event(&event);
                let obj = self.get(&key).unwrap_or_else(|| Arc::new(o.clone()));
                vec![if known { Notification::Update(key, obj) } else { Notification::Add(key, obj) }]
            }
            Event::Deleted(o) => {
                let Some(key) = object_key(o) else {
                    warn!(watch = %self.name, "skipping deleted object without metadata.name");
                    return Vec::new();
                };
                writer.apply_watcher_event(&event);
                vec![Notification::Delete(key, Arc::new(o.clone()))]
            }
            Event::Restarted(list) => {
                let prior = self.keyed(self.reader.state());
                writer.apply_watcher_event(&event);
                let next = self.keyed(list.iter().map(|o| Arc::new(o.clone())));
                debug!(watch = %self.name, prior = prior.len(), next = next.len(), "relist");
                relist_notifications(prior, next)
            }
        }
    }

    /// An Update for every mirrored object.
    pub(crate) fn resync(&self) -> Vec<Notification<DynamicObject>> {
        let objs = self.keyed(self.reader.state());
        debug!(watch = %self.name, objects = objs.len(), "resync");
        objs.into_iter().map(|(key, obj)| Notification::Update(key, obj)).collect()
    }
}
