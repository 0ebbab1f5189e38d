use std::collections::HashMap;
use std::sync::Arc;

use kubemux_core::{Notification, ObjectKey};

/// Notifications for a full relist: Add/Update for every listed object (in list order),
/// then Delete with the last mirrored state for every previously mirrored object that the
/// relist no longer contains.
pub fn relist_notifications<K>(
    prior: Vec<(ObjectKey, Arc<K>)>,
    next: Vec<(ObjectKey, Arc<K>)>,
) -> Vec<Notification<K>> {
    let mut prior: HashMap<ObjectKey, Arc<K>> = prior.into_iter().collect();
    let mut out = Vec::with_capacity(next.len() + prior.len());
    for (key, obj) in next {
        if prior.remove(&key).is_some() {
            out.push(Notification::Update(key, obj));
        } else {
            out.push(Notification::Add(key, obj));
        }
    }
    let mut gone: Vec<_> = prior.into_iter().collect();
    gone.sort_by(|a, b| a.0.cmp(&b.0));
    out.extend(gone.into_iter().map(|(key, obj)| Notification::Delete(key, obj)));
    out
}
