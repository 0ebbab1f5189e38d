use std::sync::Arc;

use kubemux_core::WatchedKey;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Last known state of objects whose Delete is still pending.
///
/// Every capture gets a new generation. Finalising a Delete purges only the generation it
/// observed, so a capture written by a later Delete notification (while the earlier attempt
/// was in flight) survives for the re-queued pass.
pub struct ShadowMap<K> {
    inner: Mutex<Inner<K>>,
}

struct Inner<K> {
    entries: FxHashMap<WatchedKey, (u64, Arc<K>)>,
    next_gen: u64,
}

impl<K> Default for ShadowMap<K> {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner { entries: FxHashMap::default(), next_gen: 0 }) }
    }
}

impl<K> ShadowMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the capture for `key`. Returns its generation.
    pub fn capture(&self, key: WatchedKey, obj: Arc<K>) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_gen += 1;
        let generation = inner.next_gen;
        inner.entries.insert(key, (generation, obj));
        generation
    }

    pub fn get(&self, key: &WatchedKey) -> Option<(u64, Arc<K>)> {
        self.inner.lock().entries.get(key).map(|(g, o)| (*g, Arc::clone(o)))
    }

    /// Remove the capture for `key` if it is still generation `generation`.
    pub fn purge(&self, key: &WatchedKey, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some((g, _)) if *g == generation => {
                inner.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &WatchedKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
