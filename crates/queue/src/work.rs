use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Deduplicating FIFO of work items.
///
/// An item is either queued, in flight (handed out by [`WorkQueue::get`] and not yet
/// [`WorkQueue::done`]), or both when it was re-added while in flight. `dirty` holds every
/// item that still needs a pass; `processing` every item currently held by a consumer. An
/// item re-added while in flight is queued again only when its current pass finishes, so no
/// two consumers ever hold the same item.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    shutdown: CancellationToken,
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    shutting_down: bool,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Clone + Eq + Hash> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Mark `item` as needing processing. No-op if it is already pending or after shutdown.
    pub fn add(&self, item: T) {
        let mut st = self.shared.state.lock();
        if st.shutting_down {
            return;
        }
        if !st.dirty.insert(item.clone()) {
            return;
        }
        counter!("kubemux_queue_adds", 1);
        if st.processing.contains(&item) {
            // picked up again by done()
            return;
        }
        st.queue.push_back(item);
        gauge!("kubemux_queue_depth", st.queue.len() as f64);
        drop(st);
        self.shared.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.shared.state.lock();
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    gauge!("kubemux_queue_depth", st.queue.len() as f64);
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish a pass over `item`. Re-queues it if it was added again in the meantime.
    pub fn done(&self, item: &T) {
        let mut st = self.shared.state.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) {
            st.queue.push_back(item.clone());
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    /// Stop accepting items and wake every blocked consumer. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            debug!(buffered = st.queue.len(), in_flight = st.processing.len(), "work queue shutting down");
        }
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Number of queued items, excluding those in flight.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires when [`WorkQueue::shutdown`] is called.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }
}
