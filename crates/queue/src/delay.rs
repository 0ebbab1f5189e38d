use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::WorkQueue;

/// [`WorkQueue`] plus delayed insertion.
///
/// Delayed items are held by a scheduler task until their deadline, then added to the
/// underlying queue (and deduplicated there). A pending delayed item is only ever moved
/// earlier. Must be created inside a tokio runtime.
pub struct DelayingQueue<T> {
    queue: WorkQueue<T>,
    waiting_tx: mpsc::UnboundedSender<(Instant, T)>,
}

impl<T> Clone for DelayingQueue<T> {
    fn clone(&self) -> Self {
        Self { queue: self.queue.clone(), waiting_tx: self.waiting_tx.clone() }
    }
}

impl<T> DelayingQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        let queue = WorkQueue::new();
        let (waiting_tx, waiting_rx) = mpsc::unbounded_channel();
        tokio::spawn(waiting_loop(queue.clone(), waiting_rx));
        Self { queue, waiting_tx }
    }

    /// Add `item` once `delay` has elapsed. Zero delay adds immediately.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(item);
            return;
        }
        let _ = self.waiting_tx.send((Instant::now() + delay, item));
    }

    pub fn queue(&self) -> &WorkQueue<T> {
        &self.queue
    }
}

struct Waiting<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Waiting<T> {}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Min-heap on (ready_at, seq).
impl<T> Ord for Waiting<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

async fn waiting_loop<T>(queue: WorkQueue<T>, mut rx: mpsc::UnboundedReceiver<(Instant, T)>)
where
    T: Clone + Eq + Hash + Send + 'static,
{
    let shutdown = queue.shutdown_token();
    let mut heap: BinaryHeap<Waiting<T>> = BinaryHeap::new();
    // item -> (deadline, seq) of its live heap entry; older entries are skipped when popped
    let mut known: FxHashMap<T, (Instant, u64)> = FxHashMap::default();
    let mut seq = 0u64;

    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|w| w.ready_at <= now) {
            let Some(w) = heap.pop() else { break };
            if known.get(&w.item).map(|(_, s)| *s) == Some(w.seq) {
                known.remove(&w.item);
                queue.add(w.item);
            }
        }
        let next = heap.peek().map(|w| w.ready_at);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some((ready_at, item)) => {
                    if let Some((at, _)) = known.get(&item) {
                        if *at <= ready_at {
                            continue;
                        }
                    }
                    seq += 1;
                    known.insert(item.clone(), (ready_at, seq));
                    heap.push(Waiting { ready_at, seq, item });
                }
                None => break,
            },
            _ = tokio::time::sleep_until(next.unwrap_or(now)), if next.is_some() => {}
        }
    }
    debug!(dropped = known.len(), "delay scheduler stopped");
}
