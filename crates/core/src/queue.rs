//! Work queues for the reconciliation loop.
//!
//! `WorkQueue` is a plain FIFO with cooperative shutdown. `LabelQueue` adds
//! the semantics document labels need: an item is never handed to two workers
//! at once (re-adds while a label is being processed are deferred until its
//! `done`), and failed labels are re-enqueued with capped exponential backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};

pub struct WorkQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    shutdown: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self { tx, rx: tokio::sync::Mutex::new(rx), shutdown, closed: Arc::new(AtomicBool::new(false)) }
    }

    pub fn add(&self, item: T) {
        if !self.closed.load(Ordering::Relaxed) {
            let _ = self.tx.send(item);
        }
    }

    /// Enqueue after a delay. Items scheduled before `close` are dropped if
    /// the queue has shut down by the time the delay elapses.
    pub fn add_after(&self, item: T, delay: Duration) {
        let tx = self.tx.clone();
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !closed.load(Ordering::Relaxed) {
                let _ = tx.send(item);
            }
        });
    }

    /// A sender that feeds this queue, for event-handler registration.
    pub fn sender(&self) -> mpsc::UnboundedSender<T> {
        self.tx.clone()
    }

    /// Blocks until an item is available or the queue shuts down (`None`).
    pub async fn pop(&self) -> Option<T> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            item = rx.recv() => item,
            _ = shutdown.changed() => None,
        }
    }

    /// Idempotent: safe to call from several places.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        // send_replace: a plain `send` is dropped when no receiver is alive,
        // and a pop that subscribes afterwards would block forever
        self.shutdown.send_replace(true);
    }
}

impl<T: Send + 'static> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct LabelState {
    queued: FxHashSet<String>,
    active: FxHashSet<String>,
    deferred: FxHashSet<String>,
    attempts: FxHashMap<String, u32>,
}

pub struct LabelQueue {
    queue: WorkQueue<String>,
    state: Mutex<LabelState>,
    base: Duration,
    cap: Duration,
}

pub(crate) fn backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(cap)
}

impl LabelQueue {
    pub fn new() -> Self {
        Self::with_limits(Duration::from_millis(50), Duration::from_secs(5))
    }

    pub fn with_limits(base: Duration, cap: Duration) -> Self {
        Self { queue: WorkQueue::new(), state: Mutex::new(LabelState::default()), base, cap }
    }

    pub fn add(&self, label: String) {
        let mut s = self.state.lock().expect("label queue lock poisoned");
        if s.active.contains(&label) {
            s.deferred.insert(label);
        } else if s.queued.insert(label.clone()) {
            drop(s);
            self.queue.add(label);
        }
    }

    /// Re-enqueue with capped exponential backoff.
    pub fn add_rate_limited(self: &Arc<Self>, label: String) {
        let delay = {
            let mut s = self.state.lock().expect("label queue lock poisoned");
            let n = s.attempts.entry(label.clone()).or_insert(0);
            let d = backoff(self.base, self.cap, *n);
            *n += 1;
            d
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.add(label);
        });
    }

    pub async fn pop(&self) -> Option<String> {
        let label = self.queue.pop().await?;
        let mut s = self.state.lock().expect("label queue lock poisoned");
        s.queued.remove(&label);
        s.active.insert(label.clone());
        Some(label)
    }

    /// Finish processing a label; requeues it if adds arrived meanwhile.
    pub fn done(&self, label: &str) {
        let requeue = {
            let mut s = self.state.lock().expect("label queue lock poisoned");
            s.active.remove(label);
            if s.deferred.remove(label) { s.queued.insert(label.to_string()) } else { false }
        };
        if requeue {
            self.queue.add(label.to_string());
        }
    }

    /// Clear the backoff counter once a label has been tracked.
    pub fn forget(&self, label: &str) {
        let mut s = self.state.lock().expect("label queue lock poisoned");
        s.attempts.remove(label);
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

impl Default for LabelQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pop_returns_items_in_order() {
        let q = WorkQueue::new();
        q.add(1);
        q.add(2);
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn close_unblocks_pop() {
        let q = Arc::new(WorkQueue::<u32>::new());
        let q2 = Arc::clone(&q);
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert_eq!(waiter.await.unwrap(), None);
        q.add(1); // dropped after close
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn add_after_delivers_later() {
        let q = WorkQueue::new();
        q.add_after("x", Duration::from_millis(10));
        assert_eq!(q.pop().await.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn label_queue_dedups_pending_adds() {
        let q = LabelQueue::new();
        q.add("a".into());
        q.add("a".into());
        q.add("b".into());
        assert_eq!(q.pop().await.as_deref(), Some("a"));
        assert_eq!(q.pop().await.as_deref(), Some("b"));
        q.done("a");
        q.done("b");
        q.close();
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn add_during_processing_is_deferred_until_done() {
        let q = LabelQueue::new();
        q.add("a".into());
        let popped = q.pop().await.unwrap();
        // a is active: a re-add must not hand it to a second worker
        q.add("a".into());
        q.done(&popped);
        assert_eq!(q.pop().await.as_deref(), Some("a"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(50);
        let cap = Duration::from_secs(5);
        assert_eq!(backoff(base, cap, 0), Duration::from_millis(50));
        assert_eq!(backoff(base, cap, 3), Duration::from_millis(400));
        assert_eq!(backoff(base, cap, 20), cap);
    }
}
