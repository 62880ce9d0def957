//! Konverge reconciliation controller.
//!
//! Owns the two work queues and the loop that converges a document toward
//! cluster state: pop a label, unify with the current snapshot, ensure it if
//! resolved, record where it landed, subscribe to its future changes, and
//! feed cluster change notifications back into the label queue.

#![forbid(unsafe_code)]

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use konverge_core::{
    meta, ClusterOps, ClusterState, DocumentValue, LabelQueue, LocatedObject, Locator, LookupError,
    WorkQueue,
};
use konverge_ensure::{Ensure, Ensurer};
use konverge_track::LocationTracker;
use konverge_unify::ClusterUnifier;
use konverge_watch::WatchSet;

const STATE_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Keep reconciling after every label is tracked, until cancelled.
    pub watch: bool,
    pub label_workers: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { watch: false, label_workers: 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Expected while dependencies resolve; always retried.
    NotConcrete,
    Lookup,
    Sync,
}

/// A per-label failure surfaced for operator visibility. Failures never abort
/// the run; the label is requeued with backoff.
#[derive(Debug, Clone)]
pub struct Failure {
    pub path: String,
    pub kind: FailureKind,
    pub message: String,
}

pub struct Controller {
    unifier: Arc<ClusterUnifier>,
    tracker: Arc<LocationTracker>,
    watches: Arc<WatchSet>,
    labels: Arc<LabelQueue>,
    changes: Arc<WorkQueue<LocatedObject>>,
    last_versions: Mutex<FxHashMap<String, String>>,
    tracked: Mutex<FxHashSet<String>>,
    total: AtomicUsize,
    watch_mode: bool,
    label_workers: usize,
    states_tx: mpsc::Sender<ClusterState>,
    failures_tx: mpsc::UnboundedSender<Failure>,
    shutdown: watch::Sender<bool>,
}

impl Controller {
    pub fn new(
        unifier: Arc<ClusterUnifier>,
        tracker: Arc<LocationTracker>,
        watches: Arc<WatchSet>,
        opts: RunOptions,
    ) -> (Arc<Self>, mpsc::Receiver<ClusterState>, mpsc::UnboundedReceiver<Failure>) {
        let (states_tx, states_rx) = mpsc::channel(STATE_CHANNEL_CAPACITY);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let controller = Arc::new(Self {
            unifier,
            tracker,
            watches,
            labels: Arc::new(LabelQueue::new()),
            changes: Arc::new(WorkQueue::new()),
            last_versions: Mutex::new(FxHashMap::default()),
            tracked: Mutex::new(FxHashSet::default()),
            total: AtomicUsize::new(0),
            watch_mode: opts.watch,
            label_workers: opts.label_workers.max(1),
            states_tx,
            failures_tx,
            shutdown,
        });
        (controller, states_rx, failures_rx)
    }

    /// Seed the label queue from the document and start the workers.
    /// Returns the total label count.
    pub fn start(self: &Arc<Self>) -> Result<usize> {
        let total = self.unifier.fill(&self.labels)?;
        self.total.store(total, Ordering::SeqCst);
        for _ in 0..self.label_workers {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.label_worker().await });
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.change_worker().await });
        Ok(total)
    }

    async fn label_worker(self: Arc<Self>) {
        while let Some(label) = self.labels.pop().await {
            self.sync_label(&label).await;
            self.labels.done(&label);
        }
    }

    async fn change_worker(self: Arc<Self>) {
        while let Some(notification) = self.changes.pop().await {
            self.sync_changed(notification).await;
        }
    }

    async fn sync_label(&self, label: &str) {
        let path = vec![label.to_string()];
        let state = self.watches.snapshot_for(&self.tracker.locators());

        let desc = match self.unifier.lookup(&state, &path) {
            Ok(desc) => desc,
            Err(e @ LookupError::NotConcrete { .. }) => {
                debug!(label, error = %e, "not yet concrete");
                self.report(label, FailureKind::NotConcrete, &e);
                self.requeue(label);
                return;
            }
            Err(e) => {
                // decode/unify failures rarely self-heal without document
                // changes; keep retrying but log loudly
                error!(label, error = %e, "lookup failed");
                self.report(label, FailureKind::Lookup, &e);
                self.requeue(label);
                return;
            }
        };

        if let Some(rv) = meta::resource_version(&desc) {
            let versions = self.last_versions.lock().expect("version map lock poisoned");
            if versions.get(label).map(String::as_str) == Some(rv) && !rv.is_empty() {
                debug!(label, "cache has not yet caught up to recent changes");
                return;
            }
        }

        let synced = match self.tracker.sync(&desc, &path).await {
            Ok(synced) => synced,
            Err(e) => {
                warn!(label, error = %e, "could not sync");
                self.report(label, FailureKind::Sync, &e);
                self.requeue(label);
                return;
            }
        };
        let locator = synced.locator;
        self.last_versions
            .lock()
            .expect("version map lock poisoned")
            .insert(label.to_string(), synced.prior_version);

        // start a watch for newly synced targets; single-creator discipline
        // holds because only label workers create handles and a label is
        // never processed by two workers at once
        let handle = match self.watches.get(&locator.target) {
            Some(handle) => handle,
            None => self.watches.add(locator.target.clone()),
        };
        handle.register(locator.clone(), self.changes.sender());
        // prime the cache so snapshots never lag our own write
        handle.seed(&synced.observed);

        self.labels.forget(label);
        counter!("reconcile_tracked_total", 1u64);
        info!(label, name = %locator.name, ns = ?locator.target.namespace, "tracked");

        let all_tracked = {
            let mut tracked = self.tracked.lock().expect("tracked set lock poisoned");
            tracked.insert(label.to_string());
            tracked.len() >= self.total.load(Ordering::SeqCst)
        };
        if all_tracked && !self.watch_mode {
            let _ = self.states_tx.send(self.final_snapshot()).await;
            self.shutdown();
        }
    }

    async fn sync_changed(&self, notification: LocatedObject) {
        let key = notification.locator.path_key();
        {
            let versions = self.last_versions.lock().expect("version map lock poisoned");
            if versions.get(&key).map(String::as_str) == Some(notification.resource_version()) {
                // our own write coming back through the cache. Only fires
                // for document engines whose decode round-trips
                // resourceVersion; RefDocument never emits one, so its
                // recorded version is always "" and every self-write takes
                // one extra fingerprint-no-op pass instead.
                debug!(path = %key, "cache has not yet caught up to recent changes");
                return;
            }
        }

        // something changed underneath this resource
        debug!(path = %key, "requeueing after cluster change");
        counter!("reconcile_change_requeue_total", 1u64);
        self.labels.add(key);

        let state = self.watches.snapshot_for(&self.tracker.locators());
        // unbuffered by design: a slow consumer throttles reconciliation
        if self.states_tx.send(state).await.is_err() {
            debug!("state receiver dropped");
        }
    }

    fn requeue(&self, label: &str) {
        counter!("reconcile_requeue_total", 1u64);
        self.labels.add_rate_limited(label.to_string());
    }

    fn report(&self, path: &str, kind: FailureKind, err: &dyn Display) {
        let _ = self.failures_tx.send(Failure { path: path.to_string(), kind, message: err.to_string() });
    }

    pub fn final_snapshot(&self) -> ClusterState {
        self.watches.snapshot_for(&self.tracker.locators())
    }

    pub fn locators(&self) -> Vec<Locator> {
        self.tracker.locators()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().expect("tracked set lock poisoned").len()
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop both queues and every watch subscription. Idempotent; in-flight
    /// work finishes, nothing new is accepted.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.labels.close();
        self.changes.close();
        self.watches.stop();
    }
}

/// A started reconciliation run.
pub struct Reconciliation {
    controller: Arc<Controller>,
    /// Refreshed cluster snapshots, emitted as watched objects change.
    pub states: mpsc::Receiver<ClusterState>,
    /// Per-label failures, keyed by document path.
    pub failures: mpsc::UnboundedReceiver<Failure>,
    pub total: usize,
}

impl Reconciliation {
    pub fn shutdown(&self) {
        self.controller.shutdown();
    }

    pub fn tracked(&self) -> usize {
        self.controller.tracked_count()
    }

    pub fn locators(&self) -> Vec<Locator> {
        self.controller.locators()
    }

    pub fn final_snapshot(&self) -> ClusterState {
        self.controller.final_snapshot()
    }

    /// Signal that flips to `true` once the run shuts down, for callers that
    /// drive their own progress loop instead of `wait`.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.controller.shutdown_rx()
    }

    /// Block until the run shuts down (non-watch mode: when every label is
    /// tracked) and return the final snapshot.
    pub async fn wait(&mut self) -> ClusterState {
        let mut shutdown = self.controller.shutdown_rx();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                state = self.states.recv() => {
                    if state.is_none() {
                        break;
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        self.controller.final_snapshot()
    }
}

/// Wire up the collaborators and start the loop against `cluster`.
pub async fn run(
    base: Box<dyn DocumentValue>,
    cluster: Arc<dyn ClusterOps>,
    opts: RunOptions,
) -> Result<Reconciliation> {
    let watches = Arc::new(WatchSet::new(Arc::clone(&cluster)));
    let ensurer: Arc<dyn Ensure> = Arc::new(Ensurer::new(Arc::clone(&cluster), Arc::clone(&watches)));
    let tracker = Arc::new(LocationTracker::new(ensurer));
    let unifier = Arc::new(ClusterUnifier::new(base));
    let (controller, states, failures) = Controller::new(unifier, tracker, watches, opts);
    let total = controller.start()?;
    Ok(Reconciliation { controller, states, failures, total })
}

/// Delete every tracked resource, concurrently and best-effort: every
/// locator is attempted even when some fail. Returns the deleted locators,
/// or an error summarizing the failures once all attempts have finished.
pub async fn delete_all(cluster: Arc<dyn ClusterOps>, locators: Vec<Locator>) -> Result<Vec<Locator>> {
    let deletions = locators.into_iter().map(|locator| {
        let cluster = Arc::clone(&cluster);
        async move {
            match cluster.delete(&locator.target, &locator.name).await {
                Ok(()) => {
                    info!(path = %locator.path_key(), name = %locator.name, "deleted");
                    Ok(locator)
                }
                Err(e) => {
                    warn!(path = %locator.path_key(), name = %locator.name, error = %e, "delete failed");
                    Err(e)
                }
            }
        }
    });
    let results = futures::future::join_all(deletions).await;
    let total = results.len();
    let mut deleted = Vec::with_capacity(total);
    let mut failed = 0usize;
    for result in results {
        match result {
            Ok(locator) => deleted.push(locator),
            Err(_) => failed += 1,
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} deletes failed", failed, total);
    }
    Ok(deleted)
}
