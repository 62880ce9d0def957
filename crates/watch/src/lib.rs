//! Konverge watch-cache set.
//!
//! One long-lived watch subscription and one name-indexed local cache per
//! distinct (resource type, namespace) pair. The controller is the sole
//! creator of handles, so check-then-add races cannot happen by construction;
//! this crate only has to keep each subscription alive and fan events out to
//! per-locator handlers.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use konverge_core::{meta, ClusterOps, ClusterState, LocatedObject, Locator, NamespacedType, WatchEvent};

const RECONNECT_BASE: Duration = Duration::from_millis(200);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 64;

struct Handler {
    locator: Locator,
    tx: mpsc::UnboundedSender<LocatedObject>,
}

/// Local cache plus handler registrations for one (type, namespace) pair.
pub struct WatchHandle {
    target: NamespacedType,
    objects: RwLock<FxHashMap<String, Json>>,
    handlers: RwLock<FxHashMap<String, Handler>>,
}

impl WatchHandle {
    fn new(target: NamespacedType) -> Self {
        Self {
            target,
            objects: RwLock::new(FxHashMap::default()),
            handlers: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn target(&self) -> &NamespacedType {
        &self.target
    }

    /// Point lookup against the local cache.
    pub fn lookup(&self, name: &str) -> Option<Json> {
        self.objects.read().expect("watch cache lock poisoned").get(name).cloned()
    }

    /// Prime the cache with a freshly observed object, typically the response
    /// of a write, so lookups never wait for the event to round-trip through
    /// the subscription.
    pub fn seed(&self, obj: &Json) {
        let Some(name) = meta::name(obj).filter(|n| !n.is_empty()) else {
            return;
        };
        self.objects
            .write()
            .expect("watch cache lock poisoned")
            .insert(name.to_string(), obj.clone());
    }

    /// Register an event handler filtered to the locator's (name, namespace).
    /// Registrations are deduplicated by document path: a label that is
    /// re-reconciled does not stack handlers.
    pub fn register(&self, locator: Locator, tx: mpsc::UnboundedSender<LocatedObject>) {
        self.handlers
            .write()
            .expect("watch handlers lock poisoned")
            .entry(locator.path_key())
            .or_insert(Handler { locator, tx });
    }

    pub(crate) fn apply_event(&self, event: &WatchEvent) {
        let obj = event.object();
        let name = match meta::name(obj) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => return,
        };
        {
            let mut cache = self.objects.write().expect("watch cache lock poisoned");
            match event {
                WatchEvent::Applied(_) => {
                    cache.insert(name.clone(), obj.clone());
                }
                WatchEvent::Deleted(_) => {
                    cache.remove(&name);
                }
            }
        }
        let namespace = meta::namespace(obj).map(str::to_string);
        let handlers = self.handlers.read().expect("watch handlers lock poisoned");
        for h in handlers.values() {
            if h.locator.name == name && h.locator.target.namespace == namespace {
                let _ = h.tx.send(LocatedObject { locator: h.locator.clone(), object: obj.clone() });
            }
        }
    }
}

pub struct WatchSet {
    cluster: Arc<dyn ClusterOps>,
    watches: RwLock<FxHashMap<NamespacedType, Arc<WatchHandle>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl WatchSet {
    pub fn new(cluster: Arc<dyn ClusterOps>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cluster,
            watches: RwLock::new(FxHashMap::default()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn get(&self, target: &NamespacedType) -> Option<Arc<WatchHandle>> {
        self.watches.read().expect("watch set lock poisoned").get(target).cloned()
    }

    /// Start a subscription for `target` if one does not exist yet. Callers
    /// (the controller) serialize per label, never racing on the same key.
    pub fn add(&self, target: NamespacedType) -> Arc<WatchHandle> {
        if let Some(existing) = self.get(&target) {
            return existing;
        }
        let handle = Arc::new(WatchHandle::new(target.clone()));
        self.watches
            .write()
            .expect("watch set lock poisoned")
            .insert(target.clone(), Arc::clone(&handle));
        let task = tokio::spawn(run_watch(
            Arc::clone(&self.cluster),
            Arc::clone(&handle),
            target,
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().expect("watch tasks lock poisoned").push(task);
        handle
    }

    /// Build a snapshot from the local caches for the given locators. A miss
    /// (watch not caught up yet) is omitted, never an error; the caller's
    /// view is one attempt stale and self-heals on the next event.
    pub fn snapshot_for(&self, locators: &[Locator]) -> ClusterState {
        let mut state = ClusterState::default();
        for locator in locators {
            let Some(handle) = self.get(&locator.target) else {
                debug!(path = %locator.path_key(), "no watch for synced locator yet");
                continue;
            };
            match handle.lookup(&locator.name) {
                Some(obj) => state.insert(locator.clone(), obj),
                None => {
                    debug!(path = %locator.path_key(), "synced but not in cache, cluster state is dirty");
                }
            }
        }
        state
    }

    /// Stop every subscription. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().expect("watch tasks lock poisoned").drain(..) {
            task.abort();
        }
    }
}

/// Keep one subscription alive, re-establishing it with capped backoff.
async fn run_watch(
    cluster: Arc<dyn ClusterOps>,
    handle: Arc<WatchHandle>,
    target: NamespacedType,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_BASE;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<WatchEvent>(EVENT_BUFFER);
        let watch_fut = cluster.watch(&target, tx);
        tokio::pin!(watch_fut);
        let mut saw_events = false;
        loop {
            tokio::select! {
                res = &mut watch_fut => {
                    if let Err(e) = res {
                        warn!(gvk = %target.ty.gvk_key(), ns = ?target.namespace, error = %e, "watch failed");
                    }
                    // drain anything still buffered
                    while let Ok(ev) = rx.try_recv() {
                        handle.apply_event(&ev);
                    }
                    break;
                }
                ev = rx.recv() => match ev {
                    Some(ev) => {
                        saw_events = true;
                        handle.apply_event(&ev);
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
        if saw_events {
            backoff = RECONNECT_BASE;
        }
        tokio::time::sleep(backoff).await;
        backoff = backoff.saturating_mul(2).min(RECONNECT_CAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCluster;

    #[async_trait::async_trait]
    impl ClusterOps for NoCluster {
        async fn resolve(&self, _: &str, _: &str) -> anyhow::Result<konverge_core::ResourceType> {
            unreachable!()
        }
        async fn get(&self, _: &NamespacedType, _: &str) -> anyhow::Result<Option<Json>> {
            Ok(None)
        }
        async fn create(&self, _: &NamespacedType, _: &Json) -> anyhow::Result<Json> {
            unreachable!()
        }
        async fn apply(&self, _: &NamespacedType, _: &str, _: &Json) -> anyhow::Result<Json> {
            unreachable!()
        }
        async fn delete(&self, _: &NamespacedType, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn watch(&self, _: &NamespacedType, _: mpsc::Sender<WatchEvent>) -> anyhow::Result<()> {
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
    }

    fn target(kind: &str, ns: Option<&str>) -> NamespacedType {
        NamespacedType {
            ty: konverge_core::ResourceType {
                group: String::new(),
                version: "v1".into(),
                kind: kind.into(),
                plural: format!("{}s", kind.to_lowercase()),
                namespaced: ns.is_some(),
            },
            namespace: ns.map(str::to_string),
        }
    }

    fn locator(kind: &str, ns: Option<&str>, name: &str, label: &str) -> Locator {
        Locator { target: target(kind, ns), name: name.into(), path: vec![label.into()] }
    }

    fn obj(name: &str, ns: Option<&str>, rv: &str) -> Json {
        let mut o = serde_json::json!({"kind": "ConfigMap", "metadata": {"name": name, "resourceVersion": rv}});
        if let Some(ns) = ns {
            konverge_core::meta::set_namespace(&mut o, ns);
        }
        o
    }

    #[test]
    fn apply_event_updates_cache() {
        let h = WatchHandle::new(target("ConfigMap", Some("ns")));
        h.apply_event(&WatchEvent::Applied(obj("a", Some("ns"), "1")));
        assert!(h.lookup("a").is_some());
        h.apply_event(&WatchEvent::Deleted(obj("a", Some("ns"), "2")));
        assert!(h.lookup("a").is_none());
    }

    #[test]
    fn seed_primes_the_cache() {
        let h = WatchHandle::new(target("ConfigMap", Some("ns")));
        h.seed(&obj("a", Some("ns"), "1"));
        assert!(h.lookup("a").is_some());
        // unnamed objects are never cached
        h.seed(&serde_json::json!({"kind": "ConfigMap", "metadata": {"name": ""}}));
        assert!(h.lookup("").is_none());
    }

    #[test]
    fn handlers_filter_by_name_and_namespace() {
        let h = WatchHandle::new(target("ConfigMap", Some("ns")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.register(locator("ConfigMap", Some("ns"), "a", "a"), tx.clone());
        // same handler re-registered under the same path: no stacking
        h.register(locator("ConfigMap", Some("ns"), "a", "a"), tx);

        h.apply_event(&WatchEvent::Applied(obj("other", Some("ns"), "1")));
        assert!(rx.try_recv().is_err());

        h.apply_event(&WatchEvent::Applied(obj("a", Some("ns"), "2")));
        let got = rx.try_recv().expect("filtered event delivered");
        assert_eq!(got.locator.name, "a");
        assert_eq!(got.resource_version(), "2");
        assert!(rx.try_recv().is_err(), "deduplicated registration fired once");
    }

    #[tokio::test]
    async fn snapshot_omits_misses() {
        let set = WatchSet::new(Arc::new(NoCluster));
        let l_hit = locator("ConfigMap", Some("ns"), "a", "a");
        let l_miss = locator("ConfigMap", Some("ns"), "b", "b");
        let handle = set.add(l_hit.target.clone());
        handle.apply_event(&WatchEvent::Applied(obj("a", Some("ns"), "1")));

        let state = set.snapshot_for(&[l_hit.clone(), l_miss]);
        assert_eq!(state.len(), 1);
        assert!(state.get(&l_hit).is_some());
        set.stop();
        set.stop(); // idempotent
    }

    #[tokio::test]
    async fn add_reuses_the_existing_subscription() {
        let set = WatchSet::new(Arc::new(NoCluster));
        let t = target("ConfigMap", Some("ns"));

        let first = set.add(t.clone());
        first.apply_event(&WatchEvent::Applied(obj("a", Some("ns"), "1")));

        // a second add for the same key must hand back the same handle, not
        // replace it; a replacement would orphan the populated cache
        let second = set.add(t);
        assert!(Arc::ptr_eq(&first, &second));

        let l = locator("ConfigMap", Some("ns"), "a", "a");
        let state = set.snapshot_for(&[l.clone()]);
        assert!(state.get(&l).is_some());
        set.stop();
    }
}
