//! Konverge core types – identity, cluster state, capability traits

#![forbid(unsafe_code)]

use anyhow::Result;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::mpsc;

pub mod meta;
pub mod queue;

pub use queue::{LabelQueue, WorkQueue};

/// A served resource type as resolved by discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceType {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

/// Key under which watch subscriptions are held: one per type/namespace pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NamespacedType {
    pub ty: ResourceType,
    pub namespace: Option<String>,
}

/// Cluster identity of a resource once it is known to exist remotely, plus the
/// document path it was ensured from. Write-once per path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Locator {
    pub target: NamespacedType,
    pub name: String,
    pub path: Vec<String>,
}

impl Locator {
    pub fn path_key(&self) -> String {
        self.path.join("/")
    }
}

/// A cluster change notification: the observed object together with the
/// locator of the document entry it belongs to.
#[derive(Debug, Clone)]
pub struct LocatedObject {
    pub locator: Locator,
    pub object: Json,
}

impl LocatedObject {
    pub fn resource_version(&self) -> &str {
        meta::resource_version(&self.object).unwrap_or("")
    }
}

/// Last-observed remote representation per locator, rebuilt from the watch
/// caches for every reconciliation attempt. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    objects: FxHashMap<Locator, Json>,
}

impl ClusterState {
    pub fn insert(&mut self, locator: Locator, object: Json) {
        self.objects.insert(locator, object);
    }

    pub fn get(&self, locator: &Locator) -> Option<&Json> {
        self.objects.get(locator)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Locator, &Json)> {
        self.objects.iter()
    }

    pub fn locators(&self) -> Vec<Locator> {
        self.objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Errors produced when evaluating a document entry against cluster state.
///
/// `NotConcrete` is the expected steady-state error while dependencies are
/// still being created; it is always retried and never fails a run.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("{path} not yet concrete: {reason}")]
    NotConcrete { path: String, reason: String },
    #[error("decoding {path}: {message}")]
    Decode { path: String, message: String },
    #[error("unifying cluster state: {0}")]
    Unify(String),
}

/// Constraint-document capability. Values are immutable: `fill` returns a new
/// value, never mutates in place.
pub trait DocumentValue: Send + Sync {
    /// Top-level labels in document order.
    fn labels(&self) -> Vec<String>;

    /// Merge an observed object into the document at `path`.
    fn fill(&self, path: &[String], observed: &Json) -> Result<Box<dyn DocumentValue>>;

    /// Check whether the value at `path` is fully resolved. The `Err` carries
    /// a human-readable explanation of the first open field.
    fn validate_concrete(&self, path: &[String]) -> Result<(), String>;

    /// Decode the (concrete) value at `path` to a resource description.
    fn decode(&self, path: &[String]) -> Result<Json>;

    fn boxed_clone(&self) -> Box<dyn DocumentValue>;
}

/// A single change observed by a watch subscription.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(Json),
    Deleted(Json),
}

impl WatchEvent {
    pub fn object(&self) -> &Json {
        match self {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

/// Remote cluster capability: type discovery, typed CRUD with idempotent
/// upsert, and long-lived watch subscriptions.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    /// Map apiVersion + kind to a served resource type.
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<ResourceType>;

    async fn get(&self, target: &NamespacedType, name: &str) -> Result<Option<Json>>;

    async fn create(&self, target: &NamespacedType, obj: &Json) -> Result<Json>;

    /// Idempotent upsert (server-side apply with ownership override).
    async fn apply(&self, target: &NamespacedType, name: &str, obj: &Json) -> Result<Json>;

    async fn delete(&self, target: &NamespacedType, name: &str) -> Result<()>;

    /// Run one watch subscription, pushing events into `events` until the
    /// stream ends, fails, or the receiver is dropped.
    async fn watch(&self, target: &NamespacedType, events: mpsc::Sender<WatchEvent>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(kind: &str) -> ResourceType {
        ResourceType {
            group: String::new(),
            version: "v1".into(),
            kind: kind.into(),
            plural: format!("{}s", kind.to_lowercase()),
            namespaced: true,
        }
    }

    fn locator(kind: &str, name: &str, path: &[&str]) -> Locator {
        Locator {
            target: NamespacedType { ty: ty(kind), namespace: Some("ns".into()) },
            name: name.into(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn api_version_omits_empty_group() {
        assert_eq!(ty("ConfigMap").api_version(), "v1");
        let mut t = ty("Widget");
        t.group = "example.dev".into();
        assert_eq!(t.api_version(), "example.dev/v1");
        assert_eq!(t.gvk_key(), "example.dev/v1/Widget");
    }

    #[test]
    fn cluster_state_round_trip() {
        let mut state = ClusterState::default();
        let l = locator("ConfigMap", "a", &["a"]);
        state.insert(l.clone(), serde_json::json!({"kind": "ConfigMap"}));
        assert_eq!(state.len(), 1);
        assert!(state.get(&l).is_some());
        assert_eq!(state.locators(), vec![l]);
    }

    #[test]
    fn path_key_joins_segments() {
        assert_eq!(locator("ConfigMap", "a", &["x", "y"]).path_key(), "x/y");
    }
}
