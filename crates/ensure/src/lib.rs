//! Konverge ensurer: make the cluster match one resolved description.
//!
//! Create if absent, server-side apply if changed, no-op if identical. The
//! no-op check is a content fingerprint stored as an annotation on every
//! ensured object, so a second pass with an unchanged description issues zero
//! mutating calls.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Result};
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

use konverge_core::{meta, ClusterOps, Locator, NamespacedType};
use konverge_watch::WatchSet;

/// Annotation carrying the content fingerprint of the last applied state.
pub const OBJECT_HASH_ANNOTATION: &str = "konverge.dev/object-hash";

/// Ensure seam, so the tracker can be exercised without a cluster.
#[async_trait::async_trait]
pub trait Ensure: Send + Sync {
    /// Returns the observed remote state and the object's cluster identity.
    /// The locator's document path is left empty; the tracker owns it.
    async fn ensure(&self, desc: &Json) -> Result<(Json, Locator)>;
}

pub struct Ensurer {
    cluster: Arc<dyn ClusterOps>,
    watches: Arc<WatchSet>,
}

impl Ensurer {
    pub fn new(cluster: Arc<dyn ClusterOps>, watches: Arc<WatchSet>) -> Self {
        Self { cluster, watches }
    }

    /// Point lookup through the watch cache when a subscription already
    /// covers the target; a cold or absent cache falls back to a direct read
    /// so existence checks never depend on watch catch-up.
    async fn lookup_existing(&self, target: &NamespacedType, name: &str) -> Result<Option<Json>> {
        if let Some(handle) = self.watches.get(target) {
            if let Some(obj) = handle.lookup(name) {
                return Ok(Some(obj));
            }
        }
        self.cluster.get(target, name).await
    }
}

#[async_trait::async_trait]
impl Ensure for Ensurer {
    async fn ensure(&self, desc: &Json) -> Result<(Json, Locator)> {
        counter!("ensure_attempts_total", 1u64);
        let api_version = meta::api_version(desc)
            .ok_or_else(|| anyhow!("description missing apiVersion"))?
            .to_string();
        let kind = meta::kind(desc)
            .ok_or_else(|| anyhow!("description missing kind"))?
            .to_string();
        let ty = self.cluster.resolve(&api_version, &kind).await?;
        let target = NamespacedType { ty, namespace: meta::namespace(desc).map(str::to_string) };

        let mut obj = desc.clone();
        stamp_fingerprint(&mut obj);

        let name = meta::name(&obj).unwrap_or("").to_string();
        if name.is_empty() {
            // no assigned name: always create, the server picks one
            let out = self.cluster.create(&target, &obj).await?;
            counter!("ensure_create_total", 1u64);
            let assigned = meta::name(&out).unwrap_or("").to_string();
            let locator = Locator { target, name: assigned, path: Vec::new() };
            return Ok((out, locator));
        }

        match self.lookup_existing(&target, &name).await? {
            None => {
                let out = self.cluster.create(&target, &obj).await?;
                counter!("ensure_create_total", 1u64);
                let locator = Locator { target, name, path: Vec::new() };
                Ok((out, locator))
            }
            Some(existing) => {
                let locator = Locator { target: target.clone(), name: name.clone(), path: Vec::new() };
                if fingerprints_equal(&obj, &existing) {
                    debug!(name = %name, "fingerprint equal to existing, no work to do");
                    counter!("ensure_noop_total", 1u64);
                    return Ok((existing, locator));
                }
                let out = self.cluster.apply(&target, &name, &obj).await?;
                counter!("ensure_apply_total", 1u64);
                Ok((out, locator))
            }
        }
    }
}

/// Compute the content fingerprint and stamp it onto the object.
pub fn stamp_fingerprint(obj: &mut Json) {
    let digest = fingerprint(obj);
    meta::set_annotation(obj, OBJECT_HASH_ANNOTATION, &digest);
}

/// Both sides must carry a fingerprint annotation and agree on it.
pub fn fingerprints_equal(desired: &Json, existing: &Json) -> bool {
    match (meta::annotation(desired, OBJECT_HASH_ANNOTATION), meta::annotation(existing, OBJECT_HASH_ANNOTATION)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Digest over a deterministic, order-independent rendering of the stable
/// fields of a description.
pub fn fingerprint(desc: &Json) -> String {
    let mut work = desc.clone();
    strip_volatile(&mut work);
    let mut buf = String::new();
    write_canonical(&work, &mut buf);
    let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
    for b in buf.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", h)
}

/// Remove version counters and server-managed bookkeeping before hashing.
fn strip_volatile(v: &mut Json) {
    if let Some(meta_obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta_obj.remove("resourceVersion");
        meta_obj.remove("uid");
        meta_obj.remove("generation");
        meta_obj.remove("creationTimestamp");
        meta_obj.remove("managedFields");
        let drop_annotations = match meta_obj.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            Some(a) => {
                a.remove(OBJECT_HASH_ANNOTATION);
                a.is_empty()
            }
            None => false,
        };
        if drop_annotations {
            meta_obj.remove("annotations");
        }
    }
    if let Some(root) = v.as_object_mut() {
        root.remove("status");
    }
}

/// JSON-shaped rendering with object keys sorted, so key order never changes
/// the digest.
fn write_canonical(v: &Json, out: &mut String) {
    match v {
        Json::Object(m) => {
            out.push('{');
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Json::String(k.clone()).to_string());
                out.push(':');
                write_canonical(&m[k], out);
            }
            out.push('}');
        }
        Json::Array(a) => {
            out.push('[');
            for (i, item) in a.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use konverge_core::WatchEvent;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeCluster {
        objects: Mutex<HashMap<String, Json>>,
        creates: AtomicUsize,
        applies: AtomicUsize,
        seq: AtomicUsize,
    }

    fn key(target: &NamespacedType, name: &str) -> String {
        format!("{}|{}|{}", target.ty.gvk_key(), target.namespace.as_deref().unwrap_or(""), name)
    }

    #[async_trait::async_trait]
    impl ClusterOps for FakeCluster {
        async fn resolve(&self, api_version: &str, kind: &str) -> Result<konverge_core::ResourceType> {
            let (group, version) = match api_version.split_once('/') {
                Some((g, v)) => (g.to_string(), v.to_string()),
                None => (String::new(), api_version.to_string()),
            };
            Ok(konverge_core::ResourceType {
                group,
                version,
                kind: kind.to_string(),
                plural: format!("{}s", kind.to_lowercase()),
                namespaced: true,
            })
        }

        async fn get(&self, target: &NamespacedType, name: &str) -> Result<Option<Json>> {
            Ok(self.objects.lock().unwrap().get(&key(target, name)).cloned())
        }

        async fn create(&self, target: &NamespacedType, obj: &Json) -> Result<Json> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            let mut stored = obj.clone();
            if meta::name(&stored).unwrap_or("").is_empty() {
                meta::set_name(&mut stored, &format!("gen-{}", n));
            }
            if let Some(m) = stored.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                m.insert("resourceVersion".into(), Json::String(n.to_string()));
                m.insert("uid".into(), Json::String(format!("uid-{}", n)));
            }
            let name = meta::name(&stored).unwrap_or("").to_string();
            self.objects.lock().unwrap().insert(key(target, &name), stored.clone());
            Ok(stored)
        }

        async fn apply(&self, target: &NamespacedType, name: &str, obj: &Json) -> Result<Json> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            let mut stored = obj.clone();
            if let Some(m) = stored.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                m.insert("resourceVersion".into(), Json::String(n.to_string()));
            }
            self.objects.lock().unwrap().insert(key(target, name), stored.clone());
            Ok(stored)
        }

        async fn delete(&self, target: &NamespacedType, name: &str) -> Result<()> {
            self.objects.lock().unwrap().remove(&key(target, name));
            Ok(())
        }

        async fn watch(&self, _: &NamespacedType, _: mpsc::Sender<WatchEvent>) -> Result<()> {
            Ok(())
        }
    }

    fn ensurer(cluster: &Arc<FakeCluster>) -> Ensurer {
        let ops: Arc<dyn ClusterOps> = Arc::clone(cluster) as Arc<dyn ClusterOps>;
        let watches = Arc::new(WatchSet::new(Arc::clone(&ops)));
        Ensurer::new(ops, watches)
    }

    fn desc(name: &str, value: &str) -> Json {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns"},
            "data": {"value": value}
        })
    }

    #[test]
    fn fingerprint_ignores_volatile_fields_and_key_order() {
        let a = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "x", "resourceVersion": "1", "uid": "u", "managedFields": [{"m": 1}]},
            "data": {"a": 1, "b": 2},
            "status": {"ready": true}
        });
        let b = serde_json::json!({
            "kind": "ConfigMap",
            "apiVersion": "v1",
            "data": {"b": 2, "a": 1},
            "metadata": {"name": "x", "resourceVersion": "2"}
        });
        assert_eq!(fingerprint(&a), fingerprint(&b));
        let c = serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "y"}});
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn stamping_does_not_change_the_fingerprint() {
        let mut obj = desc("x", "1");
        let before = fingerprint(&obj);
        stamp_fingerprint(&mut obj);
        assert_eq!(fingerprint(&obj), before);
        assert!(fingerprints_equal(&obj, &obj.clone()));
    }

    #[tokio::test]
    async fn unnamed_description_is_created_with_assigned_name() {
        let cluster = Arc::new(FakeCluster::default());
        let e = ensurer(&cluster);
        let (out, locator) = e.ensure(&desc("", "1")).await.unwrap();
        assert_eq!(locator.name, "gen-1");
        assert_eq!(meta::name(&out), Some("gen-1"));
        assert_eq!(cluster.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_ensure_with_unchanged_description_is_read_only() {
        let cluster = Arc::new(FakeCluster::default());
        let e = ensurer(&cluster);
        e.ensure(&desc("x", "1")).await.unwrap();
        let (_, locator) = e.ensure(&desc("x", "1")).await.unwrap();
        assert_eq!(locator.name, "x");
        assert_eq!(cluster.creates.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.applies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn changed_description_is_applied() {
        let cluster = Arc::new(FakeCluster::default());
        let e = ensurer(&cluster);
        e.ensure(&desc("x", "1")).await.unwrap();
        e.ensure(&desc("x", "2")).await.unwrap();
        assert_eq!(cluster.creates.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_side_drift_outside_the_description_is_a_noop() {
        let cluster = Arc::new(FakeCluster::default());
        let e = ensurer(&cluster);
        let (_, locator) = e.ensure(&desc("x", "1")).await.unwrap();
        // an external controller bumps status and resourceVersion
        {
            let mut objects = cluster.objects.lock().unwrap();
            let stored = objects.get_mut(&key(&locator.target, "x")).unwrap();
            stored["status"] = serde_json::json!({"ready": true});
            stored["metadata"]["resourceVersion"] = Json::String("99".into());
        }
        e.ensure(&desc("x", "1")).await.unwrap();
        assert_eq!(cluster.applies.load(Ordering::SeqCst), 0);
    }
}
