//! Konverge kube integration – discovery and dynamic object plumbing.
//!
//! `KubeCluster` implements the cluster capability on top of kube-rs: type
//! resolution via API discovery, dynamic-object CRUD with server-side apply,
//! and per-(type, namespace) watch subscriptions.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use konverge_core::{ClusterOps, NamespacedType, ResourceType, WatchEvent};

/// Field manager for create/apply; this engine owns the fields it sets.
pub const FIELD_MANAGER: &str = "konverge";

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self { client })
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, target: &NamespacedType) -> Api<DynamicObject> {
        let ar = api_resource(&target.ty);
        if target.ty.namespaced {
            match target.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        }
    }
}

fn api_resource(ty: &ResourceType) -> ApiResource {
    ApiResource {
        group: ty.group.clone(),
        version: ty.version.clone(),
        api_version: ty.api_version(),
        kind: ty.kind.clone(),
        plural: ty.plural.clone(),
    }
}

fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

fn to_dynamic(obj: &Json) -> Result<DynamicObject> {
    serde_json::from_value(obj.clone()).context("converting description to DynamicObject")
}

fn to_json(obj: &DynamicObject) -> Result<Json> {
    serde_json::to_value(obj).context("serializing DynamicObject")
}

#[async_trait::async_trait]
impl ClusterOps for KubeCluster {
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<ResourceType> {
        let (group, version) = split_api_version(api_version);
        let discovery = Discovery::new(self.client.clone()).run().await?;
        for g in discovery.groups() {
            for (ar, caps) in g.recommended_resources() {
                if ar.group == group && ar.version == version && ar.kind == kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(api_version, kind, plural = %ar.plural, namespaced, "resolved resource type");
                    return Ok(ResourceType {
                        group: ar.group.clone(),
                        version: ar.version.clone(),
                        kind: ar.kind.clone(),
                        plural: ar.plural.clone(),
                        namespaced,
                    });
                }
            }
        }
        Err(anyhow!("no served resource for {}/{}", api_version, kind))
    }

    async fn get(&self, target: &NamespacedType, name: &str) -> Result<Option<Json>> {
        let api = self.api_for(target);
        match api.get_opt(name).await? {
            Some(obj) => Ok(Some(to_json(&obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, target: &NamespacedType, obj: &Json) -> Result<Json> {
        let api = self.api_for(target);
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let created = api.create(&pp, &to_dynamic(obj)?).await?;
        to_json(&created)
    }

    async fn apply(&self, target: &NamespacedType, name: &str, obj: &Json) -> Result<Json> {
        let api = self.api_for(target);
        // Force: conflicting ownership is overridden, this engine is the
        // source of truth for the fields it sets.
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api.patch(name, &pp, &Patch::Apply(obj)).await?;
        to_json(&applied)
    }

    async fn delete(&self, target: &NamespacedType, name: &str) -> Result<()> {
        let api = self.api_for(target);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn watch(&self, target: &NamespacedType, events: mpsc::Sender<WatchEvent>) -> Result<()> {
        let api = self.api_for(target);
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        info!(gvk = %target.ty.gvk_key(), ns = ?target.namespace, "watch started");
        while let Some(ev) = stream.try_next().await? {
            let forwarded = match ev {
                Event::Applied(o) => events.send(WatchEvent::Applied(to_json(&o)?)).await,
                Event::Deleted(o) => events.send(WatchEvent::Deleted(to_json(&o)?)).await,
                Event::Restarted(list) => {
                    debug!(count = list.len(), "watch restarted");
                    let mut res = Ok(());
                    for o in &list {
                        res = events.send(WatchEvent::Applied(to_json(o)?)).await;
                        if res.is_err() {
                            break;
                        }
                    }
                    res
                }
            };
            if forwarded.is_err() {
                // receiver dropped: subscription is no longer wanted
                return Ok(());
            }
        }
        warn!(gvk = %target.ty.gvk_key(), "watch stream ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_api_version_handles_core_group() {
        assert_eq!(split_api_version("v1"), (String::new(), "v1".into()));
        assert_eq!(split_api_version("apps/v1"), ("apps".into(), "v1".into()));
    }
}
