//! Konverge location tracker.
//!
//! Records where in the cluster each document path landed once it has been
//! ensured. The map is write-once: a path's identity never changes within a
//! run, and a label whose entry carries no name is never created twice:
//! re-reconciliations are steered back to the recorded name.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};

use anyhow::Result;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

use konverge_core::{meta, Locator};
use konverge_ensure::Ensure;

/// Outcome of syncing one document path.
pub struct Synced {
    /// Resource version the description carried *before* the ensure, so
    /// callers can detect when a cache has not yet caught up to the write
    /// this call issued.
    pub prior_version: String,
    /// Remote state as returned by the ensure.
    pub observed: Json,
    pub locator: Locator,
}

pub struct LocationTracker {
    ensurer: Arc<dyn Ensure>,
    locators: RwLock<FxHashMap<String, Locator>>,
}

impl LocationTracker {
    pub fn new(ensurer: Arc<dyn Ensure>) -> Self {
        Self { ensurer, locators: RwLock::new(FxHashMap::default()) }
    }

    /// Ensure `desc` in the cluster and record its identity under `path`.
    /// Nothing is recorded on failure.
    pub async fn sync(&self, desc: &Json, path: &[String]) -> Result<Synced> {
        let key = path.join("/");
        let prior_version = meta::resource_version(desc).unwrap_or("").to_string();

        let mut desc = desc.clone();
        if let Some(known) = self.locators.read().expect("locator lock poisoned").get(&key) {
            // identity is write-once: reuse the recorded name instead of
            // letting an unnamed entry create a second object
            debug!(path = %key, name = %known.name, "reusing tracked identity");
            meta::set_name(&mut desc, &known.name);
            if let Some(ns) = known.target.namespace.as_deref() {
                meta::set_namespace(&mut desc, ns);
            }
        }

        let (observed, mut locator) = self.ensurer.ensure(&desc).await?;
        locator.path = path.to_vec();

        let mut map = self.locators.write().expect("locator lock poisoned");
        let recorded = map.entry(key).or_insert(locator);
        Ok(Synced { prior_version, observed, locator: recorded.clone() })
    }

    /// Consistent snapshot of every path ensured so far.
    pub fn locators(&self) -> Vec<Locator> {
        self.locators.read().expect("locator lock poisoned").values().cloned().collect()
    }
}
