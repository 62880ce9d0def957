//! Konverge unifier.
//!
//! Takes the base document and can answer, for any entry, "given what the
//! cluster looks like right now, is this entry fully resolved, and if so,
//! what resource does it describe?". The base document never changes; every
//! lookup merges the current snapshot into a fresh copy.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::Result;
use serde_json::Value as Json;
use tracing::trace;

use konverge_core::{ClusterState, DocumentValue, LabelQueue, LookupError};

pub struct ClusterUnifier {
    base: Box<dyn DocumentValue>,
    // serializes merge-and-read so a concurrent lookup never observes a
    // half-merged tree
    merge: Mutex<()>,
}

impl ClusterUnifier {
    pub fn new(base: Box<dyn DocumentValue>) -> Self {
        Self { base, merge: Mutex::new(()) }
    }

    /// Enumerate top-level labels in document order onto the work queue.
    /// Called exactly once, at startup; returns the total label count.
    pub fn fill(&self, queue: &LabelQueue) -> Result<usize> {
        let labels = self.base.labels();
        if labels.is_empty() {
            anyhow::bail!("document has no top-level entries");
        }
        let total = labels.len();
        for label in labels {
            queue.add(label);
        }
        Ok(total)
    }

    /// Merge `state` into the document and evaluate the value at `path`.
    ///
    /// Error payloads are plain strings: lookup failures travel over
    /// channels and must not borrow the merged tree.
    pub fn lookup(&self, state: &ClusterState, path: &[String]) -> Result<Json, LookupError> {
        let merged = {
            let _guard = self.merge.lock().expect("unifier lock poisoned");
            let mut value = self.base.boxed_clone();
            for (locator, observed) in state.iter() {
                trace!(path = %locator.path_key(), "filling observed state");
                value = value
                    .fill(&locator.path, observed)
                    .map_err(|e| LookupError::Unify(e.to_string()))?;
            }
            value
        };

        let key = path.join("/");
        merged
            .validate_concrete(path)
            .map_err(|reason| LookupError::NotConcrete { path: key.clone(), reason })?;
        merged.decode(path).map_err(|e| LookupError::Decode { path: key, message: e.to_string() })
    }
}
