//! Narrow accessors over self-describing resource descriptions.
//!
//! Descriptions stay dynamic (`serde_json::Value`); nothing in the core
//! assumes a schema beyond apiVersion/kind/metadata.

use serde_json::{Map, Value as Json};

pub fn api_version(obj: &Json) -> Option<&str> {
    obj.get("apiVersion").and_then(|v| v.as_str())
}

pub fn kind(obj: &Json) -> Option<&str> {
    obj.get("kind").and_then(|v| v.as_str())
}

pub fn name(obj: &Json) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str())
}

pub fn namespace(obj: &Json) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str())
}

pub fn resource_version(obj: &Json) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str())
}

pub fn annotation<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    obj.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(key))
        .and_then(|v| v.as_str())
}

fn metadata_mut(obj: &mut Json) -> Option<&mut Map<String, Json>> {
    let root = obj.as_object_mut()?;
    root.entry("metadata").or_insert_with(|| Json::Object(Map::new())).as_object_mut()
}

pub fn set_name(obj: &mut Json, name: &str) {
    if let Some(m) = metadata_mut(obj) {
        m.insert("name".into(), Json::String(name.into()));
    }
}

pub fn set_namespace(obj: &mut Json, namespace: &str) {
    if let Some(m) = metadata_mut(obj) {
        m.insert("namespace".into(), Json::String(namespace.into()));
    }
}

pub fn set_annotation(obj: &mut Json, key: &str, value: &str) {
    if let Some(m) = metadata_mut(obj) {
        if let Some(a) = m
            .entry("annotations")
            .or_insert_with(|| Json::Object(Map::new()))
            .as_object_mut()
        {
            a.insert(key.into(), Json::String(value.into()));
        }
    }
}
