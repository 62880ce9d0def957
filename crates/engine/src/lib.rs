//! Konverge built-in document capability.
//!
//! A `RefDocument` is an ordered mapping of top-level labels to JSON values.
//! Strings may embed `${label.path.to.field}` placeholders that resolve
//! against observed cluster state merged back into the document; `null` marks
//! a field that must be filled from the cluster before the entry is concrete.
//! An empty-string `metadata.name` is concrete: it asks the server to assign
//! a name on create.
//!
//! This is deliberately not a constraint solver; it is the smallest document
//! shape that exercises progressive resolution end to end. The engine seam
//! stays `konverge_core::DocumentValue`.

#![forbid(unsafe_code)]

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value as Json};

use konverge_core::DocumentValue;

const MAX_REF_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct RefDocument {
    root: Json,
    overlays: Vec<(Vec<String>, Json)>,
}

impl RefDocument {
    pub fn from_json(root: Json) -> Result<Self> {
        let map = root.as_object().ok_or_else(|| anyhow!("document root must be a mapping"))?;
        if map.is_empty() {
            bail!("document has no top-level entries");
        }
        Ok(Self { root, overlays: Vec::new() })
    }

    /// Parse exactly one YAML (or JSON) document.
    pub fn from_yaml(src: &str) -> Result<Self> {
        let val: serde_yaml::Value = serde_yaml::from_str(src).context("parsing document")?;
        let root = serde_json::to_value(val).context("converting document to JSON")?;
        Self::from_json(root)
    }

    /// Document merged with all fill overlays: the resolution view.
    fn view(&self) -> Json {
        let mut view = self.root.clone();
        for (path, observed) in &self.overlays {
            fill_at(&mut view, path, observed);
        }
        view
    }

    fn resolve_at(&self, path: &[String]) -> std::result::Result<Json, String> {
        let doc_v = value_at(&self.root, path)
            .ok_or_else(|| format!("no value at {}", path.join("/")))?;
        let view = self.view();
        let mut abs = path.to_vec();
        resolve_value(doc_v, &mut abs, &view, MAX_REF_DEPTH)
    }
}

impl DocumentValue for RefDocument {
    fn labels(&self) -> Vec<String> {
        match self.root.as_object() {
            Some(m) => m.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    fn fill(&self, path: &[String], observed: &Json) -> Result<Box<dyn DocumentValue>> {
        if path.is_empty() {
            bail!("fill requires a non-empty path");
        }
        let mut next = self.clone();
        next.overlays.push((path.to_vec(), observed.clone()));
        Ok(Box::new(next))
    }

    fn validate_concrete(&self, path: &[String]) -> std::result::Result<(), String> {
        self.resolve_at(path).map(|_| ())
    }

    fn decode(&self, path: &[String]) -> Result<Json> {
        self.resolve_at(path).map_err(|reason| anyhow!(reason))
    }

    fn boxed_clone(&self) -> Box<dyn DocumentValue> {
        Box::new(self.clone())
    }
}

/// An open field accepts a value from observed cluster state.
fn is_open(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::String(s) => s.is_empty() || s.contains("${"),
        _ => false,
    }
}

fn value_at<'a>(v: &'a Json, path: &[String]) -> Option<&'a Json> {
    let mut cur = v;
    for seg in path {
        cur = match cur {
            Json::Object(m) => m.get(seg)?,
            Json::Array(a) => a.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Merge `observed` into the value at `path`, creating parents as needed.
/// Document values win unless they are open.
fn fill_at(root: &mut Json, path: &[String], observed: &Json) {
    let mut cur = root;
    for seg in path {
        let map = match cur {
            Json::Object(m) => m,
            other => {
                *other = Json::Object(Map::new());
                other.as_object_mut().expect("just replaced with object")
            }
        };
        cur = map.entry(seg.clone()).or_insert(Json::Null);
    }
    merge_open(cur, observed);
}

fn merge_open(doc: &mut Json, obs: &Json) {
    match (doc, obs) {
        (Json::Object(d), Json::Object(o)) => {
            for (k, ov) in o {
                match d.get_mut(k) {
                    Some(dv) => merge_open(dv, ov),
                    None => {
                        d.insert(k.clone(), ov.clone());
                    }
                }
            }
        }
        (dv, ov) => {
            if is_open(dv) {
                *dv = ov.clone();
            }
        }
    }
}

/// Resolve the document-shaped value at `abs`, consulting `view` for open
/// fields and reference placeholders. Observed-only fields are not pulled in:
/// the document stays the source of truth for the shape it declares.
fn resolve_value(
    doc_v: &Json,
    abs: &mut Vec<String>,
    view: &Json,
    depth: usize,
) -> std::result::Result<Json, String> {
    match doc_v {
        Json::Object(m) => {
            let mut out = Map::with_capacity(m.len());
            for (k, v) in m {
                abs.push(k.clone());
                let r = resolve_value(v, abs, view, depth);
                abs.pop();
                out.insert(k.clone(), r?);
            }
            Ok(Json::Object(out))
        }
        Json::Array(a) => {
            let mut out = Vec::with_capacity(a.len());
            for (i, v) in a.iter().enumerate() {
                abs.push(i.to_string());
                let r = resolve_value(v, abs, view, depth);
                abs.pop();
                out.push(r?);
            }
            Ok(Json::Array(out))
        }
        Json::Null => match value_at(view, abs) {
            Some(filled) if !filled.is_null() => concretize(filled, view, depth),
            _ => Err(format!("{} has not been filled from the cluster yet", abs.join("."))),
        },
        Json::String(s) if s.contains("${") => resolve_str(s, view, depth),
        // An empty string stays concrete (server-assigned), but picks up the
        // observed value once a fill provides one.
        Json::String(s) if s.is_empty() => match value_at(view, abs) {
            Some(Json::String(filled)) if !filled.is_empty() => Ok(Json::String(filled.clone())),
            _ => Ok(Json::String(String::new())),
        },
        other => Ok(other.clone()),
    }
}

/// Resolve a reference target fetched from the view; it may itself still be a
/// placeholder from an entry that has not been ensured.
fn concretize(v: &Json, view: &Json, depth: usize) -> std::result::Result<Json, String> {
    if depth == 0 {
        return Err("reference chain too deep (cycle?)".into());
    }
    match v {
        Json::String(s) if s.contains("${") => resolve_str(s, view, depth - 1),
        Json::Object(m) => {
            let mut out = Map::with_capacity(m.len());
            for (k, vv) in m {
                out.insert(k.clone(), concretize(vv, view, depth)?);
            }
            Ok(Json::Object(out))
        }
        Json::Array(a) => a.iter().map(|vv| concretize(vv, view, depth)).collect::<Result<Vec<_>, _>>().map(Json::Array),
        other => Ok(other.clone()),
    }
}

fn resolve_ref(path: &str, view: &Json, depth: usize) -> std::result::Result<Json, String> {
    if depth == 0 {
        return Err("reference chain too deep (cycle?)".into());
    }
    let segs: Vec<String> = path.split('.').map(str::to_string).collect();
    let target = value_at(view, &segs)
        .ok_or_else(|| format!("reference ${{{}}} is not yet resolvable", path))?;
    if is_open(target) {
        if let Json::String(s) = target {
            if s.contains("${") {
                return resolve_str(s, view, depth - 1);
            }
        }
        return Err(format!("reference ${{{}}} has not been assigned yet", path));
    }
    concretize(target, view, depth - 1)
}

fn resolve_str(s: &str, view: &Json, depth: usize) -> std::result::Result<Json, String> {
    // Whole-string references keep the referenced type.
    if let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        if !inner.contains("${") {
            return resolve_ref(inner, view, depth);
        }
    }
    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| format!("unterminated reference in {:?}", s))?;
        let resolved = resolve_ref(&after[..end], view, depth)?;
        match resolved {
            Json::String(v) => out.push_str(&v),
            Json::Number(n) => out.push_str(&n.to_string()),
            Json::Bool(b) => out.push_str(if b { "true" } else { "false" }),
            other => {
                return Err(format!("cannot interpolate non-scalar reference ${{{}}} ({})", &after[..end], kind_name(&other)))
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Json::String(out))
}

fn kind_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
