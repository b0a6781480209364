//! Meridian patch engine: pure functions over JSON trees, no I/O.
//!
//! - JSON Patch (RFC 6902), applied all-or-nothing
//! - JSON Merge Patch (RFC 7386)
//! - Strategic Merge Patch, reduced to a recursive object merge that replaces lists
//! - structural diff producing add/remove/replace operations, and scope filtering of diffs

#![forbid(unsafe_code)]

pub mod pointer;

use std::fmt;
use std::str::FromStr;

use metrics::counter;
use meridian_core::{error_map, MeridianError};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use pointer::{ensure_object, escape_token, parse_pointer};

/// Top-level fields a scoped diff may be restricted to.
pub const SCOPE_SPEC: &str = "/spec";
pub const SCOPE_STATUS: &str = "/status";
pub const SCOPE_LABELS: &str = "/metadata/labels";
pub const SCOPE_ANNOTATIONS: &str = "/metadata/annotations";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("invalid JSON pointer: {0:?}")]
    InvalidPointer(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("invalid array index at {0}")]
    InvalidIndex(String),
    #[error("parent of {0} is not a container")]
    InvalidTarget(String),
    #[error("test failed at {0}")]
    TestFailed(String),
    #[error("cannot move {from} into its own child {path}")]
    MoveIntoChild { from: String, path: String },
    #[error("invalid patch document: {0}")]
    InvalidDocument(String),
}

impl From<PatchError> for MeridianError {
    fn from(e: PatchError) -> Self {
        MeridianError::InvalidFormat { reason: "patch could not be applied".into(), errors: error_map("InvalidPatch", e.to_string()) }
    }
}

/// One RFC 6902 operation, in its wire form (`{"op": "add", "path": ..., "value": ...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Json },
    Remove { path: String },
    Replace { path: String, value: Json },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Json },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Remove { path } | Self::Replace { path, .. } | Self::Move { path, .. } | Self::Copy { path, .. } | Self::Test { path, .. } => path,
        }
    }

    pub fn from_path(&self) -> Option<&str> {
        match self {
            Self::Move { from, .. } | Self::Copy { from, .. } => Some(from),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchType {
    JsonPatch,
    JsonMergePatch,
    StrategicMergePatch,
}

impl fmt::Display for PatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Self::JsonPatch => "json", Self::JsonMergePatch => "merge", Self::StrategicMergePatch => "strategic" })
    }
}

impl FromStr for PatchType {
    type Err = PatchError;

    /// Accepts short names and the patch type tags used on the webhook wire.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "jsonpatch" | "application/json-patch+json" => Ok(Self::JsonPatch),
            "merge" | "mergepatch" | "jsonmergepatch" | "application/merge-patch+json" => Ok(Self::JsonMergePatch),
            "strategic" | "strategicmergepatch" | "application/strategic-merge-patch+json" => Ok(Self::StrategicMergePatch),
            other => Err(PatchError::InvalidDocument(format!("unknown patch type {}", other))),
        }
    }
}

/// A change description in one of three algebras, dispatched once at [`Patch::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    JsonPatch(Vec<PatchOperation>),
    JsonMergePatch(Json),
    StrategicMergePatch(Json),
}

impl Patch {
    /// Build a patch from its type tag and raw document.
    pub fn from_document(kind: PatchType, document: Json) -> Result<Self, PatchError> {
        match kind {
            PatchType::JsonPatch => serde_json::from_value::<Vec<PatchOperation>>(document)
                .map(Self::JsonPatch)
                .map_err(|e| PatchError::InvalidDocument(e.to_string())),
            PatchType::JsonMergePatch => Ok(Self::JsonMergePatch(document)),
            PatchType::StrategicMergePatch => Ok(Self::StrategicMergePatch(document)),
        }
    }

    pub fn patch_type(&self) -> PatchType {
        match self {
            Self::JsonPatch(_) => PatchType::JsonPatch,
            Self::JsonMergePatch(_) => PatchType::JsonMergePatch,
            Self::StrategicMergePatch(_) => PatchType::StrategicMergePatch,
        }
    }

    pub fn apply(&self, target: &Json) -> Result<Json, PatchError> {
        let res = match self {
            Self::JsonPatch(ops) => apply_json_patch(target, ops),
            Self::JsonMergePatch(doc) => Ok(apply_json_merge_patch(target, doc)),
            Self::StrategicMergePatch(doc) => Ok(apply_strategic_merge_patch(target, doc)),
        };
        match &res {
            Ok(_) => {
                counter!("patch_apply_total", 1u64, "type" => self.patch_type().to_string());
            }
            Err(e) => {
                debug!(kind = %self.patch_type(), error = %e, "patch rejected");
                counter!("patch_apply_failed_total", 1u64, "type" => self.patch_type().to_string());
            }
        }
        res
    }
}

/// Apply RFC 6902 operations in order. Any failing operation aborts the whole patch and
/// `target` is left untouched.
pub fn apply_json_patch(target: &Json, ops: &[PatchOperation]) -> Result<Json, PatchError> {
    let mut doc = target.clone();
    for op in ops {
        apply_one(&mut doc, op)?;
    }
    Ok(doc)
}

fn apply_one(doc: &mut Json, op: &PatchOperation) -> Result<(), PatchError> {
    match op {
        PatchOperation::Add { path, value } => pointer::add(doc, &parse_pointer(path)?, value.clone(), path),
        PatchOperation::Remove { path } => pointer::remove(doc, &parse_pointer(path)?, path).map(|_| ()),
        PatchOperation::Replace { path, value } => pointer::replace(doc, &parse_pointer(path)?, value.clone(), path),
        PatchOperation::Move { from, path } => {
            if from == path { return Ok(()); }
            if path.starts_with(&format!("{}/", from)) {
                return Err(PatchError::MoveIntoChild { from: from.clone(), path: path.clone() });
            }
            let v = pointer::remove(doc, &parse_pointer(from)?, from)?;
            pointer::add(doc, &parse_pointer(path)?, v, path)
        }
        PatchOperation::Copy { from, path } => {
            let v = pointer::get(doc, &parse_pointer(from)?).cloned().ok_or_else(|| PatchError::PathNotFound(from.clone()))?;
            pointer::add(doc, &parse_pointer(path)?, v, path)
        }
        PatchOperation::Test { path, value } => match pointer::get(doc, &parse_pointer(path)?) {
            Some(cur) if cur == value => Ok(()),
            _ => Err(PatchError::TestFailed(path.clone())),
        },
    }
}

/// RFC 7386: objects merge recursively, `null` deletes, anything else replaces.
pub fn apply_json_merge_patch(target: &Json, patch: &Json) -> Json {
    let mut out = target.clone();
    merge_in_place(&mut out, patch);
    out
}

fn merge_in_place(target: &mut Json, patch: &Json) {
    let Json::Object(pm) = patch else {
        *target = patch.clone();
        return;
    };
    let tm = ensure_object(target);
    for (k, v) in pm {
        if v.is_null() {
            tm.remove(k);
        } else {
            merge_in_place(tm.entry(k.clone()).or_insert(Json::Null), v);
        }
    }
}

const DIRECTIVE: &str = "$patch";

/// Strategic merge, reduced: recursive object merge, lists replaced wholesale, `null`
/// deletes. No list merge keys. Objects may carry `$patch: replace` (take the patch
/// object as-is) or `$patch: delete` (drop the field).
pub fn apply_strategic_merge_patch(target: &Json, patch: &Json) -> Json {
    let mut out = target.clone();
    if strategic_in_place(&mut out, patch) == Directive::Delete {
        return Json::Null;
    }
    out
}

#[derive(PartialEq, Eq)]
enum Directive {
    Keep,
    Delete,
}

fn strategic_in_place(target: &mut Json, patch: &Json) -> Directive {
    let Json::Object(pm) = patch else {
        *target = patch.clone();
        return Directive::Keep;
    };
    match pm.get(DIRECTIVE).and_then(|d| d.as_str()) {
        Some("delete") => return Directive::Delete,
        Some("replace") => {
            *target = strip_directives(patch);
            return Directive::Keep;
        }
        _ => {}
    }
    let tm = ensure_object(target);
    for (k, v) in pm {
        if k.starts_with('$') { continue; }
        if v.is_null() {
            tm.remove(k);
            continue;
        }
        let slot = tm.entry(k.clone()).or_insert(Json::Null);
        if strategic_in_place(slot, v) == Directive::Delete {
            tm.remove(k);
        }
    }
    Directive::Keep
}

fn strip_directives(v: &Json) -> Json {
    match v {
        Json::Object(m) => Json::Object(m.iter().filter(|(k, _)| !k.starts_with('$')).map(|(k, v)| (k.clone(), strip_directives(v))).collect()),
        other => other.clone(),
    }
}

/// Structural diff: operations that turn `original` into `updated`.
pub fn diff(original: &Json, updated: &Json) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    diff_at("", original, updated, &mut ops);
    ops
}

fn diff_at(path: &str, a: &Json, b: &Json, ops: &mut Vec<PatchOperation>) {
    if a == b { return; }
    match (a, b) {
        (Json::Object(am), Json::Object(bm)) => {
            for (k, av) in am.iter() {
                let p = format!("{}/{}", path, escape_token(k));
                match bm.get(k) {
                    Some(bv) => diff_at(&p, av, bv, ops),
                    None => ops.push(PatchOperation::Remove { path: p }),
                }
            }
            for (k, bv) in bm.iter() {
                if !am.contains_key(k) {
                    ops.push(PatchOperation::Add { path: format!("{}/{}", path, escape_token(k)), value: bv.clone() });
                }
            }
        }
        (Json::Array(aa), Json::Array(ba)) => {
            let common = aa.len().min(ba.len());
            for i in 0..common {
                diff_at(&format!("{}/{}", path, i), &aa[i], &ba[i], ops);
            }
            // Trim from the end so earlier indices stay valid, then append.
            for i in (ba.len()..aa.len()).rev() {
                ops.push(PatchOperation::Remove { path: format!("{}/{}", path, i) });
            }
            for (i, v) in ba.iter().enumerate().skip(aa.len()) {
                ops.push(PatchOperation::Add { path: format!("{}/{}", path, i), value: v.clone() });
            }
        }
        _ => ops.push(PatchOperation::Replace { path: path.to_string(), value: b.clone() }),
    }
}

fn in_scope(path: &str, scope: &str) -> bool {
    path == scope || (path.len() > scope.len() && path.starts_with(scope) && path.as_bytes()[scope.len()] == b'/')
}

/// Keep only operations that touch one of the given pointer prefixes.
pub fn scope_ops(ops: Vec<PatchOperation>, scopes: &[&str]) -> Vec<PatchOperation> {
    ops.into_iter()
        .filter(|op| {
            let ok = |p: &str| scopes.iter().any(|s| in_scope(p, s));
            ok(op.path()) && op.from_path().map(ok).unwrap_or(true)
        })
        .collect()
}

/// Diff of `original` vs `updated`, restricted to `scopes`. An empty result means the
/// requested change would be a no-op.
pub fn scoped_diff(original: &Json, updated: &Json, scopes: &[&str]) -> Vec<PatchOperation> {
    scope_ops(diff(original, updated), scopes)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn from_ops(ops: &[PatchOperation]) -> Self {
        let mut s = Self::default();
        for op in ops {
            match op {
                PatchOperation::Add { .. } | PatchOperation::Copy { .. } => s.adds += 1,
                PatchOperation::Remove { .. } => s.removes += 1,
                PatchOperation::Replace { .. } | PatchOperation::Move { .. } => s.updates += 1,
                PatchOperation::Test { .. } => {}
            }
        }
        s
    }

    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}
