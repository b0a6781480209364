use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{error_map, MeridianError, MeridianResult};

/// Scope segment used in keys for cluster-scoped resources.
pub const CLUSTER_SCOPE: &str = "cluster";

/// Group/version/plural triple under which a kind of resource is addressed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvp {
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl Gvp {
    pub fn new(group: impl Into<String>, version: impl Into<String>, plural: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), plural: plural.into() }
    }

    /// Parse `group/version/plural` or `version/plural` (core group).
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, plural] if !version.is_empty() && !plural.is_empty() => Some(Self::new("", *version, *plural)),
            [group, version, plural] if !version.is_empty() && !plural.is_empty() => Some(Self::new(*group, *version, *plural)),
            _ => None,
        }
    }

    pub fn api_version(&self) -> String { api_version(&self.group, &self.version) }

    /// Same group/plural at another version.
    pub fn at_version(&self, version: &str) -> Self {
        Self { group: self.group.clone(), version: version.to_string(), plural: self.plural.clone() }
    }
}

impl fmt::Display for Gvp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

/// `group/version`, or just `version` for the core group.
pub fn api_version(group: &str, version: &str) -> String {
    if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) }
}

/// Inverse of [`api_version`].
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Address of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub gvp: Gvp,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(gvp: Gvp, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { gvp, namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    /// Scope segment of the primary key: the namespace, or `cluster`.
    pub fn scope(&self) -> &str { self.namespace.as_deref().unwrap_or(CLUSTER_SCOPE) }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.gvp, self.scope(), self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    /// Globally unique, generated once by the storage engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Used to derive `name` when it is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    /// Absent for cluster-scoped resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token; bumped only when `spec` changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// A versioned document. The canonical interchange form between admission, patch and
/// storage is the JSON tree from [`Resource::to_value`]; this struct is the typed edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ResourceMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Json>,
}

impl Resource {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ResourceMetadata { name: name.into(), ..Default::default() },
            spec: None,
            status: None,
        }
    }

    pub fn with_namespace(mut self, ns: &str) -> Self { self.metadata.namespace = Some(ns.to_string()); self }
    pub fn with_spec(mut self, spec: Json) -> Self { self.spec = Some(spec); self }
    pub fn with_status(mut self, status: Json) -> Self { self.status = Some(status); self }
    pub fn with_label(mut self, k: &str, v: &str) -> Self { self.metadata.labels.insert(k.to_string(), v.to_string()); self }
    pub fn with_state_version(mut self, v: u64) -> Self { self.metadata.state_version = Some(v); self }

    /// `(group, version)` split from `apiVersion`.
    pub fn group_version(&self) -> (String, String) { split_api_version(&self.api_version) }

    pub fn state_version(&self) -> u64 { self.metadata.state_version.unwrap_or(0) }

    pub fn to_value(&self) -> MeridianResult<Json> {
        serde_json::to_value(self).map_err(|e| MeridianError::Backend(e.into()))
    }

    /// Parse a JSON tree into a resource; malformed bodies are an `InvalidFormat` condition.
    pub fn from_value(v: Json) -> MeridianResult<Self> {
        if !v.is_object() {
            return Err(MeridianError::InvalidFormat {
                reason: "resource body must be a JSON object".into(),
                errors: Default::default(),
            });
        }
        serde_json::from_value(v).map_err(|e| MeridianError::InvalidFormat {
            reason: "body is not a well-formed resource".into(),
            errors: error_map("InvalidFormat", e.to_string()),
        })
    }

    pub fn from_json_str(s: &str) -> MeridianResult<Self> {
        let v: Json = serde_json::from_str(s).map_err(|e| MeridianError::InvalidFormat {
            reason: "body is not valid JSON".into(),
            errors: error_map("InvalidFormat", e.to_string()),
        })?;
        Self::from_value(v)
    }
}
