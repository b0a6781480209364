//! Logical key scheme, independent of the backend.
//!
//! primary        `{gvp}/{scope}/{name}` (string value: the resource JSON)
//! kind index     hash `idx:{gvp}`, field `{scope}.{name}`
//! ns index       hash `ns:{namespace}`, field `{gvp}/{name}`
//! ordered index  zset `ord:{gvp}:{property}`, member = `{tie key}\u{1}{primary}`
//! label index    set `lbl:{gvp}:{key}={value}`, member = primary key
//! definitions    hash `definitions`, field `{plural}.{group}`

use meridian_core::{Gvp, ResourceRef, CLUSTER_SCOPE};

/// Metadata properties with an ordered index.
pub const ORDERABLE: [&str; 5] = ["id", "createdAt", "lastModified", "name", "namespace"];

pub const DEFINITIONS_XREF: &str = "definitions";

pub fn primary(r: &ResourceRef) -> String { format!("{}/{}/{}", r.gvp, r.scope(), r.name) }

pub fn kind_index(gvp: &Gvp) -> String { format!("idx:{}", gvp) }

pub fn kind_field(r: &ResourceRef) -> String { format!("{}.{}", r.scope(), r.name) }

/// Prefix selecting one scope inside a kind index.
pub fn scope_prefix(scope: &str) -> String { format!("{}.", scope) }

pub fn namespace_index(ns: &str) -> String { format!("ns:{}", ns) }

pub fn namespace_field(r: &ResourceRef) -> String { format!("{}/{}", r.gvp, r.name) }

pub fn ordered_index(gvp: &Gvp, property: &str) -> String { format!("ord:{}:{}", gvp, property) }

const MEMBER_SEP: char = '\u{1}';

/// Ordered-index member: equal scores fall back to the property's own value, then the
/// primary key.
pub fn ordered_member(tie: &str, primary: &str) -> String { format!("{}{}{}", tie, MEMBER_SEP, primary) }

pub fn member_primary(member: &str) -> &str {
    member.rsplit_once(MEMBER_SEP).map(|(_, p)| p).unwrap_or(member)
}

pub fn label_index(gvp: &Gvp, key: &str, value: &str) -> String { format!("lbl:{}:{}={}", gvp, key, value) }

pub fn definition_field(plural: &str, group: &str) -> String { format!("{}.{}", plural, group) }

/// Recover the reference from a primary key. Names and namespaces never contain `/`.
pub fn parse_primary(key: &str) -> Option<ResourceRef> {
    let parts: Vec<&str> = key.split('/').collect();
    let (gvp, scope, name) = match parts.as_slice() {
        [g, v, p, s, n] => (Gvp::new(*g, *v, *p), *s, *n),
        [v, p, s, n] => (Gvp::new("", *v, *p), *s, *n),
        _ => return None,
    };
    if name.is_empty() || scope.is_empty() { return None; }
    let ns = if scope == CLUSTER_SCOPE { None } else { Some(scope) };
    Some(ResourceRef::new(gvp, ns, name))
}
