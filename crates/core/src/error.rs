use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resource::{Gvp, ResourceRef};

/// Error messages grouped by code.
pub type ErrorMap = BTreeMap<String, Vec<String>>;

pub fn error_map(code: &str, message: impl Into<String>) -> ErrorMap {
    let mut m = ErrorMap::new();
    m.insert(code.to_string(), vec![message.into()]);
    m
}

/// Context attached to errors so callers can act without consulting logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorTarget {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl ErrorTarget {
    pub fn kind(gvp: &Gvp) -> Self {
        Self { group: gvp.group.clone(), version: gvp.version.clone(), plural: gvp.plural.clone(), namespace: None, name: None }
    }

    pub fn namespace(ns: &str) -> Self { Self { namespace: Some(ns.to_string()), ..Default::default() } }
}

impl From<&ResourceRef> for ErrorTarget {
    fn from(r: &ResourceRef) -> Self {
        Self {
            group: r.gvp.group.clone(),
            version: r.gvp.version.clone(),
            plural: r.gvp.plural.clone(),
            namespace: r.namespace.clone(),
            name: Some(r.name.clone()),
        }
    }
}

impl fmt::Display for ErrorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.plural.is_empty() {
            if self.group.is_empty() { write!(f, "{}/{}", self.version, self.plural)?; } else { write!(f, "{}/{}/{}", self.group, self.version, self.plural)?; }
        }
        if let Some(ns) = &self.namespace { write!(f, " ns={}", ns)?; }
        if let Some(name) = &self.name { write!(f, " name={}", name)?; }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Missing {
    Resource,
    Definition,
    Namespace,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { Missing::Resource => "resource", Missing::Definition => "definition", Missing::Namespace => "namespace" };
        f.write_str(s)
    }
}

/// Repository errors. Everything except `Backend` (and an aborted transaction wrapping one)
/// is an expected outcome the caller maps to a client-facing status.
#[derive(Debug, thiserror::Error)]
pub enum MeridianError {
    #[error("not_found: {what} {target}")]
    NotFound { what: Missing, target: ErrorTarget },
    #[error("conflict: {target}: expected stateVersion {expected}, stored {actual}{}", reason.as_deref().map(|r| format!(" ({})", r)).unwrap_or_default())]
    Conflict { target: ErrorTarget, expected: u64, actual: u64, reason: Option<String> },
    #[error("already_exists: {target}")]
    AlreadyExists { target: ErrorTarget },
    #[error("admission_denied: {target}: {errors:?}")]
    AdmissionDenied { target: ErrorTarget, errors: ErrorMap },
    #[error("invalid_format: {reason}")]
    InvalidFormat { reason: String, errors: ErrorMap },
    #[error("wrong_api: expected {expected_api_version} {expected_kind}, got {actual_api_version} {actual_kind}")]
    WrongApi { expected_api_version: String, expected_kind: String, actual_api_version: String, actual_kind: String },
    #[error("not_modified: {target}")]
    NotModified { target: ErrorTarget },
    #[error("conversion_failed: {target} -> {desired}: {errors:?}")]
    ConversionFailed { target: ErrorTarget, desired: String, errors: ErrorMap },
    #[error("conversion_unsupported: {target}: {from} -> {to} with no conversion strategy")]
    ConversionUnsupported { target: ErrorTarget, from: String, to: String },
    #[error("unsupported_subresource: {target}: {sub_resource}")]
    UnsupportedSubResource { target: ErrorTarget, sub_resource: String },
    #[error("cancelled during {stage}")]
    Cancelled { stage: String },
    #[error("transaction aborted: {source} (rollback failures: {})", rollback_failures.len())]
    TransactionAborted { source: Box<MeridianError>, rollback_failures: Vec<String> },
    #[error("internal: {0:#}")]
    Backend(#[from] anyhow::Error),
}

pub type MeridianResult<T> = Result<T, MeridianError>;

impl MeridianError {
    pub fn not_found(what: Missing, target: ErrorTarget) -> Self { Self::NotFound { what, target } }

    pub fn conflict(target: ErrorTarget, expected: u64, actual: u64) -> Self { Self::Conflict { target, expected, actual, reason: None } }

    pub fn invalid(reason: impl Into<String>) -> Self { Self::InvalidFormat { reason: reason.into(), errors: ErrorMap::new() } }

    /// Numeric status-like code exposed upward.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } | Self::AlreadyExists { .. } => 409,
            Self::AdmissionDenied { .. } => 403,
            Self::InvalidFormat { .. } | Self::WrongApi { .. } | Self::UnsupportedSubResource { .. } => 400,
            Self::NotModified { .. } => 304,
            Self::ConversionFailed { .. } => 422,
            Self::Cancelled { .. } => 499,
            Self::ConversionUnsupported { .. } | Self::TransactionAborted { .. } | Self::Backend(_) => 500,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::Conflict { .. } => "Conflict",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::AdmissionDenied { .. } => "AdmissionDenied",
            Self::InvalidFormat { .. } => "InvalidFormat",
            Self::WrongApi { .. } => "WrongApi",
            Self::NotModified { .. } => "NotModified",
            Self::ConversionFailed { .. } => "ConversionFailed",
            Self::ConversionUnsupported { .. } => "ConversionUnsupported",
            Self::UnsupportedSubResource { .. } => "UnsupportedSubResource",
            Self::Cancelled { .. } => "Cancelled",
            Self::TransactionAborted { .. } => "TransactionAborted",
            Self::Backend(_) => "Internal",
        }
    }

    /// True for outcomes the caller surfaces as client errors rather than faults.
    pub fn is_expected(&self) -> bool {
        match self {
            Self::Backend(_) | Self::ConversionUnsupported { .. } => false,
            Self::TransactionAborted { source, .. } => source.is_expected(),
            _ => true,
        }
    }

    /// Unwrap an aborted transaction to the failure that triggered it.
    pub fn root(&self) -> &MeridianError {
        match self {
            Self::TransactionAborted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Structured error surface consumed by outer layers. Never carries stack traces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiError {
    pub status: u16,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "ErrorMap::is_empty")]
    pub errors: ErrorMap,
}

impl From<&MeridianError> for ApiError {
    fn from(e: &MeridianError) -> Self {
        let root = e.root();
        let mut errors = match root {
            MeridianError::AdmissionDenied { errors, .. }
            | MeridianError::InvalidFormat { errors, .. }
            | MeridianError::ConversionFailed { errors, .. } => errors.clone(),
            _ => ErrorMap::new(),
        };
        if let MeridianError::TransactionAborted { rollback_failures, .. } = e {
            if !rollback_failures.is_empty() {
                errors.entry("RollbackFailed".into()).or_default().extend(rollback_failures.iter().cloned());
            }
        }
        Self { status: root.status(), title: root.title().to_string(), detail: Some(root.to_string()), errors }
    }
}

impl From<MeridianError> for ApiError {
    fn from(e: MeridianError) -> Self { ApiError::from(&e) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409_with_versions_in_detail() {
        let r = ResourceRef::new(Gvp::new("example.io", "v1", "widgets"), Some("prod"), "w1");
        let e = MeridianError::conflict((&r).into(), 1, 2);
        let api = ApiError::from(&e);
        assert_eq!(api.status, 409);
        assert_eq!(api.title, "Conflict");
        let detail = api.detail.unwrap();
        assert!(detail.contains("expected stateVersion 1"), "{}", detail);
        assert!(detail.contains("stored 2"), "{}", detail);
        assert!(detail.contains("ns=prod"), "{}", detail);
    }

    #[test]
    fn aborted_transaction_surfaces_original_and_rollback_failures() {
        let e = MeridianError::TransactionAborted {
            source: Box::new(MeridianError::Backend(anyhow::anyhow!("disk full"))),
            rollback_failures: vec!["step label-index: io".into()],
        };
        let api = ApiError::from(&e);
        assert_eq!(api.status, 500);
        assert!(api.detail.unwrap().contains("disk full"));
        assert_eq!(api.errors["RollbackFailed"], vec!["step label-index: io".to_string()]);
        assert!(!e.is_expected());
    }

    #[test]
    fn admission_errors_are_carried_by_code() {
        let mut errors = error_map("Quota", "too many widgets");
        errors.entry("Quota".into()).or_default().push("still too many".into());
        let e = MeridianError::AdmissionDenied { target: ErrorTarget::default(), errors };
        let api: ApiError = e.into();
        assert_eq!(api.status, 403);
        assert_eq!(api.errors["Quota"].len(), 2);
    }
}
