//! Declarative webhook registrations and the predicate deciding which ones apply.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use meridian_core::{error_map, MeridianError, MeridianResult, Resource};
use meridian_webhook::Operation;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRule {
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub api_versions: Vec<String>,
    #[serde(default)]
    pub kinds: Vec<String>,
    /// Regex over the target namespace (empty string for cluster-scoped targets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    Fail,
    Ignore,
}

/// `spec` of a MutatingWebhook / ValidatingWebhook resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSpec {
    pub client_config: ClientConfig,
    #[serde(default)]
    pub rules: Vec<WebhookRule>,
    /// Lower runs first; absent runs after every prioritised webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    Mutating,
    Validating,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self { Phase::Mutating => "mutating", Phase::Validating => "validating" }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionWebhook {
    pub name: String,
    pub phase: Phase,
    pub spec: WebhookSpec,
}

impl AdmissionWebhook {
    pub fn new(name: &str, phase: Phase, spec: WebhookSpec) -> Self { Self { name: name.to_string(), phase, spec } }

    pub fn from_resource(r: &Resource, phase: Phase) -> MeridianResult<Self> {
        let spec = r.spec.clone().unwrap_or(serde_json::Value::Null);
        let spec: WebhookSpec = serde_json::from_value(spec).map_err(|e| MeridianError::InvalidFormat {
            reason: format!("webhook {} has a malformed spec", r.metadata.name),
            errors: error_map("InvalidWebhook", e.to_string()),
        })?;
        if spec.client_config.url.is_empty() {
            return Err(MeridianError::InvalidFormat {
                reason: format!("webhook {} has no clientConfig.url", r.metadata.name),
                errors: error_map("InvalidWebhook", "clientConfig.url is required"),
            });
        }
        Ok(Self::new(&r.metadata.name, phase, spec))
    }

    /// True when any rule matches the target.
    pub fn applies_to(&self, t: &AdmissionTarget<'_>) -> bool {
        self.spec.rules.iter().any(|rule| rule_matches(&self.name, rule, t))
    }
}

/// The operation/resource tuple a review is about.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionTarget<'a> {
    pub operation: Operation,
    pub group: &'a str,
    pub version: &'a str,
    pub kind: &'a str,
    pub plural: &'a str,
    pub namespace: Option<&'a str>,
}

fn pattern_matches(hook: &str, pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match Regex::new(&format!("^(?:{})$", pattern)) {
        Ok(re) => re.is_match(value),
        Err(e) => {
            warn!(webhook = %hook, pattern = %pattern, error = %e, "admission: invalid rule pattern, treating as no match");
            false
        }
    }
}

fn any_matches(hook: &str, patterns: &[String], values: &[&str]) -> bool {
    patterns.iter().any(|p| values.iter().any(|v| pattern_matches(hook, p, v)))
}

pub fn rule_matches(hook: &str, rule: &WebhookRule, t: &AdmissionTarget<'_>) -> bool {
    let op_ok = rule.operations.iter().any(|o| o == "*" || o.eq_ignore_ascii_case(t.operation.as_str()));
    op_ok
        && any_matches(hook, &rule.api_groups, &[t.group])
        && any_matches(hook, &rule.api_versions, &[t.version])
        && any_matches(hook, &rule.kinds, &[t.kind, t.plural])
        && rule.scope.as_deref().map_or(true, |s| pattern_matches(hook, s, t.namespace.unwrap_or("")))
}

/// Ascending priority, absent last, declaration order kept on ties.
pub fn order_by_priority(hooks: &mut [AdmissionWebhook]) {
    hooks.sort_by_key(|h| match h.spec.priority {
        Some(p) => (0u8, p),
        None => (1u8, 0),
    });
}
