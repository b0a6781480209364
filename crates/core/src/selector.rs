//! Label selector evaluator: a pure predicate over a resource's label set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{error_map, MeridianError, MeridianResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SelectorOperator {
    Equals,
    NotEquals,
    /// Label present and its value is one of the selector values.
    Contains,
    /// Label absent, or its value is none of the selector values.
    NotContains,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelector {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub values: SmallVec<[String; 4]>,
}

impl LabelSelector {
    pub fn equals(key: &str, value: &str) -> Self {
        Self { key: key.to_string(), operator: SelectorOperator::Equals, value: Some(value.to_string()), values: SmallVec::new() }
    }

    pub fn not_equals(key: &str, value: &str) -> Self {
        Self { key: key.to_string(), operator: SelectorOperator::NotEquals, value: Some(value.to_string()), values: SmallVec::new() }
    }

    pub fn contains(key: &str, values: &[&str]) -> Self {
        Self { key: key.to_string(), operator: SelectorOperator::Contains, value: None, values: values.iter().map(|s| s.to_string()).collect() }
    }

    pub fn not_contains(key: &str, values: &[&str]) -> Self {
        Self { key: key.to_string(), operator: SelectorOperator::NotContains, value: None, values: values.iter().map(|s| s.to_string()).collect() }
    }

    fn in_set(&self, v: &str) -> bool {
        self.value.as_deref() == Some(v) || self.values.iter().any(|x| x == v)
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let cur = labels.get(&self.key).map(|s| s.as_str());
        match (self.operator, cur) {
            (SelectorOperator::Equals, Some(v)) => self.value.as_deref() == Some(v),
            (SelectorOperator::Equals, None) => false,
            (SelectorOperator::NotEquals, Some(v)) => self.value.as_deref() != Some(v),
            (SelectorOperator::NotEquals, None) => true,
            (SelectorOperator::Contains, Some(v)) => self.in_set(v),
            (SelectorOperator::Contains, None) => false,
            (SelectorOperator::NotContains, Some(v)) => !self.in_set(v),
            (SelectorOperator::NotContains, None) => true,
        }
    }

    /// `key=value` pair usable for an exact-match index lookup, if this selector is one.
    pub fn exact_pair(&self) -> Option<(&str, &str)> {
        match (self.operator, self.value.as_deref()) {
            (SelectorOperator::Equals, Some(v)) => Some((self.key.as_str(), v)),
            _ => None,
        }
    }
}

/// Conjunction: every selector must match. An empty list matches everything.
pub fn matches_all(selectors: &[LabelSelector], labels: &BTreeMap<String, String>) -> bool {
    selectors.iter().all(|s| s.matches(labels))
}

/// Parse `env=prod,tier!=web,zone in (a,b),team notin (x)` into selectors.
pub fn parse_selectors(input: &str) -> MeridianResult<Vec<LabelSelector>> {
    let mut out = Vec::new();
    for term in split_terms(input) {
        let term = term.trim();
        if term.is_empty() { continue; }
        out.push(parse_term(term).ok_or_else(|| MeridianError::InvalidFormat {
            reason: format!("invalid label selector: {}", term),
            errors: error_map("InvalidSelector", term),
        })?);
    }
    Ok(out)
}

// Commas inside `( … )` belong to set terms.
fn split_terms(input: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, ch) in input.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => { out.push(&input[start..i]); start = i + 1; }
            _ => {}
        }
    }
    out.push(&input[start..]);
    out
}

fn parse_term(term: &str) -> Option<LabelSelector> {
    if let Some((k, v)) = term.split_once("!=") {
        return valid_key(k).map(|k| LabelSelector::not_equals(k, v.trim()));
    }
    if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return valid_key(k).map(|k| LabelSelector::equals(k, v.trim()));
    }
    let (key, rest) = term.split_once(char::is_whitespace)?;
    let rest = rest.trim();
    let (op, set) = if let Some(s) = rest.strip_prefix("notin") {
        (SelectorOperator::NotContains, s)
    } else if let Some(s) = rest.strip_prefix("in") {
        (SelectorOperator::Contains, s)
    } else {
        return None;
    };
    let inner = set.trim().strip_prefix('(')?.strip_suffix(')')?;
    let values: SmallVec<[String; 4]> = inner.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    Some(LabelSelector { key: valid_key(key)?.to_string(), operator: op, value: None, values })
}

fn valid_key(k: &str) -> Option<&str> {
    let k = k.trim();
    if k.is_empty() || k.contains(char::is_whitespace) { None } else { Some(k) }
}
