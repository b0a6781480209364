//! Meridian webhook wire types and transport.
//!
//! Admission webhooks receive an `AdmissionReview` envelope with `request` set and answer
//! with the same envelope carrying `response`. Conversion webhooks receive a
//! `ConversionReview` and answer `{succeeded, convertedResource, errors}`.
//! [`WebhookClient`] is the transport seam: HTTP in production, fakes in tests.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine as _;
use meridian_core::{ErrorMap, ResourceRef};
use meridian_patch::{Patch, PatchType};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

pub const REVIEW_API_VERSION: &str = "admission.meridian.io/v1";
pub const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";
pub const CONVERSION_REVIEW_KIND: &str = "ConversionReview";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Create => "Create", Self::Update => "Update", Self::Delete => "Delete", Self::Connect => "Connect" }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Addressed resource, flattened for the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReviewResource {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl From<&ResourceRef> for ReviewResource {
    fn from(r: &ResourceRef) -> Self {
        Self {
            group: r.gvp.group.clone(),
            version: r.gvp.version.clone(),
            plural: r.gvp.plural.clone(),
            name: r.name.clone(),
            namespace: r.namespace.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub operation: Operation,
    pub resource: ReviewResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,
    /// State the write would store; absent on delete.
    #[serde(default)]
    pub actual_state: Option<Json>,
    /// Stored state before the write; absent on create.
    #[serde(default)]
    pub original_state: Option<Json>,
    #[serde(default)]
    pub user_info: UserInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    #[serde(default)]
    pub uid: String,
    pub allowed: bool,
    /// Complete mutated resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Json>,
    /// Base64 patch document, interpreted per `patch_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(default, skip_serializing_if = "ErrorMap::is_empty")]
    pub errors: ErrorMap,
}

/// What a mutating webhook asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Replace(Json),
    Patch(Patch),
}

impl Mutation {
    pub fn apply(&self, current: &Json) -> Result<Json> {
        match self {
            Mutation::Replace(obj) => Ok(obj.clone()),
            Mutation::Patch(p) => p.apply(current).map_err(|e| anyhow!("applying webhook patch: {}", e)),
        }
    }
}

impl AdmissionResponse {
    pub fn allow(uid: &str) -> Self { Self { uid: uid.to_string(), allowed: true, ..Default::default() } }

    pub fn deny(uid: &str, errors: ErrorMap) -> Self { Self { uid: uid.to_string(), allowed: false, errors, ..Default::default() } }

    pub fn with_patch(mut self, kind: PatchType, document: &Json) -> Self {
        let tag = match kind {
            PatchType::JsonPatch => "JSONPatch",
            PatchType::JsonMergePatch => "MergePatch",
            PatchType::StrategicMergePatch => "StrategicMergePatch",
        };
        self.patch = Some(base64::engine::general_purpose::STANDARD.encode(document.to_string()));
        self.patch_type = Some(tag.to_string());
        self
    }

    /// Decode the mutation carried by the response. `object` wins over `patch`.
    pub fn mutation(&self) -> Result<Option<Mutation>> {
        if let Some(obj) = &self.object {
            return Ok(Some(Mutation::Replace(obj.clone())));
        }
        let Some(encoded) = &self.patch else { return Ok(None) };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("webhook patch is not valid base64")?;
        let doc: Json = serde_json::from_slice(&bytes).context("webhook patch is not valid JSON")?;
        let kind: PatchType = self.patch_type.as_deref().unwrap_or("JSONPatch").parse().map_err(|e| anyhow!("{}", e))?;
        let patch = Patch::from_document(kind, doc).map_err(|e| anyhow!("webhook patch: {}", e))?;
        Ok(Some(Mutation::Patch(patch)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

impl AdmissionReview {
    pub fn request(request: AdmissionRequest) -> Self {
        Self { api_version: REVIEW_API_VERSION.into(), kind: ADMISSION_REVIEW_KIND.into(), request: Some(request), response: None }
    }

    pub fn response(response: AdmissionResponse) -> Self {
        Self { api_version: REVIEW_API_VERSION.into(), kind: ADMISSION_REVIEW_KIND.into(), request: None, response: Some(response) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReview {
    pub api_version: String,
    pub kind: String,
    pub uid: String,
    pub desired_api_version: String,
    pub resource: Json,
}

impl ConversionReview {
    pub fn new(desired_api_version: &str, resource: Json) -> Self {
        Self {
            api_version: REVIEW_API_VERSION.into(),
            kind: CONVERSION_REVIEW_KIND.into(),
            uid: new_uid(),
            desired_api_version: desired_api_version.to_string(),
            resource,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub succeeded: bool,
    #[serde(default)]
    pub converted_resource: Option<Json>,
    #[serde(default, skip_serializing_if = "ErrorMap::is_empty")]
    pub errors: ErrorMap,
}

pub fn new_uid() -> String { uuid::Uuid::new_v4().to_string() }

/// Transport seam for webhook calls.
#[async_trait::async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post(&self, url: &str, body: &Json, timeout: Duration) -> Result<Json>;
}

/// Send an admission review and return its response. The request uid must be echoed.
pub async fn call_admission(client: &dyn WebhookClient, url: &str, request: AdmissionRequest, timeout: Duration) -> Result<AdmissionResponse> {
    let uid = request.uid.clone();
    let body = serde_json::to_value(AdmissionReview::request(request))?;
    let t0 = Instant::now();
    let reply = client.post(url, &body, timeout).await;
    histogram!("webhook_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => "admission");
    let reply = reply.with_context(|| format!("admission webhook {}", url))?;
    let review: AdmissionReview = serde_json::from_value(reply).with_context(|| format!("admission webhook {} returned a malformed review", url))?;
    let Some(mut response) = review.response else { bail!("admission webhook {} returned no response", url) };
    if response.uid.is_empty() {
        response.uid = uid;
    } else if response.uid != uid {
        warn!(url = %url, sent = %uid, got = %response.uid, "admission webhook echoed a different uid");
    }
    debug!(url = %url, allowed = response.allowed, took_ms = %t0.elapsed().as_millis(), "webhook: admission reviewed");
    Ok(response)
}

pub async fn call_conversion(client: &dyn WebhookClient, url: &str, review: &ConversionReview, timeout: Duration) -> Result<ConversionResponse> {
    let body = serde_json::to_value(review)?;
    let t0 = Instant::now();
    let reply = client.post(url, &body, timeout).await;
    histogram!("webhook_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => "conversion");
    let reply = reply.with_context(|| format!("conversion webhook {}", url))?;
    let response: ConversionResponse = serde_json::from_value(reply).with_context(|| format!("conversion webhook {} returned a malformed response", url))?;
    debug!(url = %url, succeeded = response.succeeded, took_ms = %t0.elapsed().as_millis(), "webhook: conversion done");
    Ok(response)
}

/// reqwest-backed client. One connection pool per process.
#[derive(Clone)]
pub struct HttpWebhookClient {
    client: reqwest::Client,
}

impl HttpWebhookClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("meridian/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building webhook http client")?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn post(&self, url: &str, body: &Json, timeout: Duration) -> Result<Json> {
        let resp = self.client.post(url).timeout(timeout).json(body).send().await.with_context(|| format!("POST {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("POST {} returned {}: {}", url, status, text.chars().take(512).collect::<String>());
        }
        resp.json::<Json>().await.with_context(|| format!("decoding response from {}", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(Json);

    #[async_trait::async_trait]
    impl WebhookClient for Echo {
        async fn post(&self, _url: &str, _body: &Json, _timeout: Duration) -> Result<Json> { Ok(self.0.clone()) }
    }

    fn request() -> AdmissionRequest {
        AdmissionRequest {
            uid: "u-1".into(),
            operation: Operation::Create,
            resource: ReviewResource { group: "example.io".into(), version: "v1".into(), plural: "widgets".into(), name: "w".into(), namespace: Some("a".into()) },
            sub_resource: None,
            actual_state: Some(json!({"spec": {"size": 1}})),
            original_state: None,
            user_info: UserInfo::default(),
        }
    }

    #[test]
    fn request_envelope_uses_camel_case_fields() {
        let v = serde_json::to_value(AdmissionReview::request(request())).unwrap();
        assert_eq!(v["kind"], "AdmissionReview");
        assert_eq!(v["request"]["operation"], "Create");
        assert_eq!(v["request"]["actualState"]["spec"]["size"], 1);
        assert!(v["request"]["originalState"].is_null());
        assert!(v.get("response").is_none());
    }

    #[test]
    fn base64_patch_decodes_to_a_typed_patch() {
        let resp = AdmissionResponse::allow("u-1").with_patch(PatchType::JsonMergePatch, &json!({"spec": {"size": 2}}));
        let m = resp.mutation().unwrap().unwrap();
        assert_eq!(m.apply(&json!({"spec": {"size": 1, "color": "red"}})).unwrap(), json!({"spec": {"size": 2, "color": "red"}}));

        let bad = AdmissionResponse { patch: Some("%%%".into()), ..AdmissionResponse::allow("u") };
        assert!(bad.mutation().is_err());
        assert!(AdmissionResponse::allow("u").mutation().unwrap().is_none());
    }

    #[tokio::test]
    async fn admission_call_fills_missing_uid() {
        let reply = serde_json::to_value(AdmissionReview::response(AdmissionResponse { uid: String::new(), allowed: true, ..Default::default() })).unwrap();
        let resp = call_admission(&Echo(reply), "http://hook", request(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.uid, "u-1");
        assert!(resp.allowed);

        let err = call_admission(&Echo(json!({"apiVersion": "x", "kind": "AdmissionReview"})), "http://hook", request(), Duration::from_secs(1)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn conversion_response_parses() {
        let reply = json!({"succeeded": false, "errors": {"Unsupported": ["no path from v1 to v3"]}});
        let review = ConversionReview::new("example.io/v3", json!({}));
        let resp = call_conversion(&Echo(reply), "http://conv", &review, Duration::from_secs(1)).await.unwrap();
        assert!(!resp.succeeded);
        assert_eq!(resp.errors["Unsupported"].len(), 1);
    }
}
