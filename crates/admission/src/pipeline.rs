use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_core::{error_map, ErrorMap, MeridianConfig, MeridianResult, Resource, ResourceRef};
use meridian_store::{ListQuery, StorageEngine};
use meridian_webhook::{call_admission, new_uid, AdmissionRequest, AdmissionResponse, Operation, ReviewResource, UserInfo, WebhookClient};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use meridian_schema::{MUTATING_WEBHOOK_PLURAL, VALIDATING_WEBHOOK_PLURAL};

use crate::rules::{order_by_priority, AdmissionTarget, AdmissionWebhook, FailurePolicy, Phase};

/// Where registered webhooks come from.
#[async_trait::async_trait]
pub trait WebhookCatalog: Send + Sync {
    /// Registered webhooks of one phase, in declaration (registration) order.
    async fn webhooks(&self, phase: Phase) -> MeridianResult<Vec<AdmissionWebhook>>;
}

/// Webhooks stored as MutatingWebhook / ValidatingWebhook resources.
#[derive(Clone)]
pub struct StoredWebhooks {
    store: StorageEngine,
}

impl StoredWebhooks {
    pub fn new(store: StorageEngine) -> Self { Self { store } }
}

#[async_trait::async_trait]
impl WebhookCatalog for StoredWebhooks {
    async fn webhooks(&self, phase: Phase) -> MeridianResult<Vec<AdmissionWebhook>> {
        let plural = match phase { Phase::Mutating => MUTATING_WEBHOOK_PLURAL, Phase::Validating => VALIDATING_WEBHOOK_PLURAL };
        let gvp = meridian_core::Gvp::new(meridian_core::ADMISSION_GROUP, "v1", plural);
        let mut out = Vec::new();
        let mut token = None;
        loop {
            // creation order stands in for declaration order on priority ties
            let q = ListQuery::new(gvp.clone()).order_by("createdAt", false).page_size(self.store.config().max_page_size).continue_from(token);
            let page = self.store.list(&q).await?;
            for r in &page.items {
                match AdmissionWebhook::from_resource(r, phase) {
                    Ok(h) => out.push(h),
                    Err(e) => warn!(webhook = %r.metadata.name, error = %e, "admission: skipping malformed webhook"),
                }
            }
            token = page.continuation;
            if token.is_none() { break; }
        }
        Ok(out)
    }
}

/// One admission review.
#[derive(Debug, Clone)]
pub struct ReviewInput {
    pub operation: Operation,
    pub target: ResourceRef,
    pub kind: String,
    pub sub_resource: Option<String>,
    /// Proposed state; `None` for deletes.
    pub actual: Option<Resource>,
    /// Stored state; `None` for creates.
    pub original: Option<Resource>,
    pub user: UserInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionOutcome {
    /// Final state after every mutation (`None` when there was no proposed state).
    Allowed(Option<Resource>),
    Denied(ErrorMap),
}

impl AdmissionOutcome {
    pub fn is_allowed(&self) -> bool { matches!(self, AdmissionOutcome::Allowed(_)) }
}

fn merge(into: &mut ErrorMap, from: ErrorMap) {
    for (code, msgs) in from {
        into.entry(code).or_default().extend(msgs);
    }
}

/// Runs mutating then validating webhooks: `Start -> Mutating -> Validating -> Allowed | Denied`.
#[derive(Clone)]
pub struct AdmissionPipeline {
    catalog: Arc<dyn WebhookCatalog>,
    client: Arc<dyn WebhookClient>,
    cfg: MeridianConfig,
}

enum Call {
    Answered(AdmissionResponse),
    /// Transport or decoding failure already resolved against the failure policy.
    Failed(Option<ErrorMap>),
}

impl AdmissionPipeline {
    pub fn new(catalog: Arc<dyn WebhookCatalog>, client: Arc<dyn WebhookClient>, cfg: MeridianConfig) -> Self {
        Self { catalog, client, cfg }
    }

    async fn applicable(&self, phase: Phase, input: &ReviewInput) -> MeridianResult<Vec<AdmissionWebhook>> {
        let t = AdmissionTarget {
            operation: input.operation,
            group: &input.target.gvp.group,
            version: &input.target.gvp.version,
            kind: &input.kind,
            plural: &input.target.gvp.plural,
            namespace: input.target.namespace.as_deref(),
        };
        let mut hooks: Vec<AdmissionWebhook> = self.catalog.webhooks(phase).await?.into_iter().filter(|h| h.applies_to(&t)).collect();
        order_by_priority(&mut hooks);
        Ok(hooks)
    }

    fn request(&self, input: &ReviewInput, actual: Option<Json>, original: &Option<Json>) -> AdmissionRequest {
        AdmissionRequest {
            uid: new_uid(),
            operation: input.operation,
            resource: ReviewResource::from(&input.target),
            sub_resource: input.sub_resource.clone(),
            actual_state: actual,
            original_state: original.clone(),
            user_info: input.user.clone(),
        }
    }

    async fn call(&self, hook: &AdmissionWebhook, request: AdmissionRequest) -> Call {
        let timeout = hook.spec.timeout_seconds.map(Duration::from_secs).unwrap_or_else(|| self.cfg.webhook_timeout());
        match call_admission(self.client.as_ref(), &hook.spec.client_config.url, request, timeout).await {
            Ok(resp) => {
                counter!("admission_webhook_calls_total", 1u64, "phase" => hook.phase.as_str(), "outcome" => if resp.allowed { "allowed" } else { "denied" });
                Call::Answered(resp)
            }
            Err(e) => {
                counter!("admission_webhook_calls_total", 1u64, "phase" => hook.phase.as_str(), "outcome" => "error");
                self.failed(hook, format!("{:#}", e))
            }
        }
    }

    fn failed(&self, hook: &AdmissionWebhook, msg: String) -> Call {
        match hook.spec.failure_policy {
            FailurePolicy::Ignore => {
                warn!(webhook = %hook.name, phase = hook.phase.as_str(), error = %msg, "admission: webhook failed, ignored by policy");
                Call::Failed(None)
            }
            FailurePolicy::Fail => {
                warn!(webhook = %hook.name, phase = hook.phase.as_str(), error = %msg, "admission: webhook failed");
                Call::Failed(Some(error_map("WebhookFailed", format!("{}: {}", hook.name, msg))))
            }
        }
    }

    fn denied(&self, phase: Phase, input: &ReviewInput, errors: ErrorMap) -> AdmissionOutcome {
        counter!("admission_denied_total", 1u64, "phase" => phase.as_str());
        info!(resource = %input.target, op = %input.operation, phase = phase.as_str(), codes = ?errors.keys().collect::<Vec<_>>(), "admission: denied");
        AdmissionOutcome::Denied(errors)
    }

    pub async fn review(&self, input: &ReviewInput) -> MeridianResult<AdmissionOutcome> {
        let t0 = Instant::now();
        let original = match &input.original { Some(r) => Some(r.to_value()?), None => None };
        let mut working = match &input.actual { Some(r) => Some(r.to_value()?), None => None };

        // Mutating: sequential, each webhook sees the previous one's output.
        if let Some(state) = working.as_mut() {
            for hook in self.applicable(Phase::Mutating, input).await? {
                let resp = match self.call(&hook, self.request(input, Some(state.clone()), &original)).await {
                    Call::Answered(r) => r,
                    Call::Failed(None) => continue,
                    Call::Failed(Some(errors)) => return Ok(self.denied(Phase::Mutating, input, errors)),
                };
                if !resp.allowed {
                    let errors = if resp.errors.is_empty() { error_map("Denied", format!("denied by {}", hook.name)) } else { resp.errors };
                    return Ok(self.denied(Phase::Mutating, input, errors));
                }
                let mutated = match resp.mutation() {
                    Ok(None) => continue,
                    Ok(Some(m)) => m.apply(state),
                    Err(e) => Err(e),
                };
                match mutated {
                    Ok(next) => {
                        if let Some(errors) = identity_changed(&hook.name, state, &next) {
                            return Ok(self.denied(Phase::Mutating, input, errors));
                        }
                        debug!(webhook = %hook.name, "admission: mutation applied");
                        *state = next;
                    }
                    Err(e) => match self.failed(&hook, format!("{:#}", e)) {
                        Call::Failed(Some(errors)) => return Ok(self.denied(Phase::Mutating, input, errors)),
                        _ => continue,
                    },
                }
            }
        }

        // Validating: every applicable webhook runs; the verdict is the AND of all.
        let mut errors = ErrorMap::new();
        let mut allowed = true;
        for hook in self.applicable(Phase::Validating, input).await? {
            match self.call(&hook, self.request(input, working.clone(), &original)).await {
                Call::Answered(resp) if resp.allowed => {}
                Call::Answered(resp) => {
                    allowed = false;
                    if resp.errors.is_empty() {
                        merge(&mut errors, error_map("Denied", format!("denied by {}", hook.name)));
                    } else {
                        merge(&mut errors, resp.errors);
                    }
                }
                Call::Failed(None) => {}
                Call::Failed(Some(e)) => {
                    allowed = false;
                    merge(&mut errors, e);
                }
            }
        }
        if !allowed {
            return Ok(self.denied(Phase::Validating, input, errors));
        }

        let final_state = match working { Some(v) => Some(Resource::from_value(v)?), None => None };
        debug!(resource = %input.target, op = %input.operation, took_ms = %t0.elapsed().as_millis(), "admission: allowed");
        Ok(AdmissionOutcome::Allowed(final_state))
    }
}

/// Mutations may not move a resource to another name or namespace.
fn identity_changed(hook: &str, before: &Json, after: &Json) -> Option<ErrorMap> {
    for ptr in ["/metadata/name", "/metadata/namespace"] {
        if before.pointer(ptr) != after.pointer(ptr) {
            return Some(error_map("IdentityChanged", format!("{} changed {}", hook, ptr)));
        }
    }
    None
}
