//! Meridian admission control.
//!
//! Registered MutatingWebhook / ValidatingWebhook resources are matched against the
//! operation and target by declarative [`WebhookRule`]s, ordered by priority, then run
//! in two phases: mutating (sequential, first deny wins) and validating (all run,
//! errors aggregated by code).

#![forbid(unsafe_code)]

mod pipeline;
mod rules;

pub use pipeline::{AdmissionOutcome, AdmissionPipeline, ReviewInput, StoredWebhooks, WebhookCatalog};
pub use rules::{
    order_by_priority, rule_matches, AdmissionTarget, AdmissionWebhook, ClientConfig, FailurePolicy, Phase, WebhookRule,
    WebhookSpec,
};

/// Fixed webhook set, for embedding and tests.
#[async_trait::async_trait]
impl WebhookCatalog for Vec<AdmissionWebhook> {
    async fn webhooks(&self, phase: Phase) -> meridian_core::MeridianResult<Vec<AdmissionWebhook>> {
        Ok(self.iter().filter(|h| h.phase == phase).cloned().collect())
    }
}
