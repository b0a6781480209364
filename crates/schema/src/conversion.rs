use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_core::{
    api_version, error_map, ErrorMap, ErrorTarget, MeridianConfig, MeridianError, MeridianResult, Resource, ResourceRef,
};
use meridian_webhook::{call_conversion, ConversionReview, WebhookClient};
use metrics::counter;
use tracing::{info, warn};

use crate::definition::{ConversionStrategy, ResourceDefinition};

/// Brings incoming resources to their definition's storage version.
#[derive(Clone)]
pub struct VersionControl {
    client: Arc<dyn WebhookClient>,
    cfg: MeridianConfig,
}

impl VersionControl {
    pub fn new(client: Arc<dyn WebhookClient>, cfg: MeridianConfig) -> Self { Self { client, cfg } }

    pub async fn convert_to_storage_version(&self, rref: &ResourceRef, def: &ResourceDefinition, resource: Resource) -> MeridianResult<Resource> {
        let storage = def.storage_version()?;
        let (_, current) = resource.group_version();
        if current == storage.name {
            return Ok(resource);
        }
        let desired = api_version(def.group(), &storage.name);
        let mut target = ErrorTarget::from(rref);
        target.version = storage.name.clone();

        let hook = match (def.spec.conversion.strategy, &def.spec.conversion.webhook) {
            (ConversionStrategy::Webhook, Some(hook)) => hook,
            _ => {
                return Err(MeridianError::ConversionUnsupported { target, from: resource.api_version.clone(), to: desired });
            }
        };
        let t0 = Instant::now();
        let timeout = hook.timeout_seconds.map(Duration::from_secs).unwrap_or_else(|| self.cfg.webhook_timeout());
        let review = ConversionReview::new(&desired, resource.to_value()?);
        let failed = |errors: ErrorMap| MeridianError::ConversionFailed { target: target.clone(), desired: desired.clone(), errors };

        let response = match call_conversion(self.client.as_ref(), &hook.url, &review, timeout).await {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %hook.url, error = %format!("{:#}", e), "conversion: webhook call failed");
                counter!("conversion_failed_total", 1u64);
                return Err(failed(error_map("WebhookFailed", format!("{:#}", e))));
            }
        };
        if !response.succeeded {
            counter!("conversion_failed_total", 1u64);
            let errors = if response.errors.is_empty() { error_map("ConversionFailed", "webhook reported failure") } else { response.errors };
            return Err(failed(errors));
        }
        let Some(converted) = response.converted_resource else {
            return Err(failed(error_map("ConversionFailed", "webhook returned no convertedResource")));
        };
        let converted = Resource::from_value(converted).map_err(|e| failed(error_map("ConversionFailed", e.to_string())))?;
        if !converted.api_version.eq_ignore_ascii_case(&desired) {
            return Err(failed(error_map("ApiVersionMismatch", format!("webhook returned {}, expected {}", converted.api_version, desired))));
        }
        info!(from = %current, to = %storage.name, resource = %rref, took_ms = %t0.elapsed().as_millis(), "conversion: ok");
        Ok(converted)
    }
}
