use std::time::Instant;

use meridian_core::{api_version, ErrorTarget, Gvp, MeridianError, MeridianResult, Missing, Resource};
use meridian_store::StorageEngine;
use tracing::debug;

use crate::definition::{builtin_definitions, DefinitionVersion, ResourceDefinition};

/// Resolves group/version/plural to a definition: built-ins first, then stored definitions.
#[derive(Clone)]
pub struct DefinitionRegistry {
    store: StorageEngine,
    builtins: Vec<ResourceDefinition>,
}

impl DefinitionRegistry {
    pub fn new(store: StorageEngine) -> Self { Self { store, builtins: builtin_definitions() } }

    pub async fn resolve(&self, group: &str, version: &str, plural: &str) -> MeridianResult<ResourceDefinition> {
        let t0 = Instant::now();
        let target = ErrorTarget::kind(&Gvp::new(group, version, plural));
        let def = match self.builtins.iter().find(|d| d.group().eq_ignore_ascii_case(group) && d.plural() == plural) {
            Some(d) => d.clone(),
            None => match self.store.definition(plural, group).await? {
                Some(r) => ResourceDefinition::from_resource(&r)?,
                None => return Err(MeridianError::not_found(Missing::Definition, target)),
            },
        };
        if def.served(version).is_none() {
            return Err(MeridianError::not_found(Missing::Definition, target));
        }
        debug!(group = %group, version = %version, plural = %plural, took_ms = %t0.elapsed().as_millis(), "registry: resolved");
        Ok(def)
    }

    pub fn storage_version(&self, def: &ResourceDefinition) -> MeridianResult<DefinitionVersion> { def.storage_version() }

    /// The body must declare the addressed group/version and the definition's kind.
    /// Comparison is case-insensitive.
    pub fn validate_kind(&self, resource: &Resource, def: &ResourceDefinition, group: &str, version: &str) -> MeridianResult<()> {
        let expected_api_version = api_version(group, version);
        let api_ok = resource.api_version.eq_ignore_ascii_case(&expected_api_version);
        let kind_ok = resource.kind.eq_ignore_ascii_case(def.kind());
        if api_ok && kind_ok {
            return Ok(());
        }
        Err(MeridianError::WrongApi {
            expected_api_version,
            expected_kind: def.kind().to_string(),
            actual_api_version: resource.api_version.clone(),
            actual_kind: resource.kind.clone(),
        })
    }
}
