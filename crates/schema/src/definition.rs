use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use meridian_core::{
    api_version, error_map, Gvp, MeridianError, MeridianResult, Resource, ADMISSION_GROUP, DEFINITION_GROUP,
    DEFINITION_PLURAL, DEFINITION_VERSION,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Names {
    pub kind: String,
    #[serde(default)]
    pub singular: String,
    pub plural: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Scope {
    Cluster,
    #[default]
    Namespaced,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionSchema {
    #[serde(rename = "openAPIV3Schema")]
    pub open_api_v3_schema: Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefinitionVersion {
    pub name: String,
    #[serde(default = "default_true")]
    pub served: bool,
    #[serde(default)]
    pub storage: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<VersionSchema>,
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConversionStrategy {
    #[default]
    None,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConversion {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Conversion {
    #[serde(default)]
    pub strategy: ConversionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConversion>,
}

/// `spec` of a ResourceDefinition resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DefinitionSpec {
    #[serde(default)]
    pub group: String,
    pub names: Names,
    /// Legacy single-version form, used when `versions` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<DefinitionVersion>,
    #[serde(default)]
    pub conversion: Conversion,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    /// `{plural}.{group}` by convention.
    pub name: String,
    pub spec: DefinitionSpec,
}

pub const DEFINITION_KIND: &str = "ResourceDefinition";

impl ResourceDefinition {
    pub fn from_resource(r: &Resource) -> MeridianResult<Self> {
        let spec = r.spec.clone().unwrap_or(Json::Null);
        let spec: DefinitionSpec = serde_json::from_value(spec).map_err(|e| MeridianError::InvalidFormat {
            reason: format!("definition {} has a malformed spec", r.metadata.name),
            errors: error_map("InvalidDefinition", e.to_string()),
        })?;
        Ok(Self { name: r.metadata.name.clone(), spec })
    }

    pub fn to_resource(&self) -> MeridianResult<Resource> {
        let spec = serde_json::to_value(&self.spec).map_err(|e| MeridianError::Backend(e.into()))?;
        Ok(Resource::new(api_version(DEFINITION_GROUP, DEFINITION_VERSION), DEFINITION_KIND, self.name.clone()).with_spec(spec))
    }

    pub fn kind(&self) -> &str { &self.spec.names.kind }

    pub fn group(&self) -> &str { &self.spec.group }

    pub fn plural(&self) -> &str { &self.spec.names.plural }

    pub fn is_namespaced(&self) -> bool { self.spec.scope == Scope::Namespaced }

    pub fn gvp(&self, version: &str) -> Gvp { Gvp::new(self.spec.group.clone(), version, self.spec.names.plural.clone()) }

    /// Declared versions, or the legacy `version` as a single served storage version.
    pub fn versions(&self) -> Vec<DefinitionVersion> {
        if !self.spec.versions.is_empty() {
            return self.spec.versions.clone();
        }
        match &self.spec.version {
            Some(v) => vec![DefinitionVersion { name: v.clone(), served: true, storage: true, schema: None }],
            None => Vec::new(),
        }
    }

    pub fn served(&self, version: &str) -> Option<DefinitionVersion> {
        self.versions().into_iter().find(|v| v.served && v.name == version)
    }

    /// The one version marked `storage`.
    pub fn storage_version(&self) -> MeridianResult<DefinitionVersion> {
        let mut storage: Vec<DefinitionVersion> = self.versions().into_iter().filter(|v| v.storage).collect();
        match storage.len() {
            1 => Ok(storage.remove(0)),
            n => Err(MeridianError::InvalidFormat {
                reason: format!("definition {} must mark exactly one storage version, found {}", self.name, n),
                errors: error_map("StorageVersion", format!("{} versions marked storage", n)),
            }),
        }
    }

    pub fn storage_gvp(&self) -> MeridianResult<Gvp> { Ok(self.gvp(&self.storage_version()?.name)) }

    /// Checks applied before a definition is stored.
    pub fn validate(&self) -> MeridianResult<()> {
        let mut errors = meridian_core::ErrorMap::new();
        let mut push = |code: &str, msg: String| errors.entry(code.to_string()).or_insert_with(Vec::new).push(msg);
        if self.spec.names.kind.is_empty() { push("InvalidDefinition", "names.kind is required".into()); }
        if self.spec.names.plural.is_empty() { push("InvalidDefinition", "names.plural is required".into()); }
        if self.spec.names.plural != self.spec.names.plural.to_lowercase() {
            push("InvalidDefinition", "names.plural must be lowercase".into());
        }
        let expected = format!("{}.{}", self.spec.names.plural, self.spec.group);
        if !self.spec.names.plural.is_empty() && self.name != expected {
            push("InvalidDefinition", format!("metadata.name must be {}", expected));
        }
        if self.versions().is_empty() { push("InvalidDefinition", "at least one version is required".into()); }
        if self.spec.conversion.strategy == ConversionStrategy::Webhook && self.spec.conversion.webhook.is_none() {
            push("InvalidDefinition", "conversion.webhook is required for the Webhook strategy".into());
        }
        if let Err(MeridianError::InvalidFormat { errors: e, .. }) = self.storage_version() {
            for (k, v) in e { errors.entry(k).or_default().extend(v); }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MeridianError::InvalidFormat { reason: format!("definition {} is invalid", self.name), errors })
        }
    }
}

fn builtin(group: &str, kind: &str, plural: &str) -> ResourceDefinition {
    ResourceDefinition {
        name: format!("{}.{}", plural, group),
        spec: DefinitionSpec {
            group: group.to_string(),
            names: Names { kind: kind.to_string(), singular: kind.to_lowercase(), plural: plural.to_string(), short_names: Vec::new() },
            version: None,
            scope: Scope::Cluster,
            versions: vec![DefinitionVersion { name: "v1".into(), served: true, storage: true, schema: None }],
            conversion: Conversion::default(),
        },
    }
}

pub const MUTATING_WEBHOOK_PLURAL: &str = "mutatingwebhooks";
pub const VALIDATING_WEBHOOK_PLURAL: &str = "validatingwebhooks";

/// Definitions that always resolve and are never stored.
pub fn builtin_definitions() -> Vec<ResourceDefinition> {
    vec![
        builtin(DEFINITION_GROUP, DEFINITION_KIND, DEFINITION_PLURAL),
        builtin(ADMISSION_GROUP, "MutatingWebhook", MUTATING_WEBHOOK_PLURAL),
        builtin(ADMISSION_GROUP, "ValidatingWebhook", VALIDATING_WEBHOOK_PLURAL),
    ]
}

pub fn is_admission_kind(gvp: &Gvp) -> bool { gvp.group == ADMISSION_GROUP }
