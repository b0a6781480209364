//! OpenAPI v3 schema checks against a definition's storage version.

use meridian_core::{MeridianResult, Resource};

use crate::definition::ResourceDefinition;

/// Validate `resource` against the storage version's `openAPIV3Schema`, when one is declared.
#[cfg(feature = "schema-validate")]
pub fn validate_resource(def: &ResourceDefinition, resource: &Resource) -> MeridianResult<()> {
    use jsonschema::{Draft, JSONSchema};
    use meridian_core::{error_map, ErrorMap, MeridianError};

    let Some(schema) = def.storage_version()?.schema.map(|s| s.open_api_v3_schema) else { return Ok(()) };
    let compiled = JSONSchema::options().with_draft(Draft::Draft7).compile(&schema).map_err(|e| MeridianError::InvalidFormat {
        reason: format!("definition {} carries an unusable schema", def.name),
        errors: error_map("InvalidSchema", e.to_string()),
    })?;
    let instance = resource.to_value()?;
    let mut errors = ErrorMap::new();
    if let Err(violations) = compiled.validate(&instance) {
        for v in violations {
            errors.entry("SchemaViolation".into()).or_default().push(format!("{}: {}", v.instance_path, v));
        }
    }
    if errors.is_empty() {
        return Ok(());
    }
    tracing::debug!(definition = %def.name, violations = errors["SchemaViolation"].len(), "schema: rejected");
    Err(MeridianError::InvalidFormat { reason: format!("{} {} does not match its schema", def.kind(), resource.metadata.name), errors })
}

#[cfg(not(feature = "schema-validate"))]
pub fn validate_resource(_def: &ResourceDefinition, _resource: &Resource) -> MeridianResult<()> { Ok(()) }

#[cfg(all(test, feature = "schema-validate"))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn violations_are_reported_per_path() {
        let def = ResourceDefinition::from_resource(&Resource::new("meridian.io/v1", "ResourceDefinition", "widgets.example.io").with_spec(json!({
            "group": "example.io",
            "names": {"kind": "Widget", "plural": "widgets"},
            "versions": [{"name": "v1", "storage": true, "schema": {"openAPIV3Schema": {
                "type": "object",
                "properties": {"spec": {"type": "object", "properties": {"size": {"type": "integer"}}, "required": ["size"]}}
            }}}]
        }))).unwrap();
        let ok = Resource::new("example.io/v1", "Widget", "w").with_spec(json!({"size": 3}));
        validate_resource(&def, &ok).unwrap();
        let bad = Resource::new("example.io/v1", "Widget", "w").with_spec(json!({"size": "big"}));
        let err = validate_resource(&def, &bad).unwrap_err();
        let meridian_core::MeridianError::InvalidFormat { errors, .. } = err else { panic!("expected invalid") };
        assert!(errors["SchemaViolation"][0].contains("/spec/size"), "{:?}", errors);
    }
}
