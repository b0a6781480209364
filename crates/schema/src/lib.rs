//! Meridian resource definitions.
//!
//! - [`DefinitionRegistry`] resolves group/version/plural to a [`ResourceDefinition`],
//!   picks its storage version and checks a body's apiVersion/kind against it
//! - [`VersionControl`] converts bodies to the storage version (identity or webhook)
//! - [`validate_resource`] checks a body against the storage version's OpenAPI schema
//!   (feature `schema-validate`; a no-op otherwise)

#![forbid(unsafe_code)]

mod conversion;
mod definition;
mod registry;
mod validate;

pub use conversion::VersionControl;
pub use definition::{
    builtin_definitions, is_admission_kind, Conversion, ConversionStrategy, DefinitionSpec, DefinitionVersion, Names,
    ResourceDefinition, Scope, VersionSchema, WebhookConversion, DEFINITION_KIND, MUTATING_WEBHOOK_PLURAL,
    VALIDATING_WEBHOOK_PLURAL,
};
pub use registry::DefinitionRegistry;
pub use validate::validate_resource;
