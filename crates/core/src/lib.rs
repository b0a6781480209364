//! Meridian core types: resources, references, watch events, label selectors and errors.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod resource;
pub mod selector;

pub use config::MeridianConfig;
pub use error::{error_map, ApiError, ErrorMap, ErrorTarget, MeridianError, MeridianResult, Missing};
pub use resource::{
    api_version, split_api_version, Gvp, Resource, ResourceMetadata, ResourceRef, CLUSTER_SCOPE,
};
pub use selector::{matches_all, parse_selectors, LabelSelector, SelectorOperator};

use serde::{Deserialize, Serialize};

/// Kind of committed change carried by a watch event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEventType {
    Created,
    Updated,
    Deleted,
}

/// Notification of a committed create/update/delete. Carries the post-mutation state
/// (pre-deletion state for `Deleted`) and nothing else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceWatchEvent {
    #[serde(rename = "type")]
    pub kind: WatchEventType,
    pub gvp: Gvp,
    pub resource: Resource,
}

/// Sub-resources addressable independently of `spec`.
pub const STATUS_SUBRESOURCE: &str = "status";

/// Group, version and plural under which resource definitions themselves are stored.
pub const DEFINITION_GROUP: &str = "meridian.io";
pub const DEFINITION_VERSION: &str = "v1";
pub const DEFINITION_PLURAL: &str = "resourcedefinitions";
/// Group of the built-in MutatingWebhook / ValidatingWebhook kinds.
pub const ADMISSION_GROUP: &str = "admission.meridian.io";

impl Gvp {
    pub fn definitions() -> Self { Gvp::new(DEFINITION_GROUP, DEFINITION_VERSION, DEFINITION_PLURAL) }

    pub fn is_definitions(&self) -> bool { self.group == DEFINITION_GROUP && self.plural == DEFINITION_PLURAL }
}

pub mod prelude {
    pub use super::{
        Gvp, LabelSelector, MeridianError, MeridianResult, Resource, ResourceMetadata, ResourceRef,
        ResourceWatchEvent, SelectorOperator, WatchEventType,
    };
}
