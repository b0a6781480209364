//! Meridian resource repository façade (in-process).
//!
//! [`ResourceRepository`] is the surface outer layers (CLI, a future HTTP adapter)
//! depend on. [`InProcRepository`] wires the pieces together for every write:
//! definition registry → version control → scoped diff → admission → storage engine,
//! and the storage engine publishes the watch event once the write has committed.
//! Reads go straight to the storage engine.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use meridian_admission::{AdmissionOutcome, AdmissionPipeline, AdmissionWebhook, Phase, ReviewInput, StoredWebhooks};
use meridian_core::{Gvp, MeridianConfig, MeridianError, MeridianResult, Resource, ResourceRef, STATUS_SUBRESOURCE};
use meridian_patch::{apply_json_patch, scoped_diff, DiffSummary, Patch, SCOPE_ANNOTATIONS, SCOPE_LABELS, SCOPE_SPEC, SCOPE_STATUS};
use meridian_persist::KvBackend;
use meridian_schema::{
    is_admission_kind, validate_resource, DefinitionRegistry, ResourceDefinition, VersionControl, MUTATING_WEBHOOK_PLURAL,
};
use meridian_store::StorageEngine;
use meridian_watch::{EventBus, WatchFilter, WatchStream};
use meridian_webhook::{Operation, UserInfo, WebhookClient};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use meridian_store::{CancellationToken, ListQuery, Page};

/// Fields a spec replace or patch may touch.
const MAIN_SCOPES: [&str; 3] = [SCOPE_SPEC, SCOPE_LABELS, SCOPE_ANNOTATIONS];
const STATUS_SCOPES: [&str; 1] = [SCOPE_STATUS];

/// Caller identity and cancellation for one operation.
#[derive(Debug, Clone, Default)]
pub struct WriteContext {
    pub user: UserInfo,
    pub cancel: CancellationToken,
}

impl WriteContext {
    pub fn as_user(username: &str) -> Self {
        Self { user: UserInfo { username: username.to_string(), groups: Vec::new() }, cancel: CancellationToken::new() }
    }
}

/// Stored state after a replace/patch, with the size of the applied change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub resource: Resource,
    pub diff: DiffSummary,
}

/// Resource repository surface.
#[async_trait::async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Store a new resource addressed by `gvp`; the body's apiVersion/kind must match.
    async fn create(&self, gvp: &Gvp, resource: Resource, ctx: &WriteContext) -> MeridianResult<Resource>;

    async fn get(&self, reference: &ResourceRef) -> MeridianResult<Resource>;

    async fn list(&self, query: ListQuery) -> MeridianResult<Page>;

    /// Replace `spec`, labels and annotations. A `stateVersion` in the body is checked
    /// against the stored one.
    async fn replace(&self, reference: &ResourceRef, resource: Resource, ctx: &WriteContext) -> MeridianResult<WriteResult>;

    /// Patch the stored state. Without a sub-resource only `spec`, labels and annotations
    /// change; with `status` only `status` does.
    async fn patch(&self, reference: &ResourceRef, patch: &Patch, sub_resource: Option<&str>, ctx: &WriteContext) -> MeridianResult<WriteResult>;

    /// Replace one sub-resource (only `status` is recognised).
    async fn update_sub_resource(&self, reference: &ResourceRef, sub_resource: &str, resource: Resource, ctx: &WriteContext) -> MeridianResult<WriteResult>;

    /// Returns the state before deletion.
    async fn delete(&self, reference: &ResourceRef, ctx: &WriteContext) -> MeridianResult<Resource>;

    /// Delete every resource in a namespace, across kinds.
    async fn delete_namespace(&self, namespace: &str, ctx: &WriteContext) -> MeridianResult<Vec<Resource>>;

    /// Live events published after this call; no replay.
    async fn watch(&self, filter: WatchFilter) -> MeridianResult<WatchStream>;
}

/// A kind resolved for one call: the definition plus the gvp it is stored under.
struct Resolved {
    def: ResourceDefinition,
    storage: Gvp,
}

impl Resolved {
    /// Storage address of a resource, applying the definition's scope.
    fn locate(&self, namespace: Option<&str>, name: &str) -> MeridianResult<ResourceRef> {
        let ns = if self.def.is_namespaced() {
            match namespace.filter(|s| !s.is_empty()) {
                Some(ns) => Some(ns),
                None => return Err(MeridianError::invalid(format!("{} is namespaced; metadata.namespace is required", self.def.kind()))),
            }
        } else {
            None
        };
        Ok(ResourceRef::new(self.storage.clone(), ns, name))
    }
}

fn record<T>(op: &'static str, t0: Instant, res: &MeridianResult<T>) {
    let outcome = match res {
        Ok(_) => "ok",
        Err(e) => e.title(),
    };
    counter!("repo_ops_total", 1u64, "op" => op, "outcome" => outcome);
    histogram!("repo_op_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    match res {
        Err(e) if !e.is_expected() => warn!(op, error = %e, took_ms = %t0.elapsed().as_millis(), "repo: failed"),
        Err(e) => debug!(op, outcome = e.title(), took_ms = %t0.elapsed().as_millis(), "repo: rejected"),
        Ok(_) => debug!(op, took_ms = %t0.elapsed().as_millis(), "repo: ok"),
    }
}

/// In-process repository over a key-value backend.
#[derive(Clone)]
pub struct InProcRepository {
    store: StorageEngine,
    registry: DefinitionRegistry,
    versions: VersionControl,
    admission: AdmissionPipeline,
}

impl InProcRepository {
    /// Webhooks are discovered from the store itself.
    pub fn new(kv: Arc<dyn KvBackend>, bus: EventBus, client: Arc<dyn WebhookClient>, cfg: MeridianConfig) -> Self {
        let store = StorageEngine::new(kv, bus, cfg.clone());
        let catalog = Arc::new(StoredWebhooks::new(store.clone()));
        Self {
            registry: DefinitionRegistry::new(store.clone()),
            versions: VersionControl::new(client.clone(), cfg.clone()),
            admission: AdmissionPipeline::new(catalog, client, cfg),
            store,
        }
    }

    /// Swap the admission pipeline, e.g. for a fixed webhook set.
    pub fn with_admission(mut self, admission: AdmissionPipeline) -> Self {
        self.admission = admission;
        self
    }

    pub fn store(&self) -> &StorageEngine { &self.store }

    async fn resolve(&self, gvp: &Gvp) -> MeridianResult<Resolved> {
        let def = self.registry.resolve(&gvp.group, &gvp.version, &gvp.plural).await?;
        let storage = def.storage_gvp()?;
        Ok(Resolved { def, storage })
    }

    /// Built-in kinds carry typed specs; reject malformed ones before they are stored.
    fn check_builtin(gvp: &Gvp, resource: &Resource) -> MeridianResult<()> {
        if gvp.is_definitions() {
            return ResourceDefinition::from_resource(resource)?.validate();
        }
        if is_admission_kind(gvp) {
            let phase = if gvp.plural == MUTATING_WEBHOOK_PLURAL { Phase::Mutating } else { Phase::Validating };
            AdmissionWebhook::from_resource(resource, phase)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn admit(
        &self,
        operation: Operation,
        target: &ResourceRef,
        kind: &str,
        sub_resource: Option<&str>,
        actual: Option<Resource>,
        original: Option<Resource>,
        ctx: &WriteContext,
    ) -> MeridianResult<Option<Resource>> {
        if is_admission_kind(&target.gvp) {
            return Ok(actual);
        }
        let input = ReviewInput {
            operation,
            target: target.clone(),
            kind: kind.to_string(),
            sub_resource: sub_resource.map(String::from),
            actual,
            original,
            user: ctx.user.clone(),
        };
        match self.admission.review(&input).await? {
            AdmissionOutcome::Allowed(state) => Ok(state),
            AdmissionOutcome::Denied(errors) => Err(MeridianError::AdmissionDenied { target: target.into(), errors }),
        }
    }

    /// Shared tail of replace / patch / sub-resource update: restrict the change to
    /// `scopes`, run admission on the merged state and store it.
    #[allow(clippy::too_many_arguments)]
    async fn write_scoped(
        &self,
        res: &Resolved,
        rref: &ResourceRef,
        current: Resource,
        updated: serde_json::Value,
        scopes: &[&str],
        sub_resource: Option<&str>,
        ctx: &WriteContext,
    ) -> MeridianResult<WriteResult> {
        let before = current.to_value()?;
        let ops = scoped_diff(&before, &updated, scopes);
        if ops.is_empty() {
            return Err(MeridianError::NotModified { target: rref.into() });
        }
        let summary = DiffSummary::from_ops(&ops);
        let merged = Resource::from_value(apply_json_patch(&before, &ops)?)?;
        let expected = current.state_version();
        let admitted = self
            .admit(Operation::Update, rref, res.def.kind(), sub_resource, Some(merged.clone()), Some(current), ctx)
            .await?
            .unwrap_or(merged);
        validate_resource(&res.def, &admitted)?;
        Self::check_builtin(&rref.gvp, &admitted)?;
        let stored = self.store.update(&rref.gvp, admitted, Some(expected), &ctx.cancel).await?;
        Ok(WriteResult { resource: stored, diff: summary })
    }

    async fn do_create(&self, gvp: &Gvp, mut resource: Resource, ctx: &WriteContext) -> MeridianResult<Resource> {
        let res = self.resolve(gvp).await?;
        self.registry.validate_kind(&resource, &res.def, &gvp.group, &gvp.version)?;
        let rref = res.locate(resource.metadata.namespace.as_deref(), &resource.metadata.name)?;
        resource.metadata.namespace = rref.namespace.clone();
        Self::check_builtin(&res.storage, &resource)?;

        let converted = self.versions.convert_to_storage_version(&rref, &res.def, resource).await?;
        let admitted = self
            .admit(Operation::Create, &rref, res.def.kind(), None, Some(converted.clone()), None, ctx)
            .await?
            .unwrap_or(converted);
        validate_resource(&res.def, &admitted)?;
        self.store.create(&res.storage, admitted, &ctx.cancel).await
    }

    async fn do_replace(&self, reference: &ResourceRef, mut resource: Resource, ctx: &WriteContext) -> MeridianResult<WriteResult> {
        let res = self.resolve(&reference.gvp).await?;
        self.registry.validate_kind(&resource, &res.def, &reference.gvp.group, &reference.gvp.version)?;
        let rref = res.locate(reference.namespace.as_deref(), &reference.name)?;
        check_identity(&rref, &mut resource)?;
        let caller_version = resource.metadata.state_version;

        let converted = self.versions.convert_to_storage_version(&rref, &res.def, resource).await?;
        let current = self.store.get(&rref).await?;
        if let Some(e) = caller_version {
            if e != current.state_version() {
                return Err(MeridianError::conflict((&rref).into(), e, current.state_version()));
            }
        }
        self.write_scoped(&res, &rref, current, converted.to_value()?, &MAIN_SCOPES, None, ctx).await
    }

    async fn do_patch(&self, reference: &ResourceRef, patch: &Patch, sub_resource: Option<&str>, ctx: &WriteContext) -> MeridianResult<WriteResult> {
        let res = self.resolve(&reference.gvp).await?;
        let rref = res.locate(reference.namespace.as_deref(), &reference.name)?;
        let scopes: &[&str] = match sub_resource {
            None => &MAIN_SCOPES,
            Some(STATUS_SUBRESOURCE) => &STATUS_SCOPES,
            Some(other) => return Err(MeridianError::UnsupportedSubResource { target: (&rref).into(), sub_resource: other.to_string() }),
        };
        let current = self.store.get(&rref).await?;
        let patched = patch.apply(&current.to_value()?)?;
        self.write_scoped(&res, &rref, current, patched, scopes, sub_resource, ctx).await
    }

    async fn do_update_sub_resource(&self, reference: &ResourceRef, sub_resource: &str, mut resource: Resource, ctx: &WriteContext) -> MeridianResult<WriteResult> {
        let res = self.resolve(&reference.gvp).await?;
        let rref = res.locate(reference.namespace.as_deref(), &reference.name)?;
        if sub_resource != STATUS_SUBRESOURCE {
            return Err(MeridianError::UnsupportedSubResource { target: (&rref).into(), sub_resource: sub_resource.to_string() });
        }
        self.registry.validate_kind(&resource, &res.def, &reference.gvp.group, &reference.gvp.version)?;
        check_identity(&rref, &mut resource)?;
        let converted = self.versions.convert_to_storage_version(&rref, &res.def, resource).await?;
        let current = self.store.get(&rref).await?;
        self.write_scoped(&res, &rref, current, converted.to_value()?, &STATUS_SCOPES, Some(sub_resource), ctx).await
    }

    async fn do_delete(&self, reference: &ResourceRef, ctx: &WriteContext) -> MeridianResult<Resource> {
        let res = self.resolve(&reference.gvp).await?;
        let rref = res.locate(reference.namespace.as_deref(), &reference.name)?;
        let current = self.store.get(&rref).await?;
        self.admit(Operation::Delete, &rref, res.def.kind(), None, None, Some(current), ctx).await?;
        self.store.delete(&rref, &ctx.cancel).await
    }
}

/// The body may omit name/namespace; when present they must match the address.
fn check_identity(rref: &ResourceRef, resource: &mut Resource) -> MeridianResult<()> {
    let m = &mut resource.metadata;
    if m.name.is_empty() {
        m.name = rref.name.clone();
    }
    if m.name != rref.name {
        return Err(MeridianError::invalid(format!("metadata.name {:?} does not match the addressed name {:?}", m.name, rref.name)));
    }
    match (&m.namespace, &rref.namespace) {
        (Some(a), Some(b)) if a != b => {
            return Err(MeridianError::invalid(format!("metadata.namespace {:?} does not match the addressed namespace {:?}", a, b)));
        }
        _ => m.namespace = rref.namespace.clone(),
    }
    Ok(())
}

#[async_trait::async_trait]
impl ResourceRepository for InProcRepository {
    async fn create(&self, gvp: &Gvp, resource: Resource, ctx: &WriteContext) -> MeridianResult<Resource> {
        let t0 = Instant::now();
        info!(gvp = %gvp, ns = ?resource.metadata.namespace, name = %resource.metadata.name, "repo: create start");
        let res = self.do_create(gvp, resource, ctx).await;
        record("create", t0, &res);
        res
    }

    async fn get(&self, reference: &ResourceRef) -> MeridianResult<Resource> {
        let t0 = Instant::now();
        let res = match self.resolve(&reference.gvp).await {
            Ok(r) => match r.locate(reference.namespace.as_deref(), &reference.name) {
                Ok(rref) => self.store.get(&rref).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        record("get", t0, &res);
        res
    }

    async fn list(&self, mut query: ListQuery) -> MeridianResult<Page> {
        let t0 = Instant::now();
        let res = match self.resolve(&query.gvp).await {
            Ok(r) => {
                query.gvp = r.storage;
                if !r.def.is_namespaced() {
                    query.namespace = None;
                }
                self.store.list(&query).await
            }
            Err(e) => Err(e),
        };
        record("list", t0, &res);
        res
    }

    async fn replace(&self, reference: &ResourceRef, resource: Resource, ctx: &WriteContext) -> MeridianResult<WriteResult> {
        let t0 = Instant::now();
        info!(resource = %reference, "repo: replace start");
        let res = self.do_replace(reference, resource, ctx).await;
        record("replace", t0, &res);
        res
    }

    async fn patch(&self, reference: &ResourceRef, patch: &Patch, sub_resource: Option<&str>, ctx: &WriteContext) -> MeridianResult<WriteResult> {
        let t0 = Instant::now();
        info!(resource = %reference, patch_type = %patch.patch_type(), sub_resource = ?sub_resource, "repo: patch start");
        let res = self.do_patch(reference, patch, sub_resource, ctx).await;
        record("patch", t0, &res);
        res
    }

    async fn update_sub_resource(&self, reference: &ResourceRef, sub_resource: &str, resource: Resource, ctx: &WriteContext) -> MeridianResult<WriteResult> {
        let t0 = Instant::now();
        info!(resource = %reference, sub_resource = %sub_resource, "repo: sub-resource update start");
        let res = self.do_update_sub_resource(reference, sub_resource, resource, ctx).await;
        record("update_sub_resource", t0, &res);
        res
    }

    async fn delete(&self, reference: &ResourceRef, ctx: &WriteContext) -> MeridianResult<Resource> {
        let t0 = Instant::now();
        info!(resource = %reference, "repo: delete start");
        let res = self.do_delete(reference, ctx).await;
        record("delete", t0, &res);
        res
    }

    async fn delete_namespace(&self, namespace: &str, ctx: &WriteContext) -> MeridianResult<Vec<Resource>> {
        let t0 = Instant::now();
        info!(ns = %namespace, "repo: delete namespace start");
        let res = self.store.delete_namespace(namespace, &ctx.cancel).await;
        record("delete_namespace", t0, &res);
        res
    }

    async fn watch(&self, mut filter: WatchFilter) -> MeridianResult<WatchStream> {
        let t0 = Instant::now();
        let res = match self.resolve(&filter.gvp).await {
            Ok(r) => {
                filter.gvp = r.storage;
                if !r.def.is_namespaced() {
                    filter.namespace = None;
                }
                self.store.watch(filter)
            }
            Err(e) => Err(e),
        };
        record("watch", t0, &res);
        res
    }
}

