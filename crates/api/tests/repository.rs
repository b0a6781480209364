use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use meridian_api::{InProcRepository, ListQuery, ResourceRepository, WriteContext};
use meridian_core::{error_map, Gvp, MeridianConfig, MeridianError, Missing, Resource, ResourceRef, WatchEventType};
use meridian_patch::{Patch, PatchType};
use meridian_persist::MemoryKv;
use meridian_watch::{EventBus, WatchFilter};
use meridian_webhook::{AdmissionResponse, AdmissionReview, WebhookClient};
use serde_json::{json, Value as Json};

/// Canned replies per url; unknown urls fail like an unreachable host.
#[derive(Default)]
struct Hooks {
    replies: Mutex<HashMap<String, Json>>,
    calls: Mutex<Vec<String>>,
}

impl Hooks {
    fn admission(&self, url: &str, resp: AdmissionResponse) {
        let body = serde_json::to_value(AdmissionReview::response(resp)).unwrap();
        self.replies.lock().unwrap().insert(url.to_string(), body);
    }

    fn conversion(&self, url: &str, body: Json) { self.replies.lock().unwrap().insert(url.to_string(), body); }
}

#[async_trait::async_trait]
impl WebhookClient for Hooks {
    async fn post(&self, url: &str, _body: &Json, _timeout: Duration) -> Result<Json> {
        self.calls.lock().unwrap().push(url.to_string());
        self.replies.lock().unwrap().get(url).cloned().ok_or_else(|| anyhow::anyhow!("no webhook listening at {}", url))
    }
}

fn widgets() -> Gvp { Gvp::new("example.io", "v1", "widgets") }

fn wref(name: &str, ns: &str) -> ResourceRef { ResourceRef::new(widgets(), Some(ns), name) }

fn widget(name: &str, ns: &str, spec: Json) -> Resource {
    Resource::new("example.io/v1", "Widget", name).with_namespace(ns).with_spec(spec)
}

fn definition(versions: Json, conversion: Json) -> Resource {
    Resource::new("meridian.io/v1", "ResourceDefinition", "widgets.example.io").with_spec(json!({
        "group": "example.io",
        "names": {"kind": "Widget", "singular": "widget", "plural": "widgets"},
        "scope": "Namespaced",
        "versions": versions,
        "conversion": conversion
    }))
}

async fn repo_with(hooks: Arc<Hooks>) -> InProcRepository {
    let repo = InProcRepository::new(Arc::new(MemoryKv::new()), EventBus::started(), hooks, MeridianConfig::default());
    let def = definition(json!([{"name": "v1", "served": true, "storage": true}]), json!({}));
    repo.create(&Gvp::definitions(), def, &WriteContext::default()).await.unwrap();
    repo
}

async fn repo() -> InProcRepository { repo_with(Arc::new(Hooks::default())).await }

#[tokio::test]
async fn create_read_replace_delete_round_trip() {
    let repo = repo().await;
    let ctx = WriteContext::as_user("alice");
    let mut watch = repo.watch(WatchFilter::new(widgets())).await.unwrap();

    let body = widget("w1", "a", json!({"size": 1})).with_label("tier", "api");
    let created = repo.create(&widgets(), body.clone(), &ctx).await.unwrap();
    let read = repo.get(&wref("w1", "a")).await.unwrap();
    assert_eq!(read, created);
    assert_eq!((read.api_version.as_str(), read.kind.as_str()), ("example.io/v1", "Widget"));
    assert_eq!(read.spec, body.spec);
    assert_eq!(read.metadata.labels, body.metadata.labels);
    assert!(read.metadata.id.is_some() && read.metadata.created_at.is_some());
    assert_eq!(read.state_version(), 0);

    let replaced = repo.replace(&wref("w1", "a"), widget("w1", "a", json!({"size": 2})).with_label("tier", "api"), &ctx).await.unwrap();
    assert_eq!(replaced.resource.state_version(), 1);
    assert_eq!(replaced.resource.metadata.generation, Some(2));
    assert_eq!(replaced.diff.updates, 1);
    assert_eq!(replaced.resource.metadata.id, created.metadata.id);

    let gone = repo.delete(&wref("w1", "a"), &ctx).await.unwrap();
    assert_eq!(gone, replaced.resource);
    let err = repo.get(&wref("w1", "a")).await.unwrap_err();
    assert!(matches!(err, MeridianError::NotFound { what: Missing::Resource, .. }));

    let kinds: Vec<WatchEventType> = (0..3).map(|_| watch.try_recv().unwrap().kind).collect();
    assert_eq!(kinds, vec![WatchEventType::Created, WatchEventType::Updated, WatchEventType::Deleted]);
    assert!(watch.try_recv().is_none());
}

#[tokio::test]
async fn stale_state_version_conflicts() {
    let repo = repo().await;
    let ctx = WriteContext::default();
    repo.create(&widgets(), widget("w1", "a", json!({"size": 1})), &ctx).await.unwrap();

    let first = repo.replace(&wref("w1", "a"), widget("w1", "a", json!({"size": 2})).with_state_version(0), &ctx).await.unwrap();
    assert_eq!(first.resource.state_version(), 1);
    let err = repo.replace(&wref("w1", "a"), widget("w1", "a", json!({"size": 3})).with_state_version(0), &ctx).await.unwrap_err();
    match err {
        MeridianError::Conflict { expected, actual, target, .. } => {
            assert_eq!((expected, actual), (0, 1));
            assert_eq!(target.name.as_deref(), Some("w1"));
        }
        other => panic!("expected Conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn changes_outside_the_scope_are_not_modified() {
    let repo = repo().await;
    let ctx = WriteContext::default();
    repo.create(&widgets(), widget("w1", "a", json!({"size": 1})), &ctx).await.unwrap();
    let mut watch = repo.watch(WatchFilter::new(widgets())).await.unwrap();

    let status_only = widget("w1", "a", json!({"size": 1})).with_status(json!({"ready": true}));
    let err = repo.replace(&wref("w1", "a"), status_only.clone(), &ctx).await.unwrap_err();
    assert!(matches!(err, MeridianError::NotModified { .. }), "{:?}", err);

    let spec_patch = Patch::from_document(PatchType::JsonMergePatch, json!({"spec": {"size": 1}})).unwrap();
    let err = repo.patch(&wref("w1", "a"), &spec_patch, None, &ctx).await.unwrap_err();
    assert!(matches!(err, MeridianError::NotModified { .. }));
    assert!(watch.try_recv().is_none());

    let stored = repo.get(&wref("w1", "a")).await.unwrap();
    assert_eq!(stored.status, None);

    // the status sub-resource takes the same body; spec is untouched and the version holds
    let updated = repo.update_sub_resource(&wref("w1", "a"), "status", status_only, &ctx).await.unwrap();
    assert_eq!(updated.resource.status, Some(json!({"ready": true})));
    assert_eq!(updated.resource.state_version(), 0);
    assert_eq!(watch.try_recv().map(|e| e.kind), Some(WatchEventType::Updated));
}

#[tokio::test]
async fn patch_types_and_sub_resources() {
    let repo = repo().await;
    let ctx = WriteContext::default();
    repo.create(&widgets(), widget("w1", "a", json!({"size": 1, "tags": ["x"]})), &ctx).await.unwrap();

    let json_patch = Patch::from_document(PatchType::JsonPatch, json!([{"op": "add", "path": "/spec/tags/-", "value": "y"}])).unwrap();
    let out = repo.patch(&wref("w1", "a"), &json_patch, None, &ctx).await.unwrap();
    assert_eq!(out.resource.spec, Some(json!({"size": 1, "tags": ["x", "y"]})));
    assert_eq!(out.resource.state_version(), 1);

    // a spec patch cannot reach status
    let sneaky = Patch::from_document(PatchType::StrategicMergePatch, json!({"spec": {"size": 5}, "status": {"ready": true}})).unwrap();
    let out = repo.patch(&wref("w1", "a"), &sneaky, None, &ctx).await.unwrap();
    assert_eq!(out.resource.spec, Some(json!({"size": 5, "tags": ["x", "y"]})));
    assert_eq!(out.resource.status, None);

    let status = Patch::from_document(PatchType::JsonMergePatch, json!({"status": {"ready": true}})).unwrap();
    let out = repo.patch(&wref("w1", "a"), &status, Some("status"), &ctx).await.unwrap();
    assert_eq!(out.resource.status, Some(json!({"ready": true})));
    assert_eq!(out.resource.state_version(), 2);

    let err = repo.patch(&wref("w1", "a"), &status, Some("scale"), &ctx).await.unwrap_err();
    assert!(matches!(err, MeridianError::UnsupportedSubResource { ref sub_resource, .. } if sub_resource == "scale"));
    let err = repo.update_sub_resource(&wref("w1", "a"), "scale", widget("w1", "a", json!({})), &ctx).await.unwrap_err();
    assert_eq!(err.status(), 400);

    let bad = Patch::from_document(PatchType::JsonPatch, json!([{"op": "test", "path": "/spec/size", "value": 99}])).unwrap();
    let err = repo.patch(&wref("w1", "a"), &bad, None, &ctx).await.unwrap_err();
    assert!(matches!(err, MeridianError::InvalidFormat { .. }));
}

#[tokio::test]
async fn addressing_errors_are_client_errors() {
    let repo = repo().await;
    let ctx = WriteContext::default();

    let err = repo.create(&widgets(), Resource::new("example.io/v1", "Widget", "w1").with_spec(json!({})), &ctx).await.unwrap_err();
    assert!(matches!(err, MeridianError::InvalidFormat { .. }));

    let err = repo.create(&widgets(), Resource::new("example.io/v1", "Gadget", "w1").with_namespace("a"), &ctx).await.unwrap_err();
    assert!(matches!(err, MeridianError::WrongApi { .. }));

    let err = repo.get(&ResourceRef::new(Gvp::new("example.io", "v1", "gadgets"), Some("a"), "g")).await.unwrap_err();
    assert!(matches!(err, MeridianError::NotFound { what: Missing::Definition, .. }));

    repo.create(&widgets(), widget("w1", "a", json!({})), &ctx).await.unwrap();
    let err = repo.create(&widgets(), widget("w1", "a", json!({})), &ctx).await.unwrap_err();
    assert_eq!(err.status(), 409);
    let err = repo.replace(&wref("w1", "a"), widget("w2", "a", json!({"size": 1})), &ctx).await.unwrap_err();
    assert!(matches!(err, MeridianError::InvalidFormat { .. }));

    let bad_def = Resource::new("meridian.io/v1", "ResourceDefinition", "wrong-name").with_spec(json!({
        "group": "example.io", "names": {"kind": "Gadget", "plural": "gadgets"}, "versions": []
    }));
    let err = repo.create(&Gvp::definitions(), bad_def, &ctx).await.unwrap_err();
    assert!(matches!(err, MeridianError::InvalidFormat { ref errors, .. } if errors.contains_key("InvalidDefinition")));
}

fn webhook(kind: &str, name: &str, url: &str, ops: &[&str]) -> Resource {
    Resource::new("admission.meridian.io/v1", kind, name).with_spec(json!({
        "clientConfig": {"url": url},
        "rules": [{"operations": ops, "apiGroups": ["example.io"], "apiVersions": ["*"], "kinds": ["Widget"]}]
    }))
}

#[tokio::test]
async fn admission_mutates_and_denies_writes() {
    let hooks = Arc::new(Hooks::default());
    let repo = repo_with(hooks.clone()).await;
    let ctx = WriteContext::as_user("bob");
    let mutating = Gvp::new("admission.meridian.io", "v1", "mutatingwebhooks");
    let validating = Gvp::new("admission.meridian.io", "v1", "validatingwebhooks");

    hooks.admission("http://label", AdmissionResponse::allow("").with_patch(PatchType::JsonMergePatch, &json!({"metadata": {"labels": {"owner": "platform"}}})));
    hooks.admission("http://deny-delete", AdmissionResponse::deny("", error_map("Protected", "widgets cannot be deleted")));
    repo.create(&mutating, webhook("MutatingWebhook", "label", "http://label", &["Create"]), &ctx).await.unwrap();
    repo.create(&validating, webhook("ValidatingWebhook", "protect", "http://deny-delete", &["Delete"]), &ctx).await.unwrap();
    // webhook writes are not themselves reviewed
    assert!(hooks.calls.lock().unwrap().is_empty());

    let created = repo.create(&widgets(), widget("w1", "a", json!({"size": 1})), &ctx).await.unwrap();
    assert_eq!(created.metadata.labels.get("owner").map(String::as_str), Some("platform"));

    let err = repo.delete(&wref("w1", "a"), &ctx).await.unwrap_err();
    match &err {
        MeridianError::AdmissionDenied { errors, .. } => assert_eq!(errors["Protected"].len(), 1),
        other => panic!("expected AdmissionDenied, got {:?}", other),
    }
    assert_eq!(err.status(), 403);
    assert!(repo.get(&wref("w1", "a")).await.is_ok());
    assert_eq!(*hooks.calls.lock().unwrap(), vec!["http://label", "http://deny-delete"]);

    let bad = Resource::new("admission.meridian.io/v1", "MutatingWebhook", "broken").with_spec(json!({"rules": []}));
    let err = repo.create(&mutating, bad, &ctx).await.unwrap_err();
    assert!(matches!(err, MeridianError::InvalidFormat { ref errors, .. } if errors.contains_key("InvalidWebhook")));
}

#[tokio::test]
async fn writes_convert_to_the_storage_version() {
    let hooks = Arc::new(Hooks::default());
    let repo = InProcRepository::new(Arc::new(MemoryKv::new()), EventBus::started(), hooks.clone(), MeridianConfig::default());
    let ctx = WriteContext::default();
    let def = definition(
        json!([{"name": "v1", "served": true, "storage": false}, {"name": "v2", "served": true, "storage": true}]),
        json!({"strategy": "Webhook", "webhook": {"url": "http://convert"}}),
    );
    repo.create(&Gvp::definitions(), def, &ctx).await.unwrap();
    let converted = Resource::new("example.io/v2", "Widget", "w1").with_namespace("a").with_spec(json!({"dimensions": {"size": 1}}));
    hooks.conversion("http://convert", json!({"succeeded": true, "convertedResource": converted.to_value().unwrap()}));
    let mut watch = repo.watch(WatchFilter::new(widgets())).await.unwrap();

    let stored = repo.create(&widgets(), widget("w1", "a", json!({"size": 1})), &ctx).await.unwrap();
    assert_eq!(stored.api_version, "example.io/v2");
    assert_eq!(stored.spec, converted.spec);
    // reads through either served version reach the stored form
    assert_eq!(repo.get(&wref("w1", "a")).await.unwrap(), stored);
    assert_eq!(repo.get(&ResourceRef::new(Gvp::new("example.io", "v2", "widgets"), Some("a"), "w1")).await.unwrap(), stored);
    let event = watch.try_recv().unwrap();
    assert_eq!(event.gvp, Gvp::new("example.io", "v2", "widgets"));

    let page = repo.list(ListQuery::new(widgets()).in_namespace("a")).await.unwrap();
    assert_eq!(page.items, vec![stored]);
}

#[tokio::test]
async fn namespace_delete_and_listing() {
    let repo = repo().await;
    let ctx = WriteContext::default();
    for (name, ns, env) in [("w1", "a", "prod"), ("w2", "a", "dev"), ("w3", "b", "prod")] {
        repo.create(&widgets(), widget(name, ns, json!({})).with_label("env", env), &ctx).await.unwrap();
    }
    let prod = repo
        .list(ListQuery::new(widgets()).with_selectors(meridian_core::parse_selectors("env=prod").unwrap()).order_by("name", true))
        .await
        .unwrap();
    let names: Vec<&str> = prod.items.iter().map(|r| r.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["w3", "w1"]);

    let deleted = repo.delete_namespace("a", &ctx).await.unwrap();
    assert_eq!(deleted.len(), 2);
    let left = repo.list(ListQuery::new(widgets())).await.unwrap();
    assert_eq!(left.items.len(), 1);
    assert_eq!(left.items[0].metadata.namespace.as_deref(), Some("b"));
}
