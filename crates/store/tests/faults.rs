#![forbid(unsafe_code)]

//! Failure paths through a backend wrapper that fails (or cancels) on chosen calls.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use anyhow::{anyhow, Result};
use meridian_core::{ApiError, Gvp, LabelSelector, MeridianConfig, MeridianError, Resource, ResourceRef, WatchEventType};
use meridian_persist::{KvBackend, MemoryKv};
use meridian_store::{CancellationToken, ListQuery, StorageEngine};
use meridian_watch::{EventBus, WatchFilter};
use serde_json::json;

enum Action { Fail, Cancel(CancellationToken) }

struct Rule {
    op: &'static str,
    key_contains: String,
    /// Matching calls let through before the rule fires.
    skip: usize,
    /// Times the rule fires once armed.
    times: usize,
    action: Action,
}

#[derive(Default)]
struct FaultyKv {
    inner: MemoryKv,
    rules: Mutex<Vec<Rule>>,
}

impl FaultyKv {
    fn rule(&self, op: &'static str, key_contains: &str, skip: usize, times: usize, action: Action) {
        self.rules.lock().unwrap().push(Rule { op, key_contains: key_contains.into(), skip, times, action });
    }

    fn check(&self, op: &str, key: &str) -> Result<()> {
        let mut rules = self.rules.lock().unwrap();
        for r in rules.iter_mut() {
            if r.op != op || !key.contains(&r.key_contains) || r.times == 0 { continue; }
            if r.skip > 0 { r.skip -= 1; continue; }
            r.times -= 1;
            match &r.action {
                Action::Fail => return Err(anyhow!("injected {} failure on {}", op, key)),
                Action::Cancel(t) => t.cancel(),
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl KvBackend for FaultyKv {
    async fn get(&self, key: &str) -> Result<Option<String>> { self.inner.get(key).await }
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: Option<&str>) -> Result<bool> {
        self.check("cas", key)?;
        self.inner.compare_and_swap(key, expected, value).await
    }
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> { self.inner.hget(key, field).await }
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<Option<String>> {
        self.check("hset", key)?;
        self.inner.hset(key, field, value).await
    }
    async fn hdel(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.check("hdel", key)?;
        self.inner.hdel(key, field).await
    }
    async fn hscan(&self, key: &str, prefix: &str) -> Result<Vec<(String, String)>> { self.inner.hscan(key, prefix).await }
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<Option<f64>> {
        self.check("zadd", key)?;
        self.inner.zadd(key, member, score).await
    }
    async fn zrem(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.check("zrem", key)?;
        self.inner.zrem(key, member).await
    }
    async fn zrange(&self, key: &str, offset: usize, limit: Option<usize>, descending: bool) -> Result<Vec<String>> {
        self.inner.zrange(key, offset, limit, descending).await
    }
    async fn zcard(&self, key: &str) -> Result<usize> { self.inner.zcard(key).await }
    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.check("sadd", key)?;
        self.inner.sadd(key, member).await
    }
    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.check("srem", key)?;
        self.inner.srem(key, member).await
    }
    async fn smembers(&self, key: &str) -> Result<Vec<String>> { self.inner.smembers(key).await }
}

fn gvp() -> Gvp { Gvp::new("example.io", "v1", "widgets") }

fn widget(name: &str) -> Resource {
    Resource::new("example.io/v1", "Widget", name).with_namespace("a").with_label("env", "prod").with_spec(json!({"size": 1}))
}

fn setup() -> (Arc<FaultyKv>, StorageEngine) {
    let kv = Arc::new(FaultyKv::default());
    let engine = StorageEngine::new(kv.clone(), EventBus::started(), MeridianConfig::default());
    (kv, engine)
}

fn wref(name: &str) -> ResourceRef { ResourceRef::new(gvp(), Some("a"), name) }

#[tokio::test]
async fn failed_index_step_leaves_no_partial_create() {
    let (kv, s) = setup();
    kv.rule("sadd", "lbl:", 0, 1, Action::Fail);
    let mut events = s.watch(WatchFilter::new(gvp())).unwrap();

    let err = s.create(&gvp(), widget("w1"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MeridianError::Backend(_)), "{:?}", err);
    assert!(s.try_get(&wref("w1")).await.unwrap().is_none());
    assert!(s.list(&ListQuery::new(gvp())).await.unwrap().items.is_empty());
    assert!(s.list(&ListQuery::new(gvp()).order_by("name", false)).await.unwrap().items.is_empty());
    assert!(s.namespace_members("a").await.unwrap().is_empty());
    assert!(events.try_recv().is_none());

    // the fault was one-shot; the same write now goes through
    s.create(&gvp(), widget("w1"), &CancellationToken::new()).await.unwrap();
    assert!(events.try_recv().is_some());
}

#[tokio::test]
async fn failed_update_restores_previous_state() {
    let (kv, s) = setup();
    let c = CancellationToken::new();
    let before = s.create(&gvp(), widget("w1"), &c).await.unwrap();
    kv.rule("sadd", "tier=web", 0, 1, Action::Fail);

    let changed = before.clone().with_label("tier", "web").with_spec(json!({"size": 9}));
    assert!(s.update(&gvp(), changed, Some(0), &c).await.is_err());
    assert_eq!(s.get(&wref("w1")).await.unwrap(), before);
}

#[tokio::test]
async fn rollback_failure_is_reported_next_to_the_cause() {
    let (kv, s) = setup();
    kv.rule("sadd", "lbl:", 0, 1, Action::Fail);
    // undoing the kind index entry fails too
    kv.rule("hdel", "idx:", 0, 1, Action::Fail);

    let err = s.create(&gvp(), widget("w1"), &CancellationToken::new()).await.unwrap_err();
    match &err {
        MeridianError::TransactionAborted { source, rollback_failures } => {
            assert!(matches!(**source, MeridianError::Backend(_)));
            assert_eq!(rollback_failures.len(), 1);
            assert!(rollback_failures[0].contains("idx:example.io/v1/widgets"), "{:?}", rollback_failures);
        }
        other => panic!("expected aborted transaction, got {:?}", other),
    }
    let api = ApiError::from(&err);
    assert_eq!(api.status, 500);
    assert!(api.detail.unwrap_or_default().contains("injected sadd failure"));
    assert_eq!(api.errors["RollbackFailed"].len(), 1);
}

#[tokio::test]
async fn cancellation_before_commit_point_rolls_back_delete() {
    let (kv, s) = setup();
    let c = CancellationToken::new();
    s.create(&gvp(), widget("w1"), &c).await.unwrap();
    let mut events = s.watch(WatchFilter::new(gvp())).unwrap();

    let cancel = CancellationToken::new();
    kv.rule("hdel", "idx:", 0, 1, Action::Cancel(cancel.clone()));
    let err = s.delete(&wref("w1"), &cancel).await.unwrap_err();
    assert!(matches!(err, MeridianError::Cancelled { .. }), "{:?}", err);

    assert!(s.try_get(&wref("w1")).await.unwrap().is_some());
    let listed = s.list(&ListQuery::new(gvp())).await.unwrap();
    assert_eq!(listed.items.len(), 1);
    assert_eq!(s.namespace_members("a").await.unwrap().len(), 1);
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn cancellation_after_commit_point_completes_and_publishes() {
    let (kv, s) = setup();
    let mut events = s.watch(WatchFilter::new(gvp())).unwrap();
    let cancel = CancellationToken::new();
    kv.rule("cas", "widgets/a/w1", 0, 1, Action::Cancel(cancel.clone()));

    let created = s.create(&gvp(), widget("w1"), &cancel).await.unwrap();
    assert!(cancel.is_cancelled());
    assert_eq!(s.list(&ListQuery::new(gvp())).await.unwrap().items, vec![created.clone()]);
    assert_eq!(events.try_recv().map(|e| e.resource), Some(created));
}

/// Parks the first matching call until released, so a second writer can run in between.
#[derive(Default)]
struct GateKv {
    inner: MemoryKv,
    gate: Mutex<Option<(&'static str, String)>>,
    parked: Notify,
    release: Notify,
}

impl GateKv {
    fn arm(&self, op: &'static str, key_contains: &str) { *self.gate.lock().unwrap() = Some((op, key_contains.into())); }

    async fn pass(&self, op: &str, key: &str) {
        let hit = {
            let mut gate = self.gate.lock().unwrap();
            let hit = matches!(&*gate, Some((o, k)) if *o == op && key.contains(k.as_str()));
            if hit { *gate = None; }
            hit
        };
        if hit {
            self.parked.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait::async_trait]
impl KvBackend for GateKv {
    async fn get(&self, key: &str) -> Result<Option<String>> { self.inner.get(key).await }
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: Option<&str>) -> Result<bool> {
        self.pass("cas", key).await;
        self.inner.compare_and_swap(key, expected, value).await
    }
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> { self.inner.hget(key, field).await }
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<Option<String>> { self.inner.hset(key, field, value).await }
    async fn hdel(&self, key: &str, field: &str) -> Result<Option<String>> { self.inner.hdel(key, field).await }
    async fn hscan(&self, key: &str, prefix: &str) -> Result<Vec<(String, String)>> { self.inner.hscan(key, prefix).await }
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<Option<f64>> {
        self.pass("zadd", key).await;
        self.inner.zadd(key, member, score).await
    }
    async fn zrem(&self, key: &str, member: &str) -> Result<Option<f64>> { self.inner.zrem(key, member).await }
    async fn zrange(&self, key: &str, offset: usize, limit: Option<usize>, descending: bool) -> Result<Vec<String>> {
        self.inner.zrange(key, offset, limit, descending).await
    }
    async fn zcard(&self, key: &str) -> Result<usize> { self.inner.zcard(key).await }
    async fn sadd(&self, key: &str, member: &str) -> Result<bool> { self.inner.sadd(key, member).await }
    async fn srem(&self, key: &str, member: &str) -> Result<bool> { self.inner.srem(key, member).await }
    async fn smembers(&self, key: &str) -> Result<Vec<String>> { self.inner.smembers(key).await }
}

fn gated() -> (Arc<GateKv>, StorageEngine) {
    let kv = Arc::new(GateKv::default());
    let engine = StorageEngine::new(kv.clone(), EventBus::started(), MeridianConfig::default());
    (kv, engine)
}

#[tokio::test]
async fn interleaved_updates_publish_in_commit_order() {
    let (kv, s) = gated();
    let c = CancellationToken::new();
    let base = s.create(&gvp(), widget("w1"), &c).await.unwrap();
    let mut events = s.watch(WatchFilter::new(gvp())).unwrap();

    // writer A stops on its lastModified index step
    kv.arm("zadd", "lastModified");
    let a = tokio::spawn({
        let s = s.clone();
        let next = base.clone().with_spec(json!({"size": 2}));
        async move { s.update(&gvp(), next, Some(0), &CancellationToken::new()).await }
    });
    kv.parked.notified().await;

    let b = s.update(&gvp(), base.clone().with_spec(json!({"size": 3})), Some(0), &c).await.unwrap();
    assert_eq!(b.state_version(), 1);
    kv.release.notify_one();
    let a = a.await.unwrap();
    assert!(matches!(a, Err(MeridianError::Conflict { expected: 0, actual: 1, .. })), "{:?}", a);

    let mut versions = Vec::new();
    while let Some(ev) = events.try_recv() {
        assert_eq!(ev.kind, WatchEventType::Updated);
        versions.push(ev.resource.state_version());
    }
    assert_eq!(versions, vec![1]);
    assert_eq!(s.get(&wref("w1")).await.unwrap(), b);
}

#[tokio::test]
async fn writer_parked_at_commit_cannot_overtake_the_next_one() {
    let (kv, s) = gated();
    let c = CancellationToken::new();
    let base = s.create(&gvp(), widget("w1"), &c).await.unwrap();
    let mut events = s.watch(WatchFilter::new(gvp())).unwrap();

    // A has written every index entry and waits on its commit
    kv.arm("cas", "widgets/a/w1");
    let a = tokio::spawn({
        let s = s.clone();
        let next = base.clone().with_label("tier", "api").with_spec(json!({"size": 2}));
        async move { s.update(&gvp(), next, Some(0), &CancellationToken::new()).await }
    });
    kv.parked.notified().await;

    let b = s.update(&gvp(), base.clone().with_label("tier", "api").with_spec(json!({"size": 3})), Some(0), &c).await.unwrap();
    kv.release.notify_one();
    assert!(matches!(a.await.unwrap(), Err(MeridianError::Conflict { .. })));

    assert_eq!(events.try_recv().map(|e| e.resource), Some(b.clone()));
    assert!(events.try_recv().is_none());

    // A's rollback shared index entries with B; they are rebuilt from B
    let tier = ListQuery::new(gvp()).with_selectors(vec![LabelSelector::equals("tier", "api")]);
    assert_eq!(s.list(&tier).await.unwrap().items, vec![b.clone()]);
    let by_modified = s.list(&ListQuery::new(gvp()).order_by("lastModified", false)).await.unwrap();
    assert_eq!(by_modified.items, vec![b]);
}

#[tokio::test]
async fn racing_creates_leave_one_resource_fully_indexed() {
    let (kv, s) = gated();
    let mut events = s.watch(WatchFilter::new(gvp())).unwrap();

    kv.arm("cas", "widgets/a/w1");
    let a = tokio::spawn({
        let s = s.clone();
        async move { s.create(&gvp(), widget("w1"), &CancellationToken::new()).await }
    });
    kv.parked.notified().await;

    let b = s.create(&gvp(), widget("w1").with_label("tier", "web"), &CancellationToken::new()).await.unwrap();
    kv.release.notify_one();
    assert!(matches!(a.await.unwrap(), Err(MeridianError::AlreadyExists { .. })));

    assert_eq!(events.try_recv().map(|e| e.kind), Some(WatchEventType::Created));
    assert!(events.try_recv().is_none());
    assert_eq!(s.list(&ListQuery::new(gvp())).await.unwrap().items, vec![b.clone()]);
    assert_eq!(s.list(&ListQuery::new(gvp()).order_by("name", false)).await.unwrap().items, vec![b.clone()]);
    assert_eq!(s.list(&ListQuery::new(gvp()).order_by("createdAt", false)).await.unwrap().items, vec![b.clone()]);
    let prod = ListQuery::new(gvp()).with_selectors(vec![LabelSelector::equals("env", "prod")]);
    assert_eq!(s.list(&prod).await.unwrap().items, vec![b]);
    assert_eq!(s.namespace_members("a").await.unwrap().len(), 1);
}
