use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use meridian_core::{
    matches_all, ErrorTarget, Gvp, LabelSelector, MeridianConfig, MeridianError, MeridianResult, Missing,
    Resource, ResourceRef, ResourceWatchEvent, WatchEventType,
};
use meridian_persist::KvBackend;
use meridian_watch::{EventBus, WatchFilter, WatchStream};
use metrics::histogram;
use rustc_hash::FxHashSet;
use serde_json::Value as Json;
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::keys;
use crate::saga::{KvStep, Transaction};
use crate::score;

/// Attempts at finding a free generated name before giving up.
const NAME_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub gvp: Gvp,
    pub namespace: Option<String>,
    pub selectors: Vec<LabelSelector>,
    pub page_size: Option<usize>,
    pub continuation: Option<String>,
    /// One of [`keys::ORDERABLE`].
    pub order_by: Option<String>,
    pub descending: bool,
}

impl ListQuery {
    pub fn new(gvp: Gvp) -> Self { Self { gvp, ..Default::default() } }
    pub fn in_namespace(mut self, ns: &str) -> Self { self.namespace = Some(ns.to_string()); self }
    pub fn with_selectors(mut self, selectors: Vec<LabelSelector>) -> Self { self.selectors = selectors; self }
    pub fn page_size(mut self, n: usize) -> Self { self.page_size = Some(n); self }
    pub fn continue_from(mut self, token: Option<String>) -> Self { self.continuation = token; self }
    pub fn order_by(mut self, prop: &str, descending: bool) -> Self { self.order_by = Some(prop.to_string()); self.descending = descending; self }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Resource>,
    /// Present when more items follow; pass back unchanged to resume.
    pub continuation: Option<String>,
}

/// Indexed resource storage over a [`KvBackend`]. Publishes one event per committed write.
#[derive(Clone)]
pub struct StorageEngine {
    kv: Arc<dyn KvBackend>,
    bus: EventBus,
    cfg: MeridianConfig,
}

fn validate_segment(what: &str, v: &str) -> MeridianResult<()> {
    if v.is_empty() || v.contains('/') || v.chars().any(char::is_whitespace) {
        return Err(MeridianError::invalid(format!("{} {:?} must be non-empty without '/' or whitespace", what, v)));
    }
    Ok(())
}

fn encode(r: &Resource) -> MeridianResult<String> {
    serde_json::to_string(r).map_err(|e| MeridianError::Backend(e.into()))
}

fn decode(key: &str, raw: &str) -> MeridianResult<Resource> {
    serde_json::from_str(raw).map_err(|e| MeridianError::Backend(anyhow::anyhow!("corrupt record {}: {}", key, e)))
}

/// `(plural, group)` a stored definition registers under.
fn definition_names(r: &Resource) -> Option<(String, String)> {
    let spec = r.spec.as_ref()?;
    let plural = spec.pointer("/names/plural")?.as_str()?;
    let group = spec.get("group").and_then(Json::as_str).unwrap_or("");
    Some((plural.to_lowercase(), group.to_lowercase()))
}

/// `(property, member, score)` for every ordered index a stored resource sits in.
fn ordered_entries(stored: &Resource, primary: &str) -> MeridianResult<Vec<(&'static str, String, f64)>> {
    let v = stored.to_value()?;
    let meta = &v["metadata"];
    Ok(keys::ORDERABLE
        .iter()
        .map(|prop| {
            let value = meta.get(*prop);
            (*prop, keys::ordered_member(&score::tie_key(value), primary), score::score(value))
        })
        .collect())
}

/// Index entries a write touched, re-derived if it loses the commit race.
#[derive(Default)]
struct Touched {
    members: Vec<(&'static str, String)>,
    labels: Vec<(String, String)>,
    definitions: Vec<(String, String)>,
}

/// The primary CAS found someone else's write.
fn lost_race(e: &MeridianError) -> bool {
    matches!(e.root(), MeridianError::Conflict { .. } | MeridianError::AlreadyExists { .. } | MeridianError::NotFound { .. })
}

fn parse_token(token: Option<&str>) -> MeridianResult<usize> {
    match token {
        None | Some("") => Ok(0),
        Some(t) => t.parse::<usize>().map_err(|_| MeridianError::invalid(format!("malformed continuation token {:?}", t))),
    }
}

impl StorageEngine {
    pub fn new(kv: Arc<dyn KvBackend>, bus: EventBus, cfg: MeridianConfig) -> Self { Self { kv, bus, cfg } }

    pub fn bus(&self) -> &EventBus { &self.bus }

    pub fn config(&self) -> &MeridianConfig { &self.cfg }

    fn reference(gvp: &Gvp, r: &Resource) -> ResourceRef {
        ResourceRef::new(gvp.clone(), r.metadata.namespace.as_deref(), r.metadata.name.clone())
    }

    async fn read_raw(&self, key: &str) -> MeridianResult<Option<String>> { Ok(self.kv.get(key).await?) }

    pub async fn try_get(&self, r: &ResourceRef) -> MeridianResult<Option<Resource>> {
        let key = keys::primary(r);
        match self.read_raw(&key).await? {
            Some(raw) => Ok(Some(decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, r: &ResourceRef) -> MeridianResult<Resource> {
        self.try_get(r).await?.ok_or_else(|| MeridianError::not_found(Missing::Resource, r.into()))
    }

    /// Stored definition registered for `(plural, group)`, if any.
    pub async fn definition(&self, plural: &str, group: &str) -> MeridianResult<Option<Resource>> {
        let field = keys::definition_field(&plural.to_lowercase(), &group.to_lowercase());
        let Some(key) = self.kv.hget(keys::DEFINITIONS_XREF, &field).await? else { return Ok(None) };
        match self.read_raw(&key).await? {
            Some(raw) => Ok(Some(decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    async fn resolve_name(&self, gvp: &Gvp, r: &mut Resource) -> MeridianResult<()> {
        if !r.metadata.name.is_empty() {
            return validate_segment("metadata.name", &r.metadata.name);
        }
        let Some(prefix) = r.metadata.name_prefix.clone().filter(|p| !p.is_empty()) else {
            return Err(MeridianError::invalid("metadata.name or metadata.namePrefix is required"));
        };
        for _ in 0..NAME_ATTEMPTS {
            let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(self.cfg.name_suffix_len).collect();
            r.metadata.name = format!("{}{}", prefix, suffix);
            validate_segment("metadata.name", &r.metadata.name)?;
            if self.read_raw(&keys::primary(&Self::reference(gvp, r))).await?.is_none() {
                return Ok(());
            }
        }
        Err(MeridianError::AlreadyExists { target: ErrorTarget::kind(gvp) })
    }

    fn index_steps(tx: &mut Transaction, touched: &mut Touched, gvp: &Gvp, rref: &ResourceRef, primary: &str, stored: &Resource) -> MeridianResult<()> {
        tx.push(KvStep::hash_put(keys::kind_index(gvp), keys::kind_field(rref), primary.to_string()));
        if let Some(ns) = &rref.namespace {
            tx.push(KvStep::hash_put(keys::namespace_index(ns), keys::namespace_field(rref), primary.to_string()));
        }
        for (prop, member, score) in ordered_entries(stored, primary)? {
            tx.push(KvStep::zadd(keys::ordered_index(gvp, prop), member.clone(), score));
            touched.members.push((prop, member));
        }
        for (k, val) in &stored.metadata.labels {
            tx.push(KvStep::sadd(keys::label_index(gvp, k, val), primary.to_string()));
            touched.labels.push((k.clone(), val.clone()));
        }
        if gvp.is_definitions() {
            if let Some((plural, group)) = definition_names(stored) {
                tx.push(KvStep::hash_put(keys::DEFINITIONS_XREF.into(), keys::definition_field(&plural, &group), primary.to_string()));
                touched.definitions.push((plural, group));
            }
        }
        Ok(())
    }

    /// Run a write whose last step is the primary record. A lost race may have compensated
    /// entries the winner shares with this write, so those are rebuilt from the winner.
    async fn commit(&self, tx: Transaction, gvp: &Gvp, rref: &ResourceRef, touched: &Touched, cancel: &CancellationToken) -> MeridianResult<()> {
        match tx.execute(self.kv.as_ref(), cancel).await {
            Err(e) if lost_race(&e) => {
                if let Err(repair) = self.repair_index(gvp, rref, touched).await {
                    warn!(resource = %rref, error = %repair, "store: index repair after lost race failed");
                }
                Err(e)
            }
            other => other,
        }
    }

    async fn repair_index(&self, gvp: &Gvp, rref: &ResourceRef, touched: &Touched) -> MeridianResult<()> {
        let primary = keys::primary(rref);
        let current = self.load(&primary).await?;
        let kv = self.kv.as_ref();
        match &current {
            Some(_) => { kv.hset(&keys::kind_index(gvp), &keys::kind_field(rref), &primary).await?; }
            None => { kv.hdel(&keys::kind_index(gvp), &keys::kind_field(rref)).await?; }
        }
        if let Some(ns) = &rref.namespace {
            match &current {
                Some(_) => { kv.hset(&keys::namespace_index(ns), &keys::namespace_field(rref), &primary).await?; }
                None => { kv.hdel(&keys::namespace_index(ns), &keys::namespace_field(rref)).await?; }
            }
        }
        let live = match &current { Some(r) => ordered_entries(r, &primary)?, None => Vec::new() };
        for (prop, member) in &touched.members {
            if !live.iter().any(|(p, m, _)| p == prop && m == member) {
                kv.zrem(&keys::ordered_index(gvp, prop), member).await?;
            }
        }
        for (prop, member, score) in &live {
            kv.zadd(&keys::ordered_index(gvp, prop), member, *score).await?;
        }
        for (k, v) in &touched.labels {
            let set = keys::label_index(gvp, k, v);
            if current.as_ref().and_then(|r| r.metadata.labels.get(k)) == Some(v) {
                kv.sadd(&set, &primary).await?;
            } else {
                kv.srem(&set, &primary).await?;
            }
        }
        let owned = current.as_ref().and_then(definition_names);
        for (plural, group) in &touched.definitions {
            let field = keys::definition_field(plural, group);
            if owned.as_ref() == Some(&(plural.clone(), group.clone())) {
                kv.hset(keys::DEFINITIONS_XREF, &field, &primary).await?;
            } else if kv.hget(keys::DEFINITIONS_XREF, &field).await?.as_deref() == Some(primary.as_str()) {
                kv.hdel(keys::DEFINITIONS_XREF, &field).await?;
            }
        }
        debug!(resource = %rref, exists = current.is_some(), "store: index repaired after lost race");
        Ok(())
    }

    /// Store a new resource. Server-owned metadata is initialised here.
    pub async fn create(&self, gvp: &Gvp, mut resource: Resource, cancel: &CancellationToken) -> MeridianResult<Resource> {
        let t0 = Instant::now();
        if let Some(ns) = &resource.metadata.namespace { validate_segment("metadata.namespace", ns)?; }
        self.resolve_name(gvp, &mut resource).await?;
        let now = Utc::now();
        let m = &mut resource.metadata;
        m.id = Some(uuid::Uuid::new_v4().to_string());
        m.created_at = Some(now);
        m.last_modified = Some(now);
        m.state_version = Some(0);
        m.generation = Some(1);

        let rref = Self::reference(gvp, &resource);
        let primary = keys::primary(&rref);
        if self.read_raw(&primary).await?.is_some() {
            return Err(MeridianError::AlreadyExists { target: (&rref).into() });
        }
        let raw = encode(&resource)?;
        let mut tx = Transaction::new();
        let mut touched = Touched::default();
        Self::index_steps(&mut tx, &mut touched, gvp, &rref, &primary, &resource)?;
        tx.push(KvStep::Primary { key: primary.clone(), target: (&rref).into(), expected: None, value: Some(raw), expected_version: None });
        self.commit(tx, gvp, &rref, &touched, cancel).await?;

        self.publish(WatchEventType::Created, gvp, &resource);
        histogram!("store_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(gvp = %gvp, ns = ?rref.namespace, name = %rref.name, took_ms = %t0.elapsed().as_millis(), "store: create ok");
        Ok(resource)
    }

    /// Replace the stored state of an existing resource. The primary record is written
    /// last, after the indexes, so the event follows the commit with no gap.
    ///
    /// `expected` is the caller's `stateVersion`; a mismatch with the stored value is a
    /// `Conflict`. `stateVersion` and `generation` only move when `spec` changed.
    pub async fn update(&self, gvp: &Gvp, mut resource: Resource, expected: Option<u64>, cancel: &CancellationToken) -> MeridianResult<Resource> {
        let t0 = Instant::now();
        let rref = Self::reference(gvp, &resource);
        let primary = keys::primary(&rref);
        let Some(current_raw) = self.read_raw(&primary).await? else {
            return Err(MeridianError::not_found(Missing::Resource, (&rref).into()));
        };
        let current = decode(&primary, &current_raw)?;
        if let Some(e) = expected {
            if e != current.state_version() {
                return Err(MeridianError::conflict((&rref).into(), e, current.state_version()));
            }
        }

        let spec_changed = resource.spec != current.spec;
        let bump = u64::from(spec_changed);
        let m = &mut resource.metadata;
        m.id = current.metadata.id.clone();
        m.created_at = current.metadata.created_at;
        m.name_prefix = current.metadata.name_prefix.clone();
        m.last_modified = Some(Utc::now());
        m.state_version = Some(current.state_version() + bump);
        m.generation = Some(current.metadata.generation.unwrap_or(1) + bump);

        let raw = encode(&resource)?;
        let mut tx = Transaction::new();
        let mut touched = Touched::default();
        let before = ordered_entries(&current, &primary)?;
        for ((prop, old, _), (_, new, score)) in before.into_iter().zip(ordered_entries(&resource, &primary)?) {
            if old == new { continue; }
            tx.push(KvStep::zadd(keys::ordered_index(gvp, prop), new.clone(), score));
            tx.push(KvStep::zrem(keys::ordered_index(gvp, prop), old.clone()));
            touched.members.push((prop, new));
            touched.members.push((prop, old));
        }
        Self::label_diff_steps(&mut tx, &mut touched, gvp, &primary, &current.metadata.labels, &resource.metadata.labels);
        if gvp.is_definitions() {
            let before = definition_names(&current);
            let after = definition_names(&resource);
            if before != after {
                if let Some((plural, group)) = before {
                    tx.push(KvStep::hash_del(keys::DEFINITIONS_XREF.into(), keys::definition_field(&plural, &group)));
                    touched.definitions.push((plural, group));
                }
                if let Some((plural, group)) = after {
                    tx.push(KvStep::hash_put(keys::DEFINITIONS_XREF.into(), keys::definition_field(&plural, &group), primary.clone()));
                    touched.definitions.push((plural, group));
                }
            }
        }
        tx.push(KvStep::Primary {
            key: primary.clone(),
            target: (&rref).into(),
            expected: Some(current_raw),
            value: Some(raw),
            expected_version: Some(expected.unwrap_or(current.state_version())),
        });
        self.commit(tx, gvp, &rref, &touched, cancel).await?;

        self.publish(WatchEventType::Updated, gvp, &resource);
        histogram!("store_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(gvp = %gvp, ns = ?rref.namespace, name = %rref.name, state_version = resource.state_version(), spec_changed, took_ms = %t0.elapsed().as_millis(), "store: update ok");
        Ok(resource)
    }

    fn label_diff_steps(tx: &mut Transaction, touched: &mut Touched, gvp: &Gvp, primary: &str, before: &BTreeMap<String, String>, after: &BTreeMap<String, String>) {
        for (k, v) in before {
            if after.get(k) != Some(v) {
                tx.push(KvStep::srem(keys::label_index(gvp, k, v), primary.to_string()));
                touched.labels.push((k.clone(), v.clone()));
            }
        }
        for (k, v) in after {
            if before.get(k) != Some(v) {
                tx.push(KvStep::sadd(keys::label_index(gvp, k, v), primary.to_string()));
                touched.labels.push((k.clone(), v.clone()));
            }
        }
    }

    /// Remove from every index, then the primary record. Returns the pre-deletion state.
    pub async fn delete(&self, r: &ResourceRef, cancel: &CancellationToken) -> MeridianResult<Resource> {
        let t0 = Instant::now();
        let primary = keys::primary(r);
        let Some(raw) = self.read_raw(&primary).await? else {
            return Err(MeridianError::not_found(Missing::Resource, r.into()));
        };
        let current = decode(&primary, &raw)?;
        let gvp = &r.gvp;
        let mut tx = Transaction::new();
        let mut touched = Touched::default();
        tx.push(KvStep::hash_del(keys::kind_index(gvp), keys::kind_field(r)));
        if let Some(ns) = &r.namespace {
            tx.push(KvStep::hash_del(keys::namespace_index(ns), keys::namespace_field(r)));
        }
        for (prop, member, _) in ordered_entries(&current, &primary)? {
            tx.push(KvStep::zrem(keys::ordered_index(gvp, prop), member.clone()));
            touched.members.push((prop, member));
        }
        for (k, v) in &current.metadata.labels {
            tx.push(KvStep::srem(keys::label_index(gvp, k, v), primary.clone()));
            touched.labels.push((k.clone(), v.clone()));
        }
        if gvp.is_definitions() {
            if let Some((plural, group)) = definition_names(&current) {
                tx.push(KvStep::hash_del(keys::DEFINITIONS_XREF.into(), keys::definition_field(&plural, &group)));
                touched.definitions.push((plural, group));
            }
        }
        tx.push(KvStep::Primary {
            key: primary.clone(),
            target: r.into(),
            expected: Some(raw),
            value: None,
            expected_version: Some(current.state_version()),
        });
        self.commit(tx, gvp, r, &touched, cancel).await?;

        self.publish(WatchEventType::Deleted, gvp, &current);
        info!(gvp = %gvp, ns = ?r.namespace, name = %r.name, took_ms = %t0.elapsed().as_millis(), "store: delete ok");
        Ok(current)
    }

    /// Every resource stored in `ns`, across kinds, via the namespace index.
    pub async fn namespace_members(&self, ns: &str) -> MeridianResult<Vec<ResourceRef>> {
        let entries = self.kv.hscan(&keys::namespace_index(ns), "").await?;
        Ok(entries.iter().filter_map(|(_, primary)| keys::parse_primary(primary)).collect())
    }

    /// Delete every resource in a namespace; one `Deleted` event each. Stops at the
    /// first failure, leaving the remaining resources in place.
    pub async fn delete_namespace(&self, ns: &str, cancel: &CancellationToken) -> MeridianResult<Vec<Resource>> {
        let t0 = Instant::now();
        let members = self.namespace_members(ns).await?;
        let mut deleted = Vec::with_capacity(members.len());
        for r in members {
            if cancel.is_cancelled() {
                return Err(MeridianError::Cancelled { stage: format!("delete namespace {} ({} removed)", ns, deleted.len()) });
            }
            match self.delete(&r, cancel).await {
                Ok(res) => deleted.push(res),
                Err(MeridianError::NotFound { .. }) => debug!(resource = %r, "store: already gone"),
                Err(e) => return Err(e),
            }
        }
        info!(ns = %ns, deleted = deleted.len(), took_ms = %t0.elapsed().as_millis(), "store: delete namespace ok");
        Ok(deleted)
    }

    async fn load(&self, primary: &str) -> MeridianResult<Option<Resource>> {
        match self.read_raw(primary).await? {
            Some(raw) => Ok(Some(decode(primary, &raw)?)),
            // index entry of a write still in flight, or of one being rolled back
            None => Ok(None),
        }
    }

    /// Candidates narrowed by the label index for every `Equals` selector.
    async fn label_candidates(&self, gvp: &Gvp, selectors: &[LabelSelector]) -> MeridianResult<Option<FxHashSet<String>>> {
        let pairs: SmallVec<[(&str, &str); 4]> = selectors.iter().filter_map(|s| s.exact_pair()).collect();
        let mut acc: Option<FxHashSet<String>> = None;
        for (k, v) in pairs {
            let members: FxHashSet<String> = self.kv.smembers(&keys::label_index(gvp, k, v)).await?.into_iter().collect();
            acc = Some(match acc {
                None => members,
                Some(prev) => prev.intersection(&members).cloned().collect(),
            });
        }
        Ok(acc)
    }

    fn keep(q: &ListQuery, r: &Resource) -> bool {
        if let Some(ns) = &q.namespace {
            if r.metadata.namespace.as_deref() != Some(ns.as_str()) { return false; }
        }
        matches_all(&q.selectors, &r.metadata.labels)
    }

    /// One page of a kind, optionally scoped to a namespace, label-filtered and ordered.
    ///
    /// The continuation token is the offset of the next item in the (filtered) ordering,
    /// so resuming is deterministic as long as the underlying set is unchanged.
    pub async fn list(&self, q: &ListQuery) -> MeridianResult<Page> {
        let t0 = Instant::now();
        let page_size = self.cfg.page_size(q.page_size);
        let offset = parse_token(q.continuation.as_deref())?;

        let mut items = Vec::with_capacity(page_size);
        let mut more = false;
        match q.order_by.as_deref() {
            Some(prop) if !keys::ORDERABLE.contains(&prop) => {
                return Err(MeridianError::invalid(format!("cannot order by {:?}; expected one of {:?}", prop, keys::ORDERABLE)));
            }
            Some(prop) if q.namespace.is_none() && q.selectors.is_empty() => {
                let members = self.kv.zrange(&keys::ordered_index(&q.gvp, prop), offset, Some(page_size + 1), q.descending).await?;
                more = members.len() > page_size;
                for m in members.iter().take(page_size) {
                    if let Some(r) = self.load(keys::member_primary(m)).await? { items.push(r); }
                }
            }
            ordered => {
                let candidates: Vec<String> = match ordered {
                    Some(prop) => self
                        .kv
                        .zrange(&keys::ordered_index(&q.gvp, prop), 0, None, q.descending)
                        .await?
                        .iter()
                        .map(|m| keys::member_primary(m).to_string())
                        .collect(),
                    None => {
                        let prefix = q.namespace.as_deref().map(keys::scope_prefix).unwrap_or_default();
                        self.kv.hscan(&keys::kind_index(&q.gvp), &prefix).await?.into_iter().map(|(_, primary)| primary).collect()
                    }
                };
                let narrowed = self.label_candidates(&q.gvp, &q.selectors).await?;
                let mut seen = 0usize;
                for primary in candidates {
                    if let Some(set) = &narrowed {
                        if !set.contains(&primary) { continue; }
                    }
                    let Some(r) = self.load(&primary).await? else { continue };
                    if !Self::keep(q, &r) { continue; }
                    seen += 1;
                    if seen <= offset { continue; }
                    if items.len() == page_size { more = true; break; }
                    items.push(r);
                }
            }
        }
        let continuation = more.then(|| (offset + page_size).to_string());
        debug!(gvp = %q.gvp, ns = ?q.namespace, items = items.len(), more, took_ms = %t0.elapsed().as_millis(), "store: list ok");
        Ok(Page { items, continuation })
    }

    /// Live events for a kind; see [`meridian_watch`] for the no-replay contract.
    pub fn watch(&self, filter: WatchFilter) -> MeridianResult<WatchStream> { Ok(self.bus.subscribe(filter)?) }

    fn publish(&self, kind: WatchEventType, gvp: &Gvp, resource: &Resource) {
        self.bus.publish(&ResourceWatchEvent { kind, gvp: gvp.clone(), resource: resource.clone() });
    }
}
