//! Compensable multi-step writes over a backend without multi-key atomicity.
//!
//! A [`Transaction`] is an ordered list of steps, each able to undo itself. Steps commit
//! strictly in order; the first failure compensates every committed step in reverse
//! before the failure is returned. One transaction per write; it is consumed by
//! [`Transaction::execute`].
//!
//! The storage engine puts the primary record write last, so it is both the commit point
//! and the final step: nothing can suspend between a committed write and its event.

use std::time::Instant;

use meridian_core::{ErrorTarget, MeridianError, MeridianResult, Resource};
use meridian_persist::KvBackend;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[async_trait::async_trait]
pub trait CompensableStep: Send + Sync {
    async fn commit(&mut self, kv: &dyn KvBackend) -> MeridianResult<()>;
    /// Undo a committed step. Failures are reported, never retried.
    async fn compensate(&mut self, kv: &dyn KvBackend) -> anyhow::Result<()>;
    fn describe(&self) -> String;
    /// Once this step commits the write is durable: cancellation is no longer observed.
    fn is_commit_point(&self) -> bool { false }
}

/// Backend primitives wrapped as steps. Each remembers what it replaced.
pub enum KvStep {
    HashPut { key: String, field: String, value: String, prev: Option<Option<String>> },
    HashDel { key: String, field: String, prev: Option<String> },
    ZAdd { key: String, member: String, score: f64, prev: Option<Option<f64>> },
    ZRem { key: String, member: String, prev: Option<f64> },
    SetAdd { key: String, member: String, added: bool },
    SetRem { key: String, member: String, removed: bool },
    /// CAS on the primary record. `expected` is the raw value read before the write;
    /// `expected_version` is what the caller asked for, reported on conflict.
    Primary { key: String, target: ErrorTarget, expected: Option<String>, value: Option<String>, expected_version: Option<u64> },
}

impl KvStep {
    pub fn hash_put(key: String, field: String, value: String) -> Self { Self::HashPut { key, field, value, prev: None } }
    pub fn hash_del(key: String, field: String) -> Self { Self::HashDel { key, field, prev: None } }
    pub fn zadd(key: String, member: String, score: f64) -> Self { Self::ZAdd { key, member, score, prev: None } }
    pub fn zrem(key: String, member: String) -> Self { Self::ZRem { key, member, prev: None } }
    pub fn sadd(key: String, member: String) -> Self { Self::SetAdd { key, member, added: false } }
    pub fn srem(key: String, member: String) -> Self { Self::SetRem { key, member, removed: false } }
}

async fn primary_mismatch(kv: &dyn KvBackend, key: &str, target: &ErrorTarget, expected: Option<&str>, expected_version: Option<u64>) -> MeridianError {
    if expected.is_none() {
        return MeridianError::AlreadyExists { target: target.clone() };
    }
    let current = match kv.get(key).await {
        Ok(v) => v,
        Err(e) => return MeridianError::Backend(e),
    };
    let Some(raw) = current else {
        return MeridianError::not_found(meridian_core::Missing::Resource, target.clone());
    };
    let actual = Resource::from_json_str(&raw).map(|r| r.state_version()).unwrap_or(0);
    let stale = expected.and_then(|s| Resource::from_json_str(s).ok()).map(|r| r.state_version()).unwrap_or(0);
    let expected = expected_version.unwrap_or(stale);
    // status, label and annotation writes leave stateVersion where it was
    let reason = if expected == actual {
        "record changed concurrently without a stateVersion change; re-read and retry"
    } else {
        "record changed concurrently"
    };
    MeridianError::Conflict { target: target.clone(), expected, actual, reason: Some(reason.to_string()) }
}

#[async_trait::async_trait]
impl CompensableStep for KvStep {
    async fn commit(&mut self, kv: &dyn KvBackend) -> MeridianResult<()> {
        match self {
            KvStep::HashPut { key, field, value, prev } => { *prev = Some(kv.hset(key, field, value).await?); }
            KvStep::HashDel { key, field, prev } => { *prev = kv.hdel(key, field).await?; }
            KvStep::ZAdd { key, member, score, prev } => { *prev = Some(kv.zadd(key, member, *score).await?); }
            KvStep::ZRem { key, member, prev } => { *prev = kv.zrem(key, member).await?; }
            KvStep::SetAdd { key, member, added } => { *added = kv.sadd(key, member).await?; }
            KvStep::SetRem { key, member, removed } => { *removed = kv.srem(key, member).await?; }
            KvStep::Primary { key, target, expected, value, expected_version } => {
                if !kv.compare_and_swap(key, expected.as_deref(), value.as_deref()).await? {
                    return Err(primary_mismatch(kv, key, target, expected.as_deref(), *expected_version).await);
                }
            }
        }
        Ok(())
    }

    async fn compensate(&mut self, kv: &dyn KvBackend) -> anyhow::Result<()> {
        match self {
            KvStep::HashPut { key, field, prev, .. } => match prev.take().flatten() {
                Some(old) => { kv.hset(key, field, &old).await?; }
                None => { kv.hdel(key, field).await?; }
            },
            KvStep::HashDel { key, field, prev } => {
                if let Some(old) = prev.take() { kv.hset(key, field, &old).await?; }
            }
            KvStep::ZAdd { key, member, prev, .. } => match prev.take().flatten() {
                Some(old) => { kv.zadd(key, member, old).await?; }
                None => { kv.zrem(key, member).await?; }
            },
            KvStep::ZRem { key, member, prev } => {
                if let Some(old) = prev.take() { kv.zadd(key, member, old).await?; }
            }
            KvStep::SetAdd { key, member, added } => {
                if *added { kv.srem(key, member).await?; }
            }
            KvStep::SetRem { key, member, removed } => {
                if *removed { kv.sadd(key, member).await?; }
            }
            KvStep::Primary { key, expected, value, .. } => {
                if !kv.compare_and_swap(key, value.as_deref(), expected.as_deref()).await? {
                    anyhow::bail!("primary record {} changed before it could be restored", key);
                }
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match self {
            KvStep::HashPut { key, field, .. } => format!("hset {} {}", key, field),
            KvStep::HashDel { key, field, .. } => format!("hdel {} {}", key, field),
            KvStep::ZAdd { key, member, .. } => format!("zadd {} {}", key, member),
            KvStep::ZRem { key, member, .. } => format!("zrem {} {}", key, member),
            KvStep::SetAdd { key, member, .. } => format!("sadd {} {}", key, member),
            KvStep::SetRem { key, member, .. } => format!("srem {} {}", key, member),
            KvStep::Primary { key, value, .. } => format!("{} {}", if value.is_some() { "write" } else { "delete" }, key),
        }
    }

    fn is_commit_point(&self) -> bool { matches!(self, KvStep::Primary { .. }) }
}

#[derive(Default)]
pub struct Transaction {
    steps: Vec<Box<dyn CompensableStep>>,
}

impl Transaction {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, step: impl CompensableStep + 'static) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize { self.steps.len() }

    pub fn is_empty(&self) -> bool { self.steps.is_empty() }

    /// Run every step in order. Cancellation is checked before each step until the
    /// commit point has been passed.
    pub async fn execute(mut self, kv: &dyn KvBackend, cancel: &CancellationToken) -> MeridianResult<()> {
        let t0 = Instant::now();
        let mut durable = false;
        for i in 0..self.steps.len() {
            if !durable && cancel.is_cancelled() {
                let cause = MeridianError::Cancelled { stage: self.steps[i].describe() };
                return Err(self.rollback(kv, i, cause).await);
            }
            if let Err(e) = self.steps[i].commit(kv).await {
                return Err(self.rollback(kv, i, e).await);
            }
            durable |= self.steps[i].is_commit_point();
        }
        debug!(steps = self.steps.len(), took_ms = %t0.elapsed().as_millis(), "store: transaction committed");
        Ok(())
    }

    /// Compensate steps `0..committed` in reverse; the original failure always survives.
    async fn rollback(&mut self, kv: &dyn KvBackend, committed: usize, cause: MeridianError) -> MeridianError {
        if cause.is_expected() {
            debug!(committed, error = %cause, "store: rolling back");
        } else {
            warn!(committed, error = %cause, "store: rolling back");
        }
        counter!("store_rollback_total", 1u64);
        let mut failures = Vec::new();
        for step in self.steps[..committed].iter_mut().rev() {
            if let Err(e) = step.compensate(kv).await {
                let what = step.describe();
                error!(step = %what, error = %e, "store: compensation failed");
                counter!("store_rollback_failed_total", 1u64);
                failures.push(format!("{}: {}", what, e));
            }
        }
        if failures.is_empty() {
            cause
        } else {
            MeridianError::TransactionAborted { source: Box::new(cause), rollback_failures: failures }
        }
    }
}
