use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use rustc_hash::FxHashMap;

use crate::KvBackend;

/// f64 with a total order so it can key a BTreeSet.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool { self.0.total_cmp(&other.0) == Ordering::Equal }
}
impl Eq for Score {}
impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering { self.0.total_cmp(&other.0) }
}

#[derive(Default)]
struct ZSet {
    scores: FxHashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

#[derive(Default)]
struct Inner {
    strings: FxHashMap<String, String>,
    hashes: FxHashMap<String, BTreeMap<String, String>>,
    zsets: FxHashMap<String, ZSet>,
    sets: FxHashMap<String, BTreeSet<String>>,
}

/// In-process backend. Every call takes one short lock, so each primitive is atomic.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("memory kv lock poisoned"))
    }
}

#[async_trait::async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.strings.get(key).cloned())
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: Option<&str>) -> Result<bool> {
        let mut g = self.lock()?;
        if g.strings.get(key).map(|s| s.as_str()) != expected { return Ok(false); }
        match value {
            Some(v) => { g.strings.insert(key.to_string(), v.to_string()); }
            None => { g.strings.remove(key); }
        }
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.lock()?.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<Option<String>> {
        Ok(self.lock()?.hashes.entry(key.to_string()).or_default().insert(field.to_string(), value.to_string()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut g = self.lock()?;
        let Some(h) = g.hashes.get_mut(key) else { return Ok(None) };
        let prev = h.remove(field);
        if h.is_empty() { g.hashes.remove(key); }
        Ok(prev)
    }

    async fn hscan(&self, key: &str, prefix: &str) -> Result<Vec<(String, String)>> {
        let g = self.lock()?;
        let Some(h) = g.hashes.get(key) else { return Ok(Vec::new()) };
        Ok(h.range(prefix.to_string()..)
            .take_while(|(f, _)| f.starts_with(prefix))
            .map(|(f, v)| (f.clone(), v.clone()))
            .collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<Option<f64>> {
        let mut g = self.lock()?;
        let z = g.zsets.entry(key.to_string()).or_default();
        let prev = z.scores.insert(member.to_string(), score);
        if let Some(p) = prev { z.ordered.remove(&(Score(p), member.to_string())); }
        z.ordered.insert((Score(score), member.to_string()));
        Ok(prev)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut g = self.lock()?;
        let Some(z) = g.zsets.get_mut(key) else { return Ok(None) };
        let prev = z.scores.remove(member);
        if let Some(p) = prev { z.ordered.remove(&(Score(p), member.to_string())); }
        if z.scores.is_empty() { g.zsets.remove(key); }
        Ok(prev)
    }

    async fn zrange(&self, key: &str, offset: usize, limit: Option<usize>, descending: bool) -> Result<Vec<String>> {
        let g = self.lock()?;
        let Some(z) = g.zsets.get(key) else { return Ok(Vec::new()) };
        let take = limit.unwrap_or(usize::MAX);
        let out = if descending {
            z.ordered.iter().rev().skip(offset).take(take).map(|(_, m)| m.clone()).collect()
        } else {
            z.ordered.iter().skip(offset).take(take).map(|(_, m)| m.clone()).collect()
        };
        Ok(out)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self.lock()?.zsets.get(key).map(|z| z.scores.len()).unwrap_or(0))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.lock()?.sets.entry(key.to_string()).or_default().insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut g = self.lock()?;
        let Some(s) = g.sets.get_mut(key) else { return Ok(false) };
        let removed = s.remove(member);
        if s.is_empty() { g.sets.remove(key); }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.lock()?.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }
}
