//! Meridian persistence: the narrow key-value contract the storage engine is written
//! against, plus two backends (in-memory and SQLite).
//!
//! The contract is deliberately poor: single-key compare-and-swap, hashes, sorted sets
//! and plain sets. Multi-key atomicity is the storage engine's job (compensable steps).

#![forbid(unsafe_code)]

mod memory;
mod sqlite;

pub use memory::MemoryKv;
pub use sqlite::{default_db_path, SqliteKv};

use anyhow::Result;

/// Key-value primitives. Every call is a suspension point; failures are unexpected I/O.
#[async_trait::async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set `key` to `value` (`None` deletes) only if its current value equals `expected`
    /// (`None` meaning absent). Returns `false` without writing on mismatch.
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: Option<&str>) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    /// Returns the previous value of the field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<Option<String>>;
    /// Returns the removed value, if any.
    async fn hdel(&self, key: &str, field: &str) -> Result<Option<String>>;
    /// Fields starting with `prefix`, ordered by field.
    async fn hscan(&self, key: &str, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Returns the member's previous score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<Option<f64>>;
    /// Returns the removed member's score.
    async fn zrem(&self, key: &str, member: &str) -> Result<Option<f64>>;
    /// Members ordered by `(score, member)`, reversed when `descending`, then windowed.
    async fn zrange(&self, key: &str, offset: usize, limit: Option<usize>, descending: bool) -> Result<Vec<String>>;
    async fn zcard(&self, key: &str) -> Result<usize>;

    /// Returns `true` if the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    /// Returns `true` if the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    /// Members in ascending order.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
}
