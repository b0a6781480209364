use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use metrics::histogram;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::KvBackend;

/// SQLite-backed store under one connection. rusqlite is blocking, so every call runs on
/// tokio's blocking pool and never stalls the async workers.
pub struct SqliteKv {
    db: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("MERIDIAN_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS hashes (
                key   TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, field)
            );
            CREATE TABLE IF NOT EXISTS zsets (
                key    TEXT NOT NULL,
                member TEXT NOT NULL,
                score  REAL NOT NULL,
                PRIMARY KEY (key, member)
            );
            CREATE INDEX IF NOT EXISTS idx_zsets_key_score ON zsets(key, score, member);
            CREATE TABLE IF NOT EXISTS sets (
                key    TEXT NOT NULL,
                member TEXT NOT NULL,
                PRIMARY KEY (key, member)
            );",
        )
        .context("creating meridian tables")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, "sqlite kv opened");
        Ok(Self { db: Arc::new(Mutex::new(db)) })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
            f(&mut conn)
        })
        .await
        .context("sqlite task did not complete")?
    }
}

#[async_trait::async_trait]
impl KvBackend for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.run(move |db| Ok(db.query_row("SELECT value FROM kv WHERE key = ?1", [&key], |r| r.get(0)).optional()?)).await
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: Option<&str>) -> Result<bool> {
        let started = std::time::Instant::now();
        let (key, expected, value) = (key.to_string(), expected.map(str::to_string), value.map(str::to_string));
        let swapped = self
            .run(move |db| {
                let tx = db.transaction()?;
                let cur: Option<String> = tx.query_row("SELECT value FROM kv WHERE key = ?1", [&key], |r| r.get(0)).optional()?;
                if cur != expected {
                    return Ok(false);
                }
                match &value {
                    Some(v) => { tx.execute("INSERT INTO kv(key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value", params![key, v])?; }
                    None => { tx.execute("DELETE FROM kv WHERE key = ?1", [&key])?; }
                }
                tx.commit()?;
                Ok(true)
            })
            .await?;
        histogram!("persist_cas_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(swapped)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let (key, field) = (key.to_string(), field.to_string());
        self.run(move |db| {
            Ok(db.query_row("SELECT value FROM hashes WHERE key = ?1 AND field = ?2", params![key, field], |r| r.get(0)).optional()?)
        })
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<Option<String>> {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        self.run(move |db| {
            let tx = db.transaction()?;
            let prev: Option<String> = tx.query_row("SELECT value FROM hashes WHERE key = ?1 AND field = ?2", params![key, field], |r| r.get(0)).optional()?;
            tx.execute(
                "INSERT INTO hashes(key, field, value) VALUES (?1, ?2, ?3) ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                params![key, field, value],
            )?;
            tx.commit()?;
            Ok(prev)
        })
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<Option<String>> {
        let (key, field) = (key.to_string(), field.to_string());
        self.run(move |db| {
            let tx = db.transaction()?;
            let prev: Option<String> = tx.query_row("SELECT value FROM hashes WHERE key = ?1 AND field = ?2", params![key, field], |r| r.get(0)).optional()?;
            tx.execute("DELETE FROM hashes WHERE key = ?1 AND field = ?2", params![key, field])?;
            tx.commit()?;
            Ok(prev)
        })
        .await
    }

    async fn hscan(&self, key: &str, prefix: &str) -> Result<Vec<(String, String)>> {
        let (key, prefix) = (key.to_string(), prefix.to_string());
        self.run(move |db| {
            let mut stmt = db.prepare(
                "SELECT field, value FROM hashes WHERE key = ?1 AND substr(field, 1, length(?2)) = ?2 ORDER BY field",
            )?;
            let rows = stmt.query_map(params![key, prefix], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
            let mut out = Vec::new();
            for row in rows { out.push(row?); }
            Ok(out)
        })
        .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<Option<f64>> {
        let (key, member) = (key.to_string(), member.to_string());
        self.run(move |db| {
            let tx = db.transaction()?;
            let prev: Option<f64> = tx.query_row("SELECT score FROM zsets WHERE key = ?1 AND member = ?2", params![key, member], |r| r.get(0)).optional()?;
            tx.execute(
                "INSERT INTO zsets(key, member, score) VALUES (?1, ?2, ?3) ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
                params![key, member, score],
            )?;
            tx.commit()?;
            Ok(prev)
        })
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let (key, member) = (key.to_string(), member.to_string());
        self.run(move |db| {
            let tx = db.transaction()?;
            let prev: Option<f64> = tx.query_row("SELECT score FROM zsets WHERE key = ?1 AND member = ?2", params![key, member], |r| r.get(0)).optional()?;
            tx.execute("DELETE FROM zsets WHERE key = ?1 AND member = ?2", params![key, member])?;
            tx.commit()?;
            Ok(prev)
        })
        .await
    }

    async fn zrange(&self, key: &str, offset: usize, limit: Option<usize>, descending: bool) -> Result<Vec<String>> {
        let key = key.to_string();
        self.run(move |db| {
            let sql = if descending {
                "SELECT member FROM zsets WHERE key = ?1 ORDER BY score DESC, member DESC LIMIT ?2 OFFSET ?3"
            } else {
                "SELECT member FROM zsets WHERE key = ?1 ORDER BY score ASC, member ASC LIMIT ?2 OFFSET ?3"
            };
            let lim: i64 = limit.map(|l| l as i64).unwrap_or(-1);
            let mut stmt = db.prepare(sql)?;
            let rows = stmt.query_map(params![key, lim, offset as i64], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows { out.push(row?); }
            Ok(out)
        })
        .await
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let key = key.to_string();
        self.run(move |db| {
            let n: i64 = db.query_row("SELECT COUNT(*) FROM zsets WHERE key = ?1", [&key], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let (key, member) = (key.to_string(), member.to_string());
        self.run(move |db| Ok(db.execute("INSERT OR IGNORE INTO sets(key, member) VALUES (?1, ?2)", params![key, member])? > 0)).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let (key, member) = (key.to_string(), member.to_string());
        self.run(move |db| Ok(db.execute("DELETE FROM sets WHERE key = ?1 AND member = ?2", params![key, member])? > 0)).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let key = key.to_string();
        self.run(move |db| {
            let mut stmt = db.prepare("SELECT member FROM sets WHERE key = ?1 ORDER BY member")?;
            let rows = stmt.query_map([&key], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows { out.push(row?); }
            Ok(out)
        })
        .await
    }
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".meridian");
        let _ = std::fs::create_dir_all(&p);
        p.push("meridian.db");
        return p.to_string_lossy().to_string();
    }
    "meridian.db".to_string()
}
