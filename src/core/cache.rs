//! Memoizing cache shared by every worker process.
//!
//! Entries live in a SQLite file so that workers running in separate OS
//! processes observe the same keys. Each entry is written at most once per
//! TTL window: a second `set` for a live key is a no-op. A `NULL` value is a
//! valid entry meaning "this call produced no usable result".

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::CallError;

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("cache file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cached value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache task failed: {0}")]
    Task(String),
}

impl From<CacheError> for CallError {
    fn from(err: CacheError) -> Self {
        CallError::Cache(err.to_string())
    }
}

/// A live cache entry: either a value or a recorded "no result"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached<T> {
    Value(T),
    NoResult,
}

/// Cache settings (from the `cache` config section)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Database file (default: `$NEWSFAN_HOME/cache.db`)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Lifetime of an entry in seconds
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
}

fn default_ttl() -> u64 {
    3600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            path: None,
            ttl_seconds: default_ttl(),
        }
    }
}

/// Entry counts reported by `newsfan cache stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub live: u64,
    pub no_result: u64,
    pub expired: u64,
}

/// SQLite-backed cache handle; cheap to clone
#[derive(Clone)]
pub struct Cache {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    ttl: Duration,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("path", &self.path)
            .field("ttl", &self.ttl)
            .finish()
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    key        TEXT PRIMARY KEY,
    value      BLOB,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entries_expires_at ON entries(expires_at);
";

impl Cache {
    /// Open or create the cache database
    pub fn open(path: &Path, ttl: Duration) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets readers in other worker processes proceed during a write;
        // the busy timeout absorbs write contention between processes.
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=10000;
            ",
        )?;
        conn.execute_batch(SCHEMA)?;

        debug!(path = %path.display(), ttl_secs = ttl.as_secs(), "Cache opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            ttl,
        })
    }

    /// Open the cache described by `settings`, defaulting under `home`
    pub fn from_settings(settings: &CacheSettings, home: &Path) -> Result<Self, CacheError> {
        let path = settings
            .path
            .clone()
            .unwrap_or_else(|| home.join("cache.db"));
        Self::open(&path, Duration::from_secs(settings.ttl_seconds))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Default entry lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Run cache operations on the blocking pool
    ///
    /// A write can wait up to the busy timeout on another process holding
    /// the database lock; async worker threads must not.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Cache) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || op(&cache))
            .await
            .map_err(|err| CacheError::Task(err.to_string()))?
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Look up a live entry; expired entries are treated as absent
    pub fn get(&self, key: &str) -> Result<Option<Cached<Vec<u8>>>, CacheError> {
        let now = now_millis();
        let row: Option<Option<Vec<u8>>> = self
            .conn()
            .query_row(
                "SELECT value FROM entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;

        Ok(row.map(|value| match value {
            Some(bytes) => Cached::Value(bytes),
            None => Cached::NoResult,
        }))
    }

    /// Write an entry unless a live one already exists
    ///
    /// Returns `true` when this call wrote the entry, `false` when an
    /// earlier writer already owns the key.
    pub fn set(&self, key: &str, value: Option<&[u8]>, ttl: Duration) -> Result<bool, CacheError> {
        let now = now_millis();
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_millis);

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM entries WHERE key = ?1 AND expires_at <= ?2",
            params![key, now],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )?;
        tx.commit()?;

        if inserted == 0 {
            debug!(key, "Cache entry already written, keeping first value");
        }
        Ok(inserted == 1)
    }

    /// Look up and decode a JSON entry
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Cached<T>>, CacheError> {
        match self.get(key)? {
            Some(Cached::Value(bytes)) => Ok(Some(Cached::Value(serde_json::from_slice(&bytes)?))),
            Some(Cached::NoResult) => Ok(Some(Cached::NoResult)),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value with the default TTL
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<bool, CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, Some(bytes.as_slice()), self.ttl)
    }

    /// Record that a call produced no usable result
    pub fn set_no_result(&self, key: &str) -> Result<bool, CacheError> {
        self.set(key, None, self.ttl)
    }

    /// Delete expired entries, returning how many were removed
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let removed = self
            .conn()
            .execute("DELETE FROM entries WHERE expires_at <= ?1", params![now_millis()])?;
        if removed > 0 {
            info!(removed, "Purged expired cache entries");
        }
        Ok(removed)
    }

    /// Delete every entry
    pub fn clear(&self) -> Result<usize, CacheError> {
        Ok(self.conn().execute("DELETE FROM entries", [])?)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = now_millis();
        let conn = self.conn();
        let (entries, live, no_result): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(expires_at > ?1), 0),
                    COALESCE(SUM(expires_at > ?1 AND value IS NULL), 0)
             FROM entries",
            params![now],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(CacheStats {
            entries: entries as u64,
            live: live as u64,
            no_result: no_result as u64,
            expired: (entries - live) as u64,
        })
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
