//! Persistence layer -- a small key-value interface with SQLite and in-memory backends.
//!
//! The bisection engine never touches SQL directly. The result cache, session records
//! and session locks are all stored as JSON values under a namespace and a key derived
//! from [`WorkflowKey`], so tests can swap in [`MemoryStore`].

pub mod cache;
pub mod schema;
pub mod session;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use thiserror::Error;

pub use cache::{CacheConsistencyError, CacheEntry, CacheError, CacheMode, ResultCache};
pub use session::{LockError, LockRecord, SessionLock, SessionState, SessionStatus, SessionStore};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Separator between key components. Not valid in repository names, workflow file
/// names, job names or SHAs.
const KEY_SEP: char = '\u{1f}';

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to (de)serialize stored record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("failed to prepare state directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("in-memory store lock poisoned")]
    Poisoned,
}

/// Logical tables inside the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    Cache,
    Session,
    Lock,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Cache => "cache",
            Namespace::Session => "session",
            Namespace::Lock => "lock",
        }
    }
}

/// Identifies one bisection target: `(repository, workflow, job?)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct WorkflowKey {
    pub repository: String,
    pub workflow: String,
    pub job: Option<String>,
}

impl WorkflowKey {
    pub fn new(repository: impl Into<String>, workflow: impl Into<String>, job: Option<String>) -> Self {
        Self {
            repository: repository.into(),
            workflow: workflow.into(),
            job,
        }
    }

    /// Stable string form used as the session and lock key.
    pub fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.repository,
            self.workflow,
            self.job.as_deref().unwrap_or(""),
            sep = KEY_SEP
        )
    }

    /// Prefix matching every cache key of this exact `(repository, workflow, job?)`.
    pub fn cache_prefix(&self) -> String {
        format!("{}{}", self.encode(), KEY_SEP)
    }

    /// Prefix matching cache keys of every job of `repository`/`workflow`.
    pub fn workflow_prefix(repository: &str, workflow: &str) -> String {
        format!("{}{sep}{}{sep}", repository, workflow, sep = KEY_SEP)
    }

    pub fn cache_key(&self, commit: &str) -> String {
        format!("{}{}", self.cache_prefix(), commit)
    }
}

impl std::fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.job {
            Some(job) => write!(f, "{}:{}#{}", self.repository, self.workflow, job),
            None => write!(f, "{}:{}", self.repository, self.workflow),
        }
    }
}

/// Durable key-value storage. Every write must be flushed before it returns.
pub trait KvStore: Send + Sync {
    fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, StorageError>;

    fn put(&self, ns: Namespace, key: &str, value: &str) -> Result<(), StorageError>;

    /// Insert only if `key` is absent. Returns whether the value was written.
    fn insert_if_absent(&self, ns: Namespace, key: &str, value: &str) -> Result<bool, StorageError>;

    /// Overwrite `key` only if it still holds `expected`. Returns whether the value
    /// was written.
    fn replace_if(&self, ns: Namespace, key: &str, expected: &str, value: &str) -> Result<bool, StorageError>;

    /// Returns whether a record was removed.
    fn delete(&self, ns: Namespace, key: &str) -> Result<bool, StorageError>;

    /// Remove every key starting with `prefix`. Returns the number removed.
    fn delete_prefix(&self, ns: Namespace, prefix: &str) -> Result<usize, StorageError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<(String, String)>, StorageError>;
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool, StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // synchronous = FULL: a verdict that was reported back must survive a crash.
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = FULL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::builder().max_size(4).build(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// [`KvStore`] backed by the `kv_entries` SQLite table.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self, StorageError> {
        tracing::debug!(path = %path.display(), "opening state database");
        Ok(Self::new(open_pool(path)?))
    }
}

impl KvStore for SqliteStore {
    fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2")?;
        let mut rows = stmt.query(params![ns.as_str(), key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn put(&self, ns: Namespace, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO kv_entries (namespace, key, value, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![ns.as_str(), key, value],
        )?;
        Ok(())
    }

    fn insert_if_absent(&self, ns: Namespace, key: &str, value: &str) -> Result<bool, StorageError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO kv_entries (namespace, key, value) VALUES (?1, ?2, ?3)",
            params![ns.as_str(), key, value],
        )?;
        Ok(changed == 1)
    }

    fn replace_if(&self, ns: Namespace, key: &str, expected: &str, value: &str) -> Result<bool, StorageError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE kv_entries SET value = ?4, updated_at = datetime('now')
             WHERE namespace = ?1 AND key = ?2 AND value = ?3",
            params![ns.as_str(), key, expected, value],
        )?;
        Ok(changed == 1)
    }

    fn delete(&self, ns: Namespace, key: &str) -> Result<bool, StorageError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            params![ns.as_str(), key],
        )?;
        Ok(changed > 0)
    }

    fn delete_prefix(&self, ns: Namespace, prefix: &str) -> Result<usize, StorageError> {
        let conn = self.pool.get()?;
        // substr() instead of LIKE: keys may contain '%' and '_'.
        let changed = conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2",
            params![ns.as_str(), prefix],
        )?;
        Ok(changed)
    }

    fn scan_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv_entries
             WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![ns.as_str(), prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }
}

/// [`KvStore`] held entirely in memory. Used by tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<(Namespace, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(Namespace, String), String>>, StorageError> {
        self.entries.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl KvStore for MemoryStore {
    fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.get(&(ns, key.to_string())).cloned())
    }

    fn put(&self, ns: Namespace, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries()?.insert((ns, key.to_string()), value.to_string());
        Ok(())
    }

    fn insert_if_absent(&self, ns: Namespace, key: &str, value: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries()?;
        let slot = (ns, key.to_string());
        if entries.contains_key(&slot) {
            return Ok(false);
        }
        entries.insert(slot, value.to_string());
        Ok(true)
    }

    fn replace_if(&self, ns: Namespace, key: &str, expected: &str, value: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries()?;
        match entries.get_mut(&(ns, key.to_string())) {
            Some(current) if current == expected => {
                *current = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete(&self, ns: Namespace, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries()?.remove(&(ns, key.to_string())).is_some())
    }

    fn delete_prefix(&self, ns: Namespace, prefix: &str) -> Result<usize, StorageError> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|(n, k), _| !(*n == ns && k.starts_with(prefix)));
        Ok(before - entries.len())
    }

    fn scan_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        Ok(self
            .entries()?
            .iter()
            .filter(|((n, k), _)| *n == ns && k.starts_with(prefix))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}
