//! Durable per-commit verdict cache.
//!
//! A GOOD or BAD verdict for a commit is assumed never to change for the same
//! `(repository, workflow, job)`: the code at that commit is fixed. Such entries are
//! only removed by an explicit [`ResultCache::clear`]. PENDING and INCONCLUSIVE entries
//! are provisional and get replaced by the next real verdict.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{KvStore, Namespace, StorageError, WorkflowKey};
use crate::bisect::Verdict;

/// A different terminal verdict was about to replace a cached one.
#[derive(Debug, Clone, Error)]
#[error(
    "cache already holds {cached} for commit {commit} ({key}) but the tester reported {reported}; \
     the test is non-deterministic or the cache key collides. Clear the cache to accept the new result"
)]
pub struct CacheConsistencyError {
    pub key: String,
    pub commit: String,
    pub cached: Verdict,
    pub reported: Verdict,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Consistency(#[from] CacheConsistencyError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// How the engine is allowed to use the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Read before testing, write after.
    #[default]
    ReadWrite,
    /// Never read, still write (`--no-cache`).
    WriteOnly,
}

/// One cached verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub repository: String,
    pub workflow: String,
    pub job: Option<String>,
    pub commit: String,
    pub verdict: Verdict,
    pub timestamp: DateTime<Utc>,
}

/// Verdict cache over any [`KvStore`].
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn KvStore>,
    mode: CacheMode,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            mode: CacheMode::ReadWrite,
        }
    }

    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Cached verdict for `commit`, honoring the cache mode.
    pub fn get(&self, key: &WorkflowKey, commit: &str) -> Result<Option<Verdict>, StorageError> {
        if self.mode == CacheMode::WriteOnly {
            return Ok(None);
        }
        Ok(self.entry(key, commit)?.map(|e| e.verdict))
    }

    /// Stored entry regardless of the cache mode.
    pub fn entry(&self, key: &WorkflowKey, commit: &str) -> Result<Option<CacheEntry>, StorageError> {
        match self.store.get(Namespace::Cache, &key.cache_key(commit))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Record a verdict. Rewriting the same verdict is a no-op, a provisional verdict
    /// never replaces GOOD/BAD, and replacing GOOD with BAD (or back) is refused.
    pub fn put(&self, key: &WorkflowKey, commit: &str, verdict: Verdict) -> Result<(), CacheError> {
        if let Some(existing) = self.entry(key, commit)? {
            if existing.verdict == verdict {
                debug!(%key, %commit, %verdict, "verdict already cached");
                return Ok(());
            }
            if existing.verdict.is_terminal() && !verdict.is_terminal() {
                debug!(%key, %commit, cached = %existing.verdict, %verdict, "keeping cached verdict over provisional one");
                return Ok(());
            }
            if existing.verdict.is_terminal() {
                warn!(%key, %commit, cached = %existing.verdict, reported = %verdict, "refusing to overwrite cached verdict");
                return Err(CacheConsistencyError {
                    key: key.to_string(),
                    commit: commit.to_string(),
                    cached: existing.verdict,
                    reported: verdict,
                }
                .into());
            }
        }

        self.write(key, commit, verdict)?;
        debug!(%key, %commit, %verdict, "cached verdict");
        Ok(())
    }

    /// Note that a run for `commit` was dispatched but never resolved. Leaves an
    /// existing GOOD/BAD entry alone.
    pub fn mark_pending(&self, key: &WorkflowKey, commit: &str) -> Result<(), StorageError> {
        if let Some(existing) = self.entry(key, commit)? {
            if existing.verdict.is_terminal() {
                return Ok(());
            }
        }
        self.write(key, commit, Verdict::Pending)
    }

    /// Remove cached verdicts. `job = None` clears every job of the workflow.
    pub fn clear(&self, repository: &str, workflow: &str, job: Option<&str>) -> Result<usize, StorageError> {
        let prefix = match job {
            Some(job) => WorkflowKey::new(repository, workflow, Some(job.to_string())).cache_prefix(),
            None => WorkflowKey::workflow_prefix(repository, workflow),
        };
        let removed = self.store.delete_prefix(Namespace::Cache, &prefix)?;
        info!(%repository, %workflow, ?job, removed, "cleared cached verdicts");
        Ok(removed)
    }

    /// Remove the cached verdicts of exactly `key`.
    pub fn clear_key(&self, key: &WorkflowKey) -> Result<usize, StorageError> {
        let removed = self.store.delete_prefix(Namespace::Cache, &key.cache_prefix())?;
        info!(%key, removed, "cleared cached verdicts");
        Ok(removed)
    }

    /// Cached entries for a workflow, oldest write first.
    pub fn entries(&self, repository: &str, workflow: &str, job: Option<&str>) -> Result<Vec<CacheEntry>, StorageError> {
        let prefix = match job {
            Some(job) => WorkflowKey::new(repository, workflow, Some(job.to_string())).cache_prefix(),
            None => WorkflowKey::workflow_prefix(repository, workflow),
        };

        let mut entries = Vec::new();
        for (k, raw) in self.store.scan_prefix(Namespace::Cache, &prefix)? {
            match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(e) => entries.push(e),
                Err(e) => warn!(key = %k.replace('\u{1f}', "/"), error = %e, "skipping unreadable cache entry"),
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    fn write(&self, key: &WorkflowKey, commit: &str, verdict: Verdict) -> Result<(), StorageError> {
        let entry = CacheEntry {
            repository: key.repository.clone(),
            workflow: key.workflow.clone(),
            job: key.job.clone(),
            commit: commit.to_string(),
            verdict,
            timestamp: Utc::now(),
        };
        let raw = serde_json::to_string(&entry)?;
        self.store.put(Namespace::Cache, &key.cache_key(commit), &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn cache() -> ResultCache {
        ResultCache::new(Arc::new(MemoryStore::new()))
    }

    fn key(job: Option<&str>) -> WorkflowKey {
        WorkflowKey::new("owner/repo", "ci.yml", job.map(str::to_string))
    }

    #[test]
    fn test_put_then_get() {
        let cache = cache();
        assert_eq!(cache.get(&key(None), "abc").unwrap(), None);
        cache.put(&key(None), "abc", Verdict::Good).unwrap();
        assert_eq!(cache.get(&key(None), "abc").unwrap(), Some(Verdict::Good));

        let entry = cache.entry(&key(None), "abc").unwrap().unwrap();
        assert_eq!(entry.repository, "owner/repo");
        assert_eq!(entry.commit, "abc");
    }

    #[test]
    fn test_same_verdict_is_idempotent() {
        let cache = cache();
        cache.put(&key(None), "abc", Verdict::Bad).unwrap();
        cache.put(&key(None), "abc", Verdict::Bad).unwrap();
        assert_eq!(cache.get(&key(None), "abc").unwrap(), Some(Verdict::Bad));
    }

    #[test]
    fn test_conflicting_verdict_is_rejected_and_original_kept() {
        let cache = cache();
        cache.put(&key(None), "abc", Verdict::Good).unwrap();

        let err = cache.put(&key(None), "abc", Verdict::Bad).unwrap_err();
        match err {
            CacheError::Consistency(e) => {
                assert_eq!(e.cached, Verdict::Good);
                assert_eq!(e.reported, Verdict::Bad);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cache.get(&key(None), "abc").unwrap(), Some(Verdict::Good));
    }

    #[test]
    fn test_provisional_entries_are_replaced() {
        let cache = cache();
        cache.put(&key(None), "abc", Verdict::Inconclusive).unwrap();
        cache.put(&key(None), "abc", Verdict::Good).unwrap();
        assert_eq!(cache.get(&key(None), "abc").unwrap(), Some(Verdict::Good));

        cache.mark_pending(&key(None), "def").unwrap();
        assert_eq!(cache.get(&key(None), "def").unwrap(), Some(Verdict::Pending));
        cache.put(&key(None), "def", Verdict::Bad).unwrap();
        assert_eq!(cache.get(&key(None), "def").unwrap(), Some(Verdict::Bad));
    }

    #[test]
    fn test_inconclusive_does_not_replace_terminal_verdict() {
        let cache = cache();
        cache.put(&key(None), "abc", Verdict::Good).unwrap();
        cache.put(&key(None), "abc", Verdict::Inconclusive).unwrap();
        assert_eq!(cache.get(&key(None), "abc").unwrap(), Some(Verdict::Good));
    }

    #[test]
    fn test_mark_pending_keeps_terminal_verdict() {
        let cache = cache();
        cache.put(&key(None), "abc", Verdict::Bad).unwrap();
        cache.mark_pending(&key(None), "abc").unwrap();
        assert_eq!(cache.get(&key(None), "abc").unwrap(), Some(Verdict::Bad));
    }

    #[test]
    fn test_jobs_are_keyed_separately() {
        let cache = cache();
        cache.put(&key(Some("build")), "abc", Verdict::Good).unwrap();
        cache.put(&key(Some("test")), "abc", Verdict::Bad).unwrap();
        assert_eq!(cache.get(&key(Some("build")), "abc").unwrap(), Some(Verdict::Good));
        assert_eq!(cache.get(&key(Some("test")), "abc").unwrap(), Some(Verdict::Bad));
        assert_eq!(cache.get(&key(None), "abc").unwrap(), None);
    }

    #[test]
    fn test_clear_with_job_only_touches_that_job() {
        let cache = cache();
        cache.put(&key(Some("build")), "a", Verdict::Good).unwrap();
        cache.put(&key(Some("test")), "a", Verdict::Good).unwrap();
        cache.put(&key(None), "a", Verdict::Good).unwrap();

        assert_eq!(cache.clear("owner/repo", "ci.yml", Some("build")).unwrap(), 1);
        assert_eq!(cache.get(&key(Some("build")), "a").unwrap(), None);
        assert_eq!(cache.get(&key(Some("test")), "a").unwrap(), Some(Verdict::Good));

        assert_eq!(cache.clear("owner/repo", "ci.yml", None).unwrap(), 2);
        assert!(cache.entries("owner/repo", "ci.yml", None).unwrap().is_empty());
    }

    #[test]
    fn test_clear_key_leaves_job_entries() {
        let cache = cache();
        cache.put(&key(Some("build")), "a", Verdict::Good).unwrap();
        cache.put(&key(None), "a", Verdict::Bad).unwrap();

        assert_eq!(cache.clear_key(&key(None)).unwrap(), 1);
        assert_eq!(cache.get(&key(None), "a").unwrap(), None);
        assert_eq!(cache.get(&key(Some("build")), "a").unwrap(), Some(Verdict::Good));
    }

    #[test]
    fn test_clear_allows_new_verdict() {
        let cache = cache();
        cache.put(&key(None), "abc", Verdict::Good).unwrap();
        cache.clear("owner/repo", "ci.yml", None).unwrap();
        cache.put(&key(None), "abc", Verdict::Bad).unwrap();
        assert_eq!(cache.get(&key(None), "abc").unwrap(), Some(Verdict::Bad));
    }

    #[test]
    fn test_write_only_mode_bypasses_reads() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let writer = ResultCache::new(store.clone()).with_mode(CacheMode::WriteOnly);
        writer.put(&key(None), "abc", Verdict::Good).unwrap();
        assert_eq!(writer.get(&key(None), "abc").unwrap(), None);

        let reader = ResultCache::new(store);
        assert_eq!(reader.get(&key(None), "abc").unwrap(), Some(Verdict::Good));
    }

    #[test]
    fn test_entries_lists_other_workflows_separately() {
        let cache = cache();
        cache.put(&key(None), "a", Verdict::Good).unwrap();
        cache
            .put(&WorkflowKey::new("owner/repo", "nightly.yml", None), "a", Verdict::Bad)
            .unwrap();
        let listed = cache.entries("owner/repo", "ci.yml", None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].verdict, Verdict::Good);
    }
}
