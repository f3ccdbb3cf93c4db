//! culprit-finder -- find the commit that broke a CI workflow.
//!
//! Bisects the commits between a known-good and a known-bad ref by running the
//! workflow remotely on temporary branches. Verdicts are cached per commit and the
//! search window is persisted, so an interrupted run picks up where it stopped.

pub mod bisect;
pub mod config;
pub mod github;
pub mod report;
pub mod storage;
pub mod tester;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bisect::{BisectError, BisectionEngine, CommitLog, CommitRange, EngineConfig, Outcome, ResumeChoice, SessionPlan};
use storage::{CacheMode, KvStore, ResultCache, SessionStore, WorkflowKey};
use tester::Tester;

/// One `bisect` invocation.
#[derive(Debug, Clone)]
pub struct BisectRequest {
    pub key: WorkflowKey,
    pub good: String,
    pub bad: String,
    pub resume: ResumeChoice,
    /// Drop this key's cached verdicts before starting.
    pub clear_cache: bool,
    /// Take the session lock even if another process holds it.
    pub force_unlock: bool,
    pub cache_mode: CacheMode,
    pub engine: EngineConfig,
}

impl BisectRequest {
    pub fn new(key: WorkflowKey, good: impl Into<String>, bad: impl Into<String>) -> Self {
        Self {
            key,
            good: good.into(),
            bad: bad.into(),
            resume: ResumeChoice::Auto,
            clear_cache: false,
            force_unlock: false,
            cache_mode: CacheMode::ReadWrite,
            engine: EngineConfig::default(),
        }
    }
}

/// The range that was bisected and how the run ended.
#[derive(Debug, Clone)]
pub struct Bisection {
    pub range: CommitRange,
    pub outcome: Outcome,
}

/// Bisect `request` against the given collaborators until it completes, is
/// abandoned, or `cancel` fires.
pub async fn run_bisection(
    request: &BisectRequest,
    commit_log: &dyn CommitLog,
    tester: Arc<dyn Tester>,
    store: Arc<dyn KvStore>,
    cancel: CancellationToken,
) -> Result<Bisection, BisectError> {
    let key = &request.key;

    // 1. Resolve the commit range
    info!(%key, good = %request.good, bad = %request.bad, "listing commits");
    let span = commit_log
        .commits_between(&key.repository, &request.good, &request.bad)
        .await
        .map_err(|e| BisectError::CommitLog(format!("{:#}", e)))?;
    let range = CommitRange::from_span(span)?;
    info!(commits = range.len(), "commit range resolved");

    // 2. Claim the key
    let sessions = SessionStore::new(store.clone());
    let lock = sessions.lock(key, request.force_unlock)?;

    // 3. Prepare the cache
    let cache = ResultCache::new(store).with_mode(request.cache_mode);
    if request.clear_cache {
        cache.clear_key(key)?;
    }

    // 4. Start or resume the session, then drive it
    let result = match SessionPlan::prepare(&sessions, key, &range, request.resume) {
        Ok(plan) => {
            let mut engine = BisectionEngine::new(range.clone(), plan, cache, sessions, tester)
                .with_config(request.engine)
                .with_cancellation(cancel);
            engine.run().await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = lock.release() {
        warn!(error = %e, "failed to release session lock");
    }

    Ok(Bisection {
        range,
        outcome: result?,
    })
}
