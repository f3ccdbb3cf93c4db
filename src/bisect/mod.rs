//! Binary search for the first bad commit.
//!
//! [`CommitRange`] pins the commits, [`engine::BisectionEngine`] walks the window,
//! and the [`CommitLog`] seam supplies the commits between two refs.

pub mod engine;
pub mod range;
pub mod verdict;

use thiserror::Error;

use crate::storage::{CacheError, CacheConsistencyError, LockError, StorageError};

pub use engine::{BisectionEngine, EngineConfig, InconclusiveExhausted, Outcome, ResumeChoice, SessionPlan, Window};
pub use range::{Commit, CommitRange};
pub use verdict::Verdict;

#[derive(Debug, Error)]
pub enum BisectError {
    #[error("no commits to bisect between {good} and {}", bad.as_deref().unwrap_or("the bad ref"))]
    EmptyRange { good: String, bad: Option<String> },

    #[error("commit {sha} appears more than once in the commit range")]
    DuplicateCommit { sha: String },

    #[error("saved session for {key} is stale: {reason}; rerun with --fresh to discard it")]
    StaleSession { key: String, reason: String },

    #[error(
        "session for {key} was abandoned at window [{lo}, {hi}] ({}); rerun with --resume or --fresh",
        reason.as_deref().unwrap_or("no reason recorded")
    )]
    AbandonedSession {
        key: String,
        lo: usize,
        hi: usize,
        reason: Option<String>,
    },

    #[error(transparent)]
    SessionLocked(#[from] LockError),

    #[error("invalid bisection window [{lo}, {hi}] over {len} commits")]
    InvalidWindow { lo: usize, hi: usize, len: usize },

    #[error(transparent)]
    CacheConsistency(#[from] CacheConsistencyError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to list commits: {0}")]
    CommitLog(String),
}

impl From<CacheError> for BisectError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Consistency(e) => BisectError::CacheConsistency(e),
            CacheError::Storage(e) => BisectError::Storage(e),
        }
    }
}

/// Commits between two refs, as resolved by the hosting provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSpan {
    /// The good ref resolved to a full commit.
    pub good: Commit,
    /// Commits in `(good, bad]`, oldest first. Empty when the refs are identical or
    /// `good` is not an ancestor of `bad`.
    pub commits: Vec<Commit>,
}

#[async_trait::async_trait]
pub trait CommitLog: Send + Sync {
    async fn commits_between(&self, repository: &str, good: &str, bad: &str) -> anyhow::Result<CommitSpan>;
}

impl CommitRange {
    /// Build the range from a commit-log answer.
    pub fn from_span(span: CommitSpan) -> Result<Self, BisectError> {
        CommitRange::new(span.good, span.commits)
    }
}
