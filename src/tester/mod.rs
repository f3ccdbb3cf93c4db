//! Tester boundary: turns "test commit X" into a verdict.
//!
//! The engine only sees [`Tester`]. [`WorkflowTester`] implements it on top of any
//! [`WorkflowRunner`] (GitHub Actions in production, scripted fakes in tests) and owns
//! the transport retry policy.

pub mod retry;
pub mod workflow;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bisect::Verdict;
use crate::storage::WorkflowKey;

pub use retry::{AdapterTransportError, RetryConfig};
pub use workflow::{PollConfig, WorkflowTester};

/// Something that can classify a single commit.
#[async_trait::async_trait]
pub trait Tester: Send + Sync {
    /// Test `commit` for `key`. Never fails: transport problems become INCONCLUSIVE.
    ///
    /// Returns PENDING when `cancel` fired after a run had been dispatched.
    async fn test(&self, key: &WorkflowKey, commit: &str, cancel: &CancellationToken) -> Verdict;
}

/// Whether a runner error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failures, 5xx, rate limiting.
    Transient,
    /// Everything else: bad request, not found, unauthorized.
    Permanent,
}

/// Error from a [`WorkflowRunner`] call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RunnerError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl RunnerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// A workflow run as reported by the CI provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: u64,
    pub head_sha: String,
    pub head_branch: Option<String>,
    /// `queued`, `in_progress`, `completed`, ...
    pub status: String,
    pub conclusion: Option<String>,
    pub html_url: String,
}

impl RunInfo {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// One job of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}

impl JobInfo {
    /// Matches the job by name, including jobs nested under a reusable-workflow
    /// caller (`caller / name`).
    pub fn matches(&self, name: &str) -> bool {
        self.name == name || self.name.ends_with(&format!(" / {}", name))
    }
}

/// Remote workflow dispatch and polling.
#[async_trait::async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn create_branch(&self, repository: &str, branch: &str, sha: &str) -> Result<(), RunnerError>;

    async fn delete_branch(&self, repository: &str, branch: &str) -> Result<(), RunnerError>;

    /// Most recent `workflow_dispatch` run of `workflow` on `branch`.
    async fn latest_dispatch_run(
        &self,
        repository: &str,
        workflow: &str,
        branch: &str,
    ) -> Result<Option<RunInfo>, RunnerError>;

    async fn dispatch(
        &self,
        repository: &str,
        workflow: &str,
        branch: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<(), RunnerError>;

    async fn run_jobs(&self, repository: &str, run_id: u64) -> Result<Vec<JobInfo>, RunnerError>;

    async fn cancel_run(&self, repository: &str, run_id: u64) -> Result<(), RunnerError>;
}

/// Map a run or job conclusion to a verdict.
///
/// Only `success` and `failure` say anything about the code; every other conclusion
/// (cancelled, timed out, startup failure, skipped, ...) is INCONCLUSIVE.
pub fn verdict_for_conclusion(conclusion: Option<&str>) -> Verdict {
    match conclusion {
        Some("success") => Verdict::Good,
        Some("failure") => Verdict::Bad,
        _ => Verdict::Inconclusive,
    }
}
