//! [`Tester`] implementation that runs a CI workflow on a temporary branch.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::retry::{duration_secs, jittered, with_retry, AdapterTransportError, RetryConfig};
use super::{verdict_for_conclusion, RunInfo, Tester, WorkflowRunner};
use crate::bisect::Verdict;
use crate::storage::WorkflowKey;

/// Temporary branches are named `culprit-finder/test-<sha>_<uuid>`.
pub const BRANCH_PREFIX: &str = "culprit-finder/test-";

/// Input name understood by the culprit-finder wrapper workflow.
pub const WRAPPER_INPUT: &str = "workflow-to-debug";

/// Timing of the dispatch-then-poll sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Wait after creating the branch so Actions can see it before dispatch.
    #[serde(with = "duration_secs")]
    pub branch_settle: Duration,
    #[serde(with = "duration_secs")]
    pub poll_initial: Duration,
    #[serde(with = "duration_secs")]
    pub poll_max: Duration,
    pub poll_multiplier: f64,
    /// Give up on a run that has not concluded after this long.
    #[serde(with = "duration_secs")]
    pub run_timeout: Duration,
    /// Retry policy for individual API calls.
    pub transport: RetryConfig,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            branch_settle: Duration::from_secs(5),
            poll_initial: Duration::from_secs(15),
            poll_max: Duration::from_secs(120),
            poll_multiplier: 1.5,
            run_timeout: Duration::from_secs(6 * 60 * 60),
            transport: RetryConfig::DEFAULT,
        }
    }
}

impl PollConfig {
    /// Zero delays everywhere. For tests.
    pub fn immediate() -> Self {
        Self {
            branch_settle: Duration::ZERO,
            poll_initial: Duration::ZERO,
            poll_max: Duration::ZERO,
            poll_multiplier: 1.0,
            run_timeout: Duration::from_secs(30),
            transport: RetryConfig::IMMEDIATE,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.poll_multiplier.max(1.0))
            .unwrap_or(self.poll_max)
            .min(self.poll_max)
    }
}

/// Result of one dispatch-and-poll attempt before branch cleanup.
enum RunOutcome {
    Concluded(Verdict),
    /// Nothing was dispatched.
    NotStarted,
    /// Dispatched, then cancelled or timed out.
    Unresolved { run_id: Option<u64>, cancelled: bool },
}

/// Tests a commit by pushing a temporary branch at it and dispatching a workflow there.
pub struct WorkflowTester<R> {
    runner: R,
    config: PollConfig,
    /// Dispatch this workflow instead, passing the real one as `workflow-to-debug`.
    wrapper_workflow: Option<String>,
}

impl<R: WorkflowRunner> WorkflowTester<R> {
    pub fn new(runner: R, config: PollConfig) -> Self {
        Self {
            runner,
            config,
            wrapper_workflow: None,
        }
    }

    pub fn with_wrapper_workflow(mut self, workflow: Option<String>) -> Self {
        self.wrapper_workflow = workflow;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Workflow to dispatch and its inputs for `key`.
    fn dispatch_target(&self, key: &WorkflowKey) -> (String, BTreeMap<String, String>) {
        let mut inputs = BTreeMap::new();
        match &self.wrapper_workflow {
            Some(wrapper) => {
                inputs.insert(WRAPPER_INPUT.to_string(), key.workflow.clone());
                (wrapper.clone(), inputs)
            }
            None => (key.workflow.clone(), inputs),
        }
    }

    async fn run_on_branch(&self, key: &WorkflowKey, commit: &str, branch: &str, cancel: &CancellationToken) -> RunOutcome {
        let repo = key.repository.as_str();
        let transport = &self.config.transport;
        let (workflow, inputs) = self.dispatch_target(key);

        tokio::select! {
            _ = cancel.cancelled() => return RunOutcome::NotStarted,
            _ = tokio::time::sleep(self.config.branch_settle) => {}
        }

        // Remember the latest run so the one we dispatch can be told apart from it.
        let previous_id = match with_retry(transport, "list workflow runs", Some(cancel), || {
            self.runner.latest_dispatch_run(repo, &workflow, branch)
        })
        .await
        {
            Ok(run) => run.map(|r| r.id),
            Err(e) => {
                report_transport(&e, commit);
                return RunOutcome::NotStarted;
            }
        };

        info!(%workflow, %branch, %commit, "dispatching workflow");
        if let Err(e) = with_retry(transport, "dispatch workflow", Some(cancel), || {
            self.runner.dispatch(repo, &workflow, branch, &inputs)
        })
        .await
        {
            report_transport(&e, commit);
            return RunOutcome::NotStarted;
        }

        let deadline = Instant::now() + self.config.run_timeout;
        let mut delay = self.config.poll_initial;
        let mut run_id = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return RunOutcome::Unresolved { run_id, cancelled: true };
                }
                _ = tokio::time::sleep(jittered(delay)) => {}
            }

            if Instant::now() >= deadline {
                warn!(%commit, ?run_id, timeout = ?self.config.run_timeout, "workflow run did not conclude in time");
                return RunOutcome::Unresolved { run_id, cancelled: false };
            }

            let latest = match with_retry(transport, "poll workflow run", Some(cancel), || {
                self.runner.latest_dispatch_run(repo, &workflow, branch)
            })
            .await
            {
                Ok(latest) => latest,
                Err(AdapterTransportError::Cancelled { .. }) => {
                    return RunOutcome::Unresolved { run_id, cancelled: true };
                }
                Err(e) => {
                    report_transport(&e, commit);
                    return RunOutcome::Unresolved { run_id, cancelled: false };
                }
            };

            match latest {
                None => debug!(%branch, "no workflow run yet"),
                Some(run) if Some(run.id) == previous_id => debug!(%branch, "waiting for the new run to appear"),
                Some(run) => {
                    run_id = Some(run.id);
                    if run.is_completed() {
                        info!(%commit, run = run.id, conclusion = ?run.conclusion, url = %run.html_url, "workflow run completed");
                        return RunOutcome::Concluded(self.conclude(key, commit, &run, cancel).await);
                    }
                    debug!(%commit, run = run.id, status = %run.status, "workflow run in progress");
                }
            }

            delay = self.config.next_delay(delay);
        }
    }

    /// Delete the temporary branch. Not cancellable: the branch must not outlive the test.
    async fn remove_branch(&self, repo: &str, branch: &str) {
        match with_retry(&self.config.transport, "delete branch", None, || {
            self.runner.delete_branch(repo, branch)
        })
        .await
        {
            Ok(()) => debug!(%branch, "deleted temporary branch"),
            Err(AdapterTransportError::Rejected { error, .. }) if error.status == Some(404) => {
                debug!(%branch, "temporary branch does not exist")
            }
            Err(e) => warn!(%branch, error = %e, "failed to delete temporary branch"),
        }
    }

    /// Verdict for a completed run: the whole run, or the named job.
    async fn conclude(&self, key: &WorkflowKey, commit: &str, run: &RunInfo, cancel: &CancellationToken) -> Verdict {
        let Some(job) = key.job.as_deref() else {
            return verdict_for_conclusion(run.conclusion.as_deref());
        };

        let jobs = match with_retry(&self.config.transport, "list run jobs", Some(cancel), || {
            self.runner.run_jobs(&key.repository, run.id)
        })
        .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                report_transport(&e, commit);
                return Verdict::Inconclusive;
            }
        };

        match jobs.iter().find(|j| j.matches(job)) {
            Some(j) => verdict_for_conclusion(j.conclusion.as_deref()),
            None => {
                let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
                warn!(%commit, %job, run = run.id, ?names, "job not found in workflow run");
                Verdict::Inconclusive
            }
        }
    }
}

fn report_transport(error: &AdapterTransportError, commit: &str) {
    match error {
        AdapterTransportError::Cancelled { .. } => debug!(%commit, %error, "transport call cancelled"),
        _ => warn!(%commit, %error, "transport failure; treating commit as inconclusive"),
    }
}

#[async_trait::async_trait]
impl<R: WorkflowRunner> Tester for WorkflowTester<R> {
    async fn test(&self, key: &WorkflowKey, commit: &str, cancel: &CancellationToken) -> Verdict {
        if cancel.is_cancelled() {
            return Verdict::Inconclusive;
        }

        let repo = key.repository.as_str();
        let branch = format!("{}{}_{}", BRANCH_PREFIX, commit, Uuid::new_v4());
        info!(%commit, %branch, "testing commit");

        if let Err(e) = with_retry(&self.config.transport, "create branch", Some(cancel), || {
            self.runner.create_branch(repo, &branch, commit)
        })
        .await
        {
            report_transport(&e, commit);
            // An attempt whose response was lost may still have created the branch.
            self.remove_branch(repo, &branch).await;
            return Verdict::Inconclusive;
        }

        let outcome = self.run_on_branch(key, commit, &branch, cancel).await;

        let verdict = match outcome {
            RunOutcome::Concluded(v) => v,
            RunOutcome::NotStarted => Verdict::Inconclusive,
            RunOutcome::Unresolved { run_id, cancelled } => {
                // Stop remote work nobody will look at.
                if let Some(id) = run_id {
                    match with_retry(&self.config.transport, "cancel workflow run", None, || {
                        self.runner.cancel_run(repo, id)
                    })
                    .await
                    {
                        Ok(()) => info!(run = id, "cancelled workflow run"),
                        Err(e) => warn!(run = id, error = %e, "failed to cancel workflow run"),
                    }
                }
                if cancelled {
                    Verdict::Pending
                } else {
                    Verdict::Inconclusive
                }
            }
        };

        self.remove_branch(repo, &branch).await;

        info!(%commit, %verdict, "commit tested");
        verdict
    }
}
