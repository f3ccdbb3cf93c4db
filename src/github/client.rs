//! GitHub REST client for the Actions and git endpoints bisection needs.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::GithubApiError;
use crate::bisect::{Commit, CommitLog, CommitSpan};
use crate::tester::retry::with_retry;
use crate::tester::{JobInfo, RetryConfig, RunInfo, RunnerError, WorkflowRunner};

const USER_AGENT: &str = concat!("culprit-finder/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";

/// A workflow run with the fields needed to locate earlier runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub workflow_id: u64,
    /// `.github/workflows/<file>`, possibly with an `@ref` suffix.
    #[serde(default)]
    pub path: Option<String>,
    pub head_sha: String,
    #[serde(default)]
    pub head_branch: Option<String>,
    pub event: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn info(&self) -> RunInfo {
        RunInfo {
            id: self.id,
            head_sha: self.head_sha.clone(),
            head_branch: self.head_branch.clone(),
            status: self.status.clone().unwrap_or_default(),
            conclusion: self.conclusion.clone(),
            html_url: self.html_url.clone(),
        }
    }

    /// Workflow file name, e.g. `ci.yml`.
    pub fn workflow_file(&self) -> Option<&str> {
        let path = self.path.as_deref()?;
        let path = path.split('@').next().unwrap_or(path);
        path.rsplit('/').next().filter(|f| !f.is_empty())
    }

    fn succeeded(&self) -> bool {
        self.conclusion.as_deref() == Some("success")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub state: String,
}

/// Filters for listing the runs of one workflow.
#[derive(Debug, Clone, Default)]
pub struct RunQuery<'a> {
    pub branch: Option<&'a str>,
    pub event: Option<&'a str>,
    /// GitHub date filter, e.g. `<2024-01-01T00:00:00Z`.
    pub created: Option<String>,
    pub status: Option<&'a str>,
    pub per_page: usize,
}

impl RunQuery<'_> {
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("per_page", self.per_page.max(1).to_string())];
        if let Some(branch) = self.branch {
            params.push(("branch", branch.to_string()));
        }
        if let Some(event) = self.event {
            params.push(("event", event.to_string()));
        }
        if let Some(created) = &self.created {
            params.push(("created", created.clone()));
        }
        if let Some(status) = self.status {
            params.push(("status", status.to_string()));
        }
        params
    }
}

#[derive(Deserialize)]
struct CompareResponse {
    status: String,
    total_commits: usize,
    base_commit: ApiCommit,
    #[serde(default)]
    commits: Vec<ApiCommit>,
}

#[derive(Deserialize)]
struct ApiCommit {
    sha: String,
    commit: ApiCommitDetail,
}

#[derive(Deserialize)]
struct ApiCommitDetail {
    message: String,
}

impl From<ApiCommit> for Commit {
    fn from(c: ApiCommit) -> Self {
        Commit::new(c.sha, c.commit.message)
    }
}

#[derive(Deserialize)]
struct RunsResponse {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<JobInfo>,
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    retry: RetryConfig,
    page_size: usize,
}

impl GithubClient {
    pub fn new(api_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, GithubApiError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        if token.is_none() {
            warn!("no GitHub token found; requests are unauthenticated and dispatch will fail");
        }
        Ok(Self {
            http,
            base: api_url.trim_end_matches('/').to_string(),
            token,
            retry: RetryConfig::DEFAULT,
            page_size: 100,
        })
    }

    /// Retry policy for the commit listing. Runner calls are retried by the tester.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, 100);
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let rb = self
            .http
            .request(method, format!("{}{}", self.base, path))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    async fn send(&self, rb: RequestBuilder) -> Result<Response, GithubApiError> {
        let resp = rb.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        let err = GithubApiError::from_response(status, &headers, &body);
        debug!(status = status.as_u16(), transient = err.is_transient(), error = %err, "GitHub request failed");
        Err(err)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, GithubApiError> {
        let resp = self.send(self.request(Method::GET, path).query(query)).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn compare_page(
        &self,
        repository: &str,
        base: &str,
        head: &str,
        page: usize,
    ) -> Result<CompareResponse, GithubApiError> {
        self.get_json(
            &format!("/repos/{}/compare/{}...{}", repository, base, head),
            &[("per_page", self.page_size.to_string()), ("page", page.to_string())],
        )
        .await
    }

    pub async fn get_run(&self, repository: &str, run_id: u64) -> Result<WorkflowRun, GithubApiError> {
        self.get_json(&format!("/repos/{}/actions/runs/{}", repository, run_id), &[])
            .await
    }

    pub async fn get_job(&self, repository: &str, job_id: u64) -> Result<JobInfo, GithubApiError> {
        self.get_json(&format!("/repos/{}/actions/jobs/{}", repository, job_id), &[])
            .await
    }

    pub async fn get_workflow(&self, repository: &str, workflow: &str) -> Result<Workflow, GithubApiError> {
        self.get_json(&format!("/repos/{}/actions/workflows/{}", repository, workflow), &[])
            .await
    }

    pub async fn has_workflow(&self, repository: &str, workflow: &str) -> Result<bool, GithubApiError> {
        match self.get_workflow(repository, workflow).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Runs of `workflow` (file name or numeric id), newest first.
    pub async fn list_runs(
        &self,
        repository: &str,
        workflow: &str,
        query: &RunQuery<'_>,
    ) -> Result<Vec<WorkflowRun>, GithubApiError> {
        let resp: RunsResponse = self
            .get_json(
                &format!("/repos/{}/actions/workflows/{}/runs", repository, workflow),
                &query.params(),
            )
            .await?;
        Ok(resp.workflow_runs)
    }

    async fn jobs(&self, repository: &str, run_id: u64) -> Result<Vec<JobInfo>, GithubApiError> {
        let resp: JobsResponse = self
            .get_json(
                &format!("/repos/{}/actions/runs/{}/jobs", repository, run_id),
                &[("per_page", "100".to_string()), ("filter", "latest".to_string())],
            )
            .await?;
        Ok(resp.jobs)
    }

    /// Latest successful run before `failed` on the same branch and event, falling
    /// back to `push` runs. With `job`, a run counts when that job succeeded even if
    /// the run as a whole failed.
    pub async fn find_previous_successful_run(
        &self,
        repository: &str,
        failed: &WorkflowRun,
        job: Option<&str>,
    ) -> Result<Option<WorkflowRun>, GithubApiError> {
        let mut events = vec![failed.event.as_str()];
        if failed.event != "push" {
            events.push("push");
        }

        for event in events {
            if let Some(run) = self.previous_success_for_event(repository, failed, event, job).await? {
                info!(run_id = run.id, head_sha = %run.head_sha, event, "found previous successful run");
                return Ok(Some(run));
            }
            info!(event, "no previous successful run for this event");
        }
        Ok(None)
    }

    async fn previous_success_for_event(
        &self,
        repository: &str,
        failed: &WorkflowRun,
        event: &str,
        job: Option<&str>,
    ) -> Result<Option<WorkflowRun>, GithubApiError> {
        let workflow = failed.workflow_id.to_string();
        let query = RunQuery {
            branch: failed.head_branch.as_deref(),
            event: Some(event),
            created: Some(format!("<{}", failed.created_at.to_rfc3339_opts(SecondsFormat::Secs, true))),
            status: if job.is_none() { Some("success") } else { None },
            per_page: if job.is_none() { 1 } else { self.page_size },
        };
        let runs = self.list_runs(repository, &workflow, &query).await?;

        let Some(job) = job else {
            return Ok(runs.into_iter().find(|r| r.succeeded()));
        };
        for run in runs {
            if run.succeeded() {
                return Ok(Some(run));
            }
            if run.status.as_deref() != Some("completed") {
                continue;
            }
            let jobs = self.jobs(repository, run.id).await?;
            if jobs
                .iter()
                .any(|j| j.matches(job) && j.conclusion.as_deref() == Some("success"))
            {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl CommitLog for GithubClient {
    async fn commits_between(&self, repository: &str, good: &str, bad: &str) -> anyhow::Result<CommitSpan> {
        let fetch = |page: usize| {
            with_retry(&self.retry, "compare", None, move || async move {
                self.compare_page(repository, good, bad, page)
                    .await
                    .map_err(RunnerError::from)
            })
        };

        let first = fetch(1)
            .await
            .with_context(|| format!("failed to compare {}...{} in {}", good, bad, repository))?;
        let good_commit = Commit::from(first.base_commit);

        if first.status != "ahead" {
            warn!(%good, %bad, status = %first.status, "good ref is not strictly behind bad ref");
            return Ok(CommitSpan {
                good: good_commit,
                commits: Vec::new(),
            });
        }

        let total = first.total_commits;
        let mut commits: Vec<Commit> = first.commits.into_iter().map(Commit::from).collect();
        let mut page = 1;
        while commits.len() < total {
            page += 1;
            let next = fetch(page)
                .await
                .with_context(|| format!("failed to fetch page {} of {}...{}", page, good, bad))?;
            if next.commits.is_empty() {
                break;
            }
            commits.extend(next.commits.into_iter().map(Commit::from));
        }

        // A short listing would make the last listed commit stand in for `bad`.
        if commits.len() != total {
            bail!(
                "compare {}...{} listed {} of {} commits",
                good,
                bad,
                commits.len(),
                total
            );
        }
        if let Some(last) = commits.last() {
            if looks_like_sha(bad) && !last.sha.starts_with(&bad.to_ascii_lowercase()) {
                bail!("compare {}...{} ended at {}, not at the bad commit", good, bad, last.sha);
            }
        }

        debug!(%repository, commits = commits.len(), "listed commits");
        Ok(CommitSpan {
            good: good_commit,
            commits,
        })
    }
}

fn looks_like_sha(reference: &str) -> bool {
    reference.len() >= 7 && reference.len() <= 40 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait::async_trait]
impl WorkflowRunner for GithubClient {
    async fn create_branch(&self, repository: &str, branch: &str, sha: &str) -> Result<(), RunnerError> {
        let body = serde_json::json!({ "ref": format!("refs/heads/{}", branch), "sha": sha });
        self.send(
            self.request(Method::POST, &format!("/repos/{}/git/refs", repository))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_branch(&self, repository: &str, branch: &str) -> Result<(), RunnerError> {
        self.send(self.request(
            Method::DELETE,
            &format!("/repos/{}/git/refs/heads/{}", repository, branch),
        ))
        .await?;
        Ok(())
    }

    async fn latest_dispatch_run(
        &self,
        repository: &str,
        workflow: &str,
        branch: &str,
    ) -> Result<Option<RunInfo>, RunnerError> {
        let query = RunQuery {
            branch: Some(branch),
            event: Some("workflow_dispatch"),
            per_page: 1,
            ..Default::default()
        };
        let runs = self.list_runs(repository, workflow, &query).await?;
        Ok(runs.first().map(WorkflowRun::info))
    }

    async fn dispatch(
        &self,
        repository: &str,
        workflow: &str,
        branch: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<(), RunnerError> {
        let body = serde_json::json!({ "ref": branch, "inputs": inputs });
        self.send(
            self.request(
                Method::POST,
                &format!("/repos/{}/actions/workflows/{}/dispatches", repository, workflow),
            )
            .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn run_jobs(&self, repository: &str, run_id: u64) -> Result<Vec<JobInfo>, RunnerError> {
        Ok(self.jobs(repository, run_id).await?)
    }

    async fn cancel_run(&self, repository: &str, run_id: u64) -> Result<(), RunnerError> {
        self.send(self.request(
            Method::POST,
            &format!("/repos/{}/actions/runs/{}/cancel", repository, run_id),
        ))
        .await?;
        Ok(())
    }
}
