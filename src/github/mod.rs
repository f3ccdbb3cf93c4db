//! GitHub Actions as the commit log and the workflow runner.

pub mod client;
pub mod error;

use std::process::Command;
use std::str::FromStr;

use anyhow::{bail, Context};
use reqwest::Url;
use tracing::{debug, info};

pub use client::{GithubClient, RunQuery, Workflow, WorkflowRun};
pub use error::GithubApiError;

/// Token from `GH_TOKEN`, `GITHUB_TOKEN`, or the GitHub CLI, in that order.
pub fn discover_token() -> Option<String> {
    for var in ["GH_TOKEN", "GITHUB_TOKEN"] {
        if let Ok(token) = std::env::var(var) {
            let token = token.trim().to_string();
            if !token.is_empty() {
                debug!(source = var, "using GitHub token from environment");
                return Some(token);
            }
        }
    }

    match Command::new("gh").args(["auth", "token"]).output() {
        Ok(out) if out.status.success() => {
            let token = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if token.is_empty() {
                None
            } else {
                debug!(source = "gh auth token", "using GitHub token from gh CLI");
                Some(token)
            }
        }
        Ok(_) | Err(_) => None,
    }
}

/// Validate `owner/name`.
pub fn validate_repository(repository: &str) -> anyhow::Result<()> {
    let mut parts = repository.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => Ok(()),
        _ => bail!("invalid repository '{}': expected owner/name", repository),
    }
}

/// A link to a workflow run or one of its jobs:
/// `https://github.com/<owner>/<repo>/actions/runs/<run>[/job/<job>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunUrl {
    pub repository: String,
    pub run_id: u64,
    pub job_id: Option<u64>,
}

impl FromStr for RunUrl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).with_context(|| format!("not a URL: {}", s))?;
        let segments: Vec<&str> = url
            .path_segments()
            .map(|parts| parts.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();

        let id_after = |name: &str| -> anyhow::Result<Option<u64>> {
            match segments.iter().position(|s| *s == name) {
                Some(i) => {
                    let raw = segments.get(i + 1).copied().unwrap_or("");
                    let id = raw
                        .parse()
                        .with_context(|| format!("invalid {} id '{}' in {}", name, raw, s))?;
                    Ok(Some(id))
                }
                None => Ok(None),
            }
        };

        if segments.len() < 5 || segments[2] != "actions" {
            bail!("could not find a workflow run in URL: {}", s);
        }
        let Some(run_id) = id_after("runs")? else {
            bail!("could not extract run ID from URL: {}", s);
        };
        let job_id = match id_after("job")? {
            Some(id) => Some(id),
            None => id_after("jobs")?,
        };

        Ok(Self {
            repository: format!("{}/{}", segments[0], segments[1]),
            run_id,
            job_id,
        })
    }
}

/// Everything needed to start a bisection, derived from a failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRun {
    pub repository: String,
    pub workflow: String,
    pub job: Option<String>,
    pub good: String,
    pub bad: String,
}

/// Turn a failed run (or job) link into bisection boundaries: the failed run's head
/// is the bad commit, the last earlier successful run's head is the good one.
pub async fn resolve_run_url(client: &GithubClient, url: &RunUrl) -> anyhow::Result<ResolvedRun> {
    let run = client
        .get_run(&url.repository, url.run_id)
        .await
        .with_context(|| format!("failed to fetch run {}", url.run_id))?;

    let job = match url.job_id {
        Some(job_id) => {
            let job = client
                .get_job(&url.repository, job_id)
                .await
                .with_context(|| format!("failed to fetch job {}", job_id))?;
            Some(job.name)
        }
        None => None,
    };

    let workflow = match run.workflow_file() {
        Some(file) => file.to_string(),
        None => {
            let wf = client
                .get_workflow(&url.repository, &run.workflow_id.to_string())
                .await
                .context("failed to fetch the run's workflow")?;
            wf.path.rsplit('/').next().unwrap_or(&wf.path).to_string()
        }
    };

    let Some(good_run) = client
        .find_previous_successful_run(&url.repository, &run, job.as_deref())
        .await?
    else {
        match &job {
            Some(job) => bail!(
                "no previous successful run found for job '{}' in workflow '{}' on branch {}",
                job,
                workflow,
                run.head_branch.as_deref().unwrap_or("?")
            ),
            None => bail!(
                "no previous successful run found for workflow '{}' on branch {}",
                workflow,
                run.head_branch.as_deref().unwrap_or("?")
            ),
        }
    };

    info!(
        %workflow,
        ?job,
        good = %good_run.head_sha,
        bad = %run.head_sha,
        "resolved boundaries from run"
    );
    Ok(ResolvedRun {
        repository: url.repository.clone(),
        workflow,
        job,
        good: good_run.head_sha,
        bad: run.head_sha,
    })
}
