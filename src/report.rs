//! Human-readable and JSON rendering of bisection results and stored state.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bisect::{CommitRange, Outcome, Window};
use crate::storage::{CacheEntry, SessionState, WorkflowKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CulpritInfo {
    pub sha: String,
    pub subject: String,
    pub index: usize,
}

/// Machine-readable summary written by `--report`.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub repository: String,
    pub workflow: String,
    pub job: Option<String>,
    pub good: String,
    pub bad: String,
    pub commits: usize,
    /// `complete`, `abandoned` or `interrupted`.
    pub status: &'static str,
    pub culprit: Option<CulpritInfo>,
    pub window: Option<Window>,
    pub reason: Option<String>,
    pub in_flight: Option<String>,
    pub tester_invocations: Option<u32>,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    pub fn new(key: &WorkflowKey, range: &CommitRange, outcome: &Outcome) -> Self {
        let mut report = Self {
            repository: key.repository.clone(),
            workflow: key.workflow.clone(),
            job: key.job.clone(),
            good: range.good().sha.clone(),
            bad: range.bad().sha.clone(),
            commits: range.len(),
            status: "complete",
            culprit: None,
            window: None,
            reason: None,
            in_flight: None,
            tester_invocations: None,
            generated_at: Utc::now(),
        };

        match outcome {
            Outcome::Complete {
                culprit,
                index,
                tester_invocations,
            } => {
                report.culprit = Some(CulpritInfo {
                    sha: culprit.sha.clone(),
                    subject: culprit.subject().to_string(),
                    index: *index,
                });
                report.tester_invocations = Some(*tester_invocations);
            }
            Outcome::Abandoned {
                window,
                reason,
                tester_invocations,
            } => {
                report.status = "abandoned";
                report.window = Some(window.clone());
                report.reason = Some(reason.clone());
                report.tester_invocations = Some(*tester_invocations);
            }
            Outcome::Interrupted { window, in_flight } => {
                report.status = "interrupted";
                report.window = Some(window.clone());
                report.in_flight = in_flight.clone();
            }
        }
        report
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize report")?;
        std::fs::write(path, json).with_context(|| format!("failed to write report: {}", path.display()))
    }
}

/// One-paragraph summary printed at the end of `bisect`.
pub fn format_summary(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Complete {
            culprit,
            tester_invocations,
            ..
        } => format!(
            "The culprit commit is: {} (SHA: {})\n{} test run{}.",
            culprit.subject(),
            culprit.sha,
            tester_invocations,
            if *tester_invocations == 1 { "" } else { "s" }
        ),
        Outcome::Abandoned { window, reason, .. } => format!(
            "No culprit commit found. Bisection abandoned: {}\nThe culprit is after {} and at or before {} ({}).\n\
             Rerun with --resume to continue or --fresh to start over.",
            reason,
            window.good,
            window.bad,
            candidates(window)
        ),
        Outcome::Interrupted { window, in_flight } => {
            let mut s = format!(
                "Bisection interrupted. The culprit is after {} and at or before {} ({}).",
                window.good,
                window.bad,
                candidates(window)
            );
            if let Some(commit) = in_flight {
                s.push_str(&format!("\nThe test of {} did not finish and will be repeated.", commit));
            }
            s.push_str("\nRerun the same command to resume.");
            s
        }
    }
}

fn candidates(window: &Window) -> String {
    let n = CommitRange::candidates_between(window.lo, window.hi) + 1;
    format!("{} candidate{}", n, if n == 1 { "" } else { "s" })
}

/// Table for `cache list`.
pub fn format_cache_entries(entries: &[CacheEntry]) -> String {
    if entries.is_empty() {
        return "No cached verdicts.".to_string();
    }
    let mut out = format!("{:<40} | {:<12} | {:<20} | Recorded\n", "Commit", "Verdict", "Job");
    out.push_str(&format!("{:-<40}-|-{:-<12}-|-{:-<20}-|-{:-<19}\n", "", "", "", ""));
    for e in entries {
        out.push_str(&format!(
            "{:<40} | {:<12} | {:<20} | {}\n",
            e.commit,
            e.verdict.as_str(),
            e.job.as_deref().unwrap_or("-"),
            e.timestamp.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out
}

/// Detail view for `session show`.
pub fn format_session(state: &SessionState) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<20} {}\n", "Session:", state.key()));
    out.push_str(&format!("{:<20} {}\n", "Status:", state.status));
    out.push_str(&format!("{:<20} {}\n", "Good boundary:", state.good_boundary));
    out.push_str(&format!("{:<20} {}\n", "Bad boundary:", state.bad_boundary));
    out.push_str(&format!("{:<20} {}\n", "Commits:", state.commit_range_snapshot.len()));

    let sha = |i: usize| state.commit_range_snapshot.get(i).map(String::as_str).unwrap_or("?");
    out.push_str(&format!(
        "{:<20} [{}, {}] {}..{}\n",
        "Window:",
        state.lo,
        state.hi,
        sha(state.lo),
        sha(state.hi)
    ));
    out.push_str(&format!("{:<20} {}\n", "Tests run:", state.tester_invocations));
    if let Some(commit) = &state.in_flight {
        out.push_str(&format!("{:<20} {}\n", "In flight:", commit));
    }
    if let Some(reason) = &state.abandon_reason {
        out.push_str(&format!("{:<20} {}\n", "Abandoned:", reason));
    }
    out.push_str(&format!(
        "{:<20} {}\n",
        "Updated:",
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out
}
