//! The ordered, immutable list of commits under bisection.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::BisectError;

/// A commit as returned by the commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub message: String,
}

impl Commit {
    pub fn new(sha: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            message: message.into(),
        }
    }

    /// First line of the commit message.
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

/// Commits from the good boundary (index 0) to the bad boundary (index `len - 1`),
/// oldest first. Never mutated after construction; bisection only moves a
/// `[lo, hi]` window over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRange {
    commits: Vec<Commit>,
}

impl CommitRange {
    /// Build a range from the good boundary and the commit log output `(good, bad]`.
    ///
    /// The last element of `log` is the bad boundary. An empty log means the
    /// boundaries are identical or the good commit is not an ancestor of the bad one.
    pub fn new(good: Commit, log: Vec<Commit>) -> Result<Self, BisectError> {
        if log.is_empty() {
            return Err(BisectError::EmptyRange {
                good: good.sha,
                bad: None,
            });
        }
        if log.iter().any(|c| c.sha == good.sha) {
            return Err(BisectError::EmptyRange {
                good: good.sha,
                bad: log.last().map(|c| c.sha.clone()),
            });
        }

        let mut commits = Vec::with_capacity(log.len() + 1);
        commits.push(good);
        commits.extend(log);
        reject_duplicates(commits.iter().map(|c| c.sha.as_str()))?;
        Ok(Self { commits })
    }

    /// Rebuild a range from a persisted SHA snapshot. Messages are not persisted.
    pub fn from_snapshot(shas: &[String]) -> Result<Self, BisectError> {
        if shas.len() < 2 {
            return Err(BisectError::EmptyRange {
                good: shas.first().cloned().unwrap_or_default(),
                bad: None,
            });
        }
        reject_duplicates(shas.iter().map(String::as_str))?;
        Ok(Self {
            commits: shas.iter().map(|s| Commit::new(s.clone(), "")).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// Always false; a constructed range holds at least both boundaries.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Commit> {
        self.commits.get(index)
    }

    pub fn sha(&self, index: usize) -> Option<&str> {
        self.commits.get(index).map(|c| c.sha.as_str())
    }

    pub fn good(&self) -> &Commit {
        &self.commits[0]
    }

    pub fn bad(&self) -> &Commit {
        &self.commits[self.commits.len() - 1]
    }

    /// The ordered SHA list pinned into a session.
    pub fn shas(&self) -> Vec<String> {
        self.commits.iter().map(|c| c.sha.clone()).collect()
    }

    /// Lower midpoint of the window. Flooring keeps candidate order reproducible.
    pub fn midpoint(lo: usize, hi: usize) -> usize {
        lo + (hi - lo) / 2
    }

    /// True once no candidate is left between `lo` and `hi`; the culprit is at `hi`.
    pub fn is_settled(lo: usize, hi: usize) -> bool {
        hi <= lo + 1
    }

    /// Number of commits strictly inside the window.
    pub fn candidates_between(lo: usize, hi: usize) -> usize {
        hi.saturating_sub(lo).saturating_sub(1)
    }
}

/// Each SHA may appear once: cache entries and session indices are keyed by it.
fn reject_duplicates<'a>(shas: impl Iterator<Item = &'a str>) -> Result<(), BisectError> {
    let mut seen = HashSet::new();
    for sha in shas {
        if !seen.insert(sha) {
            return Err(BisectError::DuplicateCommit { sha: sha.to_string() });
        }
    }
    Ok(())
}
