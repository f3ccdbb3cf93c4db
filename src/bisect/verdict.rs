//! Verdicts produced by testing a single commit.

use serde::{Deserialize, Serialize};

/// Classification of one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Good,
    Bad,
    /// The tester could not produce a result (infrastructure failure, cancelled run).
    Inconclusive,
    /// A run was dispatched but its outcome is not known yet.
    Pending,
}

impl Verdict {
    /// GOOD and BAD are the only verdicts that narrow the search window.
    pub fn is_terminal(self) -> bool {
        matches!(self, Verdict::Good | Verdict::Bad)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Good => "GOOD",
            Verdict::Bad => "BAD",
            Verdict::Inconclusive => "INCONCLUSIVE",
            Verdict::Pending => "PENDING",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Verdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GOOD" => Ok(Verdict::Good),
            "BAD" => Ok(Verdict::Bad),
            "INCONCLUSIVE" => Ok(Verdict::Inconclusive),
            "PENDING" => Ok(Verdict::Pending),
            other => anyhow::bail!("unknown verdict '{}'", other),
        }
    }
}
