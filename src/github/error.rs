//! GitHub API errors, split into transient and permanent for retry decisions.
//!
//! Transient: network failures, 5xx, 429, and 403 with an exhausted rate limit.
//! Everything else needs a human (bad token, missing workflow, no dispatch trigger).

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;

use crate::tester::{ErrorKind, RunnerError};

#[derive(Debug, Error)]
#[error("GitHub API error{}: {message}", status.map(|s| format!(" ({})", s)).unwrap_or_default())]
pub struct GithubApiError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl GithubApiError {
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

    /// Classify a non-success response.
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: &str) -> Self {
        let kind = if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            ErrorKind::Transient
        } else if status == StatusCode::FORBIDDEN && rate_limited(headers, body) {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        };
        Self {
            kind,
            status: Some(status.as_u16()),
            message: api_message(body),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl From<reqwest::Error> for GithubApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::permanent(format!("unexpected response body: {}", e));
        }
        match e.status() {
            Some(status) if status.is_client_error() => Self {
                kind: ErrorKind::Permanent,
                status: Some(status.as_u16()),
                message: e.to_string(),
            },
            _ => Self::transient(e.to_string()),
        }
    }
}

impl From<GithubApiError> for RunnerError {
    fn from(e: GithubApiError) -> Self {
        let error = RunnerError {
            kind: e.kind,
            status: None,
            message: e.message,
        };
        match e.status {
            Some(status) => error.with_status(status),
            None => error,
        }
    }
}

fn rate_limited(headers: &HeaderMap, body: &str) -> bool {
    let remaining_zero = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);
    remaining_zero || headers.contains_key("retry-after") || body.to_ascii_lowercase().contains("rate limit")
}

/// The `message` field of a GitHub error body, or the raw body.
fn api_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().chars().take(200).collect())
}
