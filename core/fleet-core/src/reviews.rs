//! Code-review status, fetched from the `gh` CLI and served from a cache.
//!
//! Fetching is slow (one `gh pr list` plus one `gh pr checks` per open PR),
//! so it runs on a background refresher thread. The aggregator only ever
//! reads the cache view, which never blocks on the network.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::cache::FetchCache;
use crate::command::run_with_timeout;
use crate::config::ReviewConfig;
use crate::error::{FleetError, Result};
use crate::types::{ReviewState, ReviewStatus};

pub trait ReviewFetcher: Send + Sync {
    fn fetch(&self, project_path: Option<&Path>) -> Result<Vec<ReviewStatus>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// CI Rollup
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiRollup {
    Failing,
    Pending,
    Passing,
}

const CI_FAIL_STATES: &[&str] = &["fail", "failed", "error", "cancelled", "timed_out"];
const CI_PENDING_STATES: &[&str] = &[
    "pending",
    "queued",
    "in_progress",
    "waiting",
    "startup_failure",
];
const CI_PASS_STATES: &[&str] = &[
    "pass",
    "passed",
    "success",
    "completed",
    "skipping",
    "skipped",
];

/// Any failure fails; otherwise anything in flight is pending; all green
/// passes. No checks at all count as pending.
pub fn ci_rollup<'a>(states: impl IntoIterator<Item = &'a str>) -> CiRollup {
    let states: Vec<String> = states.into_iter().map(str::to_ascii_lowercase).collect();
    if states.is_empty() {
        return CiRollup::Pending;
    }
    if states.iter().any(|s| CI_FAIL_STATES.contains(&s.as_str())) {
        return CiRollup::Failing;
    }
    if states.iter().any(|s| CI_PENDING_STATES.contains(&s.as_str())) {
        return CiRollup::Pending;
    }
    if states.iter().all(|s| CI_PASS_STATES.contains(&s.as_str())) {
        return CiRollup::Passing;
    }
    CiRollup::Pending
}

/// merged > ci-failing > changes-requested > approved > ci-passing > pending
pub fn review_state(merged: bool, decision: Option<&str>, ci: CiRollup) -> ReviewState {
    if merged {
        return ReviewState::Merged;
    }
    if ci == CiRollup::Failing {
        return ReviewState::CiFailing;
    }
    match decision.unwrap_or("") {
        "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
        "APPROVED" => ReviewState::Approved,
        _ if ci == CiRollup::Passing => ReviewState::CiPassing,
        _ => ReviewState::Pending,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// gh Adapter
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    state: String,
    #[serde(rename = "headRefName", default)]
    head_ref: String,
    #[serde(rename = "updatedAt", default)]
    updated_at: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(rename = "reviewDecision", default)]
    review_decision: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhCheck {
    #[serde(default)]
    state: String,
}

pub struct GhReviewFetcher {
    command: String,
    author: String,
    timeout: Duration,
}

impl GhReviewFetcher {
    pub fn new(command: impl Into<String>, author: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            author: author.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ReviewConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.author.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    fn checks(&self, number: u64, cwd: Option<&Path>) -> CiRollup {
        let number = number.to_string();
        let args = ["pr", "checks", number.as_str(), "--json", "name,state"];
        // gh exits non-zero while checks are pending or failing but still
        // prints the JSON, so stdout is parsed whatever the status.
        let stdout = match run_with_timeout(&self.command, &args, cwd, self.timeout) {
            Ok(output) => output.stdout,
            Err(err) => {
                tracing::debug!(error = %err, pr = %number, "Check lookup failed");
                return CiRollup::Pending;
            }
        };
        match serde_json::from_str::<Vec<GhCheck>>(stdout.trim()) {
            Ok(checks) => ci_rollup(checks.iter().map(|check| check.state.as_str())),
            Err(_) => CiRollup::Pending,
        }
    }
}

impl ReviewFetcher for GhReviewFetcher {
    fn fetch(&self, project_path: Option<&Path>) -> Result<Vec<ReviewStatus>> {
        let args = [
            "pr",
            "list",
            "--author",
            self.author.as_str(),
            "--state",
            "open",
            "--json",
            "number,title,state,headRefName,updatedAt,url,reviewDecision",
        ];
        let output = run_with_timeout(&self.command, &args, project_path, self.timeout)?;
        if !output.success {
            return Err(FleetError::CommandFailed {
                command: format!("{} pr list", self.command),
                details: format!("exit status {}", output.code.unwrap_or(-1)),
            });
        }

        let prs: Vec<GhPullRequest> =
            serde_json::from_str(output.stdout.trim()).map_err(|source| FleetError::Json {
                context: "parsing gh pr list output".to_string(),
                source,
            })?;

        let mut reviews = Vec::with_capacity(prs.len());
        for pr in prs.into_iter().filter(|pr| pr.number > 0) {
            let ci = self.checks(pr.number, project_path);
            let merged = pr.state.eq_ignore_ascii_case("merged");
            reviews.push(ReviewStatus {
                number: pr.number,
                state: review_state(merged, pr.review_decision.as_deref(), ci),
                repository: repository_from_url(&pr.url),
                title: pr.title,
                head_ref: pr.head_ref,
                updated_at: pr
                    .updated_at
                    .as_deref()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|parsed| parsed.with_timezone(&Utc)),
                url: pr.url,
            });
        }
        Ok(reviews)
    }
}

/// `https://github.com/owner/repo/pull/12` -> `owner/repo`
fn repository_from_url(url: &str) -> String {
    let parts: Vec<&str> = url.trim_end_matches('/').split('/').collect();
    match parts.iter().position(|part| *part == "pull") {
        Some(idx) if idx >= 2 => format!("{}/{}", parts[idx - 2], parts[idx - 1]),
        _ => String::new(),
    }
}

/// Reviews for the current project, refreshed by [`crate::cache::spawn_refresher`].
pub type ReviewCache = FetchCache<ReviewStatus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_follows_failure_then_pending_then_pass() {
        assert_eq!(ci_rollup(["success", "FAILED"]), CiRollup::Failing);
        assert_eq!(ci_rollup(["success", "queued"]), CiRollup::Pending);
        assert_eq!(ci_rollup(["pass", "skipped"]), CiRollup::Passing);
        assert_eq!(ci_rollup(["neutral"]), CiRollup::Pending);
        assert_eq!(ci_rollup(Vec::<&str>::new()), CiRollup::Pending);
    }

    #[test]
    fn state_precedence() {
        assert_eq!(
            review_state(true, Some("APPROVED"), CiRollup::Failing),
            ReviewState::Merged
        );
        assert_eq!(
            review_state(false, Some("APPROVED"), CiRollup::Failing),
            ReviewState::CiFailing
        );
        assert_eq!(
            review_state(false, Some("CHANGES_REQUESTED"), CiRollup::Passing),
            ReviewState::ChangesRequested
        );
        assert_eq!(
            review_state(false, Some("APPROVED"), CiRollup::Passing),
            ReviewState::Approved
        );
        assert_eq!(
            review_state(false, Some("REVIEW_REQUIRED"), CiRollup::Passing),
            ReviewState::CiPassing
        );
        assert_eq!(review_state(false, None, CiRollup::Pending), ReviewState::Pending);
    }

    #[test]
    fn repository_is_parsed_from_pull_url() {
        assert_eq!(
            repository_from_url("https://github.com/me/fleet/pull/12"),
            "me/fleet"
        );
        assert_eq!(repository_from_url(""), "");
    }
}
