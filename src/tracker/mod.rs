//! Issue-tracker collaborators.
//!
//! The engine only sees the [`TrackerClient`] trait. Two implementations exist:
//! - [`JiraClient`] - Jira-compatible REST over `ureq`
//! - [`FileTracker`] - replays an exported sprint from a JSON file

mod file;
mod jira;

pub use file::FileTracker;
pub use jira::{JiraClient, TrackerCredentials, extract_test_case_links};

use crate::models::{IssueDto, Sprint};
use thiserror::Error;

/// Errors raised by tracker clients.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Base URL or credentials missing
    #[error("Tracker is not configured (set tracker url, username and token)")]
    NotConfigured,

    /// Credentials rejected (401 Unauthorized)
    #[error("Tracker rejected the credentials: 401 Unauthorized")]
    Unauthorized,

    /// Credentials lack access (403 Forbidden)
    #[error("Tracker denied access: 403 Forbidden")]
    Forbidden,

    /// Any other non-success status
    #[error("Tracker request failed: {0}")]
    Http(String),

    /// Response body could not be decoded
    #[error("Failed to parse tracker response: {0}")]
    Parse(String),

    /// Network failure or timeout
    #[error("Tracker unreachable: {0}")]
    Transport(String),

    /// The client cannot perform this operation
    #[error("Unsupported tracker operation: {0}")]
    Unsupported(String),
}

/// Source of sprints and issues.
pub trait TrackerClient: Send + Sync {
    /// List sprints of a board; without a board the project's first board is used.
    fn list_sprints(
        &self,
        project_key: Option<&str>,
        board_id: Option<&str>,
    ) -> Result<Vec<Sprint>, TrackerError>;

    /// List the issues of one sprint with their candidate test-case links.
    fn list_issues_in_sprint(
        &self,
        sprint_id: &str,
        project_key: Option<&str>,
        board_id: Option<&str>,
    ) -> Result<Vec<IssueDto>, TrackerError>;

    /// Count case-insensitive occurrences of `keyword` across the issue's comments.
    fn search_comments_for_keyword(&self, issue_key: &str, keyword: &str)
    -> Result<u32, TrackerError>;

    fn test_connection(&self) -> bool;
}

/// Count case-insensitive, non-overlapping occurrences of `needle` in `haystack`.
pub fn count_occurrences(haystack: &str, needle: &str) -> u32 {
    let needle = needle.to_lowercase();
    if needle.is_empty() {
        return 0;
    }
    haystack.to_lowercase().matches(needle.as_str()).count() as u32
}
