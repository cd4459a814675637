//! File-backed tracker for offline imports.
//!
//! Reads a JSON array of issues exported from the tracker (or written by
//! hand) and serves it as if it were the sprint's live issue list.

use super::{TrackerClient, TrackerError};
use crate::models::{IssueDto, Sprint};
use std::fs;
use std::path::{Path, PathBuf};

/// Tracker that replays issues from a JSON file.
pub struct FileTracker {
    path: PathBuf,
}

impl FileTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<IssueDto>, TrackerError> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            TrackerError::Transport(format!("Cannot read {}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            TrackerError::Parse(format!("{}: {}", self.path.display(), e))
        })
    }
}

impl TrackerClient for FileTracker {
    fn list_sprints(
        &self,
        _project_key: Option<&str>,
        _board_id: Option<&str>,
    ) -> Result<Vec<Sprint>, TrackerError> {
        let mut sprints: Vec<Sprint> = Vec::new();
        for issue in self.load()? {
            let Some(id) = issue.sprint_id else { continue };
            if sprints.iter().any(|s| s.id == id) {
                continue;
            }
            sprints.push(Sprint {
                name: issue.sprint_name.unwrap_or_else(|| id.clone()),
                id,
                state: None,
                start_date: None,
                end_date: None,
            });
        }
        Ok(sprints)
    }

    /// Issues tagged with another sprint are skipped; untagged issues are
    /// assigned to the requested sprint.
    fn list_issues_in_sprint(
        &self,
        sprint_id: &str,
        _project_key: Option<&str>,
        _board_id: Option<&str>,
    ) -> Result<Vec<IssueDto>, TrackerError> {
        let issues = self
            .load()?
            .into_iter()
            .filter(|issue| issue.sprint_id.as_deref().is_none_or(|s| s == sprint_id))
            .map(|mut issue| {
                issue.sprint_id = Some(sprint_id.to_string());
                issue
            })
            .collect();
        Ok(issues)
    }

    fn search_comments_for_keyword(
        &self,
        issue_key: &str,
        _keyword: &str,
    ) -> Result<u32, TrackerError> {
        Err(TrackerError::Unsupported(format!(
            "comment search for {} needs a live tracker",
            issue_key
        )))
    }

    fn test_connection(&self) -> bool {
        self.path.is_file()
    }
}
