//! Promotion of links into the automation backlog.

use crate::lookup::{CANNOT_BE_AUTOMATED, LookupResolver, READY_TO_AUTOMATE, require_lookup};
use crate::models::{AutomationState, BacklogEntry, LookupCategory, LookupRef, TestCaseLink};
use crate::storage::Storage;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;

/// Why a link did not reach the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotPromotedReason {
    /// Project or tester missing
    IncompleteAssignment,
    /// Flags are not definitive
    Pending,
}

/// Outcome of a promotion attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Promotion {
    Created { entry: BacklogEntry },
    Updated { entry: BacklogEntry },
    NotPromoted { reason: NotPromotedReason },
}

impl Promotion {
    pub fn entry(&self) -> Option<&BacklogEntry> {
        match self {
            Promotion::Created { entry } | Promotion::Updated { entry } => Some(entry),
            Promotion::NotPromoted { .. } => None,
        }
    }
}

/// Create or update the backlog entry titled like `link`.
///
/// An existing entry only has its workflow status changed. The unique title
/// constraint settles concurrent creations: the loser updates instead.
pub fn promote(storage: &mut Storage, link: &TestCaseLink) -> Result<Promotion> {
    let (Some(project_id), Some(tester_id)) = (link.project_id, link.assigned_tester_id) else {
        tracing::info!(title = %link.title, "not promoted: project or tester missing");
        return Ok(Promotion::NotPromoted {
            reason: NotPromotedReason::IncompleteAssignment,
        });
    };

    let status_code = match link.automation_state {
        AutomationState::Pending => {
            return Ok(Promotion::NotPromoted {
                reason: NotPromotedReason::Pending,
            });
        }
        AutomationState::ReadyToAutomate => READY_TO_AUTOMATE,
        AutomationState::NotAutomatable => CANNOT_BE_AUTOMATED,
    };

    storage.transaction(|s| {
        let status = require_lookup(&*s, LookupCategory::WorkflowStatus, status_code)?;

        if let Some(existing) = s.find_backlog_by_title(&link.title)? {
            return update_status(s, existing.id, status.id);
        }

        let issue_key = if link.issue_key.is_empty() {
            s.get_issue(link.issue_id)?.issue_key
        } else {
            link.issue_key.clone()
        };

        let now = Utc::now();
        let entry = BacklogEntry {
            id: 0,
            title: link.title.clone(),
            description: format!("Test case imported from tracker issue: {}", issue_key),
            priority: backlog_priority(&*s, link.test_bank_priority.as_deref())?,
            status: Some(LookupRef::from(&status)),
            project_id,
            tester_id,
            manual_tester_id: link.manual_tester_id,
            test_case_type: link.test_case_type.clone(),
            tool_type: link.tool_type.clone(),
            created_at: now,
            updated_at: now,
        };

        match s.insert_backlog_entry(&entry)? {
            Some(id) => {
                tracing::info!(title = %entry.title, status = status_code, "added to automation backlog");
                Ok(Promotion::Created {
                    entry: s.get_backlog_entry(id)?,
                })
            }
            None => {
                let existing = s.find_backlog_by_title(&link.title)?.ok_or_else(|| {
                    Error::NotFound(format!("Backlog entry vanished: {}", link.title))
                })?;
                update_status(s, existing.id, status.id)
            }
        }
    })
}

fn update_status(storage: &mut Storage, id: i64, status_id: i64) -> Result<Promotion> {
    storage.update_backlog_status(id, status_id)?;
    Ok(Promotion::Updated {
        entry: storage.get_backlog_entry(id)?,
    })
}

/// Test-bank priority when it names a known priority, else the default.
fn backlog_priority(lookups: &dyn LookupResolver, reported: Option<&str>) -> Result<Option<LookupRef>> {
    if let Some(code) = reported.map(str::trim).filter(|c| !c.is_empty()) {
        if let Some(row) = lookups.find_code(LookupCategory::Priority, code)? {
            return Ok(Some(LookupRef::from(&row)));
        }
        tracing::debug!(priority = code, "unknown test-bank priority, using default");
    }
    Ok(lookups
        .resolve(LookupCategory::Priority, None)?
        .map(|row| LookupRef::from(&row)))
}
