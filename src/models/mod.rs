//! Data models for Quartermaster entities.
//!
//! This module defines the core data structures:
//! - `Issue` - A tracker issue and the test cases linked to it
//! - `TestCaseLink` - A test case as linked to one issue, with automation flags
//! - `BacklogEntry` - An automation work item promoted from a link
//! - `Project`, `Tester`, `Domain` - Assignment targets for links
//! - `LookupRow` - Reference data rows (priorities, statuses, tool types, ...)
//! - `IssueDto`, `Sprint` - Decoded tracker records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of test-bank identifiers (`TC-<digits>`).
const TEST_BANK_ID_PREFIX: &str = "TC-";

/// Returns true if `id` is a real test-bank identifier (`TC-<digits>`, case-insensitive).
///
/// Anything else is a legacy or derived identifier and is subject to pruning.
pub fn is_test_bank_id(id: &str) -> bool {
    let Some(prefix) = id.get(..TEST_BANK_ID_PREFIX.len()) else {
        return false;
    };
    let digits = &id[TEST_BANK_ID_PREFIX.len()..];
    prefix.eq_ignore_ascii_case(TEST_BANK_ID_PREFIX)
        && !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
}

/// Automation readiness of a linked test case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutomationState {
    #[default]
    Pending,
    ReadyToAutomate,
    NotAutomatable,
}

impl AutomationState {
    /// Derive the state from the two operator flags.
    ///
    /// Contradictory input (both flags set) folds into `Pending`.
    pub fn from_flags(can_be_automated: bool, cannot_be_automated: bool) -> Self {
        match (can_be_automated, cannot_be_automated) {
            (true, false) => AutomationState::ReadyToAutomate,
            (false, true) => AutomationState::NotAutomatable,
            _ => AutomationState::Pending,
        }
    }

    /// Lookup code for this state in the automation-status reference table.
    pub fn code(&self) -> &'static str {
        match self {
            AutomationState::Pending => "PENDING",
            AutomationState::ReadyToAutomate => "READY_TO_AUTOMATE",
            AutomationState::NotAutomatable => "NOT_AUTOMATABLE",
        }
    }

    /// Parse a lookup code, case-insensitive.
    pub fn parse(code: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|state| state.code().eq_ignore_ascii_case(code.trim()))
    }

    /// True for states that drive promotion into the backlog.
    pub fn is_definitive(&self) -> bool {
        !matches!(self, AutomationState::Pending)
    }

    pub fn all() -> &'static [AutomationState] {
        &[
            AutomationState::Pending,
            AutomationState::ReadyToAutomate,
            AutomationState::NotAutomatable,
        ]
    }
}

impl fmt::Display for AutomationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Reference table a lookup row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupCategory {
    Priority,
    WorkflowStatus,
    AutomationStatus,
    TestCaseType,
    ToolType,
    BuildStatus,
    Role,
}

impl LookupCategory {
    /// Code used when the caller supplies a blank code, if the category has one.
    pub fn default_code(&self) -> Option<&'static str> {
        match self {
            LookupCategory::Priority => Some("Medium"),
            LookupCategory::WorkflowStatus => Some("Active"),
            LookupCategory::AutomationStatus => Some("PENDING"),
            LookupCategory::Role => Some("Tester"),
            LookupCategory::TestCaseType | LookupCategory::ToolType | LookupCategory::BuildStatus => {
                None
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LookupCategory::Priority => "priority",
            LookupCategory::WorkflowStatus => "workflow_status",
            LookupCategory::AutomationStatus => "automation_status",
            LookupCategory::TestCaseType => "test_case_type",
            LookupCategory::ToolType => "tool_type",
            LookupCategory::BuildStatus => "build_status",
            LookupCategory::Role => "role",
        }
    }

    pub fn all() -> &'static [LookupCategory] {
        &[
            LookupCategory::Priority,
            LookupCategory::WorkflowStatus,
            LookupCategory::AutomationStatus,
            LookupCategory::TestCaseType,
            LookupCategory::ToolType,
            LookupCategory::BuildStatus,
            LookupCategory::Role,
        ]
    }
}

impl fmt::Display for LookupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LookupCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        LookupCategory::all()
            .iter()
            .copied()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| format!("Unknown lookup category: {}", s))
    }
}

/// Marker stored in `code_status` for rows offered in listings.
pub const ACTIVE_STATUS: &str = "Active";

/// A row of a reference table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRow {
    pub id: i64,

    pub category: LookupCategory,

    /// Unique (per category, case-insensitive) code
    pub code: String,

    /// Display text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_text: Option<String>,

    /// Active/inactive marker
    pub code_status: String,

    pub sort_by: i64,
}

impl LookupRow {
    pub fn is_active(&self) -> bool {
        self.code_status.eq_ignore_ascii_case(ACTIVE_STATUS)
    }
}

/// Compact reference to a lookup row embedded in other entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRef {
    pub id: i64,
    pub code: String,
}

impl From<&LookupRow> for LookupRef {
    fn from(row: &LookupRow) -> Self {
        Self {
            id: row.id,
            code: row.code.clone(),
        }
    }
}

/// A business domain grouping projects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A project test cases can be mapped to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,

    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<i64>,

    /// Name of the owning domain (hydrated on read)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,

    /// Tracker project key used when syncing this project's sprints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_project_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_board_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A QA tester that links and backlog entries can be assigned to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tester {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<LookupRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A tracker issue as persisted locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,

    /// Tracker key (e.g., "QA-123"); immutable once stored
    pub issue_key: String,

    pub summary: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_display_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sprint_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sprint_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    /// Occurrences of `search_keyword` in the issue's comments
    pub keyword_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_keyword: Option<String>,

    #[serde(default)]
    pub linked_test_cases: Vec<TestCaseLink>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    /// Create a new, unsaved issue from a decoded tracker record.
    pub fn from_dto(dto: &IssueDto) -> Self {
        let now = Utc::now();
        let mut issue = Self {
            id: 0,
            issue_key: dto.issue_key.clone(),
            summary: String::new(),
            assignee: None,
            assignee_display_name: None,
            sprint_id: None,
            sprint_name: None,
            issue_type: None,
            status: None,
            priority: None,
            keyword_count: 0,
            search_keyword: None,
            linked_test_cases: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        issue.apply_dto(dto);
        issue
    }

    /// Copy the tracker-owned fields from `dto`.
    ///
    /// Never touches the key, the keyword-search fields or the timestamps.
    pub fn apply_dto(&mut self, dto: &IssueDto) {
        self.summary = dto.summary.clone();
        self.assignee = dto.assignee.clone();
        self.assignee_display_name = dto.assignee_display_name.clone();
        self.sprint_id = dto.sprint_id.clone();
        self.sprint_name = dto.sprint_name.clone();
        self.issue_type = dto.issue_type.clone();
        self.status = dto.status.clone();
        self.priority = dto.priority.clone();
    }

    /// Assignee shown to QA: scanning links in order, the first test-bank
    /// assignee or assigned tester found, else the tracker assignee.
    pub fn effective_assignee(&self) -> Option<&str> {
        self.link_assignee().or(self.assignee.as_deref())
    }

    pub fn effective_assignee_display_name(&self) -> Option<&str> {
        self.link_assignee()
            .or(self.assignee_display_name.as_deref())
    }

    fn link_assignee(&self) -> Option<&str> {
        self.linked_test_cases.iter().find_map(|link| {
            link.test_bank_assignee
                .as_deref()
                .filter(|a| !a.trim().is_empty())
                .or(link.assigned_tester_name.as_deref())
        })
    }
}

/// A test case linked to one issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseLink {
    pub id: i64,

    /// Owning issue (never null)
    pub issue_id: i64,

    /// Key of the owning issue (hydrated on read)
    #[serde(default)]
    pub issue_key: String,

    /// Title as named in the test-bank; de-duplication key within an issue
    pub title: String,

    /// Test-bank identifier (`TC-<digits>` for real links)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_bank_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_bank_assignee: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_bank_priority: Option<String>,

    /// Automation status as reported by the test-bank (advisory only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_bank_automation_status: Option<String>,

    pub can_be_automated: bool,

    pub cannot_be_automated: bool,

    pub automation_state: AutomationState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_tester_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_tester_name: Option<String>,

    /// Secondary tester who executes the case manually
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_tester_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_tester_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_case_type: Option<LookupRef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<LookupRef>,

    /// Domain name captured when the link was mapped to a project
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_mapped: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TestCaseLink {
    /// Create a new, unsaved link for the given issue.
    pub fn new(issue: &Issue, title: String, test_bank_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            issue_id: issue.id,
            issue_key: issue.issue_key.clone(),
            title,
            test_bank_id,
            test_bank_assignee: None,
            test_bank_priority: None,
            test_bank_automation_status: None,
            can_be_automated: false,
            cannot_be_automated: false,
            automation_state: AutomationState::default(),
            project_id: None,
            project_name: None,
            assigned_tester_id: None,
            assigned_tester_name: None,
            manual_tester_id: None,
            manual_tester_name: None,
            test_case_type: None,
            tool_type: None,
            domain_mapped: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True if the link carries a real test-bank identifier.
    pub fn has_test_bank_id(&self) -> bool {
        self.test_bank_id.as_deref().is_some_and(is_test_bank_id)
    }
}

/// An automation work item promoted from a ready or not-automatable link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogEntry {
    pub id: i64,

    /// Matches the source link's title exactly; unique
    pub title: String,

    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<LookupRef>,

    /// Workflow status (e.g., "Ready to Automate")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LookupRef>,

    pub project_id: i64,

    pub tester_id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_tester_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_case_type: Option<LookupRef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<LookupRef>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A recorded sprint synchronization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    /// UUID v4 run identifier
    pub run_id: String,
    pub sprint_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    /// Issues never started because the run was cancelled
    pub not_started: usize,
    pub cancelled: bool,
    pub links_added: usize,
    pub links_pruned: usize,
}

/// A sprint as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sprint {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

/// An issue as decoded from the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDto {
    #[serde(alias = "key")]
    pub issue_key: String,

    #[serde(default)]
    pub summary: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprint_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprint_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    /// Candidate test-case links found on the issue
    #[serde(default)]
    pub linked_test_cases: Vec<TestCaseLinkDto>,
}

/// A candidate test-case link as decoded from the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseLinkDto {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_bank_id: Option<String>,
}

impl TestCaseLinkDto {
    pub fn has_test_bank_id(&self) -> bool {
        self.test_bank_id.as_deref().is_some_and(is_test_bank_id)
    }
}
