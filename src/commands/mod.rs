//! Command implementations for the `qm` CLI.
//!
//! Each command opens storage for the data directory, runs one library
//! operation and returns a result that renders as JSON or human text.

use crate::config::{self, ConfigEntry, ResolvedConfig};
use crate::lookup::{LookupResolver, resolve_user_code};
use crate::models::{
    BacklogEntry, Issue, LookupCategory, LookupRow, Project, Sprint, SyncRun, TestCaseLink, Tester,
};
use crate::reconcile::ops::{self, FlagUpdate, MapRequest, MapUpdate, SprintStatistics};
use crate::reconcile::{CancelFlag, NotPromotedReason, Promotion, SprintSyncCoordinator, SyncReport, SyncRequest};
use crate::storage::{NewProject, Storage};
use crate::testbank::{NoTestBank, QTestClient, TestBankClient};
use crate::tracker::{JiraClient, TrackerClient, TrackerError};
use crate::{Error, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output: Serialize {
    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
    }

    fn to_human(&self) -> String;
}

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

// === Clients ===

/// Tracker client from the resolved configuration.
pub fn tracker_client(config: &ResolvedConfig) -> Result<JiraClient> {
    let credentials = config
        .tracker_credentials()
        .ok_or(Error::Tracker(TrackerError::NotConfigured))?;
    Ok(JiraClient::new(credentials))
}

/// Test-bank client from the resolved configuration; enrichment is skipped when incomplete.
pub fn test_bank_client(config: &ResolvedConfig) -> Box<dyn TestBankClient> {
    let credentials = config.test_bank_credentials();
    if credentials.is_complete() {
        Box::new(QTestClient::new(credentials))
    } else {
        tracing::debug!("test-bank not configured, enrichment disabled");
        Box::new(NoTestBank)
    }
}

// === Init ===

#[derive(Serialize)]
pub struct InitResult {
    pub data_dir: PathBuf,
    pub created: bool,
    pub lookups_added: usize,
    pub domain_id: i64,
    pub project_id: i64,
    pub tester_id: i64,
}

impl Output for InitResult {
    fn to_human(&self) -> String {
        let verb = if self.created { "Initialized" } else { "Already initialized" };
        format!(
            "{} quartermaster at {}\n  {} lookup rows added",
            verb,
            self.data_dir.display(),
            self.lookups_added
        )
    }
}

/// Create the database if needed and seed reference data.
pub fn init(data_dir: &Path) -> Result<InitResult> {
    let created = !Storage::exists(data_dir);
    let mut storage = if created {
        Storage::init(data_dir)?
    } else {
        Storage::open(data_dir)?
    };
    let seed = storage.seed_reference_data()?;
    tracing::info!(created, lookups_added = seed.lookups_added, "workspace ready");

    Ok(InitResult {
        data_dir: data_dir.to_path_buf(),
        created,
        lookups_added: seed.lookups_added,
        domain_id: seed.domain_id,
        project_id: seed.project_id,
        tester_id: seed.tester_id,
    })
}

// === Sprint Commands ===

#[derive(Serialize)]
pub struct SprintList {
    pub sprints: Vec<Sprint>,
}

impl Output for SprintList {
    fn to_human(&self) -> String {
        if self.sprints.is_empty() {
            return "No sprints found.".to_string();
        }
        let mut out = String::new();
        for sprint in &self.sprints {
            let _ = writeln!(
                out,
                "{:>8}  {}  [{}]",
                sprint.id,
                sprint.name,
                or_dash(sprint.state.as_deref())
            );
        }
        out.trim_end().to_string()
    }
}

pub fn sprints(
    tracker: &dyn TrackerClient,
    project_key: Option<&str>,
    board_id: Option<&str>,
) -> Result<SprintList> {
    Ok(SprintList {
        sprints: tracker.list_sprints(project_key, board_id)?,
    })
}

impl Output for SyncReport {
    fn to_human(&self) -> String {
        let mut out = format!(
            "Sprint {}: {} synced, {} failed",
            self.sprint_id, self.succeeded, self.failed
        );
        if self.cancelled {
            let _ = write!(out, ", {} not started (cancelled)", self.not_started);
        }
        let _ = write!(
            out,
            "\n  links: {} added, {} pruned, {} enriched\n  run: {}",
            self.links_added, self.links_pruned, self.links_enriched, self.run_id
        );
        for failure in &self.failures {
            let _ = write!(out, "\n  FAILED {}: {}", failure.issue_key, failure.error);
        }
        out
    }
}

/// Reconcile a sprint into storage.
pub fn sync(
    data_dir: &Path,
    tracker: &dyn TrackerClient,
    test_bank: &dyn TestBankClient,
    request: &SyncRequest,
    workers: usize,
    cancel: CancelFlag,
) -> Result<SyncReport> {
    let storage = Mutex::new(Storage::open(data_dir)?);
    SprintSyncCoordinator::new(tracker, test_bank)
        .with_workers(workers)
        .with_cancel(cancel)
        .sync_sprint(&storage, request)
}

#[derive(Serialize)]
pub struct SyncHistory {
    pub runs: Vec<SyncRun>,
}

impl Output for SyncHistory {
    fn to_human(&self) -> String {
        if self.runs.is_empty() {
            return "No sync runs recorded.".to_string();
        }
        let mut out = String::new();
        for run in &self.runs {
            let _ = writeln!(
                out,
                "{}  sprint {}  ok={} failed={} not_started={}{}  ({})",
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                run.sprint_id,
                run.succeeded,
                run.failed,
                run.not_started,
                if run.cancelled { " cancelled" } else { "" },
                run.run_id
            );
        }
        out.trim_end().to_string()
    }
}

pub fn sync_history(data_dir: &Path, sprint: Option<&str>, limit: usize) -> Result<SyncHistory> {
    let storage = Storage::open(data_dir)?;
    Ok(SyncHistory {
        runs: storage.list_sync_runs(sprint, limit)?,
    })
}

impl Output for SprintStatistics {
    fn to_human(&self) -> String {
        let t = &self.totals;
        let mut out = format!(
            "Sprint {}: {} issues, {} links\n  ready to automate: {}\n  not automatable:   {}\n  pending:           {}",
            self.sprint_id, self.issues, t.links, t.ready_to_automate, t.not_automatable, t.pending
        );
        for (title, breakdown) in [("By project", &self.by_project), ("By domain", &self.by_domain)] {
            if breakdown.is_empty() {
                continue;
            }
            let _ = write!(out, "\n{}:", title);
            for (name, totals) in breakdown {
                let _ = write!(
                    out,
                    "\n  {}: {} links ({} ready, {} not automatable, {} pending)",
                    name, totals.links, totals.ready_to_automate, totals.not_automatable, totals.pending
                );
            }
        }
        out
    }
}

pub fn stats(data_dir: &Path, sprint: &str) -> Result<SprintStatistics> {
    let storage = Storage::open(data_dir)?;
    ops::sprint_statistics(&storage, sprint)
}

// === Issue Commands ===

/// An issue together with its effective assignee.
#[derive(Serialize)]
pub struct IssueView {
    #[serde(flatten)]
    pub issue: Issue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_assignee_display_name: Option<String>,
}

impl From<Issue> for IssueView {
    fn from(issue: Issue) -> Self {
        Self {
            effective_assignee: issue.effective_assignee().map(str::to_string),
            effective_assignee_display_name: issue
                .effective_assignee_display_name()
                .map(str::to_string),
            issue,
        }
    }
}

impl Output for IssueView {
    fn to_human(&self) -> String {
        let issue = &self.issue;
        let mut out = format!(
            "{} {}\n  status: {}  sprint: {}  assignee: {}",
            issue.issue_key,
            issue.summary,
            or_dash(issue.status.as_deref()),
            or_dash(issue.sprint_id.as_deref()),
            or_dash(self.effective_assignee_display_name.as_deref()),
        );
        if let Some(keyword) = &issue.search_keyword {
            let _ = write!(out, "\n  keyword '{}': {}", keyword, issue.keyword_count);
        }
        for link in &issue.linked_test_cases {
            let _ = write!(out, "\n  {}", format_link(link));
        }
        out
    }
}

fn format_link(link: &TestCaseLink) -> String {
    format!(
        "[{}] {} {} ({}; project: {}, tester: {})",
        link.id,
        or_dash(link.test_bank_id.as_deref()),
        link.title,
        link.automation_state,
        or_dash(link.project_name.as_deref()),
        or_dash(link.assigned_tester_name.as_deref()),
    )
}

#[derive(Serialize)]
pub struct IssueList {
    pub sprint_id: String,
    pub issues: Vec<IssueView>,
}

impl Output for IssueList {
    fn to_human(&self) -> String {
        if self.issues.is_empty() {
            return format!("No issues stored for sprint {}.", self.sprint_id);
        }
        let mut out = String::new();
        for view in &self.issues {
            let _ = writeln!(
                out,
                "{}  {}  ({} test cases, assignee: {})",
                view.issue.issue_key,
                view.issue.summary,
                view.issue.linked_test_cases.len(),
                or_dash(view.effective_assignee.as_deref())
            );
        }
        out.trim_end().to_string()
    }
}

pub fn issues(data_dir: &Path, sprint: &str) -> Result<IssueList> {
    let storage = Storage::open(data_dir)?;
    Ok(IssueList {
        sprint_id: sprint.to_string(),
        issues: storage
            .list_issues(Some(sprint))?
            .into_iter()
            .map(IssueView::from)
            .collect(),
    })
}

pub fn issue_show(data_dir: &Path, key: &str) -> Result<IssueView> {
    let storage = Storage::open(data_dir)?;
    Ok(storage.get_issue_by_key(key)?.into())
}

pub fn issue_keyword(
    data_dir: &Path,
    tracker: &dyn TrackerClient,
    key: &str,
    keyword: &str,
) -> Result<IssueView> {
    let mut storage = Storage::open(data_dir)?;
    Ok(ops::search_keyword_in_issue(&mut storage, tracker, key, keyword)?.into())
}

// === Link Commands ===

fn describe_promotion(promotion: &Promotion) -> String {
    match promotion {
        Promotion::Created { entry } => format!("added to backlog as #{}", entry.id),
        Promotion::Updated { entry } => format!("backlog entry #{} updated", entry.id),
        Promotion::NotPromoted {
            reason: NotPromotedReason::IncompleteAssignment,
        } => "not promoted: project or tester missing".to_string(),
        Promotion::NotPromoted {
            reason: NotPromotedReason::Pending,
        } => "not promoted: automation state pending".to_string(),
    }
}

impl Output for FlagUpdate {
    fn to_human(&self) -> String {
        format!("{}\n  {}", format_link(&self.link), describe_promotion(&self.promotion))
    }
}

impl Output for MapUpdate {
    fn to_human(&self) -> String {
        let mut out = format_link(&self.link);
        if let Some(promotion) = &self.promotion {
            let _ = write!(out, "\n  {}", describe_promotion(promotion));
        }
        out
    }
}

pub fn link_flags(data_dir: &Path, link_id: i64, can: bool, cannot: bool) -> Result<FlagUpdate> {
    let mut storage = Storage::open(data_dir)?;
    ops::update_flags(&mut storage, link_id, can, cannot)
}

/// Operator input for `qm link map`; projects and testers by id or name.
#[derive(Debug, Default)]
pub struct MapArgs {
    pub link_id: i64,
    pub project: Option<String>,
    pub tester: Option<String>,
    pub manual_tester: Option<String>,
    pub test_case_type: Option<String>,
    pub tool_type: Option<String>,
    pub notes: Option<String>,
}

pub fn link_map(data_dir: &Path, args: MapArgs) -> Result<MapUpdate> {
    let mut storage = Storage::open(data_dir)?;
    let request = MapRequest {
        link_id: args.link_id,
        project_id: args
            .project
            .as_deref()
            .map(|p| project_id(&storage, p))
            .transpose()?,
        tester_id: args
            .tester
            .as_deref()
            .map(|t| tester_id(&storage, t))
            .transpose()?,
        manual_tester_id: args
            .manual_tester
            .as_deref()
            .map(|t| tester_id(&storage, t))
            .transpose()?,
        test_case_type: args.test_case_type,
        tool_type: args.tool_type,
        notes: args.notes,
    };
    ops::map_to_project(&mut storage, &request)
}

fn project_id(storage: &Storage, reference: &str) -> Result<i64> {
    if let Ok(id) = reference.trim().parse::<i64>() {
        return Ok(id);
    }
    storage
        .find_project_by_name(reference.trim())?
        .map(|p| p.id)
        .ok_or_else(|| Error::NotFound(format!("Project not found: {}", reference)))
}

fn tester_id(storage: &Storage, reference: &str) -> Result<i64> {
    if let Ok(id) = reference.trim().parse::<i64>() {
        return Ok(id);
    }
    storage
        .find_tester_by_name(reference.trim())?
        .map(|t| t.id)
        .ok_or_else(|| Error::NotFound(format!("Tester not found: {}", reference)))
}

// === Backlog Commands ===

#[derive(Serialize)]
pub struct BacklogList {
    pub entries: Vec<BacklogEntry>,
}

impl Output for BacklogList {
    fn to_human(&self) -> String {
        if self.entries.is_empty() {
            return "Backlog is empty.".to_string();
        }
        let mut out = String::new();
        for entry in &self.entries {
            let _ = writeln!(
                out,
                "#{}  {}  [{}] priority: {}",
                entry.id,
                entry.title,
                or_dash(entry.status.as_ref().map(|s| s.code.as_str())),
                or_dash(entry.priority.as_ref().map(|p| p.code.as_str())),
            );
        }
        out.trim_end().to_string()
    }
}

pub fn backlog_list(data_dir: &Path, status: Option<&str>) -> Result<BacklogList> {
    let storage = Storage::open(data_dir)?;
    Ok(BacklogList {
        entries: storage.list_backlog(status)?,
    })
}

// === Lookup Commands ===

#[derive(Serialize)]
pub struct LookupList {
    pub category: LookupCategory,
    pub rows: Vec<LookupRow>,
}

impl Output for LookupList {
    fn to_human(&self) -> String {
        let mut out = format!("{} ({} rows)", self.category, self.rows.len());
        for row in &self.rows {
            let _ = write!(out, "\n  {:>3}  {}", row.id, row.code);
            if !row.is_active() {
                let _ = write!(out, " ({})", row.code_status);
            }
        }
        out
    }
}

pub fn lookup_list(data_dir: &Path, category: &str, all: bool) -> Result<LookupList> {
    let category: LookupCategory = category.parse().map_err(Error::InvalidInput)?;
    let storage = Storage::open(data_dir)?;
    Ok(LookupList {
        category,
        rows: storage.list_lookups(category, !all)?,
    })
}

#[derive(Serialize)]
pub struct LookupResolution {
    pub category: LookupCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<String>,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<LookupRow>,
}

impl Output for LookupResolution {
    fn to_human(&self) -> String {
        let requested = self.requested.as_deref().unwrap_or("(default)");
        match &self.row {
            Some(row) => format!("{} {} -> #{} {}", self.category, requested, row.id, row.code),
            None => format!("{} {} -> no match", self.category, requested),
        }
    }
}

pub fn lookup_resolve(data_dir: &Path, category: &str, code: Option<&str>) -> Result<LookupResolution> {
    let category: LookupCategory = category.parse().map_err(Error::InvalidInput)?;
    let storage = Storage::open(data_dir)?;
    let row = storage.resolve(category, code)?;
    Ok(LookupResolution {
        category,
        requested: code.map(str::to_string),
        found: row.is_some(),
        row,
    })
}

// === Project and Tester Commands ===

impl Output for Project {
    fn to_human(&self) -> String {
        format!(
            "#{} {} (domain: {})",
            self.id,
            self.name,
            or_dash(self.domain_name.as_deref())
        )
    }
}

impl Output for Tester {
    fn to_human(&self) -> String {
        format!(
            "#{} {} (role: {})",
            self.id,
            self.name,
            or_dash(self.role.as_ref().map(|r| r.code.as_str()))
        )
    }
}

#[derive(Serialize)]
pub struct ProjectList {
    pub projects: Vec<Project>,
}

impl Output for ProjectList {
    fn to_human(&self) -> String {
        self.projects
            .iter()
            .map(Output::to_human)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Serialize)]
pub struct TesterList {
    pub testers: Vec<Tester>,
}

impl Output for TesterList {
    fn to_human(&self) -> String {
        self.testers
            .iter()
            .map(Output::to_human)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Add a project, creating its domain when it does not exist yet.
pub fn project_add(data_dir: &Path, project: NewProjectArgs) -> Result<Project> {
    let mut storage = Storage::open(data_dir)?;
    storage.transaction(|s| {
        let domain_id = match project.domain.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(name) => Some(match s.find_domain_by_name(name)? {
                Some(domain) => domain.id,
                None => s.create_domain(name, None)?.id,
            }),
            None => None,
        };
        s.create_project(&NewProject {
            name: project.name.trim().to_string(),
            description: project.description,
            domain_id,
            tracker_project_key: project.project_key,
            tracker_board_id: project.board_id,
        })
    })
}

/// Operator input for `qm project add`.
#[derive(Debug, Default)]
pub struct NewProjectArgs {
    pub name: String,
    pub domain: Option<String>,
    pub description: Option<String>,
    pub project_key: Option<String>,
    pub board_id: Option<String>,
}

pub fn project_list(data_dir: &Path) -> Result<ProjectList> {
    let storage = Storage::open(data_dir)?;
    Ok(ProjectList {
        projects: storage.list_projects()?,
    })
}

pub fn tester_add(data_dir: &Path, name: &str, role: Option<&str>) -> Result<Tester> {
    let mut storage = Storage::open(data_dir)?;
    let role_id = match role {
        Some(code) => Some(resolve_user_code(&storage, LookupCategory::Role, code)?.id),
        None => storage.resolve(LookupCategory::Role, None)?.map(|r| r.id),
    };
    storage.create_tester(name.trim(), role_id)
}

pub fn tester_list(data_dir: &Path) -> Result<TesterList> {
    let storage = Storage::open(data_dir)?;
    Ok(TesterList {
        testers: storage.list_testers()?,
    })
}

// === Config Commands ===

#[derive(Serialize)]
pub struct ConfigShow {
    pub workspace_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_path: Option<PathBuf>,
    pub entries: Vec<ConfigEntry>,
}

impl Output for ConfigShow {
    fn to_human(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let _ = writeln!(
                out,
                "{:<22} {:<32} {}",
                entry.key,
                or_dash(entry.value.as_deref()),
                entry
                    .source
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_default()
            );
        }
        out.trim_end().to_string()
    }
}

pub fn config_show(data_dir: &Path, resolved: &ResolvedConfig) -> ConfigShow {
    ConfigShow {
        workspace_path: config::workspace_config_path(data_dir),
        system_path: config::system_config_path(),
        entries: resolved.entries(),
    }
}

#[derive(Serialize)]
pub struct ConfigSetResult {
    pub key: String,
    pub path: PathBuf,
}

impl Output for ConfigSetResult {
    fn to_human(&self) -> String {
        format!("Set {} in {}", self.key, self.path.display())
    }
}

pub fn config_set(data_dir: &Path, key: &str, value: &str) -> Result<ConfigSetResult> {
    let path = config::set_workspace_value(data_dir, key, value)?;
    Ok(ConfigSetResult {
        key: key.to_string(),
        path,
    })
}

// === Doctor ===

#[derive(Serialize)]
pub struct DoctorResult {
    pub data_dir: PathBuf,
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backlog_entries: Option<usize>,
    pub tracker_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_reachable: Option<bool>,
    pub test_bank_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_bank_reachable: Option<bool>,
}

impl Output for DoctorResult {
    fn to_human(&self) -> String {
        let probe = |configured: bool, reachable: Option<bool>| match (configured, reachable) {
            (false, _) => "not configured",
            (true, Some(true)) => "ok",
            (true, _) => "unreachable",
        };
        let mut out = format!("Data directory: {}", self.data_dir.display());
        if self.initialized {
            let _ = write!(
                out,
                "\n  issues: {}  links: {}  backlog: {}",
                self.issues.unwrap_or_default(),
                self.links.unwrap_or_default(),
                self.backlog_entries.unwrap_or_default()
            );
        } else {
            out.push_str("\n  not initialized (run `qm init`)");
        }
        let _ = write!(
            out,
            "\nTracker: {}\nTest-bank: {}",
            probe(self.tracker_configured, self.tracker_reachable),
            probe(self.test_bank_configured, self.test_bank_reachable)
        );
        out
    }
}

/// Report storage state and probe the configured services.
pub fn doctor(data_dir: &Path, resolved: &ResolvedConfig) -> Result<DoctorResult> {
    let initialized = Storage::exists(data_dir);
    let (issues, links, backlog_entries) = if initialized {
        let storage = Storage::open(data_dir)?;
        (
            Some(storage.count_issues()?),
            Some(storage.count_links()?),
            Some(storage.count_backlog()?),
        )
    } else {
        (None, None, None)
    };

    let tracker_reachable = resolved
        .tracker_credentials()
        .map(|credentials| JiraClient::new(credentials).test_connection());
    let test_bank = test_bank_client(resolved);
    let test_bank_configured = test_bank.is_configured();
    let test_bank_reachable = test_bank_configured.then(|| test_bank.test_connection());

    Ok(DoctorResult {
        data_dir: data_dir.to_path_buf(),
        initialized,
        issues,
        links,
        backlog_entries,
        tracker_configured: tracker_reachable.is_some(),
        tracker_reachable,
        test_bank_configured,
        test_bank_reachable,
    })
}
