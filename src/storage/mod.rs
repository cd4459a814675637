//! Storage layer for Quartermaster data.
//!
//! All state lives in a single SQLite database (`quartermaster.db`) inside
//! the data directory (`$QM_DATA_DIR`, else `~/.local/share/quartermaster/`).
//!
//! Tables:
//! - `lookups` - reference rows keyed by (category, case-insensitive code)
//! - `domains`, `projects`, `testers` - assignment targets
//! - `issues`, `test_case_links` - tracker issues and the test cases linked to them
//! - `backlog_entries` - automation work items, unique by title
//! - `sync_runs` - history of sprint synchronizations

use crate::lookup::{LookupResolver, SEED};
use crate::models::{
    ACTIVE_STATUS, AutomationState, BacklogEntry, Domain, Issue, LookupCategory, LookupRef,
    LookupRow, Project, SyncRun, TestCaseLink, Tester,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the database inside the data directory.
pub const DB_FILE: &str = "quartermaster.db";

/// Name of the domain created by `qm init`.
pub const DEFAULT_DOMAIN: &str = "Default";

/// Name of the project created by `qm init`.
pub const DEFAULT_PROJECT: &str = "Default Project";

/// Name of the tester created by `qm init`.
pub const DEFAULT_TESTER: &str = "Unassigned";

const ISSUE_COLUMNS: &str = "id, issue_key, summary, assignee, assignee_display_name, sprint_id, \
     sprint_name, issue_type, status, priority, keyword_count, search_keyword, created_at, updated_at";

const LINK_SELECT: &str = r#"
    SELECT l.id, l.issue_id, i.issue_key, l.title, l.test_bank_id, l.test_bank_assignee,
           l.test_bank_priority, l.test_bank_automation_status, l.can_be_automated,
           l.cannot_be_automated, l.automation_state, l.project_id, p.name,
           l.assigned_tester_id, t.name, l.manual_tester_id, mt.name,
           l.test_case_type_id, tct.code, l.tool_type_id, tt.code,
           l.domain_mapped, l.notes, l.created_at, l.updated_at
    FROM test_case_links l
    JOIN issues i ON i.id = l.issue_id
    LEFT JOIN projects p ON p.id = l.project_id
    LEFT JOIN testers t ON t.id = l.assigned_tester_id
    LEFT JOIN testers mt ON mt.id = l.manual_tester_id
    LEFT JOIN lookups tct ON tct.id = l.test_case_type_id
    LEFT JOIN lookups tt ON tt.id = l.tool_type_id
"#;

const BACKLOG_SELECT: &str = r#"
    SELECT b.id, b.title, b.description, b.priority_id, pr.code, b.status_id, st.code,
           b.project_id, b.tester_id, b.manual_tester_id, b.test_case_type_id, tct.code,
           b.tool_type_id, tt.code, b.created_at, b.updated_at
    FROM backlog_entries b
    LEFT JOIN lookups pr ON pr.id = b.priority_id
    LEFT JOIN lookups st ON st.id = b.status_id
    LEFT JOIN lookups tct ON tct.id = b.test_case_type_id
    LEFT JOIN lookups tt ON tt.id = b.tool_type_id
"#;

const PROJECT_SELECT: &str = r#"
    SELECT p.id, p.name, p.description, p.domain_id, d.name, p.tracker_project_key,
           p.tracker_board_id, p.created_at, p.updated_at
    FROM projects p
    LEFT JOIN domains d ON d.id = p.domain_id
"#;

const TESTER_SELECT: &str = r#"
    SELECT t.id, t.name, t.role_id, r.code, t.created_at, t.updated_at
    FROM testers t
    LEFT JOIN lookups r ON r.id = t.role_id
"#;

/// Fields for a new project.
#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
    pub domain_id: Option<i64>,
    pub tracker_project_key: Option<String>,
    pub tracker_board_id: Option<String>,
}

/// What `seed_reference_data` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedSummary {
    /// Lookup rows newly inserted (0 on re-seed)
    pub lookups_added: usize,
    pub domain_id: i64,
    pub project_id: i64,
    pub tester_id: i64,
}

/// Storage manager for one data directory.
pub struct Storage {
    /// Data directory holding the database
    pub root: PathBuf,
    /// SQLite connection
    conn: Connection,
}

impl Storage {
    /// Open existing storage in the given data directory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join(DB_FILE);
        if !db_path.exists() {
            return Err(Error::NotInitialized);
        }

        let conn = Self::connect(&db_path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            root: data_dir.to_path_buf(),
            conn,
        })
    }

    /// Initialize storage in the given data directory, creating it if needed.
    pub fn init(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;

        let conn = Self::connect(&data_dir.join(DB_FILE))?;
        Self::init_schema(&conn)?;

        Ok(Self {
            root: data_dir.to_path_buf(),
            conn,
        })
    }

    /// Check if storage exists in the given data directory.
    pub fn exists(data_dir: &Path) -> bool {
        data_dir.join(DB_FILE).exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn connect(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Initialize the SQLite schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS lookups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                code TEXT NOT NULL COLLATE NOCASE,
                short_text TEXT,
                long_text TEXT,
                code_status TEXT NOT NULL DEFAULT 'Active',
                sort_by INTEGER NOT NULL DEFAULT 0,
                UNIQUE (category, code)
            );

            CREATE TABLE IF NOT EXISTS domains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                description TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                description TEXT,
                domain_id INTEGER REFERENCES domains(id),
                tracker_project_key TEXT,
                tracker_board_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS testers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                role_id INTEGER REFERENCES lookups(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS issues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_key TEXT NOT NULL UNIQUE,
                summary TEXT NOT NULL DEFAULT '',
                assignee TEXT,
                assignee_display_name TEXT,
                sprint_id TEXT,
                sprint_name TEXT,
                issue_type TEXT,
                status TEXT,
                priority TEXT,
                keyword_count INTEGER NOT NULL DEFAULT 0,
                search_keyword TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS test_case_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                test_bank_id TEXT,
                test_bank_assignee TEXT,
                test_bank_priority TEXT,
                test_bank_automation_status TEXT,
                can_be_automated INTEGER NOT NULL DEFAULT 0,
                cannot_be_automated INTEGER NOT NULL DEFAULT 0,
                automation_state TEXT NOT NULL DEFAULT 'PENDING',
                automation_status_id INTEGER REFERENCES lookups(id),
                project_id INTEGER REFERENCES projects(id),
                assigned_tester_id INTEGER REFERENCES testers(id),
                manual_tester_id INTEGER REFERENCES testers(id),
                test_case_type_id INTEGER REFERENCES lookups(id),
                tool_type_id INTEGER REFERENCES lookups(id),
                domain_mapped TEXT,
                notes TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS backlog_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                priority_id INTEGER REFERENCES lookups(id),
                status_id INTEGER REFERENCES lookups(id),
                project_id INTEGER NOT NULL REFERENCES projects(id),
                tester_id INTEGER NOT NULL REFERENCES testers(id),
                manual_tester_id INTEGER REFERENCES testers(id),
                test_case_type_id INTEGER REFERENCES lookups(id),
                tool_type_id INTEGER REFERENCES lookups(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_runs (
                run_id TEXT PRIMARY KEY,
                sprint_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                not_started INTEGER NOT NULL DEFAULT 0,
                cancelled INTEGER NOT NULL DEFAULT 0,
                links_added INTEGER NOT NULL DEFAULT 0,
                links_pruned INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_lookups_category ON lookups(category, sort_by);
            CREATE INDEX IF NOT EXISTS idx_issues_sprint ON issues(sprint_id);
            CREATE INDEX IF NOT EXISTS idx_links_issue ON test_case_links(issue_id);
            CREATE INDEX IF NOT EXISTS idx_links_title ON test_case_links(title);
            CREATE INDEX IF NOT EXISTS idx_sync_runs_started ON sync_runs(started_at);
            "#,
        )?;
        Ok(())
    }

    /// Run `f` inside one transaction, rolling back if it fails.
    ///
    /// Calls made while a transaction is already open join it.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if !self.conn.is_autocommit() {
            return f(self);
        }

        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    // === Seed Operations ===

    /// Seed lookup tables and the default domain, project and tester.
    ///
    /// Safe to run repeatedly; existing rows are left as they are.
    pub fn seed_reference_data(&mut self) -> Result<SeedSummary> {
        self.transaction(|storage| {
            let mut lookups_added = 0;
            for (category, rows) in SEED {
                for (position, (code, text)) in rows.iter().enumerate() {
                    lookups_added += storage.conn.execute(
                        "INSERT INTO lookups (category, code, short_text, code_status, sort_by)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(category, code) DO NOTHING",
                        params![
                            category.as_str(),
                            code,
                            text,
                            ACTIVE_STATUS,
                            position as i64 + 1
                        ],
                    )?;
                }
            }

            let domain = match storage.find_domain_by_name(DEFAULT_DOMAIN)? {
                Some(domain) => domain,
                None => storage.create_domain(DEFAULT_DOMAIN, Some("Default business domain"))?,
            };

            let project = match storage.find_project_by_name(DEFAULT_PROJECT)? {
                Some(project) => project,
                None => storage.create_project(&NewProject {
                    name: DEFAULT_PROJECT.to_string(),
                    description: Some("Catch-all project for unmapped test cases".to_string()),
                    domain_id: Some(domain.id),
                    ..Default::default()
                })?,
            };

            let tester = match storage.find_tester_by_name(DEFAULT_TESTER)? {
                Some(tester) => tester,
                None => {
                    let role = storage.resolve(LookupCategory::Role, None)?;
                    storage.create_tester(DEFAULT_TESTER, role.map(|r| r.id))?
                }
            };

            Ok(SeedSummary {
                lookups_added,
                domain_id: domain.id,
                project_id: project.id,
                tester_id: tester.id,
            })
        })
    }

    // === Lookup Operations ===

    /// List rows of a category ordered by sort order then code.
    pub fn list_lookups(&self, category: LookupCategory, active_only: bool) -> Result<Vec<LookupRow>> {
        let mut sql = String::from(
            "SELECT id, category, code, short_text, long_text, code_status, sort_by
             FROM lookups WHERE category = ?1",
        );
        if active_only {
            sql.push_str(" AND code_status = ?2 COLLATE NOCASE");
        }
        sql.push_str(" ORDER BY sort_by ASC, code ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = if active_only {
            stmt.query_map(params![category.as_str(), ACTIVE_STATUS], lookup_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map(params![category.as_str()], lookup_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(rows)
    }

    /// Get a lookup row by ID.
    pub fn get_lookup(&self, id: i64) -> Result<LookupRow> {
        self.conn
            .query_row(
                "SELECT id, category, code, short_text, long_text, code_status, sort_by
                 FROM lookups WHERE id = ?1",
                [id],
                lookup_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Lookup not found: {}", id)))
    }

    /// Change a row's active/inactive marker.
    pub fn set_lookup_status(&mut self, id: i64, code_status: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE lookups SET code_status = ?1 WHERE id = ?2",
            params![code_status, id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Lookup not found: {}", id)));
        }
        Ok(())
    }

    // === Domain Operations ===

    pub fn create_domain(&mut self, name: &str, description: Option<&str>) -> Result<Domain> {
        let name = validate_name(name, "Domain")?;
        if self.find_domain_by_name(name)?.is_some() {
            return Err(Error::InvalidInput(format!("Domain already exists: {}", name)));
        }

        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO domains (name, description, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![name, description, now],
        )?;
        self.get_domain(self.conn.last_insert_rowid())
    }

    pub fn get_domain(&self, id: i64) -> Result<Domain> {
        self.conn
            .query_row(
                "SELECT id, name, description, created_at, updated_at FROM domains WHERE id = ?1",
                [id],
                domain_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Domain not found: {}", id)))
    }

    pub fn find_domain_by_name(&self, name: &str) -> Result<Option<Domain>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, description, created_at, updated_at FROM domains WHERE name = ?1",
                [name.trim()],
                domain_from_row,
            )
            .optional()?)
    }

    pub fn list_domains(&self) -> Result<Vec<Domain>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, created_at, updated_at FROM domains ORDER BY name",
        )?;
        let domains = stmt
            .query_map([], domain_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(domains)
    }

    // === Project Operations ===

    /// Create a project; the name must be unique (case-insensitive).
    pub fn create_project(&mut self, project: &NewProject) -> Result<Project> {
        let name = validate_name(&project.name, "Project")?;
        if self.find_project_by_name(name)?.is_some() {
            return Err(Error::InvalidInput(format!("Project already exists: {}", name)));
        }
        if let Some(domain_id) = project.domain_id {
            self.get_domain(domain_id)?;
        }

        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO projects (name, description, domain_id, tracker_project_key,
                                   tracker_board_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                name,
                project.description,
                project.domain_id,
                project.tracker_project_key,
                project.tracker_board_id,
                now
            ],
        )?;
        self.get_project(self.conn.last_insert_rowid())
    }

    pub fn get_project(&self, id: i64) -> Result<Project> {
        let sql = format!("{} WHERE p.id = ?1", PROJECT_SELECT);
        self.conn
            .query_row(&sql, [id], project_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Project not found: {}", id)))
    }

    pub fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let sql = format!("{} WHERE p.name = ?1", PROJECT_SELECT);
        Ok(self
            .conn
            .query_row(&sql, [name.trim()], project_from_row)
            .optional()?)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let sql = format!("{} ORDER BY p.name", PROJECT_SELECT);
        let mut stmt = self.conn.prepare(&sql)?;
        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    // === Tester Operations ===

    pub fn create_tester(&mut self, name: &str, role_id: Option<i64>) -> Result<Tester> {
        let name = validate_name(name, "Tester")?;
        if self.find_tester_by_name(name)?.is_some() {
            return Err(Error::InvalidInput(format!("Tester already exists: {}", name)));
        }

        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO testers (name, role_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![name, role_id, now],
        )?;
        self.get_tester(self.conn.last_insert_rowid())
    }

    pub fn get_tester(&self, id: i64) -> Result<Tester> {
        let sql = format!("{} WHERE t.id = ?1", TESTER_SELECT);
        self.conn
            .query_row(&sql, [id], tester_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Tester not found: {}", id)))
    }

    pub fn find_tester_by_name(&self, name: &str) -> Result<Option<Tester>> {
        let sql = format!("{} WHERE t.name = ?1", TESTER_SELECT);
        Ok(self
            .conn
            .query_row(&sql, [name.trim()], tester_from_row)
            .optional()?)
    }

    pub fn list_testers(&self) -> Result<Vec<Tester>> {
        let sql = format!("{} ORDER BY t.name", TESTER_SELECT);
        let mut stmt = self.conn.prepare(&sql)?;
        let testers = stmt
            .query_map([], tester_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(testers)
    }

    // === Issue Operations ===

    /// Find an issue by its tracker key (exact, case-sensitive), links included.
    pub fn find_issue_by_key(&self, issue_key: &str) -> Result<Option<Issue>> {
        let sql = format!("SELECT {} FROM issues WHERE issue_key = ?1", ISSUE_COLUMNS);
        let issue = self
            .conn
            .query_row(&sql, [issue_key], issue_from_row)
            .optional()?;
        issue.map(|issue| self.with_links(issue)).transpose()
    }

    /// Get an issue by its tracker key, links included.
    pub fn get_issue_by_key(&self, issue_key: &str) -> Result<Issue> {
        self.find_issue_by_key(issue_key)?
            .ok_or_else(|| Error::NotFound(format!("Issue not found: {}", issue_key)))
    }

    /// Get an issue by ID, links included.
    pub fn get_issue(&self, id: i64) -> Result<Issue> {
        let sql = format!("SELECT {} FROM issues WHERE id = ?1", ISSUE_COLUMNS);
        let issue = self
            .conn
            .query_row(&sql, [id], issue_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Issue not found: {}", id)))?;
        self.with_links(issue)
    }

    /// Insert a new issue, returning its ID. Links are not written.
    pub fn insert_issue(&mut self, issue: &Issue) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO issues (issue_key, summary, assignee, assignee_display_name, sprint_id,
                                 sprint_name, issue_type, status, priority, keyword_count,
                                 search_keyword, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                issue.issue_key,
                issue.summary,
                issue.assignee,
                issue.assignee_display_name,
                issue.sprint_id,
                issue.sprint_name,
                issue.issue_type,
                issue.status,
                issue.priority,
                issue.keyword_count,
                issue.search_keyword,
                issue.created_at.to_rfc3339(),
                issue.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Update an issue's mutable fields. The key and created-at never change.
    pub fn update_issue(&mut self, issue: &Issue) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE issues SET summary = ?1, assignee = ?2, assignee_display_name = ?3,
                               sprint_id = ?4, sprint_name = ?5, issue_type = ?6, status = ?7,
                               priority = ?8, keyword_count = ?9, search_keyword = ?10,
                               updated_at = ?11
             WHERE id = ?12",
            params![
                issue.summary,
                issue.assignee,
                issue.assignee_display_name,
                issue.sprint_id,
                issue.sprint_name,
                issue.issue_type,
                issue.status,
                issue.priority,
                issue.keyword_count,
                issue.search_keyword,
                issue.updated_at.to_rfc3339(),
                issue.id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Issue not found: {}", issue.issue_key)));
        }
        Ok(())
    }

    /// Delete an issue; its links go with it.
    pub fn delete_issue(&mut self, id: i64) -> Result<()> {
        let changed = self.conn.execute("DELETE FROM issues WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Issue not found: {}", id)));
        }
        Ok(())
    }

    /// List issues, optionally only those of one sprint, links included.
    pub fn list_issues(&self, sprint_id: Option<&str>) -> Result<Vec<Issue>> {
        let mut sql = format!("SELECT {} FROM issues", ISSUE_COLUMNS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(sprint) = sprint_id {
            sql.push_str(" WHERE sprint_id = ?");
            params_vec.push(Box::new(sprint.to_string()));
        }
        sql.push_str(" ORDER BY issue_key ASC");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let issues = stmt
            .query_map(params_refs.as_slice(), issue_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        issues
            .into_iter()
            .map(|issue| self.with_links(issue))
            .collect()
    }

    fn with_links(&self, mut issue: Issue) -> Result<Issue> {
        issue.linked_test_cases = self.links_for_issue(issue.id)?;
        Ok(issue)
    }

    // === Test Case Link Operations ===

    /// Get a link by ID.
    pub fn get_link(&self, id: i64) -> Result<TestCaseLink> {
        let sql = format!("{} WHERE l.id = ?1", LINK_SELECT);
        self.conn
            .query_row(&sql, [id], link_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Test case link not found: {}", id)))
    }

    /// Insert a new link, returning its ID.
    ///
    /// The automation-status reference is resolved from the link's state code;
    /// it stays empty when reference data is not seeded.
    pub fn insert_link(&mut self, link: &TestCaseLink) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO test_case_links (
                 issue_id, title, test_bank_id, test_bank_assignee, test_bank_priority,
                 test_bank_automation_status, can_be_automated, cannot_be_automated,
                 automation_state, automation_status_id, project_id, assigned_tester_id,
                 manual_tester_id, test_case_type_id, tool_type_id, domain_mapped, notes,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                     (SELECT id FROM lookups WHERE category = 'automation_status' AND code = ?9),
                     ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                link.issue_id,
                link.title,
                link.test_bank_id,
                link.test_bank_assignee,
                link.test_bank_priority,
                link.test_bank_automation_status,
                link.can_be_automated,
                link.cannot_be_automated,
                link.automation_state.code(),
                link.project_id,
                link.assigned_tester_id,
                link.manual_tester_id,
                link.test_case_type.as_ref().map(|r| r.id),
                link.tool_type.as_ref().map(|r| r.id),
                link.domain_mapped,
                link.notes,
                link.created_at.to_rfc3339(),
                link.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Update a link's mutable fields.
    pub fn update_link(&mut self, link: &TestCaseLink) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE test_case_links SET
                 title = ?1, test_bank_id = ?2, test_bank_assignee = ?3, test_bank_priority = ?4,
                 test_bank_automation_status = ?5, can_be_automated = ?6,
                 cannot_be_automated = ?7, automation_state = ?8,
                 automation_status_id =
                     (SELECT id FROM lookups WHERE category = 'automation_status' AND code = ?8),
                 project_id = ?9, assigned_tester_id = ?10, manual_tester_id = ?11,
                 test_case_type_id = ?12, tool_type_id = ?13, domain_mapped = ?14, notes = ?15,
                 updated_at = ?16
             WHERE id = ?17",
            params![
                link.title,
                link.test_bank_id,
                link.test_bank_assignee,
                link.test_bank_priority,
                link.test_bank_automation_status,
                link.can_be_automated,
                link.cannot_be_automated,
                link.automation_state.code(),
                link.project_id,
                link.assigned_tester_id,
                link.manual_tester_id,
                link.test_case_type.as_ref().map(|r| r.id),
                link.tool_type.as_ref().map(|r| r.id),
                link.domain_mapped,
                link.notes,
                link.updated_at.to_rfc3339(),
                link.id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Test case link not found: {}", link.id)));
        }
        Ok(())
    }

    /// Delete a link by ID.
    pub fn delete_link(&mut self, id: i64) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM test_case_links WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Test case link not found: {}", id)));
        }
        Ok(())
    }

    /// Links of one issue in creation order.
    pub fn links_for_issue(&self, issue_id: i64) -> Result<Vec<TestCaseLink>> {
        let sql = format!("{} WHERE l.issue_id = ?1 ORDER BY l.id ASC", LINK_SELECT);
        let mut stmt = self.conn.prepare(&sql)?;
        let links = stmt
            .query_map([issue_id], link_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    // === Backlog Operations ===

    /// Find a backlog entry by exact title.
    pub fn find_backlog_by_title(&self, title: &str) -> Result<Option<BacklogEntry>> {
        let sql = format!("{} WHERE b.title = ?1", BACKLOG_SELECT);
        Ok(self
            .conn
            .query_row(&sql, [title], backlog_from_row)
            .optional()?)
    }

    pub fn get_backlog_entry(&self, id: i64) -> Result<BacklogEntry> {
        let sql = format!("{} WHERE b.id = ?1", BACKLOG_SELECT);
        self.conn
            .query_row(&sql, [id], backlog_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Backlog entry not found: {}", id)))
    }

    /// Insert a backlog entry unless one with the same title exists.
    ///
    /// Returns `None` when the title is already taken.
    pub fn insert_backlog_entry(&mut self, entry: &BacklogEntry) -> Result<Option<i64>> {
        let changed = self.conn.execute(
            "INSERT INTO backlog_entries (title, description, priority_id, status_id, project_id,
                                          tester_id, manual_tester_id, test_case_type_id,
                                          tool_type_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(title) DO NOTHING",
            params![
                entry.title,
                entry.description,
                entry.priority.as_ref().map(|r| r.id),
                entry.status.as_ref().map(|r| r.id),
                entry.project_id,
                entry.tester_id,
                entry.manual_tester_id,
                entry.test_case_type.as_ref().map(|r| r.id),
                entry.tool_type.as_ref().map(|r| r.id),
                entry.created_at.to_rfc3339(),
                entry.updated_at.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    /// Set the workflow status of a backlog entry, touching nothing else.
    pub fn update_backlog_status(&mut self, id: i64, status_id: i64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE backlog_entries SET status_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![status_id, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Backlog entry not found: {}", id)));
        }
        Ok(())
    }

    /// List backlog entries, optionally filtered by workflow status code.
    pub fn list_backlog(&self, status: Option<&str>) -> Result<Vec<BacklogEntry>> {
        let mut sql = String::from(BACKLOG_SELECT);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(s) = status {
            sql.push_str(" WHERE st.code = ? COLLATE NOCASE");
            params_vec.push(Box::new(s.trim().to_string()));
        }
        sql.push_str(" ORDER BY b.created_at ASC, b.id ASC");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_refs.as_slice(), backlog_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    // === Sync Run Operations ===

    pub fn record_sync_run(&mut self, run: &SyncRun) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_runs (run_id, sprint_id, started_at, finished_at, succeeded, failed,
                                    not_started, cancelled, links_added, links_pruned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.run_id,
                run.sprint_id,
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
                run.succeeded as i64,
                run.failed as i64,
                run.not_started as i64,
                run.cancelled,
                run.links_added as i64,
                run.links_pruned as i64,
            ],
        )?;
        Ok(())
    }

    /// Most recent sync runs first.
    pub fn list_sync_runs(&self, sprint_id: Option<&str>, limit: usize) -> Result<Vec<SyncRun>> {
        let mut sql = String::from(
            "SELECT run_id, sprint_id, started_at, finished_at, succeeded, failed, not_started,
                    cancelled, links_added, links_pruned
             FROM sync_runs",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(sprint) = sprint_id {
            sql.push_str(" WHERE sprint_id = ?");
            params_vec.push(Box::new(sprint.to_string()));
        }
        sql.push_str(" ORDER BY started_at DESC LIMIT ?");
        params_vec.push(Box::new(limit as i64));

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params_refs.as_slice(), |row| {
                Ok(SyncRun {
                    run_id: row.get(0)?,
                    sprint_id: row.get(1)?,
                    started_at: timestamp(row, 2)?,
                    finished_at: timestamp(row, 3)?,
                    succeeded: row.get::<_, i64>(4)? as usize,
                    failed: row.get::<_, i64>(5)? as usize,
                    not_started: row.get::<_, i64>(6)? as usize,
                    cancelled: row.get(7)?,
                    links_added: row.get::<_, i64>(8)? as usize,
                    links_pruned: row.get::<_, i64>(9)? as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    // === Counts ===

    pub fn count_issues(&self) -> Result<usize> {
        self.count("issues")
    }

    pub fn count_links(&self) -> Result<usize> {
        self.count("test_case_links")
    }

    pub fn count_backlog(&self) -> Result<usize> {
        self.count("backlog_entries")
    }

    fn count(&self, table: &'static str) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl LookupResolver for Storage {
    fn find_code(&self, category: LookupCategory, code: &str) -> Result<Option<LookupRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, category, code, short_text, long_text, code_status, sort_by
                 FROM lookups WHERE category = ?1 AND code = ?2",
                params![category.as_str(), code.trim()],
                lookup_from_row,
            )
            .optional()?)
    }
}

/// Get the data directory: `$QM_DATA_DIR`, else the platform data dir.
pub fn get_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("QM_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }

    let data_dir = dirs::data_dir()
        .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))?;
    Ok(data_dir.join("quartermaster"))
}

fn validate_name<'a>(name: &'a str, kind: &str) -> Result<&'a str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput(format!("{} name must not be blank", kind)));
    }
    Ok(name)
}

// === Row mapping ===

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn lookup_ref(row: &Row<'_>, id_idx: usize, code_idx: usize) -> rusqlite::Result<Option<LookupRef>> {
    let id: Option<i64> = row.get(id_idx)?;
    let code: Option<String> = row.get(code_idx)?;
    Ok(id.zip(code).map(|(id, code)| LookupRef { id, code }))
}

fn lookup_from_row(row: &Row<'_>) -> rusqlite::Result<LookupRow> {
    let category: String = row.get(1)?;
    let category = category
        .parse::<LookupCategory>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into()))?;
    Ok(LookupRow {
        id: row.get(0)?,
        category,
        code: row.get(2)?,
        short_text: row.get(3)?,
        long_text: row.get(4)?,
        code_status: row.get(5)?,
        sort_by: row.get(6)?,
    })
}

fn domain_from_row(row: &Row<'_>) -> rusqlite::Result<Domain> {
    Ok(Domain {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: timestamp(row, 3)?,
        updated_at: timestamp(row, 4)?,
    })
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        domain_id: row.get(3)?,
        domain_name: row.get(4)?,
        tracker_project_key: row.get(5)?,
        tracker_board_id: row.get(6)?,
        created_at: timestamp(row, 7)?,
        updated_at: timestamp(row, 8)?,
    })
}

fn tester_from_row(row: &Row<'_>) -> rusqlite::Result<Tester> {
    Ok(Tester {
        id: row.get(0)?,
        name: row.get(1)?,
        role: lookup_ref(row, 2, 3)?,
        created_at: timestamp(row, 4)?,
        updated_at: timestamp(row, 5)?,
    })
}

fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<Issue> {
    Ok(Issue {
        id: row.get(0)?,
        issue_key: row.get(1)?,
        summary: row.get(2)?,
        assignee: row.get(3)?,
        assignee_display_name: row.get(4)?,
        sprint_id: row.get(5)?,
        sprint_name: row.get(6)?,
        issue_type: row.get(7)?,
        status: row.get(8)?,
        priority: row.get(9)?,
        keyword_count: row.get(10)?,
        search_keyword: row.get(11)?,
        linked_test_cases: Vec::new(),
        created_at: timestamp(row, 12)?,
        updated_at: timestamp(row, 13)?,
    })
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<TestCaseLink> {
    let state: String = row.get(10)?;
    let automation_state = AutomationState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            Type::Text,
            format!("Unknown automation state: {}", state).into(),
        )
    })?;

    Ok(TestCaseLink {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        issue_key: row.get(2)?,
        title: row.get(3)?,
        test_bank_id: row.get(4)?,
        test_bank_assignee: row.get(5)?,
        test_bank_priority: row.get(6)?,
        test_bank_automation_status: row.get(7)?,
        can_be_automated: row.get(8)?,
        cannot_be_automated: row.get(9)?,
        automation_state,
        project_id: row.get(11)?,
        project_name: row.get(12)?,
        assigned_tester_id: row.get(13)?,
        assigned_tester_name: row.get(14)?,
        manual_tester_id: row.get(15)?,
        manual_tester_name: row.get(16)?,
        test_case_type: lookup_ref(row, 17, 18)?,
        tool_type: lookup_ref(row, 19, 20)?,
        domain_mapped: row.get(21)?,
        notes: row.get(22)?,
        created_at: timestamp(row, 23)?,
        updated_at: timestamp(row, 24)?,
    })
}

fn backlog_from_row(row: &Row<'_>) -> rusqlite::Result<BacklogEntry> {
    Ok(BacklogEntry {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        priority: lookup_ref(row, 3, 4)?,
        status: lookup_ref(row, 5, 6)?,
        project_id: row.get(7)?,
        tester_id: row.get(8)?,
        manual_tester_id: row.get(9)?,
        test_case_type: lookup_ref(row, 10, 11)?,
        tool_type: lookup_ref(row, 12, 13)?,
        created_at: timestamp(row, 14)?,
        updated_at: timestamp(row, 15)?,
    })
}
