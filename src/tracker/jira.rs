//! Jira-compatible tracker client.
//!
//! Uses the agile API for boards, sprints and sprint issues, and the core
//! API for comments and the connection probe. Authentication is HTTP Basic
//! with a username and API token.

use super::{TrackerClient, TrackerError, count_occurrences};
use crate::models::{IssueDto, Sprint, TestCaseLinkDto};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::LazyLock;
use std::time::Duration;

/// Page size for paginated agile endpoints.
const PAGE_SIZE: usize = 50;

/// Issue fields requested from the sprint issue endpoint.
const ISSUE_FIELDS: &str = "summary,description,assignee,status,priority,issuetype,sprint";

const USER_AGENT: &str = concat!("quartermaster/", env!("CARGO_PKG_VERSION"));

static TEST_CASE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(TC-[0-9]+)\b").expect("valid test case id regex"));

static TEST_CASES_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:#+\s*|h[1-6]\.\s*|\*)?\s*test\s*cases?\s*\*?\s*:?\s*$")
        .expect("valid test cases heading regex")
});

/// Connection settings for a Jira-compatible tracker.
#[derive(Debug, Clone)]
pub struct TrackerCredentials {
    pub base_url: String,
    pub username: String,
    pub token: String,
    pub timeout: Duration,
}

/// Blocking Jira REST client.
pub struct JiraClient {
    base_url: String,
    auth_header: String,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct BoardPage {
    #[serde(default)]
    values: Vec<Board>,
}

#[derive(Debug, Deserialize)]
struct Board {
    id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SprintPage {
    #[serde(default)]
    values: Vec<JiraSprint>,
    #[serde(default = "default_true")]
    is_last: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JiraSprint {
    id: u64,
    name: String,
    state: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuePage {
    #[serde(default)]
    issues: Vec<JiraIssue>,
    #[serde(default)]
    total: usize,
}

#[derive(Debug, Deserialize)]
struct JiraIssue {
    key: String,
    #[serde(default)]
    fields: IssueFields,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueFields {
    summary: Option<String>,
    description: Option<String>,
    assignee: Option<JiraUser>,
    status: Option<Named>,
    priority: Option<Named>,
    issuetype: Option<Named>,
    sprint: Option<JiraSprint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JiraUser {
    name: Option<String>,
    account_id: Option<String>,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentPage {
    #[serde(default)]
    comments: Vec<Comment>,
    #[serde(default)]
    start_at: usize,
    #[serde(default)]
    total: usize,
}

#[derive(Debug, Deserialize)]
struct Comment {
    #[serde(default)]
    body: String,
}

fn default_true() -> bool {
    true
}

impl JiraClient {
    pub fn new(credentials: TrackerCredentials) -> Self {
        let raw = format!("{}:{}", credentials.username, credentials.token);
        let agent = ureq::AgentBuilder::new()
            .timeout(credentials.timeout)
            .user_agent(USER_AGENT)
            .build();

        Self {
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            auth_header: format!("Basic {}", STANDARD.encode(raw)),
            agent,
        }
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, TrackerError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .agent
            .get(&url)
            .set("Authorization", &self.auth_header)
            .set("Accept", "application/json");
        for (name, value) in query {
            request = request.query(name, value);
        }

        match request.call() {
            Ok(resp) => resp
                .into_json()
                .map_err(|e| TrackerError::Parse(e.to_string())),
            Err(ureq::Error::Status(401, _)) => Err(TrackerError::Unauthorized),
            Err(ureq::Error::Status(403, _)) => Err(TrackerError::Forbidden),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(TrackerError::Http(format!("HTTP {} for {}: {}", code, path, body)))
            }
            Err(e) => Err(TrackerError::Transport(e.to_string())),
        }
    }

    /// First board of a project, used when no board is configured.
    fn first_board(&self, project_key: &str) -> Result<String, TrackerError> {
        let page: BoardPage = self.get_json(
            "/rest/agile/1.0/board",
            &[("projectKeyOrId", project_key.to_string())],
        )?;
        page.values
            .first()
            .map(|board| board.id.to_string())
            .ok_or_else(|| TrackerError::Http(format!("No board found for project {}", project_key)))
    }

    fn board_for(
        &self,
        project_key: Option<&str>,
        board_id: Option<&str>,
    ) -> Result<String, TrackerError> {
        match (board_id, project_key) {
            (Some(board), _) => Ok(board.to_string()),
            (None, Some(key)) => self.first_board(key),
            (None, None) => Err(TrackerError::Http(
                "A board id or project key is required to list sprints".to_string(),
            )),
        }
    }
}

impl TrackerClient for JiraClient {
    fn list_sprints(
        &self,
        project_key: Option<&str>,
        board_id: Option<&str>,
    ) -> Result<Vec<Sprint>, TrackerError> {
        let board = self.board_for(project_key, board_id)?;
        let path = format!("/rest/agile/1.0/board/{}/sprint", board);

        let mut sprints = Vec::new();
        let mut start_at = 0;
        loop {
            let page: SprintPage = self.get_json(
                &path,
                &[
                    ("startAt", start_at.to_string()),
                    ("maxResults", PAGE_SIZE.to_string()),
                ],
            )?;
            let fetched = page.values.len();
            sprints.extend(page.values.into_iter().map(Sprint::from));
            if page.is_last || fetched == 0 {
                break;
            }
            start_at += fetched;
        }

        tracing::debug!(board = %board, count = sprints.len(), "listed sprints");
        Ok(sprints)
    }

    fn list_issues_in_sprint(
        &self,
        sprint_id: &str,
        project_key: Option<&str>,
        _board_id: Option<&str>,
    ) -> Result<Vec<IssueDto>, TrackerError> {
        let path = format!("/rest/agile/1.0/sprint/{}/issue", sprint_id);

        let mut issues = Vec::new();
        let mut start_at = 0;
        loop {
            let mut query = vec![
                ("startAt", start_at.to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
                ("fields", ISSUE_FIELDS.to_string()),
            ];
            if let Some(key) = project_key {
                query.push(("jql", format!("project = \"{}\"", key)));
            }

            let page: IssuePage = self.get_json(&path, &query)?;
            let fetched = page.issues.len();
            issues.extend(
                page.issues
                    .into_iter()
                    .map(|issue| issue.into_dto(sprint_id)),
            );
            start_at += fetched;
            if fetched == 0 || start_at >= page.total {
                break;
            }
        }

        tracing::debug!(sprint_id, count = issues.len(), "listed sprint issues");
        Ok(issues)
    }

    fn search_comments_for_keyword(
        &self,
        issue_key: &str,
        keyword: &str,
    ) -> Result<u32, TrackerError> {
        let path = format!("/rest/api/2/issue/{}/comment", issue_key);
        count_in_comment_pages(keyword, |start_at| {
            self.get_json(
                &path,
                &[
                    ("startAt", start_at.to_string()),
                    ("maxResults", PAGE_SIZE.to_string()),
                ],
            )
        })
    }

    fn test_connection(&self) -> bool {
        match self.get_json::<serde_json::Value>("/rest/api/2/myself", &[]) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "tracker connection probe failed");
                false
            }
        }
    }
}

/// Count `keyword` across every page of an issue's comments.
fn count_in_comment_pages(
    keyword: &str,
    mut fetch: impl FnMut(usize) -> Result<CommentPage, TrackerError>,
) -> Result<u32, TrackerError> {
    let mut count = 0;
    let mut start_at = 0;
    loop {
        let page = fetch(start_at)?;
        let fetched = page.comments.len();
        count += page
            .comments
            .iter()
            .map(|comment| count_occurrences(&comment.body, keyword))
            .sum::<u32>();
        start_at = page.start_at + fetched;
        if fetched == 0 || start_at >= page.total {
            break;
        }
    }
    Ok(count)
}

impl From<JiraSprint> for Sprint {
    fn from(sprint: JiraSprint) -> Self {
        Sprint {
            id: sprint.id.to_string(),
            name: sprint.name,
            state: sprint.state,
            start_date: sprint.start_date,
            end_date: sprint.end_date,
        }
    }
}

impl JiraIssue {
    /// Issues are stored under the sprint they were listed for, even when
    /// the tracker reports them as carried over into a later sprint.
    fn into_dto(self, requested_sprint: &str) -> IssueDto {
        let fields = self.fields;
        let sprint_name = fields
            .sprint
            .filter(|sprint| sprint.id.to_string() == requested_sprint)
            .map(|sprint| sprint.name);
        let (assignee, assignee_display_name) = match fields.assignee {
            Some(user) => (user.name.or(user.account_id), user.display_name),
            None => (None, None),
        };
        let linked_test_cases = fields
            .description
            .as_deref()
            .map(extract_test_case_links)
            .unwrap_or_default();

        IssueDto {
            issue_key: self.key,
            summary: fields.summary.unwrap_or_default(),
            description: fields.description,
            assignee,
            assignee_display_name,
            sprint_id: Some(requested_sprint.to_string()),
            sprint_name,
            issue_type: fields.issuetype.map(|n| n.name),
            status: fields.status.map(|n| n.name),
            priority: fields.priority.map(|n| n.name),
            linked_test_cases,
        }
    }
}

/// Extract candidate test-case links from an issue description.
///
/// Every line carrying a `TC-<digits>` token yields an identified candidate;
/// its title is the rest of the line, or the identifier itself when nothing
/// remains. Bullet lines under a "Test cases" heading without a token yield
/// id-less candidates.
pub fn extract_test_case_links(description: &str) -> Vec<TestCaseLinkDto> {
    let mut links = Vec::new();
    let mut in_section = false;

    for raw in description.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if TEST_CASES_HEADING.is_match(line) {
            in_section = true;
            continue;
        }

        let (is_bullet, content) = strip_bullet(line);

        if let Some(found) = TEST_CASE_ID.find(content) {
            let id = found.as_str().to_uppercase();
            let rest = format!("{} {}", &content[..found.start()], &content[found.end()..]);
            let title = clean_title(&rest);
            links.push(TestCaseLinkDto {
                title: if title.is_empty() { id.clone() } else { title },
                test_bank_id: Some(id),
            });
        } else if in_section && is_bullet {
            let title = clean_title(content);
            if !title.is_empty() {
                links.push(TestCaseLinkDto {
                    title,
                    test_bank_id: None,
                });
            }
        } else {
            in_section = false;
        }
    }

    links
}

fn strip_bullet(line: &str) -> (bool, &str) {
    for marker in ["- ", "* ", "• ", "# ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return (true, rest.trim());
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0
        && let Some(rest) = line[digits..].strip_prefix(". ").or(line[digits..].strip_prefix(") "))
    {
        return (true, rest.trim());
    }
    (false, line)
}

fn clean_title(text: &str) -> String {
    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '-' | '|' | '–' | '[' | ']'));
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_identified_lines() {
        let description = "Acceptance notes\n\
                           TC-101: Login with valid password\n\
                           - tc-102 - Logout clears session\n\
                           Covered by TC-103\n";
        let links = extract_test_case_links(description);
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].title, "Login with valid password");
        assert_eq!(links[0].test_bank_id.as_deref(), Some("TC-101"));
        assert_eq!(links[1].title, "Logout clears session");
        assert_eq!(links[1].test_bank_id.as_deref(), Some("TC-102"));
        assert_eq!(links[2].title, "Covered by");
    }

    #[test]
    fn test_extract_bare_id_uses_id_as_title() {
        let links = extract_test_case_links("TC-7");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].title, "TC-7");
        assert_eq!(links[0].test_bank_id.as_deref(), Some("TC-7"));
    }

    #[test]
    fn test_extract_legacy_bullets_under_heading() {
        let description = "h3. Test cases\n\
                           * Checkout with coupon\n\
                           * TC-9 Checkout without coupon\n\
                           \n\
                           Notes\n\
                           * Not a test case\n";
        let links = extract_test_case_links(description);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].title, "Checkout with coupon");
        assert!(links[0].test_bank_id.is_none());
        assert_eq!(links[1].test_bank_id.as_deref(), Some("TC-9"));
    }

    #[test]
    fn test_extract_ignores_embedded_tokens() {
        let links = extract_test_case_links("see ATC-12 and TC-12x");
        assert!(links.is_empty());
    }

    #[test]
    fn test_issue_decoding() {
        let json = r#"{
            "key": "QA-5",
            "fields": {
                "summary": "Cart totals",
                "description": "TC-1 Totals add up",
                "assignee": {"name": "jdoe", "displayName": "Jane Doe"},
                "status": {"name": "In Progress"},
                "priority": {"name": "High"},
                "issuetype": {"name": "Story"},
                "sprint": {"id": 12, "name": "Sprint 12", "state": "active"}
            }
        }"#;
        let issue: JiraIssue = serde_json::from_str(json).unwrap();
        let dto = issue.into_dto("12");
        assert_eq!(dto.issue_key, "QA-5");
        assert_eq!(dto.sprint_id.as_deref(), Some("12"));
        assert_eq!(dto.sprint_name.as_deref(), Some("Sprint 12"));
        assert_eq!(dto.assignee.as_deref(), Some("jdoe"));
        assert_eq!(dto.assignee_display_name.as_deref(), Some("Jane Doe"));
        assert_eq!(dto.priority.as_deref(), Some("High"));
        assert_eq!(dto.linked_test_cases.len(), 1);
    }

    #[test]
    fn test_carried_over_issue_keeps_requested_sprint() {
        let json = r#"{
            "key": "QA-8",
            "fields": {"sprint": {"id": 13, "name": "Sprint 13", "state": "future"}}
        }"#;
        let issue: JiraIssue = serde_json::from_str(json).unwrap();
        let dto = issue.into_dto("12");
        assert_eq!(dto.sprint_id.as_deref(), Some("12"));
        assert!(dto.sprint_name.is_none());
    }

    #[test]
    fn test_keyword_count_reads_every_comment_page() {
        let total = 120;
        let mut requested = Vec::new();
        let count = count_in_comment_pages("blocked", |start_at| {
            requested.push(start_at);
            let end = (start_at + PAGE_SIZE).min(total);
            let comments = (start_at..end)
                .map(|i| Comment {
                    body: if i % 2 == 0 { "Blocked by QA-1".to_string() } else { "fine".to_string() },
                })
                .collect();
            Ok(CommentPage {
                comments,
                start_at,
                total,
            })
        })
        .unwrap();

        assert_eq!(requested, vec![0, 50, 100]);
        assert_eq!(count, 60);
    }

    #[test]
    fn test_keyword_count_single_page_without_total() {
        let count = count_in_comment_pages("flaky", |_| {
            Ok(serde_json::from_str(r#"{"comments": [{"body": "flaky, FLAKY"}]}"#).unwrap())
        })
        .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_issue_without_sprint_field_uses_requested() {
        let issue: JiraIssue = serde_json::from_str(r#"{"key": "QA-6"}"#).unwrap();
        let dto = issue.into_dto("42");
        assert_eq!(dto.sprint_id.as_deref(), Some("42"));
        assert!(dto.linked_test_cases.is_empty());
    }

    #[test]
    fn test_unreachable_tracker_is_transport_error() {
        let client = JiraClient::new(TrackerCredentials {
            base_url: "http://127.0.0.1:9".to_string(),
            username: "u".to_string(),
            token: "t".to_string(),
            timeout: Duration::from_millis(500),
        });
        let err = client.list_issues_in_sprint("1", None, None).unwrap_err();
        assert!(matches!(err, TrackerError::Transport(_)));
        assert!(!client.test_connection());
    }
}
