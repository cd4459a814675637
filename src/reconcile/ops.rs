//! Operator-facing mutations and sprint statistics.

use super::promote::{Promotion, promote};
use crate::lookup::{resolve_automation_status, resolve_user_code};
use crate::models::{AutomationState, Issue, LookupCategory, LookupRef, TestCaseLink};
use crate::storage::Storage;
use crate::tracker::TrackerClient;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

/// Group name for links without a project or domain.
pub const UNMAPPED: &str = "(unmapped)";

/// Result of a flag update.
#[derive(Debug, Clone, Serialize)]
pub struct FlagUpdate {
    pub link: TestCaseLink,
    pub promotion: Promotion,
}

/// Fields to set on a link. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct MapRequest {
    pub link_id: i64,
    pub project_id: Option<i64>,
    pub tester_id: Option<i64>,
    pub manual_tester_id: Option<i64>,
    pub test_case_type: Option<String>,
    pub tool_type: Option<String>,
    /// Blank notes clear the field
    pub notes: Option<String>,
}

/// Result of mapping a link.
#[derive(Debug, Clone, Serialize)]
pub struct MapUpdate {
    pub link: TestCaseLink,
    /// Present when the link was in a definitive state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion: Option<Promotion>,
}

/// Link counts per automation state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateTotals {
    pub links: usize,
    #[serde(rename = "READY_TO_AUTOMATE")]
    pub ready_to_automate: usize,
    #[serde(rename = "NOT_AUTOMATABLE")]
    pub not_automatable: usize,
    #[serde(rename = "PENDING")]
    pub pending: usize,
}

impl StateTotals {
    fn add(&mut self, state: AutomationState) {
        self.links += 1;
        match state {
            AutomationState::Pending => self.pending += 1,
            AutomationState::ReadyToAutomate => self.ready_to_automate += 1,
            AutomationState::NotAutomatable => self.not_automatable += 1,
        }
    }
}

/// Automation readiness of one sprint.
#[derive(Debug, Clone, Serialize)]
pub struct SprintStatistics {
    pub sprint_id: String,
    pub issues: usize,
    pub totals: StateTotals,
    pub by_project: BTreeMap<String, StateTotals>,
    pub by_domain: BTreeMap<String, StateTotals>,
}

/// Store both flags, derive the automation state and promote.
///
/// Runs in one transaction: if the state's reference row is missing or the
/// promotion fails, nothing is persisted.
pub fn update_flags(
    storage: &mut Storage,
    link_id: i64,
    can_be_automated: bool,
    cannot_be_automated: bool,
) -> Result<FlagUpdate> {
    storage.transaction(|s| {
        let mut link = s.get_link(link_id)?;
        let (state, _) = resolve_automation_status(&*s, can_be_automated, cannot_be_automated)?;

        link.can_be_automated = can_be_automated;
        link.cannot_be_automated = cannot_be_automated;
        link.automation_state = state;
        link.updated_at = Utc::now();
        s.update_link(&link)?;

        tracing::info!(link_id, title = %link.title, state = %state, "automation flags updated");

        let promotion = promote(s, &link)?;
        Ok(FlagUpdate {
            link: s.get_link(link_id)?,
            promotion,
        })
    })
}

/// Assign a link to a project and testers and set its categories.
///
/// The domain snapshot follows the project. A link already in a definitive
/// state is promoted once it has both project and tester.
pub fn map_to_project(storage: &mut Storage, request: &MapRequest) -> Result<MapUpdate> {
    storage.transaction(|s| {
        let mut link = s.get_link(request.link_id)?;

        if let Some(project_id) = request.project_id {
            let project = s.get_project(project_id)?;
            link.project_id = Some(project.id);
            link.domain_mapped = project.domain_name;
        }
        if let Some(tester_id) = request.tester_id {
            link.assigned_tester_id = Some(s.get_tester(tester_id)?.id);
        }
        if let Some(tester_id) = request.manual_tester_id {
            link.manual_tester_id = Some(s.get_tester(tester_id)?.id);
        }
        if let Some(code) = &request.test_case_type {
            let row = resolve_user_code(&*s, LookupCategory::TestCaseType, code)?;
            link.test_case_type = Some(LookupRef::from(&row));
        }
        if let Some(code) = &request.tool_type {
            let row = resolve_user_code(&*s, LookupCategory::ToolType, code)?;
            link.tool_type = Some(LookupRef::from(&row));
        }
        if let Some(notes) = &request.notes {
            let notes = notes.trim();
            link.notes = (!notes.is_empty()).then(|| notes.to_string());
        }

        link.updated_at = Utc::now();
        s.update_link(&link)?;

        let promotion = if link.automation_state.is_definitive()
            && link.project_id.is_some()
            && link.assigned_tester_id.is_some()
        {
            Some(promote(s, &link)?)
        } else {
            None
        };

        Ok(MapUpdate {
            link: s.get_link(request.link_id)?,
            promotion,
        })
    })
}

/// Count `keyword` in the issue's tracker comments and store the result.
pub fn search_keyword_in_issue(
    storage: &mut Storage,
    tracker: &dyn TrackerClient,
    issue_key: &str,
    keyword: &str,
) -> Result<Issue> {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return Err(Error::InvalidInput("Keyword must not be blank".to_string()));
    }

    let mut issue = storage.get_issue_by_key(issue_key)?;
    let count = tracker.search_comments_for_keyword(&issue.issue_key, keyword)?;

    issue.keyword_count = count;
    issue.search_keyword = Some(keyword.to_string());
    issue.updated_at = Utc::now();
    storage.update_issue(&issue)?;

    tracing::info!(issue_key = %issue.issue_key, keyword, count, "keyword search stored");
    storage.get_issue(issue.id)
}

/// Totals and per-project/per-domain breakdowns for one sprint.
pub fn sprint_statistics(storage: &Storage, sprint_id: &str) -> Result<SprintStatistics> {
    let issues = storage.list_issues(Some(sprint_id))?;

    let mut totals = StateTotals::default();
    let mut by_project: BTreeMap<String, StateTotals> = BTreeMap::new();
    let mut by_domain: BTreeMap<String, StateTotals> = BTreeMap::new();

    for link in issues.iter().flat_map(|issue| &issue.linked_test_cases) {
        totals.add(link.automation_state);

        let project = link.project_name.clone().unwrap_or_else(|| UNMAPPED.to_string());
        by_project.entry(project).or_default().add(link.automation_state);

        let domain = link.domain_mapped.clone().unwrap_or_else(|| UNMAPPED.to_string());
        by_domain.entry(domain).or_default().add(link.automation_state);
    }

    Ok(SprintStatistics {
        sprint_id: sprint_id.to_string(),
        issues: issues.len(),
        totals,
        by_project,
        by_domain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::READY_TO_AUTOMATE;
    use crate::models::IssueDto;
    use crate::storage::{DEFAULT_DOMAIN, DEFAULT_PROJECT, NewProject};
    use crate::test_utils::{FakeTracker, TestEnv};

    fn setup(storage: &mut Storage) -> (Issue, TestCaseLink) {
        let mut issue = Issue::from_dto(&IssueDto {
            issue_key: "QA-1".to_string(),
            sprint_id: Some("7".to_string()),
            ..Default::default()
        });
        issue.id = storage.insert_issue(&issue).unwrap();
        let mut link = TestCaseLink::new(&issue, "Login test".to_string(), Some("TC-1".to_string()));
        link.id = storage.insert_link(&link).unwrap();
        (issue, link)
    }

    #[test]
    fn test_update_flags_without_assignment() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        let (_, link) = setup(&mut storage);

        let update = update_flags(&mut storage, link.id, true, false).unwrap();
        assert_eq!(update.link.automation_state, AutomationState::ReadyToAutomate);
        assert!(update.link.can_be_automated);
        assert!(update.promotion.entry().is_none());
        assert_eq!(storage.count_backlog().unwrap(), 0);
    }

    #[test]
    fn test_contradictory_flags_stay_pending() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        let (_, link) = setup(&mut storage);

        let update = update_flags(&mut storage, link.id, true, true).unwrap();
        assert_eq!(update.link.automation_state, AutomationState::Pending);
        assert!(update.link.can_be_automated && update.link.cannot_be_automated);
    }

    #[test]
    fn test_update_flags_unknown_link() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        assert!(matches!(
            update_flags(&mut storage, 99, true, false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_update_flags_rolls_back_without_reference_data() {
        let env = TestEnv::new();
        let mut storage = env.init_bare_storage();
        let (_, link) = setup(&mut storage);

        let err = update_flags(&mut storage, link.id, true, false).unwrap_err();
        assert!(matches!(err, Error::LookupMissing { .. }));

        let stored = storage.get_link(link.id).unwrap();
        assert!(!stored.can_be_automated);
        assert_eq!(stored.automation_state, AutomationState::Pending);
    }

    #[test]
    fn test_map_then_flags_promotes() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        let seed = storage.seed_reference_data().unwrap();
        let (_, link) = setup(&mut storage);

        let mapped = map_to_project(
            &mut storage,
            &MapRequest {
                link_id: link.id,
                project_id: Some(seed.project_id),
                tester_id: Some(seed.tester_id),
                tool_type: Some("cypress".to_string()),
                notes: Some("  needs fixtures ".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(mapped.promotion.is_none());
        assert_eq!(mapped.link.domain_mapped.as_deref(), Some(DEFAULT_DOMAIN));
        assert_eq!(mapped.link.project_name.as_deref(), Some(DEFAULT_PROJECT));
        assert_eq!(mapped.link.notes.as_deref(), Some("needs fixtures"));

        let update = update_flags(&mut storage, link.id, true, false).unwrap();
        let entry = update.promotion.entry().unwrap();
        assert_eq!(entry.title, "Login test");
        assert_eq!(entry.status.as_ref().map(|s| s.code.as_str()), Some(READY_TO_AUTOMATE));
        assert_eq!(entry.tool_type.as_ref().map(|t| t.code.as_str()), Some("Cypress"));

        // Repeated calls converge
        update_flags(&mut storage, link.id, true, false).unwrap();
        assert_eq!(storage.count_backlog().unwrap(), 1);
    }

    #[test]
    fn test_flags_then_map_promotes() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        let seed = storage.seed_reference_data().unwrap();
        let (_, link) = setup(&mut storage);

        update_flags(&mut storage, link.id, false, true).unwrap();
        let mapped = map_to_project(
            &mut storage,
            &MapRequest {
                link_id: link.id,
                project_id: Some(seed.project_id),
                tester_id: Some(seed.tester_id),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(mapped.promotion, Some(Promotion::Created { .. })));
    }

    #[test]
    fn test_map_rejects_unknown_references() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        let (_, link) = setup(&mut storage);

        for request in [
            MapRequest {
                link_id: link.id,
                project_id: Some(404),
                ..Default::default()
            },
            MapRequest {
                link_id: link.id,
                tester_id: Some(404),
                ..Default::default()
            },
            MapRequest {
                link_id: link.id,
                tool_type: Some("Watir".to_string()),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                map_to_project(&mut storage, &request),
                Err(Error::NotFound(_))
            ));
        }
    }

    #[test]
    fn test_search_keyword_in_issue() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        setup(&mut storage);
        let mut tracker = FakeTracker::default();
        tracker.comment_counts.insert("QA-1".to_string(), 3);

        let issue = search_keyword_in_issue(&mut storage, &tracker, "QA-1", " flaky ").unwrap();
        assert_eq!(issue.keyword_count, 3);
        assert_eq!(issue.search_keyword.as_deref(), Some("flaky"));
        assert_eq!(issue.linked_test_cases.len(), 1);
    }

    #[test]
    fn test_search_keyword_errors() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        setup(&mut storage);
        let tracker = FakeTracker::default();

        assert!(matches!(
            search_keyword_in_issue(&mut storage, &tracker, "QA-1", "  "),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            search_keyword_in_issue(&mut storage, &tracker, "QA-404", "flaky"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            search_keyword_in_issue(&mut storage, &tracker, "QA-1", "flaky"),
            Err(Error::Tracker(_))
        ));
    }

    #[test]
    fn test_sprint_statistics() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        let seed = storage.seed_reference_data().unwrap();
        let retail = storage.create_domain("Retail", None).unwrap();
        let shop = storage
            .create_project(&NewProject {
                name: "Shop".to_string(),
                domain_id: Some(retail.id),
                ..Default::default()
            })
            .unwrap();
        let (issue, first) = setup(&mut storage);
        let second_id = storage
            .insert_link(&TestCaseLink::new(&issue, "Logout".to_string(), Some("TC-2".to_string())))
            .unwrap();
        storage
            .insert_link(&TestCaseLink::new(&issue, "Signup".to_string(), Some("TC-3".to_string())))
            .unwrap();

        for (link_id, project_id) in [(first.id, seed.project_id), (second_id, shop.id)] {
            map_to_project(
                &mut storage,
                &MapRequest {
                    link_id,
                    project_id: Some(project_id),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        update_flags(&mut storage, first.id, true, false).unwrap();
        update_flags(&mut storage, second_id, false, true).unwrap();

        let stats = sprint_statistics(&storage, "7").unwrap();
        assert_eq!(stats.issues, 1);
        assert_eq!(
            stats.totals,
            StateTotals {
                links: 3,
                ready_to_automate: 1,
                not_automatable: 1,
                pending: 1,
            }
        );
        assert_eq!(stats.by_project[DEFAULT_PROJECT].ready_to_automate, 1);
        assert_eq!(stats.by_project["Shop"].not_automatable, 1);
        assert_eq!(stats.by_project[UNMAPPED].pending, 1);
        assert_eq!(stats.by_domain["Retail"].links, 1);
        assert_eq!(stats.by_domain[DEFAULT_DOMAIN].links, 1);

        let empty = sprint_statistics(&storage, "8").unwrap();
        assert_eq!(empty.issues, 0);
        assert_eq!(empty.totals, StateTotals::default());
    }
}
