//! Reconciliation of a single tracker issue.
//!
//! Runs in three steps so that the storage lock is never held across
//! test-bank calls:
//! 1. plan (locked, one transaction): upsert the issue, prune links without a
//!    test-bank identifier, and compute the links to add
//! 2. enrich (unlocked): fill the new links from the test-bank
//! 3. apply (locked, one transaction): insert the new links

use super::lock_storage;
use crate::models::{Issue, IssueDto, TestCaseLink};
use crate::storage::Storage;
use crate::testbank::TestBankEnricher;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;

/// Result of reconciling one issue.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub issue: Issue,
    /// The issue was not stored before
    pub created: bool,
    pub links_added: usize,
    pub links_pruned: usize,
    pub links_enriched: usize,
}

struct Plan {
    issue_id: i64,
    created: bool,
    pruned: usize,
    additions: Vec<TestCaseLink>,
}

/// Upserts tracker issues and their linked test cases.
pub struct IssueReconciler<'a> {
    enricher: &'a TestBankEnricher<'a>,
}

impl<'a> IssueReconciler<'a> {
    pub fn new(enricher: &'a TestBankEnricher<'a>) -> Self {
        Self { enricher }
    }

    pub fn reconcile(&self, storage: &Mutex<Storage>, dto: &IssueDto) -> Result<ReconcileOutcome> {
        if dto.issue_key.trim().is_empty() {
            return Err(Error::InvalidInput("Issue key must not be blank".to_string()));
        }

        let plan = {
            let mut guard = lock_storage(storage)?;
            guard.transaction(|s| plan_issue(s, dto))?
        };

        let mut additions = plan.additions;
        let mut links_enriched = 0;
        for link in &mut additions {
            let title = link.title.clone();
            if self.enricher.enrich(link, &title).is_enriched() {
                links_enriched += 1;
            }
        }

        let mut guard = lock_storage(storage)?;
        let (issue, links_added) = guard.transaction(|s| {
            let existing: HashSet<String> = s
                .links_for_issue(plan.issue_id)?
                .into_iter()
                .map(|link| link.title)
                .collect();

            let mut added = 0;
            for link in additions.iter().filter(|l| !existing.contains(&l.title)) {
                s.insert_link(link)?;
                added += 1;
            }
            Ok((s.get_issue(plan.issue_id)?, added))
        })?;

        tracing::debug!(
            issue_key = %issue.issue_key,
            created = plan.created,
            links_added,
            links_pruned = plan.pruned,
            "reconciled issue"
        );

        Ok(ReconcileOutcome {
            issue,
            created: plan.created,
            links_added,
            links_pruned: plan.pruned,
            links_enriched,
        })
    }
}

fn plan_issue(storage: &mut Storage, dto: &IssueDto) -> Result<Plan> {
    let (mut issue, created) = match storage.find_issue_by_key(&dto.issue_key)? {
        Some(mut existing) => {
            existing.apply_dto(dto);
            existing.updated_at = Utc::now();
            storage.update_issue(&existing)?;
            (existing, false)
        }
        None => {
            let mut issue = Issue::from_dto(dto);
            issue.id = storage.insert_issue(&issue)?;
            (issue, true)
        }
    };

    // Removal set from the persisted snapshot
    let (kept, stale): (Vec<TestCaseLink>, Vec<TestCaseLink>) = std::mem::take(&mut issue.linked_test_cases)
        .into_iter()
        .partition(TestCaseLink::has_test_bank_id);
    for link in &stale {
        tracing::debug!(title = %link.title, test_bank_id = ?link.test_bank_id, "pruning link without test-bank id");
        storage.delete_link(link.id)?;
    }

    // Addition set, de-duplicated by title against kept links and earlier candidates
    let mut titles: HashSet<String> = kept.iter().map(|link| link.title.clone()).collect();
    let mut additions = Vec::new();
    for candidate in &dto.linked_test_cases {
        if !candidate.has_test_bank_id() {
            continue;
        }
        let title = candidate.title.trim();
        if title.is_empty() || !titles.insert(title.to_string()) {
            continue;
        }
        additions.push(TestCaseLink::new(
            &issue,
            title.to_string(),
            candidate.test_bank_id.clone(),
        ));
    }

    Ok(Plan {
        issue_id: issue.id,
        created,
        pruned: stale.len(),
        additions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeTestBank, TestEnv, issue_dto};
    use crate::testbank::TestBankDetails;

    fn reconcile(storage: &Mutex<Storage>, bank: &FakeTestBank, dto: &IssueDto) -> ReconcileOutcome {
        let enricher = TestBankEnricher::new(bank);
        IssueReconciler::new(&enricher).reconcile(storage, dto).unwrap()
    }

    #[test]
    fn test_creates_issue_and_links() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let bank = FakeTestBank::unconfigured();

        let dto = issue_dto("QA-1", "7", &[("Login test", Some("TC-1")), ("Logout", Some("tc-2"))]);
        let outcome = reconcile(&storage, &bank, &dto);

        assert!(outcome.created);
        assert_eq!(outcome.links_added, 2);
        assert_eq!(outcome.issue.linked_test_cases.len(), 2);
        assert_eq!(outcome.issue.summary, "Summary of QA-1");
        assert_eq!(outcome.issue.sprint_name.as_deref(), Some("Sprint 7"));
    }

    #[test]
    fn test_update_keeps_key_and_keyword_fields() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let bank = FakeTestBank::unconfigured();

        let first = reconcile(&storage, &bank, &issue_dto("QA-1", "7", &[]));
        {
            let mut s = storage.lock().unwrap();
            let mut issue = first.issue.clone();
            issue.keyword_count = 4;
            issue.search_keyword = Some("flaky".to_string());
            s.update_issue(&issue).unwrap();
        }

        let mut changed = issue_dto("QA-1", "8", &[]);
        changed.summary = "Renamed".to_string();
        let second = reconcile(&storage, &bank, &changed);

        assert!(!second.created);
        assert_eq!(second.issue.id, first.issue.id);
        assert_eq!(second.issue.summary, "Renamed");
        assert_eq!(second.issue.sprint_id.as_deref(), Some("8"));
        assert_eq!(second.issue.keyword_count, 4);
        assert_eq!(second.issue.search_keyword.as_deref(), Some("flaky"));
        assert_eq!(second.issue.created_at, first.issue.created_at);
        assert!(second.issue.updated_at >= first.issue.updated_at);
    }

    #[test]
    fn test_links_without_test_bank_id_are_dropped() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let bank = FakeTestBank::unconfigured();

        let dto = issue_dto(
            "QA-1",
            "7",
            &[("Legacy", None), ("Notes", Some("NOTES-1")), ("Real", Some("TC-3"))],
        );
        let outcome = reconcile(&storage, &bank, &dto);
        let titles: Vec<&str> = outcome
            .issue
            .linked_test_cases
            .iter()
            .map(|l| l.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Real"]);
    }

    #[test]
    fn test_prunes_persisted_legacy_links() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let bank = FakeTestBank::unconfigured();

        let first = reconcile(&storage, &bank, &issue_dto("QA-1", "7", &[("Real", Some("TC-3"))]));
        {
            let mut s = storage.lock().unwrap();
            let legacy = TestCaseLink::new(&first.issue, "Old notes".to_string(), Some("NOTES-1".to_string()));
            s.insert_link(&legacy).unwrap();
            let bare = TestCaseLink::new(&first.issue, "Bare".to_string(), None);
            s.insert_link(&bare).unwrap();
        }

        let outcome = reconcile(&storage, &bank, &issue_dto("QA-1", "7", &[("Real", Some("TC-3"))]));

        assert_eq!(outcome.links_pruned, 2);
        assert_eq!(outcome.links_added, 0);
        let titles: Vec<&str> = outcome
            .issue
            .linked_test_cases
            .iter()
            .map(|l| l.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Real"]);
    }

    #[test]
    fn test_duplicate_titles_collapse_to_first() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let bank = FakeTestBank::unconfigured();

        let dto = issue_dto(
            "QA-1",
            "7",
            &[
                ("Login test", Some("TC-1")),
                ("Login test", Some("TC-2")),
                ("Login test", None),
            ],
        );
        let outcome = reconcile(&storage, &bank, &dto);

        assert_eq!(outcome.issue.linked_test_cases.len(), 1);
        assert_eq!(
            outcome.issue.linked_test_cases[0].test_bank_id.as_deref(),
            Some("TC-1")
        );
    }

    #[test]
    fn test_existing_title_not_re_added() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let bank = FakeTestBank::unconfigured();

        reconcile(&storage, &bank, &issue_dto("QA-1", "7", &[("Login test", Some("TC-1"))]));
        let outcome = reconcile(
            &storage,
            &bank,
            &issue_dto("QA-1", "7", &[("Login test", Some("TC-99")), ("New", Some("TC-5"))]),
        );

        assert_eq!(outcome.links_added, 1);
        assert_eq!(outcome.issue.linked_test_cases.len(), 2);
        assert_eq!(
            outcome.issue.linked_test_cases[0].test_bank_id.as_deref(),
            Some("TC-1")
        );
    }

    #[test]
    fn test_new_links_are_enriched_before_persisting() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let bank = FakeTestBank::online().with_case(
            "Login test",
            "77",
            TestBankDetails {
                id: Some("TC-77".to_string()),
                assignee: Some("qa.lead".to_string()),
                priority: Some("High".to_string()),
                automation_status: None,
            },
        );

        let outcome = reconcile(&storage, &bank, &issue_dto("QA-1", "7", &[("Login test", Some("TC-1"))]));

        assert_eq!(outcome.links_enriched, 1);
        let link = &outcome.issue.linked_test_cases[0];
        assert_eq!(link.test_bank_id.as_deref(), Some("TC-77"));
        assert_eq!(link.test_bank_assignee.as_deref(), Some("qa.lead"));
        assert_eq!(outcome.issue.effective_assignee(), Some("qa.lead"));

        // Existing links are not searched again
        let before = bank.calls().len();
        reconcile(&storage, &bank, &issue_dto("QA-1", "7", &[("Login test", Some("TC-1"))]));
        assert_eq!(bank.calls().len(), before);
    }

    #[test]
    fn test_blank_key_rejected() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let bank = FakeTestBank::unconfigured();
        let enricher = TestBankEnricher::new(&bank);
        let err = IssueReconciler::new(&enricher)
            .reconcile(&storage, &issue_dto("  ", "7", &[]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
