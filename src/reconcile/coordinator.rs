//! Sprint synchronization.
//!
//! Issues of a sprint are independent, so they are reconciled by a bounded
//! pool of scoped worker threads. Each issue is handled by exactly one
//! worker; failures are collected per issue and never abort the batch.

use super::issue::{IssueReconciler, ReconcileOutcome};
use super::lock_storage;
use crate::models::{IssueDto, SyncRun};
use crate::storage::Storage;
use crate::testbank::{TestBankClient, TestBankEnricher};
use crate::tracker::TrackerClient;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use uuid::Uuid;

/// Upper bound on sync workers.
pub const MAX_WORKERS: usize = 16;

/// Shared stop request. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which sprint to synchronize.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub sprint_id: String,
    pub project_key: Option<String>,
    pub board_id: Option<String>,
}

/// Summary of one successfully reconciled issue.
#[derive(Debug, Clone, Serialize)]
pub struct SyncedIssue {
    pub issue_key: String,
    pub created: bool,
    pub links: usize,
    pub links_added: usize,
    pub links_pruned: usize,
    pub links_enriched: usize,
}

impl From<ReconcileOutcome> for SyncedIssue {
    fn from(outcome: ReconcileOutcome) -> Self {
        Self {
            issue_key: outcome.issue.issue_key,
            created: outcome.created,
            links: outcome.issue.linked_test_cases.len(),
            links_added: outcome.links_added,
            links_pruned: outcome.links_pruned,
            links_enriched: outcome.links_enriched,
        }
    }
}

/// One issue that failed to reconcile.
#[derive(Debug, Clone, Serialize)]
pub struct IssueFailure {
    pub issue_key: String,
    pub error: String,
}

/// Result of a sprint synchronization.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub sprint_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub issues: Vec<SyncedIssue>,
    pub failures: Vec<IssueFailure>,
    pub succeeded: usize,
    pub failed: usize,
    /// Issues never started because the run was cancelled
    pub not_started: usize,
    pub cancelled: bool,
    pub links_added: usize,
    pub links_pruned: usize,
    pub links_enriched: usize,
}

impl SyncReport {
    pub fn to_run(&self) -> SyncRun {
        SyncRun {
            run_id: self.run_id.clone(),
            sprint_id: self.sprint_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            succeeded: self.succeeded,
            failed: self.failed,
            not_started: self.not_started,
            cancelled: self.cancelled,
            links_added: self.links_added,
            links_pruned: self.links_pruned,
        }
    }
}

/// Pulls a sprint from the tracker and reconciles every issue in it.
pub struct SprintSyncCoordinator<'a> {
    tracker: &'a dyn TrackerClient,
    enricher: TestBankEnricher<'a>,
    workers: usize,
    cancel: CancelFlag,
}

impl<'a> SprintSyncCoordinator<'a> {
    pub fn new(tracker: &'a dyn TrackerClient, test_bank: &'a dyn TestBankClient) -> Self {
        Self {
            tracker,
            enricher: TestBankEnricher::new(test_bank),
            workers: 1,
            cancel: CancelFlag::new(),
        }
    }

    /// Set the pool size, clamped to `1..=MAX_WORKERS`.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, MAX_WORKERS);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Synchronize one sprint.
    ///
    /// Only a failure of the initial issue listing is returned as an error;
    /// per-issue failures end up in the report.
    pub fn sync_sprint(&self, storage: &Mutex<Storage>, request: &SyncRequest) -> Result<SyncReport> {
        let sprint_id = request.sprint_id.trim();
        if sprint_id.is_empty() {
            return Err(Error::InvalidInput("Sprint id must not be blank".to_string()));
        }

        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("sync_sprint", sprint_id, run_id = %run_id);
        let _entered = span.enter();
        let started_at = Utc::now();

        let fetched = self
            .tracker
            .list_issues_in_sprint(
                sprint_id,
                request.project_key.as_deref(),
                request.board_id.as_deref(),
            )
            .map_err(|e| {
                tracing::error!(error = %e, "failed to fetch sprint issues");
                Error::Tracker(e)
            })?;
        let issues = dedup_by_key(fetched);
        tracing::info!(count = issues.len(), workers = self.workers, "fetched sprint issues");

        let reconciler = IssueReconciler::new(&self.enricher);
        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<(usize, std::result::Result<ReconcileOutcome, String>)>> =
            Mutex::new(Vec::with_capacity(issues.len()));
        let workers = self.workers.min(issues.len()).max(1);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(dto) = issues.get(index) else {
                            break;
                        };

                        let issue_span = tracing::info_span!(parent: &span, "reconcile_issue", issue_key = %dto.issue_key);
                        let _entered = issue_span.enter();

                        let outcome = reconciler.reconcile(storage, dto).map_err(|e| {
                            tracing::warn!(error = %e, "issue reconciliation failed");
                            e.to_string()
                        });
                        if let Ok(mut results) = results.lock() {
                            results.push((index, outcome));
                        }
                    }
                });
            }
        });

        let mut results = results
            .into_inner()
            .map_err(|_| Error::Other("sync results lock poisoned".to_string()))?;
        results.sort_by_key(|(index, _)| *index);

        let mut report = SyncReport {
            run_id,
            sprint_id: sprint_id.to_string(),
            started_at,
            finished_at: started_at,
            issues: Vec::new(),
            failures: Vec::new(),
            succeeded: 0,
            failed: 0,
            not_started: issues.len().saturating_sub(results.len()),
            cancelled: self.cancel.is_cancelled(),
            links_added: 0,
            links_pruned: 0,
            links_enriched: 0,
        };

        for (index, outcome) in results {
            match outcome {
                Ok(outcome) => {
                    report.links_added += outcome.links_added;
                    report.links_pruned += outcome.links_pruned;
                    report.links_enriched += outcome.links_enriched;
                    report.issues.push(SyncedIssue::from(outcome));
                }
                Err(error) => report.failures.push(IssueFailure {
                    issue_key: issues[index].issue_key.clone(),
                    error,
                }),
            }
        }
        report.succeeded = report.issues.len();
        report.failed = report.failures.len();
        report.finished_at = Utc::now();

        match lock_storage(storage).and_then(|mut s| s.record_sync_run(&report.to_run())) {
            Ok(()) => {}
            Err(e) => tracing::warn!(error = %e, "could not record sync run"),
        }

        if report.cancelled {
            tracing::warn!(not_started = report.not_started, "sprint sync cancelled");
        }
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            links_added = report.links_added,
            links_pruned = report.links_pruned,
            "sprint sync finished"
        );
        Ok(report)
    }
}

/// Keep the first occurrence of every issue key.
fn dedup_by_key(issues: Vec<IssueDto>) -> Vec<IssueDto> {
    let mut seen = HashSet::new();
    issues
        .into_iter()
        .filter(|issue| {
            let fresh = seen.insert(issue.issue_key.clone());
            if !fresh {
                tracing::warn!(issue_key = %issue.issue_key, "duplicate issue in tracker response ignored");
            }
            fresh
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ops::update_flags;
    use crate::reconcile::ops::{MapRequest, map_to_project};
    use crate::test_utils::{FakeTestBank, FakeTracker, TestEnv, issue_dto};
    use crate::testbank::TestBankDetails;

    fn sprint(id: &str) -> SyncRequest {
        SyncRequest {
            sprint_id: id.to_string(),
            ..Default::default()
        }
    }

    fn three_issues() -> Vec<IssueDto> {
        vec![
            issue_dto("QA-1", "7", &[("Login test", Some("TC-1")), ("Logout", Some("TC-2"))]),
            issue_dto("QA-2", "7", &[("Cart totals", Some("TC-3"))]),
            issue_dto("QA-3", "7", &[("Checkout", Some("TC-4")), ("Legacy", None)]),
        ]
    }

    #[test]
    fn test_sync_reconciles_all_issues() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let tracker = FakeTracker::with_issues(three_issues());
        let bank = FakeTestBank::unconfigured();

        let report = SprintSyncCoordinator::new(&tracker, &bank)
            .with_workers(3)
            .sync_sprint(&storage, &sprint("7"))
            .unwrap();

        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.links_added, 4);
        assert!(!report.cancelled);
        let keys: Vec<&str> = report.issues.iter().map(|i| i.issue_key.as_str()).collect();
        assert_eq!(keys, vec!["QA-1", "QA-2", "QA-3"]);

        let s = storage.lock().unwrap();
        assert_eq!(s.count_issues().unwrap(), 3);
        assert_eq!(s.count_links().unwrap(), 4);
        let runs = s.list_sync_runs(Some("7"), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, report.run_id);
    }

    #[test]
    fn test_resync_is_idempotent() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let tracker = FakeTracker::with_issues(three_issues());
        let bank = FakeTestBank::unconfigured();
        let coordinator = SprintSyncCoordinator::new(&tracker, &bank).with_workers(2);

        coordinator.sync_sprint(&storage, &sprint("7")).unwrap();

        // Promote one link so the backlog takes part in the comparison
        {
            let mut s = storage.lock().unwrap();
            let seed = s.seed_reference_data().unwrap();
            let link_id = s.get_issue_by_key("QA-2").unwrap().linked_test_cases[0].id;
            map_to_project(
                &mut s,
                &MapRequest {
                    link_id,
                    project_id: Some(seed.project_id),
                    tester_id: Some(seed.tester_id),
                    ..Default::default()
                },
            )
            .unwrap();
            update_flags(&mut s, link_id, true, false).unwrap();
        }

        let counts = |storage: &Mutex<Storage>| {
            let s = storage.lock().unwrap();
            (
                s.count_issues().unwrap(),
                s.count_links().unwrap(),
                s.count_backlog().unwrap(),
            )
        };
        let before = counts(&storage);

        let second = coordinator.sync_sprint(&storage, &sprint("7")).unwrap();

        assert_eq!(counts(&storage), before);
        assert_eq!(before, (3, 4, 1));
        assert_eq!(second.links_added, 0);
        assert_eq!(second.links_pruned, 0);
        assert!(second.issues.iter().all(|i| !i.created));

        // Operator state survives the re-sync
        let s = storage.lock().unwrap();
        let link = &s.get_issue_by_key("QA-2").unwrap().linked_test_cases[0];
        assert!(link.can_be_automated);
        assert!(link.project_id.is_some());
    }

    #[test]
    fn test_partial_failure_is_collected() {
        let env = TestEnv::new();
        let storage = env.init_storage();
        storage
            .conn()
            .execute_batch(
                "CREATE TRIGGER fail_qa2 BEFORE INSERT ON issues WHEN NEW.issue_key = 'QA-2'
                 BEGIN SELECT RAISE(ABORT, 'simulated storage failure'); END;",
            )
            .unwrap();
        let storage = Mutex::new(storage);
        let tracker = FakeTracker::with_issues(three_issues());
        let bank = FakeTestBank::unconfigured();

        let report = SprintSyncCoordinator::new(&tracker, &bank)
            .sync_sprint(&storage, &sprint("7"))
            .unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].issue_key, "QA-2");
        assert!(report.failures[0].error.contains("simulated storage failure"));

        let s = storage.lock().unwrap();
        assert_eq!(s.count_issues().unwrap(), 2);
        assert_eq!(s.list_sync_runs(None, 10).unwrap()[0].failed, 1);
    }

    #[test]
    fn test_tracker_failure_is_hard_error() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let tracker = FakeTracker {
            fail_listing: true,
            ..FakeTracker::with_issues(three_issues())
        };
        let bank = FakeTestBank::unconfigured();

        let err = SprintSyncCoordinator::new(&tracker, &bank)
            .sync_sprint(&storage, &sprint("7"))
            .unwrap_err();

        assert!(matches!(err, Error::Tracker(_)));
        let s = storage.lock().unwrap();
        assert_eq!(s.count_issues().unwrap(), 0);
        assert!(s.list_sync_runs(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_before_start_reconciles_nothing() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let tracker = FakeTracker::with_issues(three_issues());
        let bank = FakeTestBank::unconfigured();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let report = SprintSyncCoordinator::new(&tracker, &bank)
            .with_cancel(cancel)
            .sync_sprint(&storage, &sprint("7"))
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.not_started, 3);
        assert_eq!(storage.lock().unwrap().count_issues().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_issue_keys_reconciled_once() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let mut issues = three_issues();
        issues.push(issue_dto("QA-1", "7", &[("Other", Some("TC-9"))]));
        let tracker = FakeTracker::with_issues(issues);
        let bank = FakeTestBank::unconfigured();

        let report = SprintSyncCoordinator::new(&tracker, &bank)
            .with_workers(4)
            .sync_sprint(&storage, &sprint("7"))
            .unwrap();

        assert_eq!(report.succeeded, 3);
        let s = storage.lock().unwrap();
        let titles: Vec<String> = s
            .get_issue_by_key("QA-1")
            .unwrap()
            .linked_test_cases
            .into_iter()
            .map(|l| l.title)
            .collect();
        assert_eq!(titles, vec!["Login test", "Logout"]);
    }

    #[test]
    fn test_enrichment_counted_in_report() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let tracker = FakeTracker::with_issues(three_issues());
        let bank = FakeTestBank::online().with_case(
            "Cart totals",
            "3",
            TestBankDetails {
                assignee: Some("qa.lead".to_string()),
                ..Default::default()
            },
        );

        let report = SprintSyncCoordinator::new(&tracker, &bank)
            .with_workers(2)
            .sync_sprint(&storage, &sprint("7"))
            .unwrap();

        assert_eq!(report.links_enriched, 1);
        assert_eq!(tracker.list_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blank_sprint_rejected() {
        let env = TestEnv::new();
        let storage = Mutex::new(env.init_storage());
        let tracker = FakeTracker::default();
        let bank = FakeTestBank::unconfigured();
        let err = SprintSyncCoordinator::new(&tracker, &bank)
            .sync_sprint(&storage, &sprint(" "))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(tracker.list_calls.load(Ordering::SeqCst), 0);
    }
}
