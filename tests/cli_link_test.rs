//! Integration tests for link triage and the automation backlog:
//! - `qm link map` and `qm link flags` with promotion
//! - `qm backlog list`
//! - `qm stats`

mod common;

use common::{SPRINT_42, TestEnv};
use predicates::prelude::*;

/// Sync sprint 42 and return the id of QA-1's first link.
fn synced() -> (TestEnv, String) {
    let env = TestEnv::init();
    let file = env.write_issues("sprint42.json", SPRINT_42);
    env.json(&["sync", "42", "--from-file", file.to_str().unwrap()]);
    let issue = env.json(&["issue", "show", "QA-1"]);
    let id = issue["linked_test_cases"][0]["id"].as_i64().unwrap().to_string();
    (env, id)
}

fn map_default(env: &TestEnv, id: &str) -> serde_json::Value {
    env.json(&[
        "link",
        "map",
        id,
        "--project",
        "Default Project",
        "--tester",
        "Unassigned",
    ])
}

#[test]
fn test_flags_without_assignment_do_not_promote() {
    let (env, id) = synced();
    let update = env.json(&["link", "flags", &id, "--can"]);

    assert_eq!(update["link"]["automation_state"], "READY_TO_AUTOMATE");
    assert_eq!(update["link"]["can_be_automated"], true);
    assert_eq!(update["promotion"]["outcome"], "not_promoted");
    assert_eq!(update["promotion"]["reason"], "incomplete_assignment");

    let backlog = env.json(&["backlog", "list"]);
    assert!(backlog["entries"].as_array().unwrap().is_empty());
}

#[test]
fn test_map_pending_link_does_not_promote() {
    let (env, id) = synced();
    let update = map_default(&env, &id);

    assert_eq!(update["link"]["project_name"], "Default Project");
    assert_eq!(update["link"]["domain_mapped"], "Default");
    assert!(update.get("promotion").is_none());
}

#[test]
fn test_ready_link_is_promoted_then_updated() {
    let (env, id) = synced();
    map_default(&env, &id);

    let update = env.json(&["link", "flags", &id, "--can"]);
    assert_eq!(update["promotion"]["outcome"], "created");
    let entry = &update["promotion"]["entry"];
    assert_eq!(entry["title"], "Login with valid password");
    assert_eq!(entry["description"], "Test case imported from tracker issue: QA-1");
    assert_eq!(entry["status"]["code"], "Ready to Automate");
    assert_eq!(entry["priority"]["code"], "Medium");

    let update = env.json(&["link", "flags", &id, "--cannot"]);
    assert_eq!(update["link"]["automation_state"], "NOT_AUTOMATABLE");
    assert_eq!(update["promotion"]["outcome"], "updated");
    assert_eq!(update["promotion"]["entry"]["status"]["code"], "Cannot be Automated");

    let backlog = env.json(&["backlog", "list"]);
    assert_eq!(backlog["entries"].as_array().unwrap().len(), 1);

    let ready = env.json(&["backlog", "list", "--status", "Ready to Automate"]);
    assert!(ready["entries"].as_array().unwrap().is_empty());
}

#[test]
fn test_contradictory_flags_leave_link_pending() {
    let (env, id) = synced();
    map_default(&env, &id);

    let update = env.json(&["link", "flags", &id, "--can", "--cannot"]);
    assert_eq!(update["link"]["automation_state"], "PENDING");
    assert_eq!(update["promotion"]["reason"], "pending");
}

#[test]
fn test_map_sets_classification_and_notes() {
    let (env, id) = synced();
    let update = env.json(&[
        "link", "map", &id, "--type", "smoke", "--tool", "Playwright", "--notes", "  flaky on CI  ",
    ]);

    assert_eq!(update["link"]["test_case_type"]["code"], "Smoke");
    assert_eq!(update["link"]["tool_type"]["code"], "Playwright");
    assert_eq!(update["link"]["notes"], "flaky on CI");

    let cleared = env.json(&["link", "map", &id, "--notes", ""]);
    assert!(cleared["link"].get("notes").is_none());
    assert_eq!(cleared["link"]["tool_type"]["code"], "Playwright");
}

#[test]
fn test_map_unknown_references() {
    let (env, id) = synced();

    env.qm()
        .args(["link", "map", &id, "--project", "Nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Project not found: Nowhere"));

    env.qm()
        .args(["link", "map", &id, "--tool", "Watir"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));

    env.qm()
        .args(["link", "flags", "9999", "--can"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_stats_breakdown() {
    let (env, id) = synced();
    map_default(&env, &id);
    env.json(&["link", "flags", &id, "--cannot"]);

    let stats = env.json(&["stats", "42"]);
    assert_eq!(stats["issues"], 2);
    assert_eq!(stats["totals"]["links"], 3);
    assert_eq!(stats["totals"]["NOT_AUTOMATABLE"], 1);
    assert_eq!(stats["totals"]["PENDING"], 2);
    assert_eq!(stats["by_project"]["Default Project"]["links"], 1);
    assert_eq!(stats["by_project"]["(unmapped)"]["links"], 2);
    assert_eq!(stats["by_domain"]["Default"]["NOT_AUTOMATABLE"], 1);
}

#[test]
fn test_stats_human() {
    let (env, _) = synced();
    env.qm()
        .args(["-H", "stats", "42"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Sprint 42: 2 issues, 3 links"))
        .stdout(predicate::str::contains("pending:           3"));
}
