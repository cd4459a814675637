//! Integration tests for configuration:
//! - `qm config set` writes the workspace config.kdl
//! - `qm config show` reports values with their sources, secrets masked
//! - precedence of environment, workspace and system files

mod common;

use common::TestEnv;
use predicates::prelude::*;
use serde_json::Value;

fn entry<'a>(show: &'a Value, key: &str) -> &'a Value {
    show["entries"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["key"] == key)
        .unwrap_or_else(|| panic!("no entry {}", key))
}

#[test]
fn test_defaults() {
    let env = TestEnv::new();
    let show = env.json(&["config", "show"]);

    assert_eq!(entry(&show, "sync.workers")["value"], "4");
    assert_eq!(entry(&show, "sync.workers")["source"], "default");
    assert_eq!(entry(&show, "sync.timeout-secs")["value"], "30");
    assert!(entry(&show, "tracker.url")["value"].is_null());
}

#[test]
fn test_set_and_show_masks_secrets() {
    let env = TestEnv::new();
    env.json(&["config", "set", "tracker.url", "https://jira.example.com"]);
    env.json(&["config", "set", "tracker.token", "abcdefghijklmnop"]);

    assert!(env.data_path().join("config.kdl").exists());

    let show = env.json(&["config", "show"]);
    assert_eq!(entry(&show, "tracker.url")["value"], "https://jira.example.com");
    assert_eq!(entry(&show, "tracker.url")["source"], "workspace");
    assert_eq!(entry(&show, "tracker.token")["value"], "abcd...mnop");
    assert_eq!(entry(&show, "tracker.token")["secret"], true);

    env.qm()
        .args(["-H", "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("abcdefghijklmnop").not());
}

#[test]
fn test_empty_value_unsets() {
    let env = TestEnv::new();
    env.json(&["config", "set", "tracker.project-key", "QA"]);
    env.json(&["config", "set", "tracker.project-key", ""]);

    let show = env.json(&["config", "show"]);
    assert!(entry(&show, "tracker.project-key")["value"].is_null());
}

#[test]
fn test_unknown_key_and_bad_values() {
    let env = TestEnv::new();
    env.qm()
        .args(["config", "set", "tracker.colour", "blue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown config key"));

    env.qm()
        .args(["config", "set", "sync.workers", "17"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("sync.workers must be 1-16"));

    env.qm()
        .args(["config", "set", "output-format", "yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("output-format must be"));
}

#[test]
fn test_env_overrides_workspace() {
    let env = TestEnv::new();
    env.json(&["config", "set", "sync.workers", "2"]);

    let output = env
        .qm()
        .env("QM_SYNC_WORKERS", "8")
        .args(["config", "show"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let show: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(entry(&show, "sync.workers")["value"], "8");
    assert_eq!(entry(&show, "sync.workers")["source"], "env:QM_SYNC_WORKERS");
}

#[test]
fn test_workspace_overrides_system() {
    let env = TestEnv::new();
    std::fs::write(
        env.config_dir.path().join("config.kdl"),
        "sync {\n    workers 8\n    timeout-secs 90\n}\n",
    )
    .unwrap();
    env.json(&["config", "set", "sync.workers", "2"]);

    let show = env.json(&["config", "show"]);
    assert_eq!(entry(&show, "sync.workers")["value"], "2");
    assert_eq!(entry(&show, "sync.workers")["source"], "workspace");
    assert_eq!(entry(&show, "sync.timeout-secs")["value"], "90");
    assert_eq!(entry(&show, "sync.timeout-secs")["source"], "system");
}

#[test]
fn test_output_format_human_from_config() {
    let env = TestEnv::init();
    env.json(&["config", "set", "output-format", "human"]);

    env.qm()
        .args(["lookup", "list", "priority"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("priority (4 rows)"));
}

#[test]
fn test_malformed_config_is_reported() {
    let env = TestEnv::new();
    std::fs::write(env.data_path().join("config.kdl"), "sync {").unwrap();
    env.qm()
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config parse error"));
}
