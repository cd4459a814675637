//! Common test utilities for quartermaster integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't touch the
//! user's `~/.local/share/quartermaster/` or `~/.config/quartermaster/`.

#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

/// Variables that would leak a developer's real configuration into a test.
const SCRUBBED_ENV: &[&str] = &[
    "QM_TRACKER_URL",
    "QM_TRACKER_USERNAME",
    "QM_TRACKER_TOKEN",
    "QM_TRACKER_PROJECT_KEY",
    "QM_TRACKER_BOARD_ID",
    "QM_TESTBANK_URL",
    "QM_TESTBANK_USERNAME",
    "QM_TESTBANK_PASSWORD",
    "QM_TESTBANK_TOKEN",
    "QM_TESTBANK_PROJECT_ID",
    "QM_SYNC_WORKERS",
    "QM_SYNC_TIMEOUT_SECS",
    "QM_LOG",
    "RUST_LOG",
];

/// A test environment with isolated data and config directories.
///
/// The `qm()` method returns a `Command` that sets `QM_DATA_DIR` and
/// `QM_CONFIG_DIR` per invocation, so tests can run in parallel.
pub struct TestEnv {
    pub data_dir: TempDir,
    pub config_dir: TempDir,
    pub work_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            data_dir: TempDir::new().unwrap(),
            config_dir: TempDir::new().unwrap(),
            work_dir: TempDir::new().unwrap(),
        }
    }

    /// Create a new test environment and run `qm init`.
    pub fn init() -> Self {
        let env = Self::new();
        env.qm().arg("init").assert().success();
        env
    }

    /// Get a Command for the qm binary with isolated directories.
    pub fn qm(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_qm"));
        cmd.current_dir(self.work_dir.path());
        for name in SCRUBBED_ENV {
            cmd.env_remove(name);
        }
        cmd.env("QM_DATA_DIR", self.data_dir.path());
        cmd.env("QM_CONFIG_DIR", self.config_dir.path());
        cmd
    }

    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }

    /// Write a sprint export for `qm sync --from-file`.
    pub fn write_issues(&self, name: &str, json: &str) -> PathBuf {
        let path = self.work_dir.path().join(name);
        std::fs::write(&path, json).unwrap();
        path
    }

    /// Run a command and parse its stdout as JSON.
    pub fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.qm().args(args).output().unwrap();
        assert!(
            output.status.success(),
            "qm {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A two-issue sprint export with one legacy link.
pub const SPRINT_42: &str = r#"[
  {
    "key": "QA-1",
    "summary": "Login page",
    "assignee": "dev.one",
    "assignee_display_name": "Dev One",
    "sprint_id": "42",
    "sprint_name": "Sprint 42",
    "status": "In Progress",
    "linked_test_cases": [
      { "title": "Login with valid password", "test_bank_id": "TC-101" },
      { "title": "Login lockout", "test_bank_id": "TC-102" },
      { "title": "Old manual notes" }
    ]
  },
  {
    "key": "QA-2",
    "summary": "Cart",
    "sprint_id": "42",
    "linked_test_cases": [
      { "title": "Cart totals", "test_bank_id": "tc-201" }
    ]
  }
]"#;
