//! Precedence resolution for configuration.
//!
//! Highest to lowest:
//! 1. `QM_*` environment variables
//! 2. Workspace config.kdl (`<data-dir>/config.kdl`)
//! 3. System config.kdl (`~/.config/quartermaster/config.kdl`)
//! 4. Built-in defaults

use super::schema::{
    DEFAULT_TIMEOUT_SECS, DEFAULT_WORKERS, OutputFormat, QmConfig, check_timeout, check_workers,
};
use crate::testbank::TestBankCredentials;
use crate::tracker::TrackerCredentials;
use crate::{Error, Result};
use serde::Serialize;
use std::time::Duration;

pub const TRACKER_URL_ENV: &str = "QM_TRACKER_URL";
pub const TRACKER_USERNAME_ENV: &str = "QM_TRACKER_USERNAME";
pub const TRACKER_TOKEN_ENV: &str = "QM_TRACKER_TOKEN";
pub const TRACKER_PROJECT_KEY_ENV: &str = "QM_TRACKER_PROJECT_KEY";
pub const TRACKER_BOARD_ID_ENV: &str = "QM_TRACKER_BOARD_ID";
pub const TESTBANK_URL_ENV: &str = "QM_TESTBANK_URL";
pub const TESTBANK_USERNAME_ENV: &str = "QM_TESTBANK_USERNAME";
pub const TESTBANK_PASSWORD_ENV: &str = "QM_TESTBANK_PASSWORD";
pub const TESTBANK_TOKEN_ENV: &str = "QM_TESTBANK_TOKEN";
pub const TESTBANK_PROJECT_ID_ENV: &str = "QM_TESTBANK_PROJECT_ID";
pub const SYNC_WORKERS_ENV: &str = "QM_SYNC_WORKERS";
pub const SYNC_TIMEOUT_ENV: &str = "QM_SYNC_TIMEOUT_SECS";

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    EnvVar(String),
    Workspace,
    System,
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::Workspace => write!(f, "workspace"),
            ValueSource::System => write!(f, "system"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

impl Serialize for ValueSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone, Serialize)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// Fully resolved configuration with source tracking.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub tracker_url: Option<Resolved<String>>,
    pub tracker_username: Option<Resolved<String>>,
    pub tracker_token: Option<Resolved<String>>,
    pub tracker_project_key: Option<Resolved<String>>,
    pub tracker_board_id: Option<Resolved<String>>,
    pub test_bank_url: Option<Resolved<String>>,
    pub test_bank_username: Option<Resolved<String>>,
    pub test_bank_password: Option<Resolved<String>>,
    pub test_bank_token: Option<Resolved<String>>,
    pub test_bank_project_id: Option<Resolved<String>>,
    pub workers: Resolved<usize>,
    pub timeout_secs: Resolved<u64>,
    pub output_format: Resolved<OutputFormat>,
}

/// One row of `qm config show`.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigEntry {
    pub key: &'static str,
    pub value: Option<String>,
    pub source: Option<ValueSource>,
    pub secret: bool,
}

impl ResolvedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.value)
    }

    pub fn workers(&self) -> usize {
        self.workers.value
    }

    pub fn tracker_project_key(&self) -> Option<&str> {
        value_of(&self.tracker_project_key)
    }

    pub fn tracker_board_id(&self) -> Option<&str> {
        value_of(&self.tracker_board_id)
    }

    /// Tracker credentials, present only when url, username and token are all set.
    pub fn tracker_credentials(&self) -> Option<TrackerCredentials> {
        Some(TrackerCredentials {
            base_url: value_of(&self.tracker_url)?.to_string(),
            username: value_of(&self.tracker_username)?.to_string(),
            token: value_of(&self.tracker_token)?.to_string(),
            timeout: self.timeout(),
        })
    }

    /// Test-bank credentials; check [`TestBankCredentials::is_complete`] before use.
    pub fn test_bank_credentials(&self) -> TestBankCredentials {
        TestBankCredentials {
            base_url: value_of(&self.test_bank_url).unwrap_or_default().to_string(),
            username: value_of(&self.test_bank_username).unwrap_or_default().to_string(),
            password: value_of(&self.test_bank_password).map(str::to_string),
            token: value_of(&self.test_bank_token).map(str::to_string),
            project_id: value_of(&self.test_bank_project_id).map(str::to_string),
            timeout: self.timeout(),
        }
    }

    /// All values in display order, secrets masked.
    pub fn entries(&self) -> Vec<ConfigEntry> {
        let text = |key, resolved: &Option<Resolved<String>>, secret: bool| ConfigEntry {
            key,
            value: resolved.as_ref().map(|r| {
                if secret {
                    mask_secret(&r.value)
                } else {
                    r.value.clone()
                }
            }),
            source: resolved.as_ref().map(|r| r.source.clone()),
            secret,
        };
        vec![
            text("tracker.url", &self.tracker_url, false),
            text("tracker.username", &self.tracker_username, false),
            text("tracker.token", &self.tracker_token, true),
            text("tracker.project-key", &self.tracker_project_key, false),
            text("tracker.board-id", &self.tracker_board_id, false),
            text("test-bank.url", &self.test_bank_url, false),
            text("test-bank.username", &self.test_bank_username, false),
            text("test-bank.password", &self.test_bank_password, true),
            text("test-bank.token", &self.test_bank_token, true),
            text("test-bank.project-id", &self.test_bank_project_id, false),
            ConfigEntry {
                key: "sync.workers",
                value: Some(self.workers.value.to_string()),
                source: Some(self.workers.source.clone()),
                secret: false,
            },
            ConfigEntry {
                key: "sync.timeout-secs",
                value: Some(self.timeout_secs.value.to_string()),
                source: Some(self.timeout_secs.source.clone()),
                secret: false,
            },
            ConfigEntry {
                key: "output-format",
                value: Some(self.output_format.value.to_string()),
                source: Some(self.output_format.source.clone()),
                secret: false,
            },
        ]
    }
}

fn value_of(resolved: &Option<Resolved<String>>) -> Option<&str> {
    resolved
        .as_ref()
        .map(|r| r.value.trim())
        .filter(|v| !v.is_empty())
}

/// Mask a secret for display, keeping the first and last four characters.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        let head: String = chars.iter().take(4.min(chars.len() / 2)).collect();
        format!("{}...", head)
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

/// Resolve with the process environment.
pub fn resolve_config(workspace: &QmConfig, system: &QmConfig) -> Result<ResolvedConfig> {
    resolve_config_with(workspace, system, |name| std::env::var(name).ok())
}

/// Resolve with an injected environment lookup.
pub fn resolve_config_with(
    workspace: &QmConfig,
    system: &QmConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let text = |var: &str, pick: fn(&QmConfig) -> &Option<String>| -> Option<Resolved<String>> {
        if let Some(value) = env(var).filter(|v| !v.trim().is_empty()) {
            return Some(Resolved::new(value, ValueSource::EnvVar(var.to_string())));
        }
        if let Some(value) = pick(workspace) {
            return Some(Resolved::new(value.clone(), ValueSource::Workspace));
        }
        pick(system)
            .as_ref()
            .map(|value| Resolved::new(value.clone(), ValueSource::System))
    };

    let number = |var: &str,
                  pick: fn(&QmConfig) -> Option<i64>,
                  default: i64|
     -> Result<Resolved<i64>> {
        if let Some(raw) = env(var).filter(|v| !v.trim().is_empty()) {
            let value = raw.trim().parse::<i64>().map_err(|_| {
                Error::Config(format!("{} must be an integer, got '{}'", var, raw))
            })?;
            return Ok(Resolved::new(value, ValueSource::EnvVar(var.to_string())));
        }
        Ok(match (pick(workspace), pick(system)) {
            (Some(value), _) => Resolved::new(value, ValueSource::Workspace),
            (None, Some(value)) => Resolved::new(value, ValueSource::System),
            (None, None) => Resolved::new(default, ValueSource::Default),
        })
    };

    let workers = number(SYNC_WORKERS_ENV, |c| c.sync.workers, DEFAULT_WORKERS)?;
    check_workers(Some(workers.value)).map_err(Error::Config)?;
    let timeout = number(SYNC_TIMEOUT_ENV, |c| c.sync.timeout_secs, DEFAULT_TIMEOUT_SECS)?;
    check_timeout(Some(timeout.value)).map_err(Error::Config)?;

    let output_format = match (workspace.output_format, system.output_format) {
        (Some(format), _) => Resolved::new(format, ValueSource::Workspace),
        (None, Some(format)) => Resolved::new(format, ValueSource::System),
        (None, None) => Resolved::new(OutputFormat::default(), ValueSource::Default),
    };

    Ok(ResolvedConfig {
        tracker_url: text(TRACKER_URL_ENV, |c| &c.tracker.url),
        tracker_username: text(TRACKER_USERNAME_ENV, |c| &c.tracker.username),
        tracker_token: text(TRACKER_TOKEN_ENV, |c| &c.tracker.token),
        tracker_project_key: text(TRACKER_PROJECT_KEY_ENV, |c| &c.tracker.project_key),
        tracker_board_id: text(TRACKER_BOARD_ID_ENV, |c| &c.tracker.board_id),
        test_bank_url: text(TESTBANK_URL_ENV, |c| &c.test_bank.url),
        test_bank_username: text(TESTBANK_USERNAME_ENV, |c| &c.test_bank.username),
        test_bank_password: text(TESTBANK_PASSWORD_ENV, |c| &c.test_bank.password),
        test_bank_token: text(TESTBANK_TOKEN_ENV, |c| &c.test_bank.token),
        test_bank_project_id: text(TESTBANK_PROJECT_ID_ENV, |c| &c.test_bank.project_id),
        // Range checks above keep both values positive
        workers: Resolved::new(workers.value as usize, workers.source),
        timeout_secs: Resolved::new(timeout.value as u64, timeout.source),
        output_format,
    })
}
