//! KDL schema for `config.kdl`.
//!
//! ```kdl
//! tracker {
//!     url "https://tracker.example.com"
//!     username "qa-bot"
//!     token "secret"
//!     project-key "QA"
//!     board-id "42"
//! }
//! test-bank {
//!     url "https://testbank.example.com"
//!     username "qa-bot"
//!     password "secret"
//!     project-id "1001"
//! }
//! sync {
//!     workers 4
//!     timeout-secs 30
//! }
//! output-format "human"
//! ```

use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};

/// Default number of sync workers.
pub const DEFAULT_WORKERS: i64 = 4;

/// Default HTTP timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: i64 = 30;

/// Allowed range for `sync.workers`.
pub const WORKERS_RANGE: std::ops::RangeInclusive<i64> = 1..=16;

/// Allowed range for `sync.timeout-secs`.
pub const TIMEOUT_RANGE: std::ops::RangeInclusive<i64> = 1..=600;

/// Required permissions for config.kdl (Unix: 0600, it holds credentials).
#[cfg(unix)]
pub const CONFIG_FILE_MODE: u32 = 0o600;

/// Keys accepted by `qm config set`.
pub const KEYS: &[&str] = &[
    "tracker.url",
    "tracker.username",
    "tracker.token",
    "tracker.project-key",
    "tracker.board-id",
    "test-bank.url",
    "test-bank.username",
    "test-bank.password",
    "test-bank.token",
    "test-bank.project-id",
    "sync.workers",
    "sync.timeout-secs",
    "output-format",
];

/// Output format preference for CLI commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Human,
}

impl OutputFormat {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "human" => Some(OutputFormat::Human),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Human => "human",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `tracker { ... }` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSettings {
    pub url: Option<String>,
    pub username: Option<String>,
    /// API token (secret)
    pub token: Option<String>,
    pub project_key: Option<String>,
    pub board_id: Option<String>,
}

/// `test-bank { ... }` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBankSettings {
    pub url: Option<String>,
    pub username: Option<String>,
    /// Password for the token grant (secret)
    pub password: Option<String>,
    /// Pre-issued bearer token (secret)
    pub token: Option<String>,
    pub project_id: Option<String>,
}

/// `sync { ... }` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub workers: Option<i64>,
    pub timeout_secs: Option<i64>,
}

/// Contents of one config.kdl file. Unset values fall through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmConfig {
    pub tracker: TrackerSettings,
    pub test_bank: TestBankSettings,
    pub sync: SyncSettings,
    pub output_format: Option<OutputFormat>,
}

impl QmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the config values.
    pub fn validate(&self) -> Result<(), String> {
        check_workers(self.sync.workers)?;
        check_timeout(self.sync.timeout_secs)?;
        Ok(())
    }

    /// Parse config from a KDL document. Unknown nodes are ignored.
    pub fn from_kdl(doc: &KdlDocument) -> Self {
        let mut config = Self::new();

        if let Some(block) = doc.get("tracker").and_then(KdlNode::children) {
            config.tracker = TrackerSettings {
                url: string_arg(block, "url"),
                username: string_arg(block, "username"),
                token: string_arg(block, "token"),
                project_key: string_arg(block, "project-key"),
                board_id: string_arg(block, "board-id"),
            };
        }

        if let Some(block) = doc.get("test-bank").and_then(KdlNode::children) {
            config.test_bank = TestBankSettings {
                url: string_arg(block, "url"),
                username: string_arg(block, "username"),
                password: string_arg(block, "password"),
                token: string_arg(block, "token"),
                project_id: string_arg(block, "project-id"),
            };
        }

        if let Some(block) = doc.get("sync").and_then(KdlNode::children) {
            config.sync = SyncSettings {
                workers: integer_arg(block, "workers"),
                timeout_secs: integer_arg(block, "timeout-secs"),
            };
        }

        config.output_format = string_arg(doc, "output-format").and_then(|s| OutputFormat::parse(&s));
        config
    }

    /// Convert config to a KDL document, omitting empty blocks.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        let tracker = block(&[
            ("url", self.tracker.url.as_deref()),
            ("username", self.tracker.username.as_deref()),
            ("token", self.tracker.token.as_deref()),
            ("project-key", self.tracker.project_key.as_deref()),
            ("board-id", self.tracker.board_id.as_deref()),
        ]);
        push_block(&mut doc, "tracker", tracker);

        let test_bank = block(&[
            ("url", self.test_bank.url.as_deref()),
            ("username", self.test_bank.username.as_deref()),
            ("password", self.test_bank.password.as_deref()),
            ("token", self.test_bank.token.as_deref()),
            ("project-id", self.test_bank.project_id.as_deref()),
        ]);
        push_block(&mut doc, "test-bank", test_bank);

        let mut sync = KdlDocument::new();
        for (name, value) in [
            ("workers", self.sync.workers),
            ("timeout-secs", self.sync.timeout_secs),
        ] {
            if let Some(value) = value {
                let mut node = KdlNode::new(name);
                node.push(KdlEntry::new(KdlValue::Integer(value as i128)));
                sync.nodes_mut().push(node);
            }
        }
        push_block(&mut doc, "sync", sync);

        if let Some(format) = self.output_format {
            let mut node = KdlNode::new("output-format");
            node.push(KdlEntry::new(KdlValue::String(format.as_str().to_string())));
            doc.nodes_mut().push(node);
        }

        doc.autoformat();
        doc
    }

    /// Merge another config into this one.
    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &QmConfig) {
        fn take<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
            if source.is_some() {
                *target = source.clone();
            }
        }
        take(&mut self.tracker.url, &other.tracker.url);
        take(&mut self.tracker.username, &other.tracker.username);
        take(&mut self.tracker.token, &other.tracker.token);
        take(&mut self.tracker.project_key, &other.tracker.project_key);
        take(&mut self.tracker.board_id, &other.tracker.board_id);
        take(&mut self.test_bank.url, &other.test_bank.url);
        take(&mut self.test_bank.username, &other.test_bank.username);
        take(&mut self.test_bank.password, &other.test_bank.password);
        take(&mut self.test_bank.token, &other.test_bank.token);
        take(&mut self.test_bank.project_id, &other.test_bank.project_id);
        take(&mut self.sync.workers, &other.sync.workers);
        take(&mut self.sync.timeout_secs, &other.sync.timeout_secs);
        take(&mut self.output_format, &other.output_format);
    }

    /// Set one dotted key (see [`KEYS`]). An empty value unsets it.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let trimmed = value.trim();
        let text = (!trimmed.is_empty()).then(|| trimmed.to_string());
        let slot = match key {
            "tracker.url" => &mut self.tracker.url,
            "tracker.username" => &mut self.tracker.username,
            "tracker.token" => &mut self.tracker.token,
            "tracker.project-key" => &mut self.tracker.project_key,
            "tracker.board-id" => &mut self.tracker.board_id,
            "test-bank.url" => &mut self.test_bank.url,
            "test-bank.username" => &mut self.test_bank.username,
            "test-bank.password" => &mut self.test_bank.password,
            "test-bank.token" => &mut self.test_bank.token,
            "test-bank.project-id" => &mut self.test_bank.project_id,
            "sync.workers" => {
                self.sync.workers = parse_integer(key, text.as_deref())?;
                return check_workers(self.sync.workers);
            }
            "sync.timeout-secs" => {
                self.sync.timeout_secs = parse_integer(key, text.as_deref())?;
                return check_timeout(self.sync.timeout_secs);
            }
            "output-format" => {
                self.output_format = match text.as_deref() {
                    None => None,
                    Some(s) => Some(OutputFormat::parse(s).ok_or_else(|| {
                        format!("output-format must be 'json' or 'human', got '{}'", s)
                    })?),
                };
                return Ok(());
            }
            _ => {
                return Err(format!(
                    "Unknown config key '{}'. Valid keys: {}",
                    key,
                    KEYS.join(", ")
                ));
            }
        };
        *slot = text;
        Ok(())
    }
}

pub(crate) fn check_workers(workers: Option<i64>) -> Result<(), String> {
    match workers {
        Some(w) if !WORKERS_RANGE.contains(&w) => Err(format!("sync.workers must be 1-16, got {}", w)),
        _ => Ok(()),
    }
}

pub(crate) fn check_timeout(timeout: Option<i64>) -> Result<(), String> {
    match timeout {
        Some(t) if !TIMEOUT_RANGE.contains(&t) => {
            Err(format!("sync.timeout-secs must be 1-600, got {}", t))
        }
        _ => Ok(()),
    }
}

fn parse_integer(key: &str, value: Option<&str>) -> Result<Option<i64>, String> {
    value
        .map(|v| {
            v.parse::<i64>()
                .map_err(|_| format!("{} must be an integer, got '{}'", key, v))
        })
        .transpose()
}

fn first_value<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlValue> {
    doc.get(name)
        .and_then(|node| node.entries().first())
        .map(KdlEntry::value)
}

/// String argument of a node. Integers are accepted for id-like values.
fn string_arg(doc: &KdlDocument, name: &str) -> Option<String> {
    match first_value(doc, name)? {
        KdlValue::String(s) => Some(s.clone()),
        KdlValue::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

fn integer_arg(doc: &KdlDocument, name: &str) -> Option<i64> {
    first_value(doc, name)?
        .as_integer()
        .and_then(|i| i64::try_from(i).ok())
}

fn block(values: &[(&str, Option<&str>)]) -> KdlDocument {
    let mut doc = KdlDocument::new();
    for (name, value) in values {
        if let Some(value) = value {
            let mut node = KdlNode::new(*name);
            node.push(KdlEntry::new(KdlValue::String(value.to_string())));
            doc.nodes_mut().push(node);
        }
    }
    doc
}

fn push_block(doc: &mut KdlDocument, name: &str, children: KdlDocument) {
    if children.nodes().is_empty() {
        return;
    }
    let mut node = KdlNode::new(name);
    node.set_children(children);
    doc.nodes_mut().push(node);
}
