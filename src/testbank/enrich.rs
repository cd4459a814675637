//! Best-effort enrichment of test-case links from the test-bank.
//!
//! Enrichment is additive: it only ever fills fields that the test-bank
//! reports as present and non-empty, and it never fails. Every problem is
//! reported as a [`SkipReason`] and logged at debug level.

use super::{TestBankClient, TestBankError};
use crate::models::{TestCaseLink, is_test_bank_id};
use serde::Serialize;
use std::fmt;

/// Why a link was left without enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    NotConfigured,
    Unreachable,
    NoMatch,
    Error(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotConfigured => write!(f, "not configured"),
            SkipReason::Unreachable => write!(f, "unreachable"),
            SkipReason::NoMatch => write!(f, "no match"),
            SkipReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Outcome of one enrichment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrichmentResult {
    /// Fields that were written
    Enriched { fields: Vec<&'static str> },
    Skipped(SkipReason),
}

impl EnrichmentResult {
    pub fn is_enriched(&self) -> bool {
        matches!(self, EnrichmentResult::Enriched { .. })
    }
}

/// Wraps a test-bank client so that it can be used without error handling.
pub struct TestBankEnricher<'a> {
    client: &'a dyn TestBankClient,
}

impl<'a> TestBankEnricher<'a> {
    pub fn new(client: &'a dyn TestBankClient) -> Self {
        Self { client }
    }

    /// Search the test-bank by `title` and copy details of the first match onto `link`.
    ///
    /// Multiple matches are not disambiguated: the first one wins.
    pub fn enrich(&self, link: &mut TestCaseLink, title: &str) -> EnrichmentResult {
        if !self.client.is_configured() {
            return skipped(title, SkipReason::NotConfigured);
        }
        if !self.client.is_authenticated() && !self.client.test_connection() {
            return skipped(title, SkipReason::Unreachable);
        }

        let matches = match self.client.search_by_title(title) {
            Ok(matches) => matches,
            Err(e) => return skipped(title, error_reason(e)),
        };
        let Some(first) = matches.first() else {
            return skipped(title, SkipReason::NoMatch);
        };
        if matches.len() > 1 {
            tracing::debug!(title, candidates = matches.len(), chosen = %first.id, "multiple test-bank matches, taking the first");
        }

        let details = match self.client.fetch_details(&first.id) {
            Ok(details) => details,
            Err(e) => return skipped(title, error_reason(e)),
        };

        let mut fields = Vec::new();
        // An identifier that would not survive the next prune is not worth writing.
        if let Some(id) = non_empty(details.id)
            && is_test_bank_id(&id)
        {
            link.test_bank_id = Some(id);
            fields.push("test_bank_id");
        }
        if let Some(assignee) = non_empty(details.assignee) {
            link.test_bank_assignee = Some(assignee);
            fields.push("test_bank_assignee");
        }
        if let Some(priority) = non_empty(details.priority) {
            link.test_bank_priority = Some(priority);
            fields.push("test_bank_priority");
        }
        if let Some(status) = non_empty(details.automation_status) {
            link.test_bank_automation_status = Some(status);
            fields.push("test_bank_automation_status");
        }

        tracing::debug!(title, ?fields, "enriched from test-bank");
        EnrichmentResult::Enriched { fields }
    }
}

fn skipped(title: &str, reason: SkipReason) -> EnrichmentResult {
    tracing::debug!(title, %reason, "test-bank enrichment skipped");
    EnrichmentResult::Skipped(reason)
}

fn error_reason(error: TestBankError) -> SkipReason {
    SkipReason::Error(error.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
