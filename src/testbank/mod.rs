//! Test-bank collaborators.
//!
//! The test-bank is optional: when it is not configured or not reachable,
//! links simply go without enrichment.

mod enrich;
mod qtest;

pub use enrich::{EnrichmentResult, SkipReason, TestBankEnricher};
pub use qtest::{QTestClient, TestBankCredentials};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by test-bank clients. They never escape the enricher.
#[derive(Debug, Error)]
pub enum TestBankError {
    #[error("Test-bank is not configured")]
    NotConfigured,

    #[error("Test-bank rejected the credentials: 401 Unauthorized")]
    Unauthorized,

    #[error("Test-bank denied access: 403 Forbidden")]
    Forbidden,

    #[error("Test-bank request failed: {0}")]
    Http(String),

    #[error("Failed to parse test-bank response: {0}")]
    Parse(String),

    #[error("Test-bank unreachable: {0}")]
    Transport(String),
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBankMatch {
    /// Handle passed to `fetch_details`
    pub id: String,
    pub name: String,
}

/// Test-case details; any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBankDetails {
    /// Display identifier (`TC-<digits>`)
    pub id: Option<String>,
    pub assignee: Option<String>,
    pub priority: Option<String>,
    pub automation_status: Option<String>,
}

/// External test-case repository.
pub trait TestBankClient: Send + Sync {
    /// Base URL and credentials are present.
    fn is_configured(&self) -> bool;

    /// A session token is cached.
    fn is_authenticated(&self) -> bool;

    /// Lightweight probe, authenticating first if needed.
    fn test_connection(&self) -> bool;

    fn search_by_title(&self, title: &str) -> Result<Vec<TestBankMatch>, TestBankError>;

    fn fetch_details(&self, id: &str) -> Result<TestBankDetails, TestBankError>;
}

/// Client used when no test-bank is configured at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTestBank;

impl TestBankClient for NoTestBank {
    fn is_configured(&self) -> bool {
        false
    }

    fn is_authenticated(&self) -> bool {
        false
    }

    fn test_connection(&self) -> bool {
        false
    }

    fn search_by_title(&self, _title: &str) -> Result<Vec<TestBankMatch>, TestBankError> {
        Err(TestBankError::NotConfigured)
    }

    fn fetch_details(&self, _id: &str) -> Result<TestBankDetails, TestBankError> {
        Err(TestBankError::NotConfigured)
    }
}
