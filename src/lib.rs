//! Quartermaster - sprint test-case reconciliation for QA teams.
//!
//! This library provides the core functionality for the `qm` CLI tool:
//! pulling a sprint's issues from the tracker, merging their linked test
//! cases into local storage, enriching them from the test-bank, and
//! promoting automation-ready cases into the automation backlog.

pub mod cli;
pub mod commands;
pub mod config;
pub mod lookup;
pub mod models;
pub mod reconcile;
pub mod storage;
pub mod testbank;
pub mod tracker;

use models::LookupCategory;


/// Library-level error type for Quartermaster operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Config parse error: {0}")]
    Kdl(#[from] kdl::KdlError),

    #[error("Not initialized: run `qm init` first")]
    NotInitialized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Reference data missing: no {category} row with code '{code}' (run `qm init` to seed lookups)")]
    LookupMissing {
        category: LookupCategory,
        code: String,
    },

    #[error("Tracker error: {0}")]
    Tracker(#[from] tracker::TrackerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Quartermaster operations.
pub type Result<T> = std::result::Result<T, Error>;
