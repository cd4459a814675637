//! Reference-data resolution.
//!
//! Lookup rows (priorities, workflow statuses, automation statuses, ...) are
//! read-only from the engine's point of view. Resolution never creates rows:
//! a missing code is reported as absent and the caller decides whether that
//! is fatal.

use crate::models::{ACTIVE_STATUS, AutomationState, LookupCategory, LookupRow};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Canonical reference rows written by `qm init`.
///
/// Tuples are `(code, short text)`; sort order follows position.
pub const SEED: &[(LookupCategory, &[(&str, &str)])] = &[
    (
        LookupCategory::Priority,
        &[
            ("Critical", "Critical priority"),
            ("High", "High priority"),
            ("Medium", "Medium priority"),
            ("Low", "Low priority"),
        ],
    ),
    (
        LookupCategory::WorkflowStatus,
        &[
            ("Active", "Active"),
            ("Inactive", "Inactive"),
            ("Ready to Automate", "Ready to automate"),
            ("Cannot be Automated", "Cannot be automated"),
            ("In Progress", "Automation in progress"),
            ("Automated", "Automated"),
        ],
    ),
    (
        LookupCategory::AutomationStatus,
        &[
            ("PENDING", "Pending review"),
            ("READY_TO_AUTOMATE", "Ready to automate"),
            ("NOT_AUTOMATABLE", "Not automatable"),
        ],
    ),
    (
        LookupCategory::TestCaseType,
        &[
            ("Functional", "Functional"),
            ("Regression", "Regression"),
            ("Smoke", "Smoke"),
            ("Integration", "Integration"),
            ("End to End", "End to end"),
        ],
    ),
    (
        LookupCategory::ToolType,
        &[
            ("Selenium", "Selenium"),
            ("Cypress", "Cypress"),
            ("Playwright", "Playwright"),
            ("Postman", "Postman"),
            ("Appium", "Appium"),
        ],
    ),
    (
        LookupCategory::BuildStatus,
        &[
            ("SUCCESS", "Build succeeded"),
            ("FAILURE", "Build failed"),
            ("UNSTABLE", "Build unstable"),
            ("ABORTED", "Build aborted"),
        ],
    ),
    (
        LookupCategory::Role,
        &[
            ("Tester", "QA tester"),
            ("Lead", "QA lead"),
            ("Manager", "QA manager"),
        ],
    ),
];

/// Workflow status given to backlog entries promoted from ready links.
pub const READY_TO_AUTOMATE: &str = "Ready to Automate";

/// Workflow status given to backlog entries promoted from not-automatable links.
pub const CANNOT_BE_AUTOMATED: &str = "Cannot be Automated";

/// Resolves categorical codes to lookup rows.
pub trait LookupResolver {
    /// Find a row by exact code, trimmed and case-insensitive.
    fn find_code(&self, category: LookupCategory, code: &str) -> Result<Option<LookupRow>>;

    /// Resolve a possibly blank code, substituting the category default.
    ///
    /// Returns `Ok(None)` when nothing matches; inactive rows still resolve.
    fn resolve(&self, category: LookupCategory, code: Option<&str>) -> Result<Option<LookupRow>> {
        let code = code.map(str::trim).filter(|c| !c.is_empty());
        match code.or_else(|| category.default_code()) {
            Some(code) => self.find_code(category, code),
            None => Ok(None),
        }
    }
}

/// Resolve a code that must exist, reporting unseeded reference data.
pub fn require_lookup(
    lookups: &dyn LookupResolver,
    category: LookupCategory,
    code: &str,
) -> Result<LookupRow> {
    lookups
        .resolve(category, Some(code))?
        .ok_or_else(|| Error::LookupMissing {
            category,
            code: code.to_string(),
        })
}

/// Resolve a code supplied by an operator; unknown codes are `NotFound`.
pub fn resolve_user_code(
    lookups: &dyn LookupResolver,
    category: LookupCategory,
    code: &str,
) -> Result<LookupRow> {
    lookups
        .resolve(category, Some(code))?
        .ok_or_else(|| Error::NotFound(format!("No {} with code '{}'", category, code.trim())))
}

/// Derive the automation state from the flags and fetch its reference row.
///
/// An absent row surfaces as `Error::LookupMissing` so that a deployment
/// without seeded reference data never leaves a link's state silently unset.
pub fn resolve_automation_status(
    lookups: &dyn LookupResolver,
    can_be_automated: bool,
    cannot_be_automated: bool,
) -> Result<(AutomationState, LookupRow)> {
    let state = AutomationState::from_flags(can_be_automated, cannot_be_automated);
    let row = require_lookup(lookups, LookupCategory::AutomationStatus, state.code())?;
    Ok((state, row))
}

/// In-memory reference table, used where no database is at hand.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLookups {
    rows: BTreeMap<LookupCategory, Vec<LookupRow>>,
    next_id: i64,
}

impl InMemoryLookups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate with the canonical rows written by `qm init`.
    pub fn seeded() -> Self {
        let mut lookups = Self::new();
        for (category, rows) in SEED {
            for (code, text) in *rows {
                lookups.insert(*category, code, Some(text));
            }
        }
        lookups
    }

    pub fn insert(&mut self, category: LookupCategory, code: &str, short_text: Option<&str>) -> LookupRow {
        self.next_id += 1;
        let rows = self.rows.entry(category).or_default();
        let row = LookupRow {
            id: self.next_id,
            category,
            code: code.to_string(),
            short_text: short_text.map(str::to_string),
            long_text: None,
            code_status: ACTIVE_STATUS.to_string(),
            sort_by: rows.len() as i64 + 1,
        };
        rows.push(row.clone());
        row
    }

    /// Drop a row, simulating a deployment missing part of its reference data.
    pub fn remove(&mut self, category: LookupCategory, code: &str) {
        if let Some(rows) = self.rows.get_mut(&category) {
            rows.retain(|row| !row.code.eq_ignore_ascii_case(code));
        }
    }
}

impl LookupResolver for InMemoryLookups {
    fn find_code(&self, category: LookupCategory, code: &str) -> Result<Option<LookupRow>> {
        let code = code.trim();
        Ok(self
            .rows
            .get(&category)
            .and_then(|rows| rows.iter().find(|row| row.code.eq_ignore_ascii_case(code)))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_trimmed_and_case_insensitive() {
        let lookups = InMemoryLookups::seeded();
        let row = lookups
            .resolve(LookupCategory::Priority, Some("  hIgH "))
            .unwrap()
            .unwrap();
        assert_eq!(row.code, "High");
    }

    #[test]
    fn test_blank_code_uses_category_default() {
        let lookups = InMemoryLookups::seeded();
        for (category, expected) in [
            (LookupCategory::Priority, "Medium"),
            (LookupCategory::WorkflowStatus, "Active"),
            (LookupCategory::Role, "Tester"),
            (LookupCategory::AutomationStatus, "PENDING"),
        ] {
            let row = lookups.resolve(category, Some("   ")).unwrap().unwrap();
            assert_eq!(row.code, expected);
            let row = lookups.resolve(category, None).unwrap().unwrap();
            assert_eq!(row.code, expected);
        }
    }

    #[test]
    fn test_blank_code_without_default_is_absent() {
        let lookups = InMemoryLookups::seeded();
        assert!(lookups.resolve(LookupCategory::ToolType, None).unwrap().is_none());
        assert!(lookups.resolve(LookupCategory::TestCaseType, Some("")).unwrap().is_none());
        assert!(lookups.resolve(LookupCategory::BuildStatus, Some(" ")).unwrap().is_none());
    }

    #[test]
    fn test_unknown_code_is_absent_not_created() {
        let lookups = InMemoryLookups::seeded();
        assert!(lookups.resolve(LookupCategory::ToolType, Some("Watir")).unwrap().is_none());
        assert!(lookups.find_code(LookupCategory::ToolType, "Watir").unwrap().is_none());
    }

    #[test]
    fn test_resolve_automation_status_table() {
        let lookups = InMemoryLookups::seeded();
        let cases = [
            (false, false, "PENDING"),
            (true, false, "READY_TO_AUTOMATE"),
            (false, true, "NOT_AUTOMATABLE"),
            (true, true, "PENDING"),
        ];
        for (can, cannot, code) in cases {
            let (state, row) = resolve_automation_status(&lookups, can, cannot).unwrap();
            assert_eq!(state.code(), code);
            assert_eq!(row.code, code);
        }
    }

    #[test]
    fn test_resolve_automation_status_missing_row() {
        let mut lookups = InMemoryLookups::seeded();
        lookups.remove(LookupCategory::AutomationStatus, "READY_TO_AUTOMATE");

        let err = resolve_automation_status(&lookups, true, false).unwrap_err();
        match err {
            Error::LookupMissing { category, code } => {
                assert_eq!(category, LookupCategory::AutomationStatus);
                assert_eq!(code, "READY_TO_AUTOMATE");
            }
            other => panic!("expected LookupMissing, got {other:?}"),
        }

        // Other states still resolve
        assert!(resolve_automation_status(&lookups, false, true).is_ok());
    }

    #[test]
    fn test_resolve_user_code_not_found() {
        let lookups = InMemoryLookups::seeded();
        let err = resolve_user_code(&lookups, LookupCategory::ToolType, "Watir").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(
            resolve_user_code(&lookups, LookupCategory::ToolType, "cypress").unwrap().code,
            "Cypress"
        );
    }
}
