//! Sprint reconciliation engine.
//!
//! - [`IssueReconciler`] merges one tracker issue and its links into storage
//! - [`promote`] turns a ready or not-automatable link into a backlog entry
//! - [`SprintSyncCoordinator`] runs a whole sprint through the reconciler
//! - [`ops`] holds the operator-facing mutations (flags, mapping, keyword search)
//!   and sprint statistics

mod coordinator;
mod issue;
pub mod ops;
mod promote;

pub use coordinator::{
    CancelFlag, IssueFailure, SprintSyncCoordinator, SyncReport, SyncRequest, SyncedIssue,
};
pub use issue::{IssueReconciler, ReconcileOutcome};
pub use promote::{NotPromotedReason, Promotion, promote};

use crate::storage::Storage;
use crate::{Error, Result};
use std::sync::{Mutex, MutexGuard};

/// Lock shared storage, reporting a poisoned lock as an error.
pub(crate) fn lock_storage(storage: &Mutex<Storage>) -> Result<MutexGuard<'_, Storage>> {
    storage
        .lock()
        .map_err(|_| Error::Other("storage lock poisoned by a failed worker".to_string()))
}
