//! Recovery policy
//!
//! One decision table shared by every writeback path: given how an operation
//! ended, pick the toast to show and which cached collections must be
//! refreshed. Single-cell and batch paths must stay consistent, so neither
//! decides on its own.

use planner_core::{CellId, UserId};
use crate::toast::ToastType;

/// How an operation (or a remote event) ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Single-cell write accepted
    CellUpdated { cell_id: CellId },
    /// Batch accepted with no conflicts
    BatchApplied { updated_count: usize },
    /// Batch accepted but some cells were out of date
    BatchPartialConflict { updated_count: usize, conflict_count: usize },
    /// Single-cell write rejected on version mismatch (409)
    VersionConflict { cell_id: CellId, expected_version: i64, actual_version: Option<i64> },
    /// Single-cell write rejected because the cell is locked (423)
    CellLocked { cell_id: CellId },
    /// Whole batch rejected (409)
    BatchConflict { conflict_count: usize },
    /// Lock or unlock confirmed by the server
    LockChanged { cell_id: CellId, locked: bool, reason: Option<String> },
    /// Lock or unlock rejected
    LockFailed { cell_id: CellId, locking: bool, message: Option<String> },
    /// Any other write failure
    Failure { message: Option<String> },
    /// Another user's change merged into the cache
    RemoteChange { field_name: String, user_id: Option<UserId> },
    /// Realtime channel errored or closed
    ConnectionError { detail: Option<String> },
    /// Realtime channel subscribed again after an error
    Reconnected,
}

/// What to do about an outcome
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub severity: ToastType,
    pub message: String,
    /// Reload the version's cells from the server now
    pub refetch_cells: bool,
    /// Mark the version's cells stale without forcing a reload
    pub invalidate_cells: bool,
    /// Mark the version's change history stale
    pub invalidate_changes: bool,
}

impl Decision {
    fn new(severity: ToastType, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            refetch_cells: false,
            invalidate_cells: false,
            invalidate_changes: false,
        }
    }

    fn refetch(mut self) -> Self {
        self.refetch_cells = true;
        self
    }

    fn invalidate_cells(mut self) -> Self {
        self.invalidate_cells = true;
        self
    }

    fn invalidate_changes(mut self) -> Self {
        self.invalidate_changes = true;
        self
    }
}

/// The decision table
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryPolicy;

impl RecoveryPolicy {
    pub fn decide(&self, outcome: &Outcome) -> Decision {
        match outcome {
            Outcome::CellUpdated { .. } => {
                Decision::new(ToastType::Success, "Cell updated").invalidate_changes()
            }
            Outcome::BatchApplied { updated_count } => Decision::new(
                ToastType::Success,
                format!("{} {} updated", updated_count, plural(*updated_count)),
            )
            .invalidate_changes(),
            Outcome::BatchPartialConflict { updated_count, conflict_count } => Decision::new(
                ToastType::Warning,
                format!(
                    "{} {} updated, {} {}. Reloading latest values.",
                    updated_count,
                    plural(*updated_count),
                    conflict_count,
                    if *conflict_count == 1 { "conflict" } else { "conflicts" },
                ),
            )
            .refetch()
            .invalidate_changes(),
            Outcome::VersionConflict { .. } => Decision::new(
                ToastType::Error,
                "This cell was modified by another user. Reloading latest values.",
            )
            .refetch(),
            Outcome::CellLocked { .. } => {
                Decision::new(ToastType::Error, "This cell is locked and cannot be edited")
            }
            Outcome::BatchConflict { conflict_count } => Decision::new(
                ToastType::Error,
                format!(
                    "Batch update failed: {} {} had conflicts",
                    conflict_count,
                    plural(*conflict_count)
                ),
            )
            .refetch(),
            Outcome::LockChanged { locked, reason, .. } => {
                let verb = if *locked { "Cell locked" } else { "Cell unlocked" };
                let message = match reason {
                    Some(reason) if !reason.is_empty() => format!("{}: {}", verb, reason),
                    _ => verb.to_string(),
                };
                Decision::new(ToastType::Success, message).invalidate_cells()
            }
            Outcome::LockFailed { locking, message, .. } => {
                let verb = if *locking { "lock" } else { "unlock" };
                Decision::new(ToastType::Error, with_detail(&format!("Failed to {} cell", verb), message))
            }
            Outcome::Failure { message } => {
                Decision::new(ToastType::Error, with_detail("Update failed", message))
            }
            Outcome::RemoteChange { field_name, .. } => {
                Decision::new(ToastType::Info, format!("{} updated by another user", field_name))
            }
            Outcome::ConnectionError { .. } => Decision::new(
                ToastType::Error,
                "Realtime sync interrupted. Reconnecting...",
            ),
            Outcome::Reconnected => {
                Decision::new(ToastType::Info, "Realtime sync restored").refetch()
            }
        }
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "cell" } else { "cells" }
}

fn with_detail(prefix: &str, message: &Option<String>) -> String {
    match message {
        Some(m) if !m.is_empty() => format!("{}: {}", prefix, m),
        _ => prefix.to_string(),
    }
}
