//! Optimistic mutation engine
//!
//! Every write follows the same shape:
//!
//! 1. cancel in-flight refetches of the version's cells
//! 2. apply the predicted result (new value, version + 1, modified now),
//!    keeping a snapshot of the rows it touched
//! 3. send the request
//! 4. commit the server's answer, or restore the snapshot
//!
//! The cache never stays in the predicted state once the request settles.
//! Rollback is per row: other cells, and rows a remote merge or refetch
//! replaced in the meantime, are never put back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use chrono::{DateTime, Utc};

use notifications::Outcome;
use planner_core::{BatchSessionId, Cell, CellId, CellUpdate, CellValue};

use crate::context::WritebackContext;
use crate::error::{CellConflict, Result, WritebackError};
use crate::types::*;

/// Result of an accepted batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub session_id: BatchSessionId,
    /// Count reported by the server
    pub updated_count: usize,
    /// Submitted cells not named in `conflicts`
    pub succeeded: Vec<CellId>,
    pub conflicts: Vec<CellConflict>,
}

impl BatchOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Optimistic single-cell and batch writes for one budget version
#[derive(Clone)]
pub struct WritebackEngine {
    ctx: Arc<WritebackContext>,
}

impl WritebackEngine {
    pub fn new(ctx: Arc<WritebackContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<WritebackContext> {
        &self.ctx
    }

    /// Write one cell, expecting it to be at `expected_version` on the server
    pub async fn update_cell(
        &self,
        cell_id: &CellId,
        value: CellValue,
        expected_version: i64,
    ) -> Result<CellUpdateResponse> {
        let key = self.ctx.cells_key();
        let store = self.ctx.store();

        store.cancel_fetches(&key);

        let now = Utc::now();
        let user = self.ctx.user_id().cloned();
        let snapshot = store.speculate(&key, |cell| {
            if &cell.id != cell_id {
                return false;
            }
            predict(cell, value.clone(), now, user.clone());
            true
        });
        let predicted = snapshot.cells().first().map(|c| c.version);
        tracing::debug!(%cell_id, expected_version, ?predicted, "Applied optimistic cell update");

        let request = UpdateCellRequest::new(&value, expected_version);
        match self.ctx.api().update_cell(cell_id, &request).await {
            Ok(response) => {
                store.commit(snapshot, |cell| reconcile(cell, &response));
                tracing::info!(%cell_id, version = response.version, "Cell update accepted");
                self.ctx.settle(Outcome::CellUpdated { cell_id: cell_id.clone() }).await;
                Ok(response)
            }
            Err(error) => {
                let restored = store.restore(snapshot);
                tracing::debug!(%cell_id, restored, "Rolled back optimistic cell update");
                let outcome = match &error {
                    WritebackError::VersionConflict { cell_id, expected_version, actual_version, .. } => {
                        tracing::warn!(%cell_id, expected_version, ?actual_version, "Cell version conflict");
                        Outcome::VersionConflict {
                            cell_id: cell_id.clone(),
                            expected_version: *expected_version,
                            actual_version: *actual_version,
                        }
                    }
                    WritebackError::CellLocked { cell_id, .. } => {
                        tracing::warn!(%cell_id, "Cell is locked");
                        Outcome::CellLocked { cell_id: cell_id.clone() }
                    }
                    other => {
                        tracing::error!(%cell_id, error = %other, "Cell update failed");
                        Outcome::Failure { message: Some(other.to_string()) }
                    }
                };
                self.ctx.settle(outcome).await;
                Err(error)
            }
        }
    }

    /// Commit several cells together.
    ///
    /// The prediction for every listed cell lands in one cache write, and a
    /// failed request rolls all of them back together. Cells the server
    /// reports as conflicted are rolled back on their own.
    pub async fn batch_update(
        &self,
        session_id: BatchSessionId,
        updates: Vec<CellUpdate>,
    ) -> Result<BatchOutcome> {
        if updates.is_empty() {
            tracing::warn!(%session_id, "Ignoring empty batch");
            return Err(WritebackError::InvalidRequest("batch contains no updates".into()));
        }

        let key = self.ctx.cells_key();
        let store = self.ctx.store();

        store.cancel_fetches(&key);

        let lookup: HashMap<&CellId, &CellUpdate> = updates.iter().map(|u| (&u.cell_id, u)).collect();
        let now = Utc::now();
        let user = self.ctx.user_id().cloned();
        let mut snapshot = store.speculate(&key, |cell| match lookup.get(&cell.id) {
            Some(update) => {
                predict(cell, update.value.clone(), now, user.clone());
                true
            }
            None => false,
        });
        let predicted = snapshot.cells().len();
        tracing::debug!(%session_id, submitted = updates.len(), predicted, "Applied optimistic batch");

        let request = BatchUpdateRequest {
            session_id,
            updates: updates.iter().map(BatchUpdateItem::from).collect(),
        };

        match self.ctx.api().batch_update(&request).await {
            Ok(response) => {
                let conflicted: HashSet<&CellId> = response.conflicts.iter().map(|c| &c.cell_id).collect();
                let mut seen = HashSet::new();
                let succeeded: Vec<CellId> = updates
                    .iter()
                    .map(|u| &u.cell_id)
                    .filter(|id| !conflicted.contains(id) && seen.insert(*id))
                    .cloned()
                    .collect();

                // Conflicted predictions are known wrong; put them back until
                // the refetch lands. The rest stand as accepted.
                let rejected = snapshot.split_off(|cell| conflicted.contains(&cell.id));
                store.restore(rejected);
                store.commit(snapshot, |_| {});

                let outcome = if response.conflicts.is_empty() {
                    tracing::info!(%session_id, updated = response.updated_count, "Batch accepted");
                    Outcome::BatchApplied { updated_count: response.updated_count }
                } else {
                    tracing::warn!(
                        %session_id,
                        updated = response.updated_count,
                        conflicts = response.conflicts.len(),
                        "Batch accepted with conflicts"
                    );
                    Outcome::BatchPartialConflict {
                        updated_count: response.updated_count,
                        conflict_count: response.conflicts.len(),
                    }
                };
                self.ctx.settle(outcome).await;

                Ok(BatchOutcome {
                    session_id: response.session_id,
                    updated_count: response.updated_count,
                    succeeded,
                    conflicts: response.conflicts,
                })
            }
            Err(error) => {
                let restored = store.restore(snapshot);
                tracing::debug!(%session_id, restored, "Rolled back optimistic batch");
                let outcome = match &error {
                    WritebackError::BatchConflict { conflicts, .. } => {
                        tracing::warn!(%session_id, conflicts = conflicts.len(), "Batch rejected with conflicts");
                        Outcome::BatchConflict { conflict_count: conflicts.len() }
                    }
                    other => {
                        tracing::error!(%session_id, error = %other, "Batch update failed");
                        Outcome::Failure { message: Some(other.to_string()) }
                    }
                };
                self.ctx.settle(outcome).await;
                Err(error)
            }
        }
    }
}

/// Speculative result of a write: the server is expected to bump the version by one
fn predict(cell: &mut Cell, value: CellValue, now: DateTime<Utc>, user: Option<planner_core::UserId>) {
    cell.set_value(value);
    cell.version += 1;
    cell.modified_at = Some(now);
    if user.is_some() {
        cell.modified_by = user;
    }
}

/// Overwrite predicted fields with what the server accepted
fn reconcile(cell: &mut Cell, response: &CellUpdateResponse) {
    if response.value_numeric.is_some() || response.value_text.is_some() {
        cell.value_numeric = response.value_numeric;
        cell.value_text = response.value_text.clone();
    }
    cell.version = response.version;
    if response.modified_by.is_some() {
        cell.modified_by = response.modified_by.clone();
    }
    if response.modified_at.is_some() {
        cell.modified_at = response.modified_at;
    }
}
