//! Writeback API seam

use async_trait::async_trait;

use cell_store::CellFetcher;
use planner_core::CellId;

use crate::error::{Result, WritebackError};
use crate::types::*;

/// The REST surface the writeback engine depends on.
///
/// Reads go through the `CellFetcher` supertrait so the cell store can
/// refetch from the same backend.
#[async_trait]
pub trait WritebackApi: CellFetcher<Error = WritebackError> {
    /// `PUT /writeback/cells/{cell_id}`
    async fn update_cell(&self, cell_id: &CellId, request: &UpdateCellRequest) -> Result<CellUpdateResponse>;

    /// `POST /writeback/cells/batch`
    async fn batch_update(&self, request: &BatchUpdateRequest) -> Result<BatchUpdateResponse>;

    /// `POST /writeback/cells/{cell_id}/lock`
    async fn lock_cell(&self, cell_id: &CellId, request: &LockRequest) -> Result<LockResponse>;

    /// `DELETE /writeback/cells/{cell_id}/lock`
    async fn unlock_cell(&self, cell_id: &CellId, request: &UnlockRequest) -> Result<LockResponse>;
}
