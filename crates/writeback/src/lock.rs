//! Pessimistic cell locks
//!
//! Locking is not predicted: the cache only changes once the server has
//! confirmed. A lock never bumps the cell's version.

use std::sync::Arc;

use notifications::Outcome;
use planner_core::CellId;

use crate::context::WritebackContext;
use crate::error::Result;
use crate::types::{LockRequest, LockResponse, UnlockRequest};

/// Locks and unlocks cells of one budget version
#[derive(Clone)]
pub struct LockController {
    ctx: Arc<WritebackContext>,
}

impl LockController {
    pub fn new(ctx: Arc<WritebackContext>) -> Self {
        Self { ctx }
    }

    pub async fn lock_cell(&self, cell_id: &CellId, reason: Option<String>) -> Result<LockResponse> {
        let request = LockRequest { lock_reason: reason };
        let result = self.ctx.api().lock_cell(cell_id, &request).await;
        self.finish(cell_id, true, result).await
    }

    pub async fn unlock_cell(&self, cell_id: &CellId, reason: Option<String>) -> Result<LockResponse> {
        let request = UnlockRequest { unlock_reason: reason };
        let result = self.ctx.api().unlock_cell(cell_id, &request).await;
        self.finish(cell_id, false, result).await
    }

    async fn finish(&self, cell_id: &CellId, locking: bool, result: Result<LockResponse>) -> Result<LockResponse> {
        match result {
            Ok(response) => {
                self.apply(&response);
                tracing::info!(%cell_id, locked = response.is_locked, "Cell lock changed");
                self.ctx
                    .settle(Outcome::LockChanged {
                        cell_id: cell_id.clone(),
                        locked: response.is_locked,
                        reason: response.lock_reason.clone(),
                    })
                    .await;
                Ok(response)
            }
            Err(error) => {
                tracing::error!(%cell_id, locking, error = %error, "Cell lock request failed");
                self.ctx
                    .settle(Outcome::LockFailed {
                        cell_id: cell_id.clone(),
                        locking,
                        message: Some(error.to_string()),
                    })
                    .await;
                Err(error)
            }
        }
    }

    fn apply(&self, response: &LockResponse) {
        self.ctx.store().update(&self.ctx.cells_key(), |cells| {
            if let Some(cell) = cells.iter_mut().find(|c| c.id == response.id) {
                cell.set_lock(
                    response.is_locked,
                    response.lock_reason.clone(),
                    response.locked_by.clone(),
                    response.locked_at,
                );
            }
        });
    }
}
