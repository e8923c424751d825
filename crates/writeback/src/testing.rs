//! In-memory writeback backend for engine tests

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use cell_store::{CellFetcher, CellStore};
use notifications::NotificationService;
use planner_core::{CacheKey, Cell, CellId, UserId, VersionId};

use crate::api::WritebackApi;
use crate::context::WritebackContext;
use crate::engine::WritebackEngine;
use crate::error::{CellConflict, Result, WritebackError};
use crate::lock::LockController;
use crate::types::*;

pub const SERVER_USER: &str = "server-user";

/// Keeps version and lock rules the way the real backend does
#[derive(Default)]
pub struct FakeServer {
    cells: Mutex<BTreeMap<CellId, Cell>>,
    next_error: Mutex<Option<WritebackError>>,
    cell_errors: Mutex<HashMap<CellId, WritebackError>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    fail_fetches: AtomicBool,
    reject_conflicting_batches: AtomicBool,
    fetch_calls: AtomicUsize,
    batch_calls: AtomicUsize,
}

/// Releases requests held by `FakeServer::hold_requests`
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn release(&self) {
        self.0.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    /// Let the oldest held request through
    pub fn release_one(&self) {
        self.0.add_permits(1);
    }
}

impl FakeServer {
    pub fn cell(id: &str, value: f64, version: i64) -> Cell {
        Cell::new(id, "v1", "revenue", "fees", id)
            .with_value(value)
            .with_version(version)
    }

    pub fn insert(&self, cell: Cell) {
        self.cells.lock().insert(cell.id.clone(), cell);
    }

    /// Simulate another user's accepted write
    pub fn set_remote(&self, id: &str, value: f64, version: i64) {
        let mut cells = self.cells.lock();
        if let Some(cell) = cells.get_mut(&CellId::new(id)) {
            cell.set_value(value.into());
            cell.version = version;
            cell.modified_by = Some(UserId::new("someone-else"));
        }
    }

    pub fn lock(&self, id: &str) {
        if let Some(cell) = self.cells.lock().get_mut(&CellId::new(id)) {
            cell.set_lock(true, None, Some(UserId::new("someone-else")), Some(Utc::now()));
        }
    }

    pub fn remote(&self, id: &str) -> Cell {
        self.cells.lock()[&CellId::new(id)].clone()
    }

    pub fn fail_next(&self, error: WritebackError) {
        *self.next_error.lock() = Some(error);
    }

    /// Fail the next write to one cell
    pub fn fail_cell(&self, id: &str, error: WritebackError) {
        self.cell_errors.lock().insert(CellId::new(id), error);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Reject a batch outright when any entry is stale
    pub fn reject_batches_with_conflict(&self, reject: bool) {
        self.reject_conflicting_batches.store(reject, Ordering::SeqCst);
    }

    /// Hold write requests until the returned gate is released
    pub fn hold_requests(&self) -> Gate {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(semaphore.clone());
        Gate(semaphore)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<()> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        match self.next_error.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn not_found(cell_id: &CellId) -> WritebackError {
        WritebackError::Server { status: 404, message: format!("Cell {} not found", cell_id) }
    }

    fn conflict_for(cell: &Cell, expected_version: i64) -> Option<CellConflict> {
        if cell.is_locked {
            Some(CellConflict {
                cell_id: cell.id.clone(),
                expected_version,
                actual_version: Some(cell.version),
                message: Some("Cell is locked".into()),
            })
        } else if cell.version != expected_version {
            Some(CellConflict {
                cell_id: cell.id.clone(),
                expected_version,
                actual_version: Some(cell.version),
                message: Some("Version mismatch".into()),
            })
        } else {
            None
        }
    }

    fn accept(cell: &mut Cell, numeric: Option<f64>, text: Option<String>) {
        cell.value_numeric = numeric;
        cell.value_text = text;
        cell.version += 1;
        cell.modified_by = Some(UserId::new(SERVER_USER));
        cell.modified_at = Some(Utc::now());
    }
}

#[async_trait]
impl CellFetcher for FakeServer {
    type Error = WritebackError;

    async fn fetch_cells(&self, version_id: &VersionId) -> Result<Vec<Cell>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(WritebackError::Server { status: 503, message: "fetch unavailable".into() });
        }
        Ok(self
            .cells
            .lock()
            .values()
            .filter(|c| &c.version_id == version_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WritebackApi for FakeServer {
    async fn update_cell(&self, cell_id: &CellId, request: &UpdateCellRequest) -> Result<CellUpdateResponse> {
        self.enter().await?;
        if let Some(error) = self.cell_errors.lock().remove(cell_id) {
            return Err(error);
        }
        let mut cells = self.cells.lock();
        let cell = cells.get_mut(cell_id).ok_or_else(|| Self::not_found(cell_id))?;

        if cell.is_locked {
            return Err(WritebackError::CellLocked { message: "Cell is locked".into(), cell_id: cell_id.clone() });
        }
        if cell.version != request.version {
            return Err(WritebackError::VersionConflict {
                message: "Cell modified by another user".into(),
                cell_id: cell_id.clone(),
                expected_version: request.version,
                actual_version: Some(cell.version),
            });
        }

        Self::accept(cell, request.value_numeric, request.value_text.clone());
        Ok(CellUpdateResponse {
            id: cell.id.clone(),
            value_numeric: cell.value_numeric,
            value_text: cell.value_text.clone(),
            version: cell.version,
            modified_by: cell.modified_by.clone(),
            modified_at: cell.modified_at,
        })
    }

    async fn batch_update(&self, request: &BatchUpdateRequest) -> Result<BatchUpdateResponse> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        let mut cells = self.cells.lock();

        let mut conflicts = Vec::new();
        for item in &request.updates {
            let cell = cells.get(&item.cell_id).ok_or_else(|| Self::not_found(&item.cell_id))?;
            if let Some(conflict) = Self::conflict_for(cell, item.version) {
                conflicts.push(conflict);
            }
        }

        if !conflicts.is_empty() && self.reject_conflicting_batches.load(Ordering::SeqCst) {
            return Err(WritebackError::BatchConflict { message: "Batch update conflict".into(), conflicts });
        }

        let mut updated_count = 0;
        for item in &request.updates {
            if conflicts.iter().any(|c| c.cell_id == item.cell_id) {
                continue;
            }
            if let Some(cell) = cells.get_mut(&item.cell_id) {
                Self::accept(cell, item.value_numeric, item.value_text.clone());
                updated_count += 1;
            }
        }

        Ok(BatchUpdateResponse { session_id: request.session_id, updated_count, conflicts })
    }

    async fn lock_cell(&self, cell_id: &CellId, request: &LockRequest) -> Result<LockResponse> {
        self.enter().await?;
        let mut cells = self.cells.lock();
        let cell = cells.get_mut(cell_id).ok_or_else(|| Self::not_found(cell_id))?;
        cell.set_lock(true, request.lock_reason.clone(), Some(UserId::new(SERVER_USER)), Some(Utc::now()));
        Ok(LockResponse {
            id: cell.id.clone(),
            is_locked: true,
            lock_reason: cell.lock_reason.clone(),
            locked_by: cell.locked_by.clone(),
            locked_at: cell.locked_at,
        })
    }

    async fn unlock_cell(&self, cell_id: &CellId, _request: &UnlockRequest) -> Result<LockResponse> {
        self.enter().await?;
        let mut cells = self.cells.lock();
        let cell = cells.get_mut(cell_id).ok_or_else(|| Self::not_found(cell_id))?;
        cell.set_lock(false, None, None, None);
        Ok(LockResponse { id: cell.id.clone(), is_locked: false, lock_reason: None, locked_by: None, locked_at: None })
    }
}

/// A loaded version `v1` wired to a fake backend
pub struct Harness {
    pub server: Arc<FakeServer>,
    pub store: Arc<CellStore>,
    pub notifications: Arc<NotificationService>,
    pub engine: WritebackEngine,
    pub locks: LockController,
}

impl Harness {
    /// Seed both the backend and the cache with the same cells
    pub fn with_cells(cells: Vec<(&str, f64, i64)>) -> Self {
        let server = Arc::new(FakeServer::default());
        let seeded: Vec<Cell> = cells
            .into_iter()
            .map(|(id, value, version)| FakeServer::cell(id, value, version))
            .collect();
        for cell in &seeded {
            server.insert(cell.clone());
        }

        let store = Arc::new(CellStore::new());
        store.set(&CacheKey::cells("v1"), seeded);
        let notifications = Arc::new(NotificationService::default());

        let ctx = Arc::new(
            WritebackContext::new(VersionId::new("v1"), server.clone(), store.clone(), notifications.clone())
                .with_user(UserId::new("user-1")),
        );

        Self {
            server,
            store,
            notifications,
            engine: WritebackEngine::new(ctx.clone()),
            locks: LockController::new(ctx),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::cells("v1")
    }

    pub fn cached(&self, id: &str) -> Cell {
        self.store.cell(&self.key(), &CellId::new(id)).expect("cell cached")
    }
}
