//! Writeback API request and response bodies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use planner_core::{BatchSessionId, CellId, CellUpdate, CellValue, UserId};
use crate::error::CellConflict;

/// `PUT /writeback/cells/{cell_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCellRequest {
    pub value_numeric: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_text: Option<String>,
    /// Version the client expects the cell to be at
    pub version: i64,
}

impl UpdateCellRequest {
    pub fn new(value: &CellValue, expected_version: i64) -> Self {
        Self {
            value_numeric: value.as_f64(),
            value_text: value.as_text().map(str::to_string),
            version: expected_version,
        }
    }
}

/// Authoritative fields returned after an accepted write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellUpdateResponse {
    pub id: CellId,
    #[serde(default)]
    pub value_numeric: Option<f64>,
    #[serde(default)]
    pub value_text: Option<String>,
    pub version: i64,
    #[serde(default)]
    pub modified_by: Option<UserId>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

/// One entry of `POST /writeback/cells/batch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchUpdateItem {
    pub cell_id: CellId,
    pub value_numeric: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_text: Option<String>,
    pub version: i64,
}

impl From<&CellUpdate> for BatchUpdateItem {
    fn from(update: &CellUpdate) -> Self {
        Self {
            cell_id: update.cell_id.clone(),
            value_numeric: update.value.as_f64(),
            value_text: update.value.as_text().map(str::to_string),
            version: update.expected_version,
        }
    }
}

/// `POST /writeback/cells/batch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchUpdateRequest {
    pub session_id: BatchSessionId,
    pub updates: Vec<BatchUpdateItem>,
}

/// Partial-success batch result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchUpdateResponse {
    pub session_id: BatchSessionId,
    pub updated_count: usize,
    #[serde(default)]
    pub conflicts: Vec<CellConflict>,
}

/// `POST /writeback/cells/{cell_id}/lock`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_reason: Option<String>,
}

/// `DELETE /writeback/cells/{cell_id}/lock`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnlockRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_reason: Option<String>,
}

/// Lock state after a lock or unlock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockResponse {
    pub id: CellId,
    pub is_locked: bool,
    #[serde(default)]
    pub lock_reason: Option<String>,
    #[serde(default)]
    pub locked_by: Option<UserId>,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
}
