//! Writeback errors and the HTTP failure classifier
//!
//! Conflicts and locks are ordinary outcomes of multi-user editing, so they
//! get their own variants carrying what the engine needs to pick a recovery
//! (rollback, refetch) without looking at message text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use planner_core::CellId;

/// One cell whose supplied version did not match the server's
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellConflict {
    pub cell_id: CellId,
    pub expected_version: i64,
    #[serde(default)]
    pub actual_version: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Writeback error
#[derive(Debug, Error)]
pub enum WritebackError {
    /// Single-cell write carried a stale version (HTTP 409)
    #[error("{message}")]
    VersionConflict {
        message: String,
        cell_id: CellId,
        expected_version: i64,
        actual_version: Option<i64>,
    },

    /// Single-cell write hit a locked cell (HTTP 423)
    #[error("{message}")]
    CellLocked { message: String, cell_id: CellId },

    /// Batch rejected as a whole (HTTP 409)
    #[error("{message}")]
    BatchConflict { message: String, conflicts: Vec<CellConflict> },

    /// Request rejected before it was sent
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Server returned any other error status
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// HTTP request failed (connect, timeout, body)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base URL could not be joined with an endpoint path
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Discriminant used to pick a recovery path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    VersionConflict,
    CellLocked,
    BatchConflict,
    Other,
}

impl WritebackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WritebackError::VersionConflict { .. } => ErrorKind::VersionConflict,
            WritebackError::CellLocked { .. } => ErrorKind::CellLocked,
            WritebackError::BatchConflict { .. } => ErrorKind::BatchConflict,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.kind(), ErrorKind::VersionConflict | ErrorKind::BatchConflict)
    }

    /// HTTP status behind the error, when there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            WritebackError::VersionConflict { .. } | WritebackError::BatchConflict { .. } => Some(409),
            WritebackError::CellLocked { .. } => Some(423),
            WritebackError::Server { status, .. } => Some(*status),
            WritebackError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Result type for writeback operations
pub type Result<T> = std::result::Result<T, WritebackError>;

/// The request a failure belongs to
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    UpdateCell { cell_id: CellId, expected_version: i64 },
    BatchUpdate,
    LockCell { cell_id: CellId },
    UnlockCell { cell_id: CellId },
    FetchCells,
}

#[derive(Debug, Default, Deserialize)]
struct ConflictDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    cell_id: Option<CellId>,
    #[serde(default)]
    expected_version: Option<i64>,
    #[serde(default)]
    actual_version: Option<i64>,
    #[serde(default)]
    conflicts: Vec<CellConflict>,
}

/// Map a failed response to a typed error.
///
/// Bodies follow `{"detail": {...}}`; a plain string `detail` or a body that
/// is not JSON at all still produces the right variant with default fields.
pub fn classify(request: &RequestKind, status: u16, body: &str) -> WritebackError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let detail_value = parsed.as_ref().and_then(|v| v.get("detail"));

    let (detail, detail_text) = match detail_value {
        Some(Value::String(s)) => (ConflictDetail::default(), Some(s.clone())),
        Some(v @ Value::Object(_)) => (
            serde_json::from_value(v.clone()).unwrap_or_default(),
            None,
        ),
        _ => (ConflictDetail::default(), None),
    };
    let message = detail.message.clone().or(detail_text);

    match (request, status) {
        (RequestKind::UpdateCell { cell_id, expected_version }, 409) => {
            WritebackError::VersionConflict {
                message: message.unwrap_or_else(|| "Version conflict".to_string()),
                cell_id: detail.cell_id.unwrap_or_else(|| cell_id.clone()),
                expected_version: detail.expected_version.unwrap_or(*expected_version),
                actual_version: detail.actual_version,
            }
        }
        (RequestKind::UpdateCell { cell_id, .. }, 423) => WritebackError::CellLocked {
            message: message.unwrap_or_else(|| "Cell is locked".to_string()),
            cell_id: detail.cell_id.unwrap_or_else(|| cell_id.clone()),
        },
        (RequestKind::BatchUpdate, 409) => WritebackError::BatchConflict {
            message: message.unwrap_or_else(|| "Batch update conflict".to_string()),
            conflicts: detail.conflicts,
        },
        _ => WritebackError::Server {
            status,
            message: message.unwrap_or_else(|| fallback_message(body, status)),
        },
    }
}

fn fallback_message(body: &str, status: u16) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status)
    } else {
        trimmed.chars().take(200).collect()
    }
}
