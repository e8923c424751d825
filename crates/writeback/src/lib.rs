//! # Writeback
//!
//! Multi-user editing of planning cells against the writeback REST API.
//!
//! Writes are optimistic: the cell store shows the predicted result at once
//! and is reconciled or rolled back when the server answers. Concurrent edits
//! are detected through per-cell version tokens and surface as typed errors
//! (`VersionConflict`, `CellLocked`, `BatchConflict`) so callers can recover
//! without parsing messages.
//!
//! ```text
//! WritebackEngine ─┐                 ┌─> CellStore (predict / restore / refetch)
//!                  ├─> WritebackContext ─> NotificationService (one toast per outcome)
//! LockController ──┘                 └─> WritebackApi (HttpWritebackApi)
//! ```

pub mod api;
pub mod context;
pub mod engine;
pub mod error;
pub mod http;
pub mod lock;
pub mod types;

#[cfg(test)]
mod testing;

pub use api::WritebackApi;
pub use context::WritebackContext;
pub use engine::{BatchOutcome, WritebackEngine};
pub use error::{classify, CellConflict, ErrorKind, RequestKind, Result, WritebackError};
pub use http::HttpWritebackApi;
pub use lock::LockController;
pub use types::*;
