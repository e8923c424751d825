//! Planning cells - the unit of collaborative editing
//!
//! A cell is addressed by `(version, module, entity, field, period)` and carries
//! a server-assigned `version` token used for optimistic concurrency.

use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CellId, UserId, VersionId};

/// Value held by a cell. Numeric and text values are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Numeric(f64),
    Text(String),
}

impl CellValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Numeric(v) => Some(*v),
            CellValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Numeric(_) => None,
            CellValue::Text(s) => Some(s),
        }
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Numeric(v)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Numeric(v) => write!(f, "{}", v),
            CellValue::Text(s) => f.write_str(s),
        }
    }
}

/// A planning cell as stored by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub version_id: VersionId,
    pub module_code: String,
    pub entity_id: String,
    pub field_name: String,
    #[serde(default)]
    pub period_code: Option<String>,
    #[serde(default)]
    pub value_numeric: Option<f64>,
    #[serde(default)]
    pub value_text: Option<String>,
    /// Optimistic concurrency token, bumped by the server on every accepted write
    pub version: i64,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub lock_reason: Option<String>,
    #[serde(default)]
    pub locked_by: Option<UserId>,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_by: Option<UserId>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Cell {
    /// Create an unlocked numeric cell at its baseline version
    pub fn new(
        id: impl Into<CellId>,
        version_id: impl Into<VersionId>,
        module_code: &str,
        entity_id: &str,
        field_name: &str,
    ) -> Self {
        Self {
            id: id.into(),
            version_id: version_id.into(),
            module_code: module_code.to_string(),
            entity_id: entity_id.to_string(),
            field_name: field_name.to_string(),
            period_code: None,
            value_numeric: None,
            value_text: None,
            version: 1,
            is_locked: false,
            lock_reason: None,
            locked_by: None,
            locked_at: None,
            modified_by: None,
            modified_at: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_value(mut self, value: impl Into<CellValue>) -> Self {
        self.set_value(value.into());
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn with_period(mut self, period_code: &str) -> Self {
        self.period_code = Some(period_code.to_string());
        self
    }

    /// Current value, numeric taking precedence
    pub fn value(&self) -> Option<CellValue> {
        match (&self.value_numeric, &self.value_text) {
            (Some(v), _) => Some(CellValue::Numeric(*v)),
            (None, Some(s)) => Some(CellValue::Text(s.clone())),
            (None, None) => None,
        }
    }

    /// Set the value, clearing the other representation
    pub fn set_value(&mut self, value: CellValue) {
        match value {
            CellValue::Numeric(v) => {
                self.value_numeric = Some(v);
                self.value_text = None;
            }
            CellValue::Text(s) => {
                self.value_numeric = None;
                self.value_text = Some(s);
            }
        }
    }

    pub fn set_lock(
        &mut self,
        locked: bool,
        reason: Option<String>,
        by: Option<UserId>,
        at: Option<DateTime<Utc>>,
    ) {
        self.is_locked = locked;
        self.lock_reason = reason;
        self.locked_by = by;
        self.locked_at = at;
    }
}

/// One entry of a multi-cell commit
#[derive(Debug, Clone, PartialEq)]
pub struct CellUpdate {
    pub cell_id: CellId,
    pub value: CellValue,
    /// The version the client last observed for this cell
    pub expected_version: i64,
}

impl CellUpdate {
    pub fn new(cell_id: impl Into<CellId>, value: impl Into<CellValue>, expected_version: i64) -> Self {
        Self {
            cell_id: cell_id.into(),
            value: value.into(),
            expected_version,
        }
    }
}

/// Collection a cache entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheKind {
    /// `['cells', versionId]`
    Cells,
    /// `['cell-changes', versionId]`
    CellChanges,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Cells => "cells",
            CacheKind::CellChanges => "cell-changes",
        }
    }
}

/// Key of one cached collection, scoped to a budget version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub version_id: VersionId,
}

impl CacheKey {
    pub fn cells(version_id: impl Into<VersionId>) -> Self {
        Self { kind: CacheKind::Cells, version_id: version_id.into() }
    }

    pub fn cell_changes(version_id: impl Into<VersionId>) -> Self {
        Self { kind: CacheKind::CellChanges, version_id: version_id.into() }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "['{}', '{}']", self.kind.as_str(), self.version_id)
    }
}
