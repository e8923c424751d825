//! # Planner Core
//!
//! The foundational layer of the budget planning writeback stack - shared
//! identifiers, the collaborative cell model, cache keys and settings.

pub mod cell;
pub mod settings;

use std::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use cell::{Cell, CellValue, CellUpdate, CacheKey, CacheKind};
pub use settings::{
    ApiSettings, NotificationSettings, PlannerSettings, RealtimeSettings, TelemetrySettings,
};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable cell identifier, unique within a budget version
    CellId
);

string_id!(
    /// Budget version identifier; every cache and channel is scoped to one
    VersionId
);

string_id!(
    /// Identity of a user as reported by the backend (`modified_by`, `locked_by`)
    UserId
);

/// Client-generated id grouping the cells of one batch commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchSessionId(pub Uuid);

impl BatchSessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchSessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
