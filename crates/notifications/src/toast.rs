//! Toast notifications

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use planner_core::NotificationSettings;
use crate::new_id;

/// Toast type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToastType {
    Info,
    Warning,
    Error,
    Success,
}

impl ToastType {
    /// Display duration for this type
    pub fn timeout_ms(&self, settings: &NotificationSettings) -> u64 {
        match self {
            ToastType::Info => settings.info_timeout_ms,
            ToastType::Success => settings.success_timeout_ms,
            ToastType::Warning => settings.warning_timeout_ms,
            ToastType::Error => settings.error_timeout_ms,
        }
    }
}

/// Toast notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toast {
    /// Unique ID
    pub id: String,
    /// Toast type
    pub toast_type: ToastType,
    /// Message
    pub message: String,
    /// Auto-dismiss timeout in ms
    pub timeout: u64,
    /// When the toast was created
    pub created_at: DateTime<Utc>,
}

impl Toast {
    pub fn new(toast_type: ToastType, message: &str) -> Self {
        Self {
            id: new_id(),
            toast_type,
            message: message.to_string(),
            timeout: toast_type.timeout_ms(&NotificationSettings::default()),
            created_at: Utc::now(),
        }
    }

    /// Timeouts are always bounded; zero is bumped to one millisecond
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout.max(1);
        self
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::milliseconds(self.timeout as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}
