//! Writeback settings
//!
//! Loaded from `<config dir>/budgetgrid/settings.toml`, falling back to
//! defaults. A handful of environment variables override connection details.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use anyhow::Result;

pub const ENV_API_URL: &str = "BUDGETGRID_API_URL";
pub const ENV_API_TOKEN: &str = "BUDGETGRID_API_TOKEN";
pub const ENV_REALTIME_URL: &str = "BUDGETGRID_REALTIME_URL";

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// REST writeback API
    pub api: ApiSettings,
    /// Realtime change channel
    pub realtime: RealtimeSettings,
    /// Toast display behaviour
    pub notifications: NotificationSettings,
    /// Logging
    pub telemetry: TelemetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    pub enabled: bool,
    pub url: String,
    pub api_key: Option<String>,
    pub schema: String,
    pub cell_table: String,
    pub heartbeat_interval_secs: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Show an info toast for every merged remote change
    pub notify_remote_changes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub success_timeout_ms: u64,
    pub info_timeout_ms: u64,
    pub warning_timeout_ms: u64,
    pub error_timeout_ms: u64,
    pub max_toasts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub log_level: String,
}

impl PlannerSettings {
    /// Load settings from disk or return defaults
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::config_path();

        let mut settings = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            Self::default()
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: PlannerSettings = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded planner settings");
        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Override connection details from the environment
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            self.api.base_url = url;
        }
        if let Ok(token) = std::env::var(ENV_API_TOKEN) {
            self.api.token = Some(token);
        }
        if let Ok(url) = std::env::var(ENV_REALTIME_URL) {
            self.realtime.url = url;
        }
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("budgetgrid")
            .join("settings.toml")
    }
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RealtimeSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Delay before reconnect attempt `attempt` (1-based), doubling up to the cap
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.reconnect_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_reconnect_delay_ms))
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api/v1".into(),
            token: None,
            request_timeout_secs: 30,
        }
    }
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "ws://localhost:54321/realtime/v1/websocket".into(),
            api_key: None,
            schema: "public".into(),
            cell_table: "planning_cells".into(),
            heartbeat_interval_secs: 30,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            notify_remote_changes: true,
        }
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            success_timeout_ms: 2000,
            info_timeout_ms: 3000,
            warning_timeout_ms: 5000,
            error_timeout_ms: 6000,
            max_toasts: 5,
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self { log_level: "info".into() }
    }
}
