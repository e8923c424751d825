//! Logging subsystem

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    EnvFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use planner_core::TelemetrySettings;

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err("Invalid log level"),
        }
    }
}

/// Filter directives for the configured level.
///
/// An unknown level falls back to `info` instead of failing startup.
pub fn directives(settings: &TelemetrySettings) -> String {
    let level = settings.log_level.parse::<LogLevel>().unwrap_or_default();
    let crates = ["planner_core", "cell_store", "writeback", "realtime", "notifications", "budgetgrid"];
    let mut directives = vec!["warn".to_string()];
    directives.extend(crates.iter().map(|c| format!("{}={}", c, level.as_str())));
    directives.join(",")
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this twice is harmless;
/// the second call leaves the first subscriber in place.
pub fn init(settings: &TelemetrySettings) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives(settings))?,
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true));

    if subscriber.try_init().is_err() {
        tracing::debug!("Global subscriber already installed");
    }

    Ok(())
}
