//! Channel connection status

use serde::{Deserialize, Serialize};

/// Lifecycle of the realtime channel for one budget version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    /// Not connected yet
    #[default]
    Idle,
    /// Socket opening or join pending
    Connecting,
    /// Join confirmed; changes are flowing
    Subscribed,
    /// Channel failed; a reconnect is pending
    ChannelError,
    /// Channel shut down, locally or by the server
    Closed,
}

impl ChannelStatus {
    /// Whether `next` is a legal transition from `self`
    pub fn can_transition_to(&self, next: ChannelStatus) -> bool {
        use ChannelStatus::*;
        match (self, next) {
            (Idle, Connecting) => true,
            (Connecting, Subscribed | ChannelError | Closed) => true,
            (Subscribed, ChannelError | Closed) => true,
            (ChannelError, Connecting | Closed) => true,
            (Closed, Connecting) => true,
            (Idle, Closed) => true,
            _ => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ChannelStatus::ChannelError | ChannelStatus::Closed)
    }

    pub fn is_subscribed(&self) -> bool {
        *self == ChannelStatus::Subscribed
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Idle => "IDLE",
            ChannelStatus::Connecting => "CONNECTING",
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
