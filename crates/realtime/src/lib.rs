//! # Realtime Sync
//!
//! Live merge of other users' cell edits for one budget version:
//! - Phoenix-style channel over WebSocket, scoped to the version
//! - Row-change merge into the cell store, skipping our own echoes
//! - Presence roster of who else is in the version
//! - Automatic reconnect with backoff, and a resync once back

pub mod client;
pub mod listener;
pub mod presence;
pub mod protocol;
pub mod status;

pub use client::{ChannelConnection, RealtimeTransport, WsTransport};
pub use listener::{CellChangeEvent, RealtimeListener, ResyncHook, SubscriptionHandle};
pub use presence::{Presence, PresenceEvent, UserPresence};
pub use protocol::{ChangeType, ChannelConfig, ChannelMessage, Frame, PostgresChange, PresenceDiff, PresenceState};
pub use status::ChannelStatus;
