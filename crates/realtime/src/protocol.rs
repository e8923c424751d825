//! Realtime channel protocol
//!
//! Phoenix-style frames (`{topic, event, payload, ref}`) as spoken by the
//! realtime server, plus the typed messages the listener consumes.

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use planner_core::{Cell, CellId, RealtimeSettings, UserId, VersionId};

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const HEARTBEAT: &str = "heartbeat";
pub const POSTGRES_CHANGES: &str = "postgres_changes";
pub const PRESENCE_STATE: &str = "presence_state";
pub const PRESENCE_DIFF: &str = "presence_diff";

/// Wire frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    pub fn join(config: &ChannelConfig, reference: &str) -> Self {
        Self {
            topic: config.wire_topic(),
            event: PHX_JOIN.into(),
            payload: config.join_payload(),
            reference: Some(reference.into()),
            join_ref: Some(reference.into()),
        }
    }

    pub fn leave(config: &ChannelConfig, reference: &str) -> Self {
        Self {
            topic: config.wire_topic(),
            event: PHX_LEAVE.into(),
            payload: json!({}),
            reference: Some(reference.into()),
            join_ref: None,
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: "phoenix".into(),
            event: HEARTBEAT.into(),
            payload: json!({}),
            reference: Some(reference.into()),
            join_ref: None,
        }
    }

    /// Decode a server frame for the channel joined with `join_ref`.
    ///
    /// Frames the listener has no use for (heartbeat replies, system
    /// notices) yield `None`.
    pub fn into_message(self, join_ref: &str) -> Option<ChannelMessage> {
        match self.event.as_str() {
            PHX_REPLY => {
                if self.reference.as_deref() != Some(join_ref) {
                    return None;
                }
                match self.payload.get("status").and_then(Value::as_str) {
                    Some("ok") => Some(ChannelMessage::Subscribed),
                    _ => Some(ChannelMessage::Error(
                        reason(&self.payload["response"]).unwrap_or_else(|| "join rejected".into()),
                    )),
                }
            }
            POSTGRES_CHANGES => {
                let data = self.payload.get("data").cloned().unwrap_or(Value::Null);
                match serde_json::from_value::<PostgresChange>(data) {
                    Ok(change) => Some(ChannelMessage::Change(change)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping malformed change payload");
                        None
                    }
                }
            }
            PRESENCE_STATE => serde_json::from_value(self.payload).ok().map(ChannelMessage::PresenceState),
            PRESENCE_DIFF => serde_json::from_value(self.payload).ok().map(ChannelMessage::PresenceDiff),
            PHX_ERROR => Some(ChannelMessage::Error(
                reason(&self.payload).unwrap_or_else(|| "channel error".into()),
            )),
            PHX_CLOSE => Some(ChannelMessage::Closed),
            _ => None,
        }
    }
}

fn reason(value: &Value) -> Option<String> {
    value
        .get("reason")
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Message delivered from a channel connection into the listener
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// Join confirmed
    Subscribed,
    /// Row change on the cell table
    Change(PostgresChange),
    /// Full presence roster
    PresenceState(PresenceState),
    /// Presence joins and leaves
    PresenceDiff(PresenceDiff),
    /// Channel failed
    Error(String),
    /// Channel or socket closed by the remote end
    Closed,
}

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Row change payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresChange {
    #[serde(rename = "type", alias = "eventType")]
    pub event_type: ChangeType,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
    /// New row; empty for DELETE
    #[serde(default, alias = "new")]
    pub record: Value,
    /// Previous row; may carry only the primary key
    #[serde(default, alias = "old")]
    pub old_record: Value,
}

impl PostgresChange {
    /// The new row as a cell
    pub fn new_cell(&self) -> Option<Cell> {
        serde_json::from_value(self.record.clone()).ok()
    }

    /// The previous row as a cell, when the server sent all of it
    pub fn old_cell(&self) -> Option<Cell> {
        serde_json::from_value(self.old_record.clone()).ok()
    }

    pub fn cell_id(&self) -> Option<CellId> {
        self.record
            .get("id")
            .or_else(|| self.old_record.get("id"))
            .and_then(Value::as_str)
            .map(CellId::from)
    }

    /// User behind the change: the new row's modifier, or the old row's for DELETE
    pub fn acting_user(&self) -> Option<UserId> {
        let (primary, fallback) = match self.event_type {
            ChangeType::Delete => (&self.old_record, &self.record),
            _ => (&self.record, &self.old_record),
        };
        primary
            .get("modified_by")
            .or_else(|| fallback.get("modified_by"))
            .and_then(Value::as_str)
            .map(UserId::from)
    }
}

/// Presence metas of one key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceMetas {
    #[serde(default)]
    pub metas: Vec<Value>,
}

/// Presence key → metas
pub type PresenceState = HashMap<String, PresenceMetas>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceState,
    #[serde(default)]
    pub leaves: PresenceState,
}

/// Channel parameters for one budget version
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub version_id: VersionId,
    /// `budget-version:{version_id}`
    pub topic: String,
    /// Presence is keyed by the local user
    pub presence_key: Option<String>,
    /// Echo our own broadcasts back to us
    pub broadcast_self: bool,
    pub schema: String,
    pub table: String,
    /// Server-side row filter
    pub filter: String,
    pub access_token: Option<String>,
}

impl ChannelConfig {
    pub fn for_version(version_id: &VersionId, user_id: Option<&UserId>, settings: &RealtimeSettings) -> Self {
        Self {
            version_id: version_id.clone(),
            topic: format!("budget-version:{}", version_id),
            presence_key: user_id.map(|u| u.to_string()),
            broadcast_self: false,
            schema: settings.schema.clone(),
            table: settings.cell_table.clone(),
            filter: format!("version_id=eq.{}", version_id),
            access_token: settings.api_key.clone(),
        }
    }

    pub fn wire_topic(&self) -> String {
        format!("realtime:{}", self.topic)
    }

    pub fn join_payload(&self) -> Value {
        let mut payload = json!({
            "config": {
                "broadcast": { "self": self.broadcast_self, "ack": false },
                "presence": { "key": self.presence_key.clone().unwrap_or_default() },
                "postgres_changes": [{
                    "event": "*",
                    "schema": self.schema,
                    "table": self.table,
                    "filter": self.filter,
                }],
            }
        });
        if let Some(token) = &self.access_token {
            payload["access_token"] = json!(token);
        }
        payload
    }
}
