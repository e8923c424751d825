//! Who else is editing this budget version

use std::collections::HashMap;
use chrono::{DateTime, Utc};

use planner_core::UserId;
use crate::protocol::{PresenceDiff, PresenceState};

/// Per-user presence information
#[derive(Debug, Clone, PartialEq)]
pub struct UserPresence {
    pub user_id: UserId,
    /// Open connections (tabs, devices) for this user
    pub connections: usize,
    /// First seen in this roster
    pub joined_at: DateTime<Utc>,
}

/// Roster change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined(UserId),
    Left(UserId),
}

/// Presence roster for one channel
#[derive(Debug, Default)]
pub struct Presence {
    users: HashMap<UserId, UserPresence>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with a full state sync
    pub fn apply_state(&mut self, state: &PresenceState) -> Vec<PresenceEvent> {
        let mut events = Vec::new();

        let incoming: HashMap<UserId, usize> = state
            .iter()
            .filter(|(_, m)| !m.metas.is_empty())
            .map(|(key, m)| (UserId::from(key.as_str()), m.metas.len()))
            .collect();

        self.users.retain(|id, _| {
            let keep = incoming.contains_key(id);
            if !keep {
                events.push(PresenceEvent::Left(id.clone()));
            }
            keep
        });

        for (user_id, connections) in incoming {
            match self.users.get_mut(&user_id) {
                Some(presence) => presence.connections = connections,
                None => {
                    events.push(PresenceEvent::Joined(user_id.clone()));
                    self.users.insert(user_id.clone(), UserPresence {
                        user_id,
                        connections,
                        joined_at: Utc::now(),
                    });
                }
            }
        }
        events
    }

    /// Apply joins, then leaves
    pub fn apply_diff(&mut self, diff: &PresenceDiff) -> Vec<PresenceEvent> {
        let mut events = Vec::new();

        for (key, metas) in &diff.joins {
            let user_id = UserId::from(key.as_str());
            let added = metas.metas.len().max(1);
            match self.users.get_mut(&user_id) {
                Some(presence) => presence.connections += added,
                None => {
                    events.push(PresenceEvent::Joined(user_id.clone()));
                    self.users.insert(user_id.clone(), UserPresence {
                        user_id,
                        connections: added,
                        joined_at: Utc::now(),
                    });
                }
            }
        }

        for (key, metas) in &diff.leaves {
            let user_id = UserId::from(key.as_str());
            let removed = metas.metas.len().max(1);
            if let Some(presence) = self.users.get_mut(&user_id) {
                presence.connections = presence.connections.saturating_sub(removed);
                if presence.connections == 0 {
                    self.users.remove(&user_id);
                    events.push(PresenceEvent::Left(user_id));
                }
            }
        }
        events
    }

    pub fn get(&self, user_id: &UserId) -> Option<&UserPresence> {
        self.users.get(user_id)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    /// Online users, sorted by id
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn count(&self) -> usize {
        self.users.len()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }
}
