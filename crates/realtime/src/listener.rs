//! Realtime change listener
//!
//! Merges other users' row changes for one budget version into the cell
//! store. Changes made by the local user are dropped: the writeback engine
//! already shows them, and applying the echo could race an in-flight
//! prediction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use cell_store::CellStore;
use notifications::{NotificationService, Outcome, RecoveryPolicy};
use planner_core::{CacheKey, Cell, CellId, RealtimeSettings, UserId, VersionId};

use crate::client::{ChannelConnection, RealtimeTransport};
use crate::presence::{Presence, PresenceEvent};
use crate::protocol::{ChangeType, ChannelConfig, ChannelMessage, PostgresChange};
use crate::status::ChannelStatus;

/// Reloads the version's cells after the channel recovers
pub type ResyncHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A remote change that was merged
#[derive(Debug, Clone, PartialEq)]
pub struct CellChangeEvent {
    pub event_type: ChangeType,
    pub cell_id: CellId,
    /// New row, or the removed row for DELETE when known
    pub cell: Option<Cell>,
    pub user_id: Option<UserId>,
}

/// Why a channel stopped delivering
enum Disconnect {
    Error(String),
    Closed,
    /// Replaced by a newer pump
    Superseded,
}

/// Realtime listener for one budget version
pub struct RealtimeListener {
    version_id: VersionId,
    user_id: Option<UserId>,
    settings: RealtimeSettings,
    config: ChannelConfig,
    transport: Arc<dyn RealtimeTransport>,
    store: Arc<CellStore>,
    notifications: Arc<NotificationService>,
    policy: RecoveryPolicy,
    resync: Option<ResyncHook>,
    status_tx: watch::Sender<ChannelStatus>,
    change_tx: broadcast::Sender<CellChangeEvent>,
    presence_tx: broadcast::Sender<PresenceEvent>,
    presence: RwLock<Presence>,
    /// Bumped for every pump; stale pumps stop touching state
    generation: AtomicU64,
    /// Between a channel failure and the next successful join
    recovering: AtomicBool,
}

impl RealtimeListener {
    pub fn new(
        version_id: VersionId,
        settings: RealtimeSettings,
        transport: Arc<dyn RealtimeTransport>,
        store: Arc<CellStore>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        let config = ChannelConfig::for_version(&version_id, None, &settings);
        let (status_tx, _) = watch::channel(ChannelStatus::Idle);
        let (change_tx, _) = broadcast::channel(256);
        let (presence_tx, _) = broadcast::channel(64);
        Self {
            version_id,
            user_id: None,
            settings,
            config,
            transport,
            store,
            notifications,
            policy: RecoveryPolicy,
            resync: None,
            status_tx,
            change_tx,
            presence_tx,
            presence: RwLock::new(Presence::new()),
            generation: AtomicU64::new(0),
            recovering: AtomicBool::new(false),
        }
    }

    /// Local user: presence key, and the identity whose echoes are dropped
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.config = ChannelConfig::for_version(&self.version_id, Some(&user_id), &self.settings);
        self.user_id = Some(user_id);
        self
    }

    pub fn with_resync(mut self, hook: ResyncHook) -> Self {
        self.resync = Some(hook);
        self
    }

    pub fn version_id(&self) -> &VersionId {
        &self.version_id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    /// Every merged remote change
    pub fn subscribe(&self) -> broadcast::Receiver<CellChangeEvent> {
        self.change_tx.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence_tx.subscribe()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.presence.read().online_users()
    }

    /// Open the channel. Connection failures are retried in the background;
    /// the returned handle tears everything down when closed or dropped.
    pub fn connect(self: &Arc<Self>) -> SubscriptionHandle {
        let handle = SubscriptionHandle {
            listener: Arc::clone(self),
            pump: Mutex::new(None),
        };
        handle.start();
        handle
    }

    fn cells_key(&self) -> CacheKey {
        CacheKey::cells(self.version_id.clone())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn transition(&self, next: ChannelStatus) -> bool {
        let current = self.status();
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            tracing::warn!(version_id = %self.version_id, %current, %next, "Ignoring invalid channel transition");
            return false;
        }
        self.status_tx.send_replace(next);
        tracing::debug!(version_id = %self.version_id, from = %current, to = %next, "Channel status changed");
        true
    }

    async fn settle(&self, outcome: Outcome) {
        let decision = self.policy.decide(&outcome);
        self.notifications.notify(&decision);
        if decision.invalidate_cells {
            self.store.invalidate(&self.cells_key());
        }
        if decision.refetch_cells {
            match &self.resync {
                Some(hook) => hook().await,
                None => self.store.invalidate(&self.cells_key()),
            }
        }
    }

    /// Connect, pump, and reconnect with backoff until superseded or out of attempts
    async fn run(self: Arc<Self>, generation: u64) {
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                if attempt > self.settings.max_reconnect_attempts {
                    tracing::error!(
                        version_id = %self.version_id,
                        attempts = attempt - 1,
                        "Giving up on realtime channel"
                    );
                    return;
                }
                tokio::time::sleep(self.settings.reconnect_delay(attempt)).await;
            }
            if !self.is_current(generation) {
                return;
            }

            self.transition(ChannelStatus::Connecting);
            let disconnect = match self.transport.connect(&self.config).await {
                Ok(connection) => self.pump(generation, connection, &mut attempt).await,
                Err(e) => Disconnect::Error(format!("{:#}", e)),
            };

            match disconnect {
                Disconnect::Superseded => return,
                Disconnect::Error(detail) => {
                    self.fail(ChannelStatus::ChannelError, Some(detail)).await;
                }
                Disconnect::Closed => {
                    self.fail(ChannelStatus::Closed, None).await;
                }
            }
            attempt += 1;
        }
    }

    async fn pump(&self, generation: u64, mut connection: ChannelConnection, attempt: &mut u32) -> Disconnect {
        while let Some(message) = connection.recv().await {
            if !self.is_current(generation) {
                return Disconnect::Superseded;
            }
            match message {
                ChannelMessage::Subscribed => {
                    *attempt = 0;
                    if self.transition(ChannelStatus::Subscribed) {
                        tracing::info!(version_id = %self.version_id, topic = %self.config.topic, "Realtime channel subscribed");
                    }
                    if self.recovering.swap(false, Ordering::SeqCst) {
                        self.settle(Outcome::Reconnected).await;
                    }
                }
                ChannelMessage::Change(change) => {
                    self.handle_change(change).await;
                }
                ChannelMessage::PresenceState(state) => {
                    let events = self.presence.write().apply_state(&state);
                    self.publish_presence(events);
                }
                ChannelMessage::PresenceDiff(diff) => {
                    let events = self.presence.write().apply_diff(&diff);
                    self.publish_presence(events);
                }
                ChannelMessage::Error(detail) => return Disconnect::Error(detail),
                ChannelMessage::Closed => return Disconnect::Closed,
            }
        }
        if self.is_current(generation) {
            Disconnect::Closed
        } else {
            Disconnect::Superseded
        }
    }

    async fn fail(&self, status: ChannelStatus, detail: Option<String>) {
        tracing::warn!(version_id = %self.version_id, %status, detail = ?detail, "Realtime channel interrupted");
        self.transition(status);
        self.presence.write().clear();
        if !self.recovering.swap(true, Ordering::SeqCst) {
            self.settle(Outcome::ConnectionError { detail }).await;
        }
    }

    fn publish_presence(&self, events: Vec<PresenceEvent>) {
        for event in events {
            let _ = self.presence_tx.send(event);
        }
    }

    /// Merge one row change. Returns the published event, or `None` when
    /// the change was an echo of our own write or could not be read.
    pub async fn handle_change(&self, change: PostgresChange) -> Option<CellChangeEvent> {
        let acting_user = change.acting_user();
        if acting_user.is_some() && acting_user == self.user_id {
            tracing::trace!(version_id = %self.version_id, "Ignoring echo of own change");
            return None;
        }

        let Some(cell_id) = change.cell_id() else {
            tracing::warn!(version_id = %self.version_id, "Change without a cell id");
            return None;
        };

        let key = self.cells_key();
        let cell = match change.event_type {
            ChangeType::Insert | ChangeType::Update => {
                let Some(incoming) = change.new_cell() else {
                    tracing::warn!(%cell_id, "Change with unreadable record");
                    return None;
                };
                let upsert = change.event_type == ChangeType::Update;
                self.store.update(&key, |cells| {
                    match cells.iter_mut().find(|c| c.id == incoming.id) {
                        Some(existing) if upsert => *existing = incoming.clone(),
                        Some(_) => {}
                        None => cells.push(incoming.clone()),
                    }
                });
                Some(incoming)
            }
            ChangeType::Delete => {
                let removed = self
                    .store
                    .update(&key, |cells| {
                        let index = cells.iter().position(|c| c.id == cell_id)?;
                        Some(cells.remove(index))
                    })
                    .flatten();
                removed.or_else(|| change.old_cell())
            }
        };

        tracing::debug!(
            version_id = %self.version_id,
            %cell_id,
            event = ?change.event_type,
            user = ?acting_user,
            "Merged remote change"
        );

        if self.settings.notify_remote_changes {
            let field_name = cell
                .as_ref()
                .map(|c| c.field_name.clone())
                .unwrap_or_else(|| cell_id.to_string());
            self.settle(Outcome::RemoteChange { field_name, user_id: acting_user.clone() }).await;
        }

        let event = CellChangeEvent {
            event_type: change.event_type,
            cell_id,
            cell,
            user_id: acting_user,
        };
        let _ = self.change_tx.send(event.clone());
        Some(event)
    }
}

/// Live subscription to a version's channel
///
/// Dropping the handle stops the pump and closes the socket.
pub struct SubscriptionHandle {
    listener: Arc<RealtimeListener>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionHandle {
    pub fn listener(&self) -> &Arc<RealtimeListener> {
        &self.listener
    }

    pub fn status(&self) -> ChannelStatus {
        self.listener.status()
    }

    /// Tear down the current channel and open a fresh one
    pub fn reconnect(&self) {
        tracing::info!(version_id = %self.listener.version_id, "Reconnecting realtime channel");
        self.stop();
        self.start();
    }

    pub fn close(self) {
        drop(self);
    }

    fn start(&self) {
        let generation = self.listener.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let task = tokio::spawn(Arc::clone(&self.listener).run(generation));
        *self.pump.lock() = Some(task);
    }

    fn stop(&self) {
        self.listener.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }
        self.listener.transition(ChannelStatus::Closed);
        self.listener.presence.write().clear();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.stop();
        tracing::debug!(version_id = %self.listener.version_id, "Realtime subscription closed");
    }
}
