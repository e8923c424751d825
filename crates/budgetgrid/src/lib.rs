//! # Budgetgrid
//!
//! One planning session per budget version: the cell cache, optimistic
//! writeback, cell locks, toasts and the realtime channel, wired together
//! from `PlannerSettings`.

use std::sync::Arc;
use anyhow::Result;
use futures::FutureExt;
use tokio::sync::broadcast;

use cell_store::{CellStore, StoreEvent};
use notifications::NotificationService;
use planner_core::{BatchSessionId, CacheKey, Cell, CellId, CellUpdate, CellValue, PlannerSettings, UserId, VersionId};
use realtime::{CellChangeEvent, ChannelStatus, RealtimeListener, RealtimeTransport, SubscriptionHandle, WsTransport};
use writeback::{
    BatchOutcome, CellUpdateResponse, HttpWritebackApi, LockController, LockResponse, WritebackApi,
    WritebackContext, WritebackEngine, WritebackError,
};

pub use planner_core;
pub use writeback;
pub use realtime;

/// Everything needed to edit one budget version
pub struct PlanningSession {
    version_id: VersionId,
    store: Arc<CellStore>,
    notifications: Arc<NotificationService>,
    context: Arc<WritebackContext>,
    engine: WritebackEngine,
    locks: LockController,
    listener: Option<Arc<RealtimeListener>>,
    subscription: Option<SubscriptionHandle>,
}

impl PlanningSession {
    /// Open a session against the configured HTTP and WebSocket endpoints
    pub fn open(settings: &PlannerSettings, version_id: VersionId, user_id: Option<UserId>) -> Result<Self> {
        let api: Arc<dyn WritebackApi> = Arc::new(HttpWritebackApi::new(&settings.api)?);
        let transport: Option<Arc<dyn RealtimeTransport>> = if settings.realtime.enabled {
            Some(Arc::new(WsTransport::new(settings.realtime.clone())))
        } else {
            None
        };
        Ok(Self::with_backends(settings, version_id, user_id, api, transport))
    }

    /// Open a session over caller-supplied backends
    pub fn with_backends(
        settings: &PlannerSettings,
        version_id: VersionId,
        user_id: Option<UserId>,
        api: Arc<dyn WritebackApi>,
        transport: Option<Arc<dyn RealtimeTransport>>,
    ) -> Self {
        let store = Arc::new(CellStore::new());
        let notifications = Arc::new(NotificationService::new(settings.notifications.clone()));

        let mut context = WritebackContext::new(version_id.clone(), api, store.clone(), notifications.clone());
        if let Some(user_id) = &user_id {
            context = context.with_user(user_id.clone());
        }
        let context = Arc::new(context);

        let listener = transport.map(|transport| {
            let resync_ctx = context.clone();
            let mut listener = RealtimeListener::new(
                version_id.clone(),
                settings.realtime.clone(),
                transport,
                store.clone(),
                notifications.clone(),
            )
            .with_resync(Arc::new(move || {
                let ctx = resync_ctx.clone();
                async move {
                    ctx.refetch_cells().await;
                }
                .boxed()
            }));
            if let Some(user_id) = &user_id {
                listener = listener.with_user(user_id.clone());
            }
            Arc::new(listener)
        });

        tracing::info!(%version_id, realtime = listener.is_some(), "Planning session opened");

        Self {
            version_id,
            store,
            notifications,
            engine: WritebackEngine::new(context.clone()),
            locks: LockController::new(context.clone()),
            context,
            listener,
            subscription: None,
        }
    }

    pub fn version_id(&self) -> &VersionId {
        &self.version_id
    }

    pub fn store(&self) -> &Arc<CellStore> {
        &self.store
    }

    pub fn notifications(&self) -> &Arc<NotificationService> {
        &self.notifications
    }

    pub fn engine(&self) -> &WritebackEngine {
        &self.engine
    }

    pub fn locks(&self) -> &LockController {
        &self.locks
    }

    /// Load the version's cells. Returns whether the result landed in the cache.
    pub async fn load(&self) -> std::result::Result<bool, WritebackError> {
        self.store
            .refetch_cells(&self.version_id, self.context.api().as_ref())
            .await
    }

    /// Start listening for other users' changes. No-op without a transport
    /// or when already started.
    pub fn start_realtime(&mut self) {
        if self.subscription.is_some() {
            return;
        }
        if let Some(listener) = &self.listener {
            self.subscription = Some(listener.connect());
        }
    }

    /// Tear down and reopen the realtime channel
    pub fn reconnect_realtime(&mut self) {
        match &self.subscription {
            Some(subscription) => subscription.reconnect(),
            None => self.start_realtime(),
        }
    }

    pub fn realtime_status(&self) -> ChannelStatus {
        self.listener.as_ref().map_or(ChannelStatus::Idle, |l| l.status())
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.listener.as_ref().map(|l| l.online_users()).unwrap_or_default()
    }

    /// Merged remote changes, when realtime is configured
    pub fn subscribe_changes(&self) -> Option<broadcast::Receiver<CellChangeEvent>> {
        self.listener.as_ref().map(|l| l.subscribe())
    }

    pub fn subscribe_store(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn cells(&self) -> Vec<Cell> {
        self.store.get(&CacheKey::cells(self.version_id.clone())).unwrap_or_default()
    }

    pub fn cell(&self, cell_id: &CellId) -> Option<Cell> {
        self.store.cell(&CacheKey::cells(self.version_id.clone()), cell_id)
    }

    pub async fn update_cell(
        &self,
        cell_id: &CellId,
        value: impl Into<CellValue>,
        expected_version: i64,
    ) -> std::result::Result<CellUpdateResponse, WritebackError> {
        self.engine.update_cell(cell_id, value.into(), expected_version).await
    }

    pub async fn batch_update(&self, updates: Vec<CellUpdate>) -> std::result::Result<BatchOutcome, WritebackError> {
        self.engine.batch_update(BatchSessionId::new(), updates).await
    }

    pub async fn lock_cell(
        &self,
        cell_id: &CellId,
        reason: Option<String>,
    ) -> std::result::Result<LockResponse, WritebackError> {
        self.locks.lock_cell(cell_id, reason).await
    }

    pub async fn unlock_cell(
        &self,
        cell_id: &CellId,
        reason: Option<String>,
    ) -> std::result::Result<LockResponse, WritebackError> {
        self.locks.unlock_cell(cell_id, reason).await
    }

    /// Stop realtime and drop this version's cache entries
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.close();
        }
        self.store.clear_version(&self.version_id);
    }
}

impl Drop for PlanningSession {
    fn drop(&mut self) {
        self.shutdown();
        tracing::debug!(version_id = %self.version_id, "Planning session closed");
    }
}

/// Load settings, install logging and open a session over HTTP
pub fn bootstrap(version_id: VersionId, user_id: Option<UserId>) -> Result<PlanningSession> {
    let settings = PlannerSettings::load_or_default()?;
    telemetry::init(&settings.telemetry)?;
    PlanningSession::open(&settings, version_id, user_id)
}
