//! State shared by the mutation engine and the lock controller

use std::sync::Arc;

use cell_store::CellStore;
use notifications::{Decision, NotificationService, Outcome, RecoveryPolicy};
use planner_core::{CacheKey, UserId, VersionId};

use crate::api::WritebackApi;

/// Everything a writeback operation on one budget version touches
pub struct WritebackContext {
    version_id: VersionId,
    user_id: Option<UserId>,
    api: Arc<dyn WritebackApi>,
    store: Arc<CellStore>,
    notifications: Arc<NotificationService>,
    policy: RecoveryPolicy,
}

impl WritebackContext {
    pub fn new(
        version_id: VersionId,
        api: Arc<dyn WritebackApi>,
        store: Arc<CellStore>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        Self {
            version_id,
            user_id: None,
            api,
            store,
            notifications,
            policy: RecoveryPolicy,
        }
    }

    /// Identity recorded as `modified_by` on optimistic predictions
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn version_id(&self) -> &VersionId {
        &self.version_id
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn api(&self) -> &Arc<dyn WritebackApi> {
        &self.api
    }

    pub fn store(&self) -> &Arc<CellStore> {
        &self.store
    }

    pub fn notifications(&self) -> &Arc<NotificationService> {
        &self.notifications
    }

    pub fn cells_key(&self) -> CacheKey {
        CacheKey::cells(self.version_id.clone())
    }

    pub fn changes_key(&self) -> CacheKey {
        CacheKey::cell_changes(self.version_id.clone())
    }

    /// Reload this version's cells. Failures are logged, not returned.
    pub async fn refetch_cells(&self) -> bool {
        match self.store.refetch_cells(&self.version_id, self.api.as_ref()).await {
            Ok(applied) => applied,
            Err(e) => {
                tracing::warn!(version_id = %self.version_id, error = %e, "Refetch of cells failed");
                false
            }
        }
    }

    /// Run the recovery policy for an outcome: one toast, then the cache
    /// invalidations and refetch it calls for.
    pub async fn settle(&self, outcome: Outcome) -> Decision {
        let decision = self.policy.decide(&outcome);
        self.notifications.notify(&decision);

        if decision.invalidate_changes {
            self.store.invalidate(&self.changes_key());
        }
        if decision.invalidate_cells {
            self.store.invalidate(&self.cells_key());
        }
        if decision.refetch_cells {
            self.refetch_cells().await;
        }
        decision
    }
}
