//! # Writeback Notifications
//!
//! Transient toast messages for writeback outcomes, and the recovery policy
//! deciding which toast and which cache refresh every outcome gets.

pub mod policy;
pub mod toast;

use chrono::Utc;
use parking_lot::RwLock;
use crossbeam_channel::{Sender, Receiver, TrySendError, bounded};
use uuid::Uuid;

use planner_core::NotificationSettings;

pub use policy::{Decision, Outcome, RecoveryPolicy};
pub use toast::{Toast, ToastType};

/// Notification ID
pub type NotificationId = String;

/// Generate unique notification ID
pub fn new_id() -> NotificationId {
    Uuid::new_v4().to_string()
}

/// Events queued per subscriber before new ones are dropped
pub const EVENT_CAPACITY: usize = 64;

/// Notification event
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    /// Toast shown
    ToastShown(NotificationId),
    /// Toast closed, by the user, by eviction or by expiry
    ToastClosed(NotificationId),
}

/// Notification service
pub struct NotificationService {
    /// Active toasts, newest first
    toasts: RwLock<Vec<Toast>>,
    /// One bounded queue per subscriber
    subscribers: RwLock<Vec<Sender<NotificationEvent>>>,
    settings: NotificationSettings,
}

impl NotificationService {
    pub fn new(settings: NotificationSettings) -> Self {
        Self {
            toasts: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
            settings,
        }
    }

    /// Show the toast a policy decision asks for
    pub fn notify(&self, decision: &Decision) -> NotificationId {
        self.show(decision.severity, &decision.message)
    }

    fn show(&self, toast_type: ToastType, message: &str) -> NotificationId {
        let toast = Toast::new(toast_type, message)
            .with_timeout(toast_type.timeout_ms(&self.settings));
        self.show_toast(toast)
    }

    /// Show custom toast
    pub fn show_toast(&self, toast: Toast) -> NotificationId {
        let id = toast.id.clone();
        tracing::debug!(kind = ?toast.toast_type, message = %toast.message, "Toast shown");

        let mut toasts = self.toasts.write();

        // Remove old toasts if over limit
        while toasts.len() >= self.settings.max_toasts.max(1) {
            if let Some(old) = toasts.pop() {
                self.emit(NotificationEvent::ToastClosed(old.id));
            }
        }

        toasts.insert(0, toast);
        self.emit(NotificationEvent::ToastShown(id.clone()));
        id
    }

    /// Close toast
    pub fn close_toast(&self, id: &str) {
        let mut toasts = self.toasts.write();
        if let Some(pos) = toasts.iter().position(|t| t.id == id) {
            toasts.remove(pos);
            self.emit(NotificationEvent::ToastClosed(id.to_string()));
        }
    }

    /// Drop toasts whose display duration has elapsed. Returns how many closed.
    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let mut toasts = self.toasts.write();
        let mut closed = Vec::new();
        toasts.retain(|t| {
            let expired = t.is_expired(now);
            if expired {
                closed.push(t.id.clone());
            }
            !expired
        });
        drop(toasts);

        let count = closed.len();
        for id in closed {
            self.emit(NotificationEvent::ToastClosed(id));
        }
        count
    }

    /// Get active toasts
    pub fn toasts(&self) -> Vec<Toast> {
        self.toasts.read().clone()
    }

    /// Subscribe to events.
    ///
    /// Each receiver gets its own queue of `EVENT_CAPACITY` events. A full
    /// queue drops new events; a dropped receiver is forgotten on the next send.
    pub fn subscribe(&self) -> Receiver<NotificationEvent> {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        self.subscribers.write().push(tx);
        rx
    }

    fn emit(&self, event: NotificationEvent) {
        self.subscribers.write().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(?event, "Notification subscriber lagging, event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new(NotificationSettings::default())
    }
}
