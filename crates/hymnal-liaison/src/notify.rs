//! User-facing notifications.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};

/// Identifier of a raised notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(u64);

impl NotificationId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Offline,
    Online,
    UpdateAvailable,
    InstallAvailable,
    InstallInstructions,
    Installed,
}

/// How long a notification stays up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLifetime {
    /// Until dismissed.
    Persistent,
    /// Auto-dismissed after the duration.
    Timed(Duration),
}

/// Button attached to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    Install,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    pub lifetime: NotificationLifetime,
    pub action: Option<NotificationAction>,
}

impl Notification {
    pub fn timed(kind: NotificationKind, message: &str, lifetime: Duration) -> Self {
        Self {
            kind,
            message: message.to_string(),
            lifetime: NotificationLifetime::Timed(lifetime),
            action: None,
        }
    }

    pub fn persistent(kind: NotificationKind, message: &str, action: NotificationAction) -> Self {
        Self {
            kind,
            message: message.to_string(),
            lifetime: NotificationLifetime::Persistent,
            action: Some(action),
        }
    }
}

/// Surface that shows notifications to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification) -> NotificationId;
    fn dismiss(&self, id: NotificationId);
}

/// Notifier that only writes to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) -> NotificationId {
        let id = NotificationId::new();
        info!(
            id = id.raw(),
            kind = ?notification.kind,
            lifetime = ?notification.lifetime,
            action = ?notification.action,
            "{}",
            notification.message
        );
        id
    }

    fn dismiss(&self, id: NotificationId) {
        debug!(id = id.raw(), "Notification dismissed");
    }
}
