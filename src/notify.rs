use std::fmt::{self, Display};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Lifecycle event classes pushed to a [`NotificationSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Starting,
    Started,
    Stopping,
    Stopped,
    Crashed,
    UpdateAvailable,
    UpdateSkipped,
    UpdateApplied,
    UpdateFailed,
    BackupCompleted,
    BackupFailed,
    /// Crash-retry budget exhausted; the server stays down until a human
    /// intervenes.
    CrashLoopHalted,
}

/// One lifecycle event with a human-readable detail string.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: NotificationKind,
    pub detail: String,
}

impl Notification {
    pub fn new<S: Into<String>>(kind: NotificationKind, detail: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            detail: detail.into(),
        }
    }
}

impl Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

/// Receives lifecycle events, at most once each, fire-and-forget.
///
/// Implementations must never let delivery failure surface to the caller;
/// the orchestrator's state machine does not depend on any sink.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Sink that forwards events to the tracing subscriber.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Crashed
            | NotificationKind::UpdateFailed
            | NotificationKind::BackupFailed
            | NotificationKind::CrashLoopHalted => {
                error!(kind = ?notification.kind, "{}", notification.detail)
            }
            NotificationKind::UpdateSkipped | NotificationKind::UpdateAvailable => {
                warn!(kind = ?notification.kind, "{}", notification.detail)
            }
            _ => info!(kind = ?notification.kind, "{}", notification.detail),
        }
    }
}

/// Sink that fans events out over a tokio broadcast channel.
///
/// Chat-bot and UI bridges subscribe here and talk back only by submitting
/// triggers; they never reach into the supervisor or backup manager.
#[derive(Debug)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::Sender::new(capacity),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn notify(&self, notification: Notification) {
        // No receivers is fine; delivery is best-effort.
        let _ = self.tx.send(notification);
    }
}
