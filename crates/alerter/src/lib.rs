//! User-facing notification dispatch.
//!
//! Notifications are fire-and-forget so they can never block or fail the
//! trading path: each send spawns a task that persists the row and mirrors
//! it to connected UIs through the outbound hub. Either half failing is
//! logged and tolerated.

use chrono::Utc;
use database::DbRepository;
use events::{NotificationLevel, PushMessage};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Fan-out handle for everything pushed to end-user UIs.
///
/// The WebSocket gateway subscribes here and routes messages to sockets;
/// the engine only ever writes.
#[derive(Clone)]
pub struct OutboundHub {
    tx: broadcast::Sender<PushMessage>,
}

impl OutboundHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.tx.subscribe()
    }

    /// Pushes one message; having no connected gateway is not an error.
    pub fn push(&self, message: PushMessage) {
        let _ = self.tx.send(message);
    }
}

/// High-level notification dispatcher shared by every bot.
#[derive(Clone)]
pub struct NotificationService {
    repo: Option<DbRepository>,
    hub: Arc<OutboundHub>,
}

impl NotificationService {
    pub fn new(repo: Option<DbRepository>, hub: Arc<OutboundHub>) -> Self {
        if repo.is_none() {
            tracing::warn!("notification persistence disabled (no repository wired)");
        }
        Self { repo, hub }
    }

    /// Sends a notification to one user without blocking the caller.
    pub fn send(
        &self,
        user_id: i64,
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        data: Option<JsonValue>,
    ) {
        let title = title.into();
        let message = message.into();
        let repo = self.repo.clone();
        let hub = Arc::clone(&self.hub);

        tokio::spawn(async move {
            if let Some(repo) = repo {
                let level_str = serde_json::to_value(level)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "info".to_string());
                if let Err(e) = repo
                    .insert_notification(user_id, &level_str, &title, &message, data)
                    .await
                {
                    tracing::error!(user_id, error = %e, "failed to persist notification");
                }
            }

            hub.push(PushMessage::Notification {
                user_id,
                level,
                title,
                message,
                time: Utc::now(),
            });
        });
    }

    /// Broadcasts a process-wide alert to every connected client.
    pub fn system_alert(&self, level: NotificationLevel, message: impl Into<String>) {
        self.hub.push(PushMessage::SystemAlert {
            level,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_repository_still_reaches_the_hub() {
        let hub = Arc::new(OutboundHub::new(16));
        let mut rx = hub.subscribe();
        let service = NotificationService::new(None, Arc::clone(&hub));

        service.send(
            7,
            NotificationLevel::Warning,
            "Stop-loss fired",
            "position closed",
            None,
        );

        match rx.recv().await.unwrap() {
            PushMessage::Notification {
                user_id,
                level,
                title,
                ..
            } => {
                assert_eq!(user_id, 7);
                assert_eq!(level, NotificationLevel::Warning);
                assert_eq!(title, "Stop-loss fired");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn system_alerts_are_broadcast() {
        let hub = Arc::new(OutboundHub::new(16));
        let mut rx_a = hub.subscribe();
        let mut rx_b = hub.subscribe();
        let service = NotificationService::new(None, Arc::clone(&hub));

        service.system_alert(NotificationLevel::Critical, "global halt engaged");

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                PushMessage::SystemAlert { level, message } => {
                    assert_eq!(level, NotificationLevel::Critical);
                    assert_eq!(message, "global halt engaged");
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }
}
