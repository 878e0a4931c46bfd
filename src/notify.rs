//! Operator notifications.
//!
//! Delivery is best effort. The optimizer fires and forgets; a failing sink is
//! logged at `warn` and never affects a transition.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub level: NotificationLevel,
}

impl Notification {
    pub fn info(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            level: NotificationLevel::Info,
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the structured log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn send(&self, n: Notification) -> anyhow::Result<()> {
        match n.level {
            NotificationLevel::Info => info!(title = %n.title, level = %n.level, "{}", n.body),
            NotificationLevel::Warning => warn!(title = %n.title, level = %n.level, "{}", n.body),
            NotificationLevel::Critical => error!(title = %n.title, level = %n.level, "{}", n.body),
        }
        Ok(())
    }
}

/// Keeps every notification in memory; used by tests and the simulator.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn send(&self, n: Notification) -> anyhow::Result<()> {
        self.sent.lock().push(n);
        Ok(())
    }
}

/// Send and swallow failures.
pub async fn notify_best_effort(sink: &dyn NotificationSink, notification: Notification) {
    let title = notification.title.clone();
    if let Err(e) = sink.send(notification).await {
        warn!(title = %title, error = %e, "notification delivery failed");
    }
}
