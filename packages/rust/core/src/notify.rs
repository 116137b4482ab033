//! Task outcome notifications.
//!
//! Delivery is fire-and-forget: [`dispatch`] spawns the send, logs a failed
//! delivery and never retries, so a slow or broken notifier cannot hold up
//! the scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use citeflow_shared::{CiteflowError, NotificationSettings, Result, USER_AGENT};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Success,
    Failure,
    /// The task hit its failure threshold and was disabled.
    CriticalFailure,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::CriticalFailure => "critical_failure",
        }
    }
}

/// One task outcome event.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub task_id: String,
    pub status: NotificationStatus,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        task_id: impl Into<String>,
        status: NotificationStatus,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Send `notification` in the background.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification).await {
            warn!(
                task_id = %notification.task_id,
                status = notification.status.as_str(),
                error = %e,
                "notification delivery failed"
            );
        }
    });
}

/// Build the notifier described by `[notifications]`: always logs, and also
/// posts to the webhook when one is configured.
pub fn from_settings(settings: &NotificationSettings) -> Result<Arc<dyn Notifier>> {
    match &settings.webhook_url {
        Some(hook) => {
            let url = Url::parse(hook).map_err(|e| {
                CiteflowError::config(format!("notifications.webhook_url '{hook}': {e}"))
            })?;
            let webhook = WebhookNotifier::new(url, Duration::from_secs(settings.timeout_secs))?;
            let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier), Arc::new(webhook)];
            Ok(Arc::new(FanoutNotifier::new(notifiers)))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Emits notifications as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        match n.status {
            NotificationStatus::Success => {
                info!(task_id = %n.task_id, payload = %n.payload, "task succeeded")
            }
            NotificationStatus::Failure => {
                warn!(task_id = %n.task_id, payload = %n.payload, "task failed")
            }
            NotificationStatus::CriticalFailure => {
                error!(task_id = %n.task_id, payload = %n.payload, "task disabled after repeated failures")
            }
        }
        Ok(())
    }
}

/// POSTs each notification as JSON.
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| CiteflowError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        let response = self
            .client
            .post(self.url.as_str())
            .json(n)
            .send()
            .await
            .map_err(|e| CiteflowError::Network(format!("webhook {}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CiteflowError::Network(format!(
                "webhook {} answered {status}",
                self.url
            )));
        }
        debug!(task_id = %n.task_id, url = %self.url, "webhook notified");
        Ok(())
    }
}

/// Delivers to every inner notifier; fails if any of them fails.
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let mut first_error = None;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(notification).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Keeps every notification in memory.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    seen: std::sync::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn statuses(&self) -> Vec<NotificationStatus> {
        self.seen.lock().unwrap().iter().map(|n| n.status).collect()
    }

    pub(crate) fn count(&self, status: NotificationStatus) -> usize {
        self.statuses().into_iter().filter(|s| *s == status).count()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.seen.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
