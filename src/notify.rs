//! Push notifications.
//!
//! Delivery is best-effort. A notification is dispatched only after the
//! visit change it describes has committed, and a failed or slow delivery
//! never reaches the caller: it is logged and counted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Who receives a notification: a user account, or whoever is linked to a
/// care recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyTarget {
    #[serde(rename = "targetUserId")]
    User(String),
    #[serde(rename = "targetElderId")]
    Elder(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(flatten)]
    pub target: NotifyTarget,
    pub title: String,
    pub body: String,
    /// Routing payload for the receiving app (`type`, `visit_id`, ...).
    #[serde(default)]
    pub data: Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Posts notifications to a push-notification endpoint.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: &str, api_key: &SecretString, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
            .map_err(|_| Error::Config("notification key is not a valid header value".into()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let response = self.client.post(&self.url).json(notification).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::from_status(status.as_u16(), body))
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            target_party = ?notification.target,
            title = %notification.title,
            "notification"
        );
        Ok(())
    }
}

/// Fire-and-forget delivery on background tasks.
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self {
            notifier,
            timeout,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn delivery and return immediately. Must be called from within a
    /// tokio runtime.
    pub fn dispatch(&self, notification: Notification) {
        let notifier = Arc::clone(&self.notifier);
        let timeout = self.timeout;

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let result = match tokio::time::timeout(timeout, notifier.send(&notification)).await {
                Ok(Ok(())) => {
                    debug!(target_party = ?notification.target, "notification delivered");
                    "ok"
                }
                Ok(Err(e)) => {
                    warn!(target_party = ?notification.target, error = %e, "notification failed");
                    "error"
                }
                Err(_) => {
                    warn!(
                        target_party = ?notification.target,
                        timeout_ms = timeout.as_millis() as u64,
                        "notification timed out"
                    );
                    "timeout"
                }
            };
            metrics::notifications().add(1, &[KeyValue::new("result", result)]);
        });
    }

    /// Wait for every delivery dispatched so far to settle.
    pub async fn flush(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        while tasks.join_next().await.is_some() {}
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
