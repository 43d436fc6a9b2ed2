//! Operator notification channel with per-kind throttling.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::json;
use tracing::{error, warn};

use premia_config::AlertingConfig;

/// Where a notification should be delivered.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str);
}

/// Posts `{title, message}` JSON to a webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, title: &str, message: &str) {
        let payload = json!({ "title": title, "message": message });
        if let Err(err) = self.client.post(&self.url).json(&payload).send().await {
            error!(error = %err, "failed to deliver alert webhook");
        }
    }
}

/// Logs and drops.
#[derive(Default)]
pub struct NullNotifier;

#[async_trait::async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _title: &str, _message: &str) {}
}

/// Alert classes with independent throttle windows. Critical and trade
/// notifications are never suppressed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AlertKind {
    Startup,
    Feed,
    Broker,
    Trade,
    Critical,
}

pub struct AlertManager {
    notifier: Box<dyn Notifier>,
    config: AlertingConfig,
    last_sent: Mutex<HashMap<AlertKind, Instant>>,
}

impl AlertManager {
    #[must_use]
    pub fn new(config: AlertingConfig) -> Self {
        let notifier: Box<dyn Notifier> = match config.webhook_url.clone() {
            Some(url) if !url.trim().is_empty() => Box::new(WebhookNotifier::new(url)),
            _ => Box::new(NullNotifier),
        };
        Self {
            notifier,
            config,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_notifier(config: AlertingConfig, notifier: Box<dyn Notifier>) -> Self {
        Self {
            notifier,
            config,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn throttle_window(&self, kind: AlertKind) -> Option<Duration> {
        match kind {
            AlertKind::Startup => Some(Duration::from_secs(self.config.startup_throttle_secs)),
            AlertKind::Feed => Some(Duration::from_secs(self.config.feed_throttle_secs)),
            AlertKind::Broker => Some(Duration::from_secs(self.config.broker_throttle_secs)),
            AlertKind::Trade | AlertKind::Critical => None,
        }
    }

    /// Deliver an alert unless its kind is inside the throttle window.
    pub async fn notify(&self, kind: AlertKind, title: &str, message: &str) {
        if let Some(window) = self.throttle_window(kind) {
            let mut last = self.last_sent.lock().expect("alert throttle lock");
            let now = Instant::now();
            if let Some(sent) = last.get(&kind) {
                if now.duration_since(*sent) < window {
                    return;
                }
            }
            last.insert(kind, now);
        }
        warn!(%title, %message, "alert raised");
        self.notifier.notify(title, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingNotifier(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _title: &str, _message: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn throttles_per_kind_but_never_critical() {
        let sent = Arc::new(AtomicUsize::new(0));
        let manager = AlertManager::with_notifier(
            AlertingConfig::default(),
            Box::new(CountingNotifier(sent.clone())),
        );

        manager.notify(AlertKind::Feed, "failover", "a").await;
        manager.notify(AlertKind::Feed, "failover", "b").await;
        assert_eq!(sent.load(Ordering::SeqCst), 1, "feed alert throttled");

        manager.notify(AlertKind::Broker, "reject", "c").await;
        assert_eq!(sent.load(Ordering::SeqCst), 2, "kinds throttle separately");

        manager.notify(AlertKind::Critical, "naked", "d").await;
        manager.notify(AlertKind::Critical, "naked", "e").await;
        assert_eq!(sent.load(Ordering::SeqCst), 4, "critical never throttled");
    }
}
