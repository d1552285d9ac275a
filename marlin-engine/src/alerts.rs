//! Operator alerting over a webhook, mirrored to the log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::json;
use tracing::{error, warn};

/// Sends operator alerts to an optional webhook. Delivery failures are
/// logged, never propagated; alerting must not take the engine down.
#[derive(Clone)]
pub struct AlertDispatcher {
    client: Client,
    webhook: Option<String>,
}

impl AlertDispatcher {
    #[must_use]
    pub fn new(webhook: Option<String>) -> Self {
        Self {
            client: Client::new(),
            webhook: sanitize_webhook(webhook),
        }
    }

    pub async fn notify(&self, title: &str, message: &str) {
        warn!(%title, %message, "alert raised");
        let Some(url) = self.webhook.as_ref() else {
            return;
        };
        let payload = json!({ "title": title, "message": message });
        if let Err(err) = self.client.post(url).json(&payload).send().await {
            error!(error = %err, "failed to deliver alert webhook");
        }
    }
}

pub fn sanitize_webhook(input: Option<String>) -> Option<String> {
    input.and_then(|value| {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

/// Latched dead-feed detector. The runtime's watchdog loop polls
/// [`FeedWatchdog::stalled`]; price loops call [`FeedWatchdog::heartbeat`]
/// whenever the venue answers.
pub struct FeedWatchdog {
    max_gap: Duration,
    last_data: Mutex<Instant>,
    alerted: AtomicBool,
}

impl FeedWatchdog {
    /// A zero `max_gap` disables the watchdog entirely.
    #[must_use]
    pub fn new(max_gap: Duration) -> Self {
        Self {
            max_gap,
            last_data: Mutex::new(Instant::now()),
            alerted: AtomicBool::new(false),
        }
    }

    pub fn heartbeat(&self) {
        let mut last = self.last_data.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
        self.alerted.store(false, Ordering::SeqCst);
    }

    /// True exactly once per stall; re-arms on the next heartbeat.
    #[must_use]
    pub fn stalled(&self) -> bool {
        if self.max_gap.is_zero() {
            return false;
        }
        let last = *self.last_data.lock().unwrap_or_else(|e| e.into_inner());
        if last.elapsed() < self.max_gap {
            return false;
        }
        !self.alerted.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_rejects_blank_urls() {
        assert_eq!(sanitize_webhook(None), None);
        assert_eq!(sanitize_webhook(Some("   ".into())), None);
        assert_eq!(
            sanitize_webhook(Some(" https://hooks.example.com/x ".into())),
            Some("https://hooks.example.com/x".into())
        );
    }

    #[test]
    fn zero_gap_disables_watchdog() {
        let watchdog = FeedWatchdog::new(Duration::ZERO);
        assert!(!watchdog.stalled());
    }

    #[tokio::test]
    async fn stall_fires_once_and_rearms_on_heartbeat() {
        let watchdog = FeedWatchdog::new(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(watchdog.stalled());
        assert!(!watchdog.stalled());

        watchdog.heartbeat();
        assert!(!watchdog.stalled());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(watchdog.stalled());
    }
}
