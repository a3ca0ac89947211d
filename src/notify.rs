// SPDX-License-Identifier: MIT
//! Outbound notification channel.
//!
//! Delivers human-readable alerts to the responsible humans. Strictly
//! best-effort: a delivery failure is logged and swallowed — it must never
//! roll back or retry a remediation or kill decision.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Best-effort notification sink. Implementations swallow their own errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

/// POSTs `{subject, body}` as JSON to a configured webhook URL.
///
/// With no URL configured, notifications are logged at INFO and dropped —
/// useful for local runs and required for tests.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        let Some(url) = &self.url else {
            info!(subject, "notification (no webhook configured)");
            return;
        };
        let payload = serde_json::json!({ "subject": subject, "body": body });
        let send = self.client.post(url).json(&payload).timeout(SEND_TIMEOUT).send();
        match send.await {
            Ok(resp) if resp.status().is_success() => {
                info!(subject, "notification delivered");
            }
            Ok(resp) => {
                warn!(subject, status = %resp.status(), "notification rejected — dropped");
            }
            Err(e) => {
                warn!(subject, err = %e, "notification send failed — dropped");
            }
        }
    }
}

/// Test support — a notifier that records instead of delivering.
/// Kept out of `#[cfg(test)]` so integration tests can use it.
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every notification for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, subject: &str, body: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), body.to_string()));
        }
    }

    impl RecordingNotifier {
        pub fn subjects(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
        }
    }
}
