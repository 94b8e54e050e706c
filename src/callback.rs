use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::config::CallbackConfig;
use crate::payload::CallbackPayload;

/// Delivers payloads to the webhook with bounded retries.
///
/// The HTTP client is created by [`start`](Self::start) and released by
/// [`stop`](Self::stop); both are idempotent.
pub struct CallbackDispatcher {
    url: String,
    timeout: Duration,
    retries: u32,
    backoff_unit: Duration,
    client: RwLock<Option<reqwest::Client>>,
}

impl CallbackDispatcher {
    pub fn new(config: &CallbackConfig) -> Self {
        Self {
            url: config.url.clone(),
            timeout: config.timeout(),
            retries: config.retries.max(1),
            backoff_unit: config.backoff_unit(),
            client: RwLock::new(None),
        }
    }

    pub async fn start(&self) {
        let mut client = self.client.write().await;
        if client.is_none() {
            *client = Some(reqwest::Client::new());
            debug!("Callback HTTP client started");
        }
    }

    pub async fn stop(&self) {
        if self.client.write().await.take().is_some() {
            debug!("Callback HTTP client closed");
        }
    }

    /// Delay before the retry that follows attempt `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Send one payload. Returns `true` once the webhook answers 200.
    pub async fn deliver(&self, payload: &CallbackPayload) -> bool {
        let Some(client) = self.client.read().await.clone() else {
            error!("Callback dispatcher not started; dropping payload");
            return false;
        };

        let id = payload.diagnostic_id();
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to serialize payload for message {}: {}", id, e);
                return false;
            }
        };

        for attempt in 0..self.retries {
            let n = attempt + 1;
            let result = client
                .post(&self.url)
                .header(CONTENT_TYPE, "application/json")
                .timeout(self.timeout)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status() == StatusCode::OK => {
                    debug!("Callback sent successfully for message {}", id);
                    return true;
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let preview: String = text.chars().take(200).collect();
                    warn!(
                        "Callback failed (attempt {}/{}): HTTP {} - {}",
                        n, self.retries, status, preview
                    );
                }
                Err(e) if e.is_timeout() => {
                    warn!("Callback timeout (attempt {}/{})", n, self.retries);
                }
                Err(e) => {
                    warn!("Callback error (attempt {}/{}): {}", n, self.retries, e);
                }
            }

            if n < self.retries {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }

        error!(
            "Failed to send callback for message {} after {} attempts",
            id, self.retries
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::build_single;
    use crate::testing::{text_message, CaptureWebhook};
    use std::time::Instant;

    fn config(url: String, retries: u32) -> CallbackConfig {
        CallbackConfig {
            url,
            timeout_secs: 5,
            retries,
            backoff_unit_ms: 20,
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let dispatcher = CallbackDispatcher::new(&config("http://unused".to_string(), 3));
        assert_eq!(dispatcher.backoff_delay(0), Duration::from_millis(20));
        assert_eq!(dispatcher.backoff_delay(1), Duration::from_millis(40));
        assert_eq!(dispatcher.backoff_delay(2), Duration::from_millis(80));
        assert!(dispatcher.backoff_delay(1) > dispatcher.backoff_delay(0));
    }

    #[tokio::test]
    async fn test_deliver_before_start_fails() {
        let hook = CaptureWebhook::spawn(0).await;
        let dispatcher = CallbackDispatcher::new(&config(hook.url(), 3));

        let payload = build_single(&text_message(1, "hi"), None);
        assert!(!dispatcher.deliver(&payload).await);
        assert_eq!(hook.hits(), 0);
    }

    #[tokio::test]
    async fn test_deliver_first_attempt() {
        let hook = CaptureWebhook::spawn(0).await;
        let dispatcher = CallbackDispatcher::new(&config(hook.url(), 3));
        dispatcher.start().await;

        let payload = build_single(&text_message(7, "hi"), None);
        assert!(dispatcher.deliver(&payload).await);
        assert_eq!(hook.hits(), 1);

        let received = hook.payloads();
        assert_eq!(received[0]["message_id"], 7);
        assert_eq!(received[0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let hook = CaptureWebhook::spawn(2).await;
        let dispatcher = CallbackDispatcher::new(&config(hook.url(), 3));
        dispatcher.start().await;

        let started = Instant::now();
        let payload = build_single(&text_message(1, "retry me"), None);
        assert!(dispatcher.deliver(&payload).await);

        assert_eq!(hook.hits(), 3);
        assert_eq!(hook.payloads().len(), 1);
        // 20ms after the first failure, 40ms after the second
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let hook = CaptureWebhook::spawn(10).await;
        let dispatcher = CallbackDispatcher::new(&config(hook.url(), 2));
        dispatcher.start().await;

        let started = Instant::now();
        let payload = build_single(&text_message(1, "lost"), None);
        assert!(!dispatcher.deliver(&payload).await);

        assert_eq!(hook.hits(), 2);
        // Only one backoff: none after the final attempt
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_connection_error_is_not_fatal() {
        // Nothing listens on this port once the probe listener is dropped.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        drop(listener);

        let dispatcher = CallbackDispatcher::new(&config(url, 2));
        dispatcher.start().await;
        let payload = build_single(&text_message(1, "nobody home"), None);
        assert!(!dispatcher.deliver(&payload).await);
    }

    #[tokio::test]
    async fn test_stop_releases_client() {
        let hook = CaptureWebhook::spawn(0).await;
        let dispatcher = CallbackDispatcher::new(&config(hook.url(), 1));
        dispatcher.start().await;
        dispatcher.start().await;
        dispatcher.stop().await;
        dispatcher.stop().await;

        let payload = build_single(&text_message(1, "late"), None);
        assert!(!dispatcher.deliver(&payload).await);
        assert_eq!(hook.hits(), 0);
    }
}
