use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{QueueKind, Storage};

const POST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Safety margin added on top of whatever the rate-limit headers ask for.
const RATE_LIMIT_MARGIN_MS: u64 = 1_000;

/// Transient-failure backoff: 1s, 2s, 4s, ... capped at 60s.
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 60;

/// Must outlast the longest 429 reset the receiving platform may send.
const SEND_LOCK_TTL_SECS: i64 = 900;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookType {
    #[default]
    #[serde(rename = "discord-compatible")]
    DiscordCompatible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: u64,
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default, rename = "type")]
    pub webhook_type: WebhookType,
    #[serde(default)]
    pub notes: String,
}

impl Webhook {
    /// Config-time validation; rejected webhooks never reach the sender.
    pub fn validate(&self) -> Result<(), url::ParseError> {
        url::Url::parse(&self.url).map(|_| ())
    }
}

/// Everything the sender needs from an HTTP response, already picked out of
/// the provider's rate-limit protocol.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    /// `retry_after` from a 429 body, in milliseconds.
    pub retry_after_ms: Option<u64>,
    /// `X-RateLimit-Remaining` header.
    pub rate_limit_remaining: Option<u32>,
    /// `X-RateLimit-Reset-After` header, in seconds.
    pub rate_limit_reset_after: Option<f64>,
}

/// Seam between the sender algorithm and the network, so the delivery state
/// machine is testable without sockets.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        body: &str,
    ) -> Result<TransportResponse, Box<dyn Error + Send + Sync>>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        body: &str,
    ) -> Result<TransportResponse, Box<dyn Error + Send + Sync>> {
        let response = self
            .client
            .post(url)
            .timeout(POST_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status().as_u16();
        let rate_limit_remaining = header_value(&response, "X-RateLimit-Remaining");
        let rate_limit_reset_after = header_value(&response, "X-RateLimit-Reset-After");
        let retry_after_ms = if status == 429 {
            response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("retry_after").and_then(|v| v.as_u64()))
        } else {
            None
        };

        Ok(TransportResponse {
            status,
            retry_after_ms,
            rate_limit_remaining,
            rate_limit_reset_after,
        })
    }
}

fn header_value<T: std::str::FromStr>(response: &reqwest::Response, name: &str) -> Option<T> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queue drained, or the webhook is disabled or unknown.
    Idle,
    /// Another sender task holds this webhook's lock.
    AlreadyRunning,
    /// Rate limited; run again at the given instant.
    Blocked(DateTime<Utc>),
    /// Transient failure; run again after the given delay.
    RetryAfter(std::time::Duration),
}

/// Drains webhook queues against the provider's rate-limit protocol.
/// Single-flight per webhook: concurrent invocations for the same webhook
/// bail out on the shared `send:{id}` lock.
pub struct WebhookSender<T: WebhookTransport + ?Sized> {
    transport: std::sync::Arc<T>,
    backoff_counters: Mutex<HashMap<u64, u32>>,
}

impl<T: WebhookTransport + ?Sized> WebhookSender<T> {
    pub fn new(transport: std::sync::Arc<T>) -> Self {
        WebhookSender {
            transport,
            backoff_counters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn send_queued(&self, storage: &Storage, webhook_id: u64) -> SendOutcome {
        let webhook = match storage.webhook(webhook_id).await {
            Ok(Some(webhook)) => webhook,
            Ok(None) => {
                warn!("Webhook {} does not exist", webhook_id);
                return SendOutcome::Idle;
            }
            Err(e) => {
                warn!("Failed to load webhook {}: {}", webhook_id, e);
                return SendOutcome::Idle;
            }
        };
        if !webhook.is_enabled {
            debug!("Webhook {} is disabled", webhook_id);
            return SendOutcome::Idle;
        }

        let lock_name = format!("send:{}", webhook_id);
        let Some(_lock) = storage
            .try_lock(&lock_name, Duration::seconds(SEND_LOCK_TTL_SECS))
            .await
        else {
            debug!("Webhook {} sender already running", webhook_id);
            return SendOutcome::AlreadyRunning;
        };

        loop {
            match storage.blocked_until(webhook_id).await {
                Ok(Some(until)) if until > Utc::now() => {
                    return SendOutcome::Blocked(until);
                }
                Ok(Some(_)) => {
                    let _ = storage.clear_blocked_until(webhook_id).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to read block for webhook {}: {}", webhook_id, e);
                }
            }

            let message = match storage.dequeue(webhook_id, QueueKind::Main).await {
                Ok(Some(message)) => message,
                Ok(None) => return SendOutcome::Idle,
                Err(e) => {
                    warn!("Failed to dequeue for webhook {}: {}", webhook_id, e);
                    return SendOutcome::Idle;
                }
            };

            match self.transport.post(&webhook.url, &message).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    info!("Webhook {}: message delivered", webhook_id);
                    self.reset_backoff(webhook_id);
                    // Honor the headers proactively: a drained allowance
                    // blocks further sends until the reported reset.
                    if response.rate_limit_remaining == Some(0) {
                        if let Some(reset_after) = response.rate_limit_reset_after {
                            let until = Utc::now()
                                + Duration::milliseconds(
                                    (reset_after * 1000.0) as i64 + RATE_LIMIT_MARGIN_MS as i64,
                                );
                            if let Err(e) = storage.set_blocked_until(webhook_id, until).await {
                                warn!("Failed to store block for webhook {}: {}", webhook_id, e);
                            }
                        }
                    }
                    // Let other webhooks' sender tasks get a turn.
                    tokio::task::yield_now().await;
                }
                Ok(response) if response.status == 429 => {
                    let retry_ms = response.retry_after_ms.unwrap_or(0);
                    let reset_ms = response
                        .rate_limit_reset_after
                        .map(|secs| (secs * 1000.0) as u64)
                        .unwrap_or(0);
                    let wait_ms = retry_ms.max(reset_ms) + RATE_LIMIT_MARGIN_MS;
                    let until = Utc::now() + Duration::milliseconds(wait_ms as i64);
                    warn!(
                        "Webhook {}: rate limited, blocked for {} ms",
                        webhook_id, wait_ms
                    );
                    if let Err(e) = storage
                        .requeue_front(webhook_id, QueueKind::Main, message)
                        .await
                    {
                        warn!("Failed to requeue for webhook {}: {}", webhook_id, e);
                    }
                    if let Err(e) = storage.set_blocked_until(webhook_id, until).await {
                        warn!("Failed to store block for webhook {}: {}", webhook_id, e);
                    }
                    return SendOutcome::Blocked(until);
                }
                Ok(response) if (400..500).contains(&response.status) => {
                    warn!(
                        "Webhook {}: HTTP {}, message moved to error queue",
                        webhook_id, response.status
                    );
                    if let Err(e) = storage.enqueue(webhook_id, QueueKind::Error, message).await {
                        warn!("Failed to park message for webhook {}: {}", webhook_id, e);
                    }
                }
                Ok(response) => {
                    warn!("Webhook {}: HTTP {}", webhook_id, response.status);
                    return self.transient_failure(storage, webhook_id, message).await;
                }
                Err(e) => {
                    warn!("Webhook {}: send failed: {}", webhook_id, e);
                    return self.transient_failure(storage, webhook_id, message).await;
                }
            }
        }
    }

    async fn transient_failure(
        &self,
        storage: &Storage,
        webhook_id: u64,
        message: String,
    ) -> SendOutcome {
        if let Err(e) = storage
            .requeue_front(webhook_id, QueueKind::Main, message)
            .await
        {
            warn!("Failed to requeue for webhook {}: {}", webhook_id, e);
        }
        let attempt = {
            let mut counters = self.backoff_counters.lock().unwrap();
            let counter = counters.entry(webhook_id).or_insert(0);
            *counter += 1;
            *counter
        };
        let delay_secs =
            (BACKOFF_BASE_SECS << (attempt - 1).min(16)).min(BACKOFF_CAP_SECS);
        SendOutcome::RetryAfter(std::time::Duration::from_secs(delay_secs))
    }

    fn reset_backoff(&self, webhook_id: u64) {
        self.backoff_counters.lock().unwrap().remove(&webhook_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_webhook_json_deserializes_with_defaults() {
        let webhook: Webhook = serde_json::from_str(
            r#"{"id": 1, "name": "alerts", "url": "https://discord.test/api/webhooks/1/x"}"#,
        )
        .unwrap();
        assert!(webhook.is_enabled);
        assert_eq!(webhook.webhook_type, WebhookType::DiscordCompatible);
        assert_eq!(webhook.notes, "");
    }

    #[test]
    fn validation_rejects_unparseable_urls() {
        let mut webhook: Webhook = serde_json::from_str(
            r#"{"id": 1, "name": "alerts", "url": "https://discord.test/api/webhooks/1/x"}"#,
        )
        .unwrap();
        assert!(webhook.validate().is_ok());
        webhook.url = "not a url".to_string();
        assert!(webhook.validate().is_err());
    }

    #[test]
    fn webhook_type_uses_wire_name() {
        let webhook = Webhook {
            id: 1,
            name: "alerts".to_string(),
            url: "https://discord.test/api/webhooks/1/x".to_string(),
            is_enabled: true,
            webhook_type: WebhookType::DiscordCompatible,
            notes: String::new(),
        };
        let json = serde_json::to_string(&webhook).unwrap();
        assert!(json.contains(r#""type":"discord-compatible""#));
    }
}
