use rand::{distributions::Alphanumeric, Rng};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::esi::EsiClient;
use crate::models::{CodecError, Killmail, Package, RedisQResponse};

pub const DEFAULT_REDISQ_URL: &str = "https://redisq.zkillboard.com/listen.php";
pub const DEFAULT_ZKB_API_URL: &str = "https://zkillboard.com/api/";

/// Any of these ends an ingest run; none of them is surfaced past the
/// ingestor.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream rate limited (HTTP 429)")]
    RateLimited,
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("upstream returned an HTML page instead of JSON")]
    HtmlBody,
    #[error("upstream returned non-JSON: {0}")]
    NonJson(String),
    #[error("upstream request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// The upstream serves one queue per queueID; a fresh random id per process
/// gives this instance its own cursor into the feed.
pub fn generate_queue_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

pub struct ZkbClient {
    client: Client,
    listen_url: String,
    api_url: String,
    esi: EsiClient,
    request_timeout: Duration,
}

impl ZkbClient {
    pub fn new(
        listen_url: &str,
        api_url: &str,
        esi: EsiClient,
        queue_id: &str,
        request_timeout: Duration,
    ) -> Self {
        ZkbClient {
            client: Client::new(),
            listen_url: format!("{}?queueID={}", listen_url, queue_id),
            api_url: api_url.trim_end_matches('/').to_string() + "/",
            esi,
            request_timeout,
        }
    }

    /// One long-poll request. `Ok(None)` means the poll timed out upstream
    /// with no event.
    pub async fn listen(&self) -> Result<Option<Killmail>, UpstreamError> {
        let response = self
            .client
            .get(&self.listen_url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        match parse_listen_body(status, &text)? {
            Some(package) => {
                debug!("Received package for killmail {}", package.kill_id);
                Ok(Some(Killmail::from_package(package)?))
            }
            None => Ok(None),
        }
    }

    /// Point lookup for operator test flows: the zkb API provides the hash,
    /// ESI provides the body, and the two are composed into the same package
    /// shape the long-poll delivers.
    pub async fn fetch_killmail(&self, killmail_id: i64) -> Result<Killmail, UpstreamError> {
        let url = format!("{}killID/{}/", self.api_url, killmail_id);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status == 429 {
            return Err(UpstreamError::RateLimited);
        }
        if !(200..300).contains(&status) {
            return Err(UpstreamError::Status(status));
        }
        let listing: serde_json::Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::NonJson(e.to_string()))?;
        let zkb = listing
            .get(0)
            .and_then(|entry| entry.get("zkb"))
            .cloned()
            .ok_or_else(|| {
                UpstreamError::NonJson(format!("no zkb record for killmail {}", killmail_id))
            })?;
        let hash = zkb.get("hash").and_then(|h| h.as_str()).ok_or_else(|| {
            UpstreamError::NonJson(format!("no hash for killmail {}", killmail_id))
        })?;

        let body = self
            .esi
            .get_killmail(killmail_id, hash)
            .await
            .map_err(|e| UpstreamError::NonJson(e.to_string()))?;

        let package = serde_json::json!({
            "killID": killmail_id,
            "killmail": body,
            "zkb": zkb,
        });
        let package: Package = serde_json::from_value(package)
            .map_err(|e| UpstreamError::Codec(CodecError::Json(e)))?;
        Ok(Killmail::from_package(package)?)
    }
}

fn parse_listen_body(status: u16, text: &str) -> Result<Option<Package>, UpstreamError> {
    if status == 429 {
        return Err(UpstreamError::RateLimited);
    }
    if !(200..300).contains(&status) {
        return Err(UpstreamError::Status(status));
    }
    // Ban notices come back as HTML with a 200; never parse them.
    if text.contains("<!DOCTYPE html>") || text.trim_start().starts_with('<') {
        return Err(UpstreamError::HtmlBody);
    }
    let wrapper: RedisQResponse = serde_json::from_str(text).map_err(|e| {
        let mut snippet = text.to_string();
        snippet.truncate(200);
        UpstreamError::NonJson(format!("{}: '{}'", e, snippet))
    })?;
    Ok(wrapper.package)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKAGE_BODY: &str = r#"
    {
        "package": {
            "killID": 10000001,
            "killmail": {
                "killmail_id": 10000001,
                "killmail_time": "2025-07-06T23:32:26Z",
                "solar_system_id": 30002539,
                "victim": {"ship_type_id": 587, "damage_taken": 100},
                "attackers": [{"final_blow": true, "ship_type_id": 34562}]
            },
            "zkb": {"hash": "abc", "totalValue": 1000000.0}
        }
    }"#;

    #[test]
    fn populated_package_is_returned() {
        let package = parse_listen_body(200, PACKAGE_BODY).unwrap().unwrap();
        assert_eq!(package.kill_id, 10000001);
    }

    #[test]
    fn empty_package_means_idle() {
        assert!(parse_listen_body(200, r#"{"package": null}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn http_429_is_rate_limited() {
        assert!(matches!(
            parse_listen_body(429, ""),
            Err(UpstreamError::RateLimited)
        ));
    }

    #[test]
    fn error_status_is_reported() {
        assert!(matches!(
            parse_listen_body(502, "bad gateway"),
            Err(UpstreamError::Status(502))
        ));
    }

    #[test]
    fn html_ban_page_is_detected_not_parsed() {
        let body = "<!DOCTYPE html>\n<html><body>You have been banned</body></html>";
        assert!(matches!(
            parse_listen_body(200, body),
            Err(UpstreamError::HtmlBody)
        ));
    }

    #[test]
    fn non_json_body_is_rejected() {
        assert!(matches!(
            parse_listen_body(200, "not json at all"),
            Err(UpstreamError::NonJson(_))
        ));
    }

    #[test]
    fn queue_ids_are_twelve_alphanumerics() {
        let id = generate_queue_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_queue_id());
    }
}
