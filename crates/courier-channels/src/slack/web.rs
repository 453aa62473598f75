use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use courier_core::{OutboundMessage, OutboundSender};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_API_BASE: &str = "https://slack.com/api";

/// Retries after an HTTP 429 before giving up on a call.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Error codes that mean the token itself is unusable. Retrying cannot help.
const AUTH_FAILURE_CODES: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "token_expired",
    "not_allowed_token_type",
];

/// Slack answered the call with `ok: false`.
#[derive(Debug, thiserror::Error)]
#[error("slack {method} failed: {code}")]
pub struct SlackApiError {
    pub method: String,
    pub code: String,
}

impl SlackApiError {
    pub fn is_auth_failure(&self) -> bool {
        AUTH_FAILURE_CODES.contains(&self.code.as_str())
    }
}

/// Minimal Slack Web API client: identity lookup, Socket Mode URL, posting.
#[derive(Clone)]
pub struct SlackWebClient {
    http: reqwest::Client,
    base_url: String,
    bot_token: SecretString,
    max_retries: u32,
}

impl std::fmt::Debug for SlackWebClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackWebClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SlackWebClient {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_API_BASE.to_owned(),
            bot_token,
            max_retries: MAX_RATE_LIMIT_RETRIES,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The bot's own user id.
    pub async fn auth_test(&self) -> Result<String> {
        let response = self.call("auth.test", &self.bot_token, &json!({})).await?;
        response
            .get("user_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .context("auth.test response has no user_id")
    }

    /// A fresh Socket Mode WebSocket URL. Each URL is single-use.
    pub async fn open_socket_url(&self, app_token: &SecretString) -> Result<String> {
        let response = self
            .call("apps.connections.open", app_token, &json!({}))
            .await?;
        response
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .context("apps.connections.open response has no url")
    }

    pub async fn post_message(&self, message: &OutboundMessage) -> Result<()> {
        let mut body = json!({
            "channel": message.channel,
            "text": message.text,
        });
        if let Some(thread_ts) = &message.thread_ts {
            body["thread_ts"] = json!(thread_ts);
        }
        self.call("chat.postMessage", &self.bot_token, &body)
            .await
            .with_context(|| format!("failed to post to {}", message.channel))?;
        Ok(())
    }

    async fn call(&self, method: &str, token: &SecretString, body: &Value) -> Result<Value> {
        let url = format!("{}/{method}", self.base_url);
        let mut attempt = 0;

        loop {
            let response = self
                .http
                .post(&url)
                .bearer_auth(token.expose_secret())
                .json(body)
                .send()
                .await
                .with_context(|| format!("slack {method} request failed"))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= self.max_retries {
                    bail!("slack {method} rate limited after {attempt} retries");
                }
                attempt += 1;
                let wait = retry_after(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER);
                warn!(
                    method,
                    attempt,
                    wait_ms = wait.as_millis(),
                    "slack rate limited, retrying"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if !status.is_success() {
                bail!("slack {method} returned HTTP {status}");
            }

            let value: Value = response
                .json()
                .await
                .with_context(|| format!("invalid slack {method} response"))?;
            if value.get("ok").and_then(Value::as_bool) != Some(true) {
                let code = value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown_error");
                return Err(SlackApiError {
                    method: method.to_owned(),
                    code: code.to_owned(),
                }
                .into());
            }
            debug!(method, "slack call ok");
            return Ok(value);
        }
    }
}

#[async_trait]
impl OutboundSender for SlackWebClient {
    async fn send(&self, msg: OutboundMessage) -> Result<()> {
        self.post_message(&msg).await
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(server: &mockito::Server) -> SlackWebClient {
        SlackWebClient::new(SecretString::new("xoxb-test".to_owned())).with_base_url(server.url())
    }

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn auth_test_returns_user_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth.test")
            .match_header("authorization", "Bearer xoxb-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"ok": true, "user_id": "UBOT"}).to_string())
            .create_async()
            .await;

        let user_id = client(&server).auth_test().await.unwrap();
        assert_eq!(user_id, "UBOT");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn post_message_sends_thread_ts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat.postMessage")
            .match_body(Matcher::PartialJson(json!({
                "channel": "C1",
                "text": "hi",
                "thread_ts": "111.222",
            })))
            .with_status(200)
            .with_body(json!({"ok": true}).to_string())
            .create_async()
            .await;

        let message = OutboundMessage {
            channel: "C1".to_owned(),
            thread_ts: Some("111.222".to_owned()),
            text: "hi".to_owned(),
        };
        client(&server).post_message(&message).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn api_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat.postMessage")
            .with_status(200)
            .with_body(json!({"ok": false, "error": "channel_not_found"}).to_string())
            .create_async()
            .await;

        let message = OutboundMessage {
            channel: "C404".to_owned(),
            thread_ts: None,
            text: "hi".to_owned(),
        };
        let err = client(&server).post_message(&message).await.unwrap_err();
        assert!(format!("{err:#}").contains("channel_not_found"));
        let api_error = err.downcast_ref::<SlackApiError>().unwrap();
        assert_eq!(api_error.code, "channel_not_found");
        assert!(!api_error.is_auth_failure());
    }

    #[tokio::test]
    async fn rate_limit_retries_are_bounded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth.test")
            .with_status(429)
            .with_header("retry-after", "0")
            .expect(3)
            .create_async()
            .await;

        let err = client(&server)
            .with_max_retries(2)
            .auth_test()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rate limited"));
        mock.assert_async().await;
    }
}
