//! Outbound notification channels used by the external-notifier endpoint.

use crate::types::WebhookPayload;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Rendered message sent to every channel for one webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub subject: String,
    pub text: String,
}

impl Notification {
    pub fn from_payload(payload: &WebhookPayload) -> Self {
        let data = serde_json::to_string_pretty(&payload.data).unwrap_or_else(|_| "{}".into());
        Self {
            subject: format!("[{}] {}", payload.metadata.source, payload.event),
            text: format!(
                "Event: {}\nTime: {}\nCorrelation: {}\n\n{}",
                payload.event,
                payload.timestamp.to_rfc3339(),
                payload.metadata.correlation_id,
                data
            ),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("{channel} request failed: {cause}")]
    Request { channel: &'static str, cause: String },

    #[error("{channel} rejected the message with status {status}: {body}")]
    Rejected {
        channel: &'static str,
        status: u16,
        body: String,
    },

    #[error("{channel} returned an unexpected response: {cause}")]
    Response { channel: &'static str, cause: String },
}

/// One independent delivery target. `send` returns the provider's message ID.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<String, ChannelError>;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Truncated response body for error messages.
async fn error_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > 256 {
        let mut end = 256;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

// ---------------------------------------------------------------------------
// Telegram
// ---------------------------------------------------------------------------

pub struct TelegramChannel {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

#[derive(Deserialize)]
struct TelegramResponse {
    ok: bool,
    result: Option<TelegramMessage>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    message_id: i64,
}

impl TelegramChannel {
    pub fn new(
        api_base: Option<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: http_client(timeout)?,
            api_base: api_base
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, notification: &Notification) -> Result<String, ChannelError> {
        const CHANNEL: &str = "telegram";
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let response = self
            .client
            .post(url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": format!("{}\n\n{}", notification.subject, notification.text),
            }))
            .send()
            .await
            // reqwest errors carry the URL, which contains the bot token.
            .map_err(|e| ChannelError::Request {
                channel: CHANNEL,
                cause: e.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Rejected {
                channel: CHANNEL,
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }

        let body: TelegramResponse = response.json().await.map_err(|e| ChannelError::Response {
            channel: CHANNEL,
            cause: e.without_url().to_string(),
        })?;
        match (body.ok, body.result) {
            (true, Some(message)) => Ok(message.message_id.to_string()),
            _ => Err(ChannelError::Response {
                channel: CHANNEL,
                cause: body.description.unwrap_or_else(|| "ok=false".into()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Email (HTTP mail API)
// ---------------------------------------------------------------------------

/// Sends mail through a JSON HTTP API: bearer-authenticated POST of
/// `{from, to, subject, text}` answered with `{id}`.
pub struct EmailChannel {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
    to: Vec<String>,
}

#[derive(Deserialize)]
struct EmailResponse {
    id: String,
}

impl EmailChannel {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        to: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: http_client(timeout)?,
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
            to,
        })
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, notification: &Notification) -> Result<String, ChannelError> {
        const CHANNEL: &str = "email";
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": self.to,
                "subject": notification.subject,
                "text": notification.text,
            }))
            .send()
            .await
            .map_err(|e| ChannelError::Request {
                channel: CHANNEL,
                cause: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Rejected {
                channel: CHANNEL,
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }

        let body: EmailResponse = response.json().await.map_err(|e| ChannelError::Response {
            channel: CHANNEL,
            cause: e.to_string(),
        })?;
        Ok(body.id)
    }
}
