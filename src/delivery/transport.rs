use crate::error::WebhookError;
use crate::types::headers;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// A fully signed webhook POST, ready to send.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub signature: String,
    pub webhook_id: Uuid,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timeout ({0:?})")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request error: {0}")]
    Request(String),
}

/// Sends a signed webhook request somewhere.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, request: &SignedRequest) -> Result<TransportResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Every attempt is bounded by `timeout`, independent of retry backoff.
    pub fn new(timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("gym-webhooks/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, request: &SignedRequest) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(headers::SIGNATURE, &request.signature)
            .header(headers::ID, request.webhook_id.to_string())
            .header(headers::TIMESTAMP, &request.timestamp)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout)
                } else if e.is_connect() {
                    TransportError::Connect(e.to_string())
                } else {
                    TransportError::Request(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(TransportResponse { status, body })
    }
}
