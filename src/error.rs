//! Error types shared across the webhook pipeline and the queue RPC layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use uuid::Uuid;

/// Persistence failures from the JSON-file stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {path}: {cause}")]
    Read { path: String, cause: String },

    #[error("failed to write {path}: {cause}")]
    Write { path: String, cause: String },

    #[error("failed to (de)serialize {what}: {cause}")]
    Serde { what: &'static str, cause: String },

    #[error("delivery not found: {0}")]
    DeliveryNotFound(Uuid),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(Uuid),
}

/// Errors surfaced by the webhook publisher, receivers and management API.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("delivery queue is closed")]
    QueueClosed,

    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("stale webhook: timestamp is {age_secs}s away from now (window {window_secs}s)")]
    StaleTimestamp { age_secs: i64, window_secs: i64 },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("delivery not found")]
    DeliveryNotFound,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("notification failed on {failed} of {total} channel(s)")]
    NotificationFailed { failed: usize, total: usize },

    #[error("no notification channels are configured")]
    NoNotificationChannels,

    #[error("queue rpc failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    /// Status code and machine-readable error code for this error.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            WebhookError::Store(StoreError::DeliveryNotFound(_))
            | WebhookError::DeliveryNotFound => {
                (StatusCode::NOT_FOUND, "delivery_not_found")
            }
            WebhookError::Store(StoreError::SubscriptionNotFound(_))
            | WebhookError::SubscriptionNotFound => {
                (StatusCode::NOT_FOUND, "subscription_not_found")
            }
            WebhookError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            WebhookError::QueueClosed => (StatusCode::SERVICE_UNAVAILABLE, "queue_closed"),
            WebhookError::MissingHeader(_) => (StatusCode::BAD_REQUEST, "missing_header"),
            WebhookError::InvalidSignature => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            WebhookError::StaleTimestamp { .. } => (StatusCode::BAD_REQUEST, "stale_timestamp"),
            WebhookError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
            WebhookError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            WebhookError::NotificationFailed { .. } | WebhookError::NoNotificationChannels => {
                (StatusCode::INTERNAL_SERVER_ERROR, "notification_failed")
            }
            WebhookError::Rpc(e) => rpc_status(e),
            WebhookError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

fn rpc_status(error: &RpcError) -> (StatusCode, &'static str) {
    match error {
        RpcError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "rpc_timeout"),
        RpcError::Remote { .. } => (StatusCode::BAD_GATEWAY, "rpc_remote_error"),
        RpcError::InvalidReply(_) => (StatusCode::BAD_GATEWAY, "rpc_invalid_reply"),
        RpcError::Broker(e) if e.is_connection_loss() => {
            (StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable")
        }
        RpcError::Broker(_) => (StatusCode::BAD_GATEWAY, "broker_error"),
        RpcError::Cancelled | RpcError::Serialization(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

/// JSON error body returned by every HTTP endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, WebhookError>;

/// Failures reported by a message broker connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is not connected")]
    NotConnected,

    #[error("connection to {url} failed: {cause}")]
    ConnectionFailed { url: String, cause: String },

    #[error("failed to publish to queue {queue}: {cause}")]
    PublishFailed { queue: String, cause: String },

    #[error("failed to consume from queue {queue}: {cause}")]
    ConsumeFailed { queue: String, cause: String },
}

impl BrokerError {
    /// Whether the failure indicates the connection itself is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BrokerError::NotConnected | BrokerError::ConnectionFailed { .. }
        )
    }
}

/// Outcome errors of a request/reply call over the broker.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("no reply for correlation id {correlation_id} within {timeout_ms}ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("remote handler failed: {message}")]
    Remote { message: String },

    #[error("invalid reply: {0}")]
    InvalidReply(String),

    #[error("request was cancelled before a reply arrived")]
    Cancelled,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

/// Environment configuration problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration missing: {var}")]
    Missing { var: String },

    #[error("configuration invalid for {var}: {reason}")]
    Invalid { var: String, reason: String },
}
