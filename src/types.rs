use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Subscription event value that matches every event type.
pub const WILDCARD_EVENT: &str = "*";

/// HTTP headers carried by every webhook POST.
pub mod headers {
    pub const SIGNATURE: &str = "X-Webhook-Signature";
    pub const ID: &str = "X-Webhook-Id";
    pub const TIMESTAMP: &str = "X-Webhook-Timestamp";
}

/// Event types raised by the gym domain services.
pub mod event_types {
    pub const CLASE_CREATED: &str = "clase.created";
    pub const CLASE_UPDATED: &str = "clase.updated";
    pub const INSCRIPCION_CREATED: &str = "inscripcion.created";
    pub const PAGO_COMPLETED: &str = "pago.completed";
    pub const MEMBRESIA_CREATED: &str = "membresia.created";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    pub events: BTreeSet<String>,
    pub secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn new(
        url: impl Into<String>,
        events: impl IntoIterator<Item = String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            events: events.into_iter().collect(),
            secret: secret.into(),
            active: true,
            created_at: Utc::now(),
        }
    }

    /// True if the subscription is active and listens for `event_type`
    /// either by name or through the wildcard.
    pub fn matches(&self, event_type: &str) -> bool {
        self.active && (self.events.contains(event_type) || self.events.contains(WILDCARD_EVENT))
    }
}

/// Subscription as shown by the management API (no secret).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub id: Uuid,
    pub url: String,
    pub events: BTreeSet<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&WebhookSubscription> for SubscriptionView {
    fn from(sub: &WebhookSubscription) -> Self {
        Self {
            id: sub.id,
            url: sub.url.clone(),
            events: sub.events.clone(),
            active: sub.active,
            created_at: sub.created_at,
        }
    }
}

/// A domain event raised by a business service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, rename = "correlationId")]
    pub correlation_id: Option<String>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub source: String,
    pub environment: String,
    pub correlation_id: String,
}

/// Body of every webhook POST. Immutable once built: the same bytes are
/// signed and resent on every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub version: String,
    pub id: Uuid,
    pub idempotency_key: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    pub metadata: PayloadMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Retrying => "RETRYING",
            DeliveryStatus::Success => "SUCCESS",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "RETRYING" => Ok(DeliveryStatus::Retrying),
            "SUCCESS" => Ok(DeliveryStatus::Success),
            "FAILED" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// Durable record of one payload sent to one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub subscription_id: Uuid,
    pub event: String,
    pub payload: WebhookPayload,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn pending(subscription_id: Uuid, payload: WebhookPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            webhook_id: payload.id,
            subscription_id,
            event: payload.event.clone(),
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            response_status: None,
            response_body: None,
            error_message: None,
            delivered_at: None,
            next_attempt_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Unit of work handed to the delivery worker.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub delivery_id: Uuid,
    pub subscription_url: String,
    pub payload: WebhookPayload,
    pub subscription_secret: String,
}
