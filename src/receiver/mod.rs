//! Receiving side of the webhook pipeline.
//!
//! Both endpoints run the same checks in order and stop at the first
//! failure: required headers (400), HMAC over the raw body (401), payload
//! shape (400), then endpoint-specific freshness and idempotency.

pub mod channels;
pub mod event_logger;
pub mod notifier;

pub use channels::{
    ChannelError, EmailChannel, Notification, NotificationChannel, TelegramChannel,
};
pub use event_logger::EventLoggerState;
pub use notifier::NotifierState;

use crate::error::WebhookError;
use crate::signature;
use crate::types::{headers, WebhookPayload};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

pub const EVENT_LOGGER_PATH: &str = "/webhooks/events";
pub const NOTIFIER_PATH: &str = "/webhooks/notifications";

/// Router with both receiver endpoints. Non-POST methods get 405 from axum.
pub fn router(event_logger: EventLoggerState, notifier: NotifierState) -> Router {
    Router::new()
        .route(
            EVENT_LOGGER_PATH,
            post(event_logger::handle_event).with_state(event_logger),
        )
        .route(
            NOTIFIER_PATH,
            post(notifier::handle_notification).with_state(notifier),
        )
}

fn header<'a>(map: &'a HeaderMap, name: &'static str) -> Result<&'a str, WebhookError> {
    map
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(WebhookError::MissingHeader(name))
}

/// Header, signature and shape checks shared by both endpoints.
pub(crate) fn verify_request(
    endpoint: &'static str,
    map: &HeaderMap,
    body: &[u8],
    secret: &str,
    require_timestamp: bool,
) -> Result<WebhookPayload, WebhookError> {
    let result = (|| {
        let sig = header(map, headers::SIGNATURE)?;
        let webhook_id = header(map, headers::ID)?;
        if require_timestamp {
            header(map, headers::TIMESTAMP)?;
        }

        if !signature::verify(secret, body, sig) {
            return Err(WebhookError::InvalidSignature);
        }

        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
        if payload.id.to_string() != webhook_id.to_ascii_lowercase() {
            return Err(WebhookError::InvalidPayload(format!(
                "{} does not match payload id",
                headers::ID
            )));
        }
        Ok(payload)
    })();

    if let Err(e) = &result {
        warn!(
            target: "webhook_receiver",
            endpoint,
            webhook_id = map.get(headers::ID).and_then(|v| v.to_str().ok()).unwrap_or(""),
            error = %e,
            "Rejected webhook"
        );
    }
    result
}

/// Anti-replay: the payload timestamp must lie within `window` of `now`
/// in either direction.
pub(crate) fn check_freshness(
    payload: &WebhookPayload,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<(), WebhookError> {
    let age = now - payload.timestamp;
    if age.abs() > window {
        return Err(WebhookError::StaleTimestamp {
            age_secs: age.num_seconds(),
            window_secs: window.num_seconds(),
        });
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn freshness_window_edges() {
        let now = Utc::now();
        let window = Duration::minutes(5);
        assert!(check_freshness(&payload_at(now - Duration::minutes(4)), window, now).is_ok());
        assert!(check_freshness(&payload_at(now + Duration::minutes(4)), window, now).is_ok());
        assert!(matches!(
            check_freshness(&payload_at(now - Duration::minutes(6)), window, now),
            Err(WebhookError::StaleTimestamp { .. })
        ));
        assert!(check_freshness(&payload_at(now + Duration::minutes(6)), window, now).is_err());
    }

    #[test]
    fn header_checks_precede_signature() {
        let payload = payload_at(Utc::now());
        let body = signature::canonical_json(&payload).unwrap();
        let mut map = HeaderMap::new();
        map.insert(headers::ID, payload.id.to_string().parse().unwrap());
        let err = verify_request("test", &map, &body, "s", false).unwrap_err();
        assert!(matches!(err, WebhookError::MissingHeader(h) if h == headers::SIGNATURE));

        map.insert(headers::SIGNATURE, "deadbeef".parse().unwrap());
        let err = verify_request("test", &map, &body, "s", true).unwrap_err();
        assert!(matches!(err, WebhookError::MissingHeader(h) if h == headers::TIMESTAMP));

        let err = verify_request("test", &map, &body, "s", false).unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));
    }

    #[test]
    fn mismatched_webhook_id_rejected() {
        let payload = payload_at(Utc::now());
        let body = signature::canonical_json(&payload).unwrap();
        let mut map = HeaderMap::new();
        map.insert(headers::SIGNATURE, signature::sign("s", &body).parse().unwrap());
        map.insert(headers::ID, uuid::Uuid::new_v4().to_string().parse().unwrap());
        let err = verify_request("test", &map, &body, "s", false).unwrap_err();
        assert!(matches!(err, WebhookError::InvalidPayload(_)));
    }

    #[test]
    fn signed_garbage_is_invalid_payload() {
        let body = b"not json".to_vec();
        let mut map = HeaderMap::new();
        map.insert(headers::SIGNATURE, signature::sign("s", &body).parse().unwrap());
        map.insert(headers::ID, uuid::Uuid::new_v4().to_string().parse().unwrap());
        let err = verify_request("test", &map, &body, "s", false).unwrap_err();
        assert!(matches!(err, WebhookError::InvalidPayload(_)));
    }
}
