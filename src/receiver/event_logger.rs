use crate::error::WebhookError;
use crate::receiver::{check_freshness, verify_request};
use crate::store::{InsertOutcome, ProcessedEvent, ProcessedEvents};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Event-logger endpoint: verifies, rejects stale payloads and stores each
/// logical event exactly once.
#[derive(Clone)]
pub struct EventLoggerState {
    pub secret: Arc<str>,
    pub replay_window: Duration,
    pub events: Arc<ProcessedEvents>,
}

impl EventLoggerState {
    pub fn new(secret: &str, replay_window: Duration, events: Arc<ProcessedEvents>) -> Self {
        Self {
            secret: Arc::from(secret),
            replay_window,
            events,
        }
    }
}

pub async fn handle_event(
    State(state): State<EventLoggerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, WebhookError> {
    let payload = verify_request("event_logger", &headers, &body, &state.secret, true)?;
    check_freshness(&payload, state.replay_window, Utc::now())?;

    if let Some(existing) = state.events.get(payload.idempotency_key).await {
        return Ok(already_processed(existing.event_id));
    }

    let raw: Value = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
    let record = ProcessedEvent {
        idempotency_key: payload.idempotency_key,
        event_id: Uuid::new_v4(),
        webhook_id: payload.id,
        event: payload.event.clone(),
        payload: raw,
        received_at: Utc::now(),
    };

    // A concurrent duplicate that passed the lookup above still loses here.
    match state.events.insert_unique(record).await? {
        InsertOutcome::Inserted(stored) => {
            info!(
                target: "webhook_receiver",
                event = %stored.event,
                event_id = %stored.event_id,
                idempotency_key = %stored.idempotency_key,
                correlation_id = %payload.metadata.correlation_id,
                "Webhook event logged"
            );
            Ok(Json(json!({
                "success": true,
                "message": "Event logged",
                "event_id": stored.event_id,
            })))
        }
        InsertOutcome::Duplicate(existing) => Ok(already_processed(existing.event_id)),
    }
}

fn already_processed(event_id: Uuid) -> Json<Value> {
    info!(
        target: "webhook_receiver",
        event_id = %event_id,
        "Duplicate webhook ignored"
    );
    Json(json!({
        "success": true,
        "message": "Event already processed",
        "event_id": event_id,
        "duplicate": true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::test_support::*;
    use crate::receiver::{router, NotifierState, EVENT_LOGGER_PATH};
    use crate::signature;
    use crate::store::NotificationLedger;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use tower::ServiceExt;

    const SECRET: &str = "logger-secret";

    fn app() -> (Router, Arc<ProcessedEvents>) {
        let events = Arc::new(ProcessedEvents::in_memory());
        let logger = EventLoggerState::new(SECRET, Duration::minutes(5), events.clone());
        let ledger = Arc::new(NotificationLedger::in_memory());
        let notifier = NotifierState::new(SECRET, ledger, vec![]);
        (router(logger, notifier), events)
    }

    #[tokio::test]
    async fn same_idempotency_key_twice_stores_one_row() {
        let (app, events) = app();
        let payload = payload_at(Utc::now());

        let first = app
            .clone()
            .oneshot(signed_request(EVENT_LOGGER_PATH, SECRET, &payload))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first = json_body(first).await;

        let second = app
            .oneshot(signed_request(EVENT_LOGGER_PATH, SECRET, &payload))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let second = json_body(second).await;

        assert_eq!(second["duplicate"], true);
        assert_eq!(first["event_id"], second["event_id"]);
        assert_eq!(events.len().await, 1);
    }

    #[tokio::test]
    async fn stored_row_keeps_full_payload() {
        let (app, events) = app();
        let payload = payload_at(Utc::now());
        app.oneshot(signed_request(EVENT_LOGGER_PATH, SECRET, &payload))
            .await
            .unwrap();

        let row = events.get(payload.idempotency_key).await.unwrap();
        assert_eq!(row.webhook_id, payload.id);
        assert_eq!(row.payload["data"]["nombre"], "Spinning");
        assert_eq!(row.payload["metadata"]["correlation_id"], "corr-1");
    }

    #[tokio::test]
    async fn mutated_body_is_unauthorized() {
        let (app, events) = app();
        let payload = payload_at(Utc::now());
        let body = signature::canonical_json(&payload).unwrap();
        let sig = signature::sign(SECRET, &body);

        let mut tampered = body.clone();
        let pos = tampered.len() / 2;
        tampered[pos] ^= 0x20;

        let resp = app
            .oneshot(request_with_body(EVENT_LOGGER_PATH, &sig, &payload, tampered))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(resp).await["error"], "invalid_signature");
        assert!(events.is_empty().await);
    }

    #[tokio::test]
    async fn six_minutes_old_is_rejected_four_is_accepted() {
        let (app, events) = app();

        let stale = payload_at(Utc::now() - Duration::minutes(6));
        let resp = app
            .clone()
            .oneshot(signed_request(EVENT_LOGGER_PATH, SECRET, &stale))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "stale_timestamp");

        let fresh = payload_at(Utc::now() - Duration::minutes(4));
        let resp = app
            .oneshot(signed_request(EVENT_LOGGER_PATH, SECRET, &fresh))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(events.len().await, 1);
    }

    #[tokio::test]
    async fn missing_headers_are_bad_request() {
        let (app, _) = app();
        let payload = payload_at(Utc::now());
        let req = Request::builder()
            .method("POST")
            .uri(EVENT_LOGGER_PATH)
            .body(Body::from(signature::canonical_json(&payload).unwrap()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "missing_header");
    }

    #[tokio::test]
    async fn non_post_is_method_not_allowed() {
        let (app, _) = app();
        let req = Request::builder()
            .method("GET")
            .uri(EVENT_LOGGER_PATH)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn concurrent_duplicates_store_once() {
        let (app, events) = app();
        let payload = payload_at(Utc::now());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let app = app.clone();
            let req = signed_request(EVENT_LOGGER_PATH, SECRET, &payload);
            handles.push(tokio::spawn(async move { app.oneshot(req).await.unwrap().status() }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), StatusCode::OK);
        }
        assert_eq!(events.len().await, 1);
    }
}
