use crate::error::{StoreError, WebhookError};
use crate::receiver::channels::{Notification, NotificationChannel};
use crate::receiver::verify_request;
use crate::store::{ChannelClaim, NotificationLedger};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// External-notifier endpoint state. Channels are tried independently and
/// each one's outcome is recorded under `(idempotency_key, channel)`.
#[derive(Clone)]
pub struct NotifierState {
    pub secret: Arc<str>,
    pub ledger: Arc<NotificationLedger>,
    pub channels: Arc<Vec<Arc<dyn NotificationChannel>>>,
}

impl NotifierState {
    pub fn new(
        secret: &str,
        ledger: Arc<NotificationLedger>,
        channels: Vec<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self {
            secret: Arc::from(secret),
            ledger,
            channels: Arc::new(channels),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Sent,
    AlreadySent,
    /// Another request holds the claim for this channel.
    InProgress,
    Failed,
}

impl ChannelStatus {
    fn is_done(self) -> bool {
        matches!(self, ChannelStatus::Sent | ChannelStatus::AlreadySent)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelResult {
    pub channel: String,
    pub status: ChannelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn handle_notification(
    State(state): State<NotifierState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), WebhookError> {
    let payload = verify_request("notifier", &headers, &body, &state.secret, false)?;
    let notification = Notification::from_payload(&payload);

    let mut results = Vec::with_capacity(state.channels.len());
    for channel in state.channels.iter() {
        let result = dispatch(
            &state.ledger,
            payload.idempotency_key,
            channel.as_ref(),
            &notification,
        )
        .await;
        results.push(result);
    }

    let total = results.len();
    let incomplete = results.iter().filter(|r| !r.status.is_done()).count();
    let failure = if total == 0 {
        Some(WebhookError::NoNotificationChannels)
    } else if incomplete > 0 {
        Some(WebhookError::NotificationFailed {
            failed: incomplete,
            total,
        })
    } else {
        None
    };
    if let Some(err) = failure {
        let (status, code) = err.status_and_code();
        warn!(
            target: "webhook_receiver",
            idempotency_key = %payload.idempotency_key,
            event = %payload.event,
            failed = incomplete,
            total,
            error = %err,
            "Notification incomplete; sender will retry"
        );
        return Ok((
            status,
            Json(json!({
                "success": false,
                "error": code,
                "message": err.to_string(),
                "status": status.as_u16(),
                "idempotency_key": payload.idempotency_key,
                "channels": results,
            })),
        ));
    }

    let message = if results.iter().all(|r| r.status == ChannelStatus::AlreadySent) {
        "Notification already processed"
    } else {
        "Notification sent"
    };
    info!(
        target: "webhook_receiver",
        idempotency_key = %payload.idempotency_key,
        event = %payload.event,
        channels = total,
        outcome = message,
        "Notification handled"
    );
    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": message,
            "idempotency_key": payload.idempotency_key,
            "channels": results,
        })),
    ))
}

/// Claim, send and record one channel. Ledger failures come back as a
/// `Failed` result so the other channels still run.
async fn dispatch(
    ledger: &NotificationLedger,
    idempotency_key: Uuid,
    channel: &dyn NotificationChannel,
    notification: &Notification,
) -> ChannelResult {
    let name = channel.name();
    let claim = match ledger.claim(idempotency_key, name).await {
        Ok(claim) => claim,
        Err(e) => return ledger_failure(idempotency_key, name, None, e),
    };
    match claim {
        ChannelClaim::AlreadySent(record) => ChannelResult {
            channel: name.to_string(),
            status: ChannelStatus::AlreadySent,
            message_id: record.message_id,
            error: None,
        },
        ChannelClaim::InFlight(_) => ChannelResult {
            channel: name.to_string(),
            status: ChannelStatus::InProgress,
            message_id: None,
            error: None,
        },
        ChannelClaim::Claimed => {
            let outcome = channel.send(notification).await.map_err(|e| e.to_string());
            if let Err(e) = &outcome {
                warn!(
                    target: "webhook_receiver",
                    idempotency_key = %idempotency_key,
                    channel = name,
                    error = %e,
                    "Notification channel failed"
                );
            }
            let sent_id = outcome.as_ref().ok().cloned();
            let record = match ledger.complete(idempotency_key, name, outcome).await {
                Ok(record) => record,
                Err(e) => return ledger_failure(idempotency_key, name, sent_id, e),
            };
            let status = if record.error.is_none() {
                ChannelStatus::Sent
            } else {
                ChannelStatus::Failed
            };
            ChannelResult {
                channel: name.to_string(),
                status,
                message_id: record.message_id,
                error: record.error,
            }
        }
    }
}

fn ledger_failure(
    idempotency_key: Uuid,
    channel: &str,
    message_id: Option<String>,
    error: StoreError,
) -> ChannelResult {
    warn!(
        target: "webhook_receiver",
        idempotency_key = %idempotency_key,
        channel,
        error = %error,
        "Notification ledger unavailable"
    );
    ChannelResult {
        channel: channel.to_string(),
        status: ChannelStatus::Failed,
        message_id,
        error: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::channels::ChannelError;
    use crate::receiver::test_support::*;
    use crate::receiver::{router, EventLoggerState, NOTIFIER_PATH};
    use crate::store::{NotificationState, ProcessedEvents};
    use async_trait::async_trait;
    use axum::Router;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const SECRET: &str = "notifier-secret";

    /// Fails the first `failures` sends, then succeeds.
    struct FakeChannel {
        name: &'static str,
        failures: usize,
        calls: AtomicUsize,
    }

    impl FakeChannel {
        fn new(name: &'static str, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NotificationChannel for FakeChannel {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _notification: &Notification) -> Result<String, ChannelError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ChannelError::Request {
                    channel: "fake",
                    cause: "unavailable".into(),
                })
            } else {
                Ok(format!("{}-{}", self.name, call))
            }
        }
    }

    fn app(channels: Vec<Arc<dyn NotificationChannel>>) -> (Router, Arc<NotificationLedger>) {
        let ledger = Arc::new(NotificationLedger::in_memory());
        let logger = EventLoggerState::new(
            SECRET,
            Duration::minutes(5),
            Arc::new(ProcessedEvents::in_memory()),
        );
        let notifier = NotifierState::new(SECRET, ledger.clone(), channels);
        (router(logger, notifier), ledger)
    }

    #[tokio::test]
    async fn retry_only_resends_failed_channel() {
        let telegram = FakeChannel::new("telegram", 0);
        let email = FakeChannel::new("email", 1);
        let (app, ledger) = app(vec![telegram.clone(), email.clone()]);
        let payload = payload_at(Utc::now());

        let resp = app
            .clone()
            .oneshot(signed_request(NOTIFIER_PATH, SECRET, &payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["error"], "notification_failed");
        assert_eq!(body["channels"][0]["status"], "sent");
        assert_eq!(body["channels"][1]["status"], "failed");

        let resp = app
            .oneshot(signed_request(NOTIFIER_PATH, SECRET, &payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["channels"][0]["status"], "already_sent");
        assert_eq!(body["channels"][0]["message_id"], "telegram-0");
        assert_eq!(body["channels"][1]["status"], "sent");

        assert_eq!(telegram.calls(), 1);
        assert_eq!(email.calls(), 2);

        let records = ledger.records_for(payload.idempotency_key).await;
        assert!(records.iter().all(|r| r.state == NotificationState::Sent));
    }

    #[tokio::test]
    async fn fully_sent_event_is_already_processed() {
        let telegram = FakeChannel::new("telegram", 0);
        let (app, _) = app(vec![telegram.clone()]);
        let payload = payload_at(Utc::now());

        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(signed_request(NOTIFIER_PATH, SECRET, &payload))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = app
            .oneshot(signed_request(NOTIFIER_PATH, SECRET, &payload))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["message"], "Notification already processed");
        assert_eq!(telegram.calls(), 1);
    }

    #[tokio::test]
    async fn stale_payload_still_notifies() {
        let telegram = FakeChannel::new("telegram", 0);
        let (app, _) = app(vec![telegram.clone()]);
        let payload = payload_at(Utc::now() - Duration::hours(2));

        let resp = app
            .oneshot(signed_request(NOTIFIER_PATH, SECRET, &payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(telegram.calls(), 1);
    }

    #[tokio::test]
    async fn bad_signature_sends_nothing() {
        let telegram = FakeChannel::new("telegram", 0);
        let (app, ledger) = app(vec![telegram.clone()]);
        let payload = payload_at(Utc::now());

        let resp = app
            .oneshot(signed_request(NOTIFIER_PATH, "wrong-secret", &payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(telegram.calls(), 0);
        assert!(ledger.records_for(payload.idempotency_key).await.is_empty());
    }

    #[tokio::test]
    async fn mutated_body_sends_nothing() {
        let telegram = FakeChannel::new("telegram", 0);
        let (app, ledger) = app(vec![telegram.clone()]);
        let payload = payload_at(Utc::now());
        let body = crate::signature::canonical_json(&payload).unwrap();
        let sig = crate::signature::sign(SECRET, &body);

        let mut tampered = body.clone();
        let pos = tampered.len() / 2;
        tampered[pos] ^= 0x20;

        let resp = app
            .oneshot(request_with_body(NOTIFIER_PATH, &sig, &payload, tampered))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(resp).await["error"], "invalid_signature");
        assert_eq!(telegram.calls(), 0);
        assert!(ledger.records_for(payload.idempotency_key).await.is_empty());
    }

    #[tokio::test]
    async fn no_channels_is_a_failure() {
        let (app, _) = app(vec![]);
        let payload = payload_at(Utc::now());

        let resp = app
            .oneshot(signed_request(NOTIFIER_PATH, SECRET, &payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "notification_failed");
        assert_eq!(body["message"], "no notification channels are configured");
        assert_eq!(body["channels"], json!([]));
    }

    #[tokio::test]
    async fn unwritable_ledger_fails_channel_but_tries_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(NotificationLedger::open(Some(dir.path())).unwrap());
        let telegram = FakeChannel::new("telegram", 0);
        let email = FakeChannel::new("email", 0);
        let notifier = NotifierState::new(
            SECRET,
            ledger.clone(),
            vec![telegram.clone(), email.clone()],
        );
        let logger = EventLoggerState::new(
            SECRET,
            Duration::minutes(5),
            Arc::new(ProcessedEvents::in_memory()),
        );
        let app = router(logger, notifier);
        let payload = payload_at(Utc::now());

        // A directory where the temp file goes makes every save fail.
        let blocker = dir.path().join("processed_notifications.json.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let resp = app
            .clone()
            .oneshot(signed_request(NOTIFIER_PATH, SECRET, &payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["error"], "notification_failed");
        assert_eq!(body["channels"][0]["status"], "failed");
        assert_eq!(body["channels"][1]["status"], "failed");
        assert_eq!(telegram.calls(), 0);
        assert_eq!(email.calls(), 0);
        assert!(ledger.records_for(payload.idempotency_key).await.is_empty());

        std::fs::remove_dir(&blocker).unwrap();
        let resp = app
            .oneshot(signed_request(NOTIFIER_PATH, SECRET, &payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(telegram.calls(), 1);
        assert_eq!(email.calls(), 1);
    }

    #[tokio::test]
    async fn in_flight_channel_is_not_sent_twice() {
        let telegram = FakeChannel::new("telegram", 0);
        let (app, ledger) = app(vec![telegram.clone()]);
        let payload = payload_at(Utc::now());
        ledger
            .claim(payload.idempotency_key, "telegram")
            .await
            .unwrap();

        let resp = app
            .oneshot(signed_request(NOTIFIER_PATH, SECRET, &payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(resp).await["channels"][0]["status"], "in_progress");
        assert_eq!(telegram.calls(), 0);
    }
}
