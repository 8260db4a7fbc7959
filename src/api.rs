//! Management HTTP API: subscriptions, delivery history, event intake and
//! a bridge onto the queue RPC endpoint.

use crate::error::{ApiResult, WebhookError};
use crate::publisher::EventPublisher;
use crate::rpc::RpcEndpoint;
use crate::store::{DeliveryLog, SubscriptionRegistry};
use crate::types::{
    DeliveryStatus, DomainEvent, SubscriptionView, WebhookDelivery, WebhookSubscription,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub deliveries: Arc<DeliveryLog>,
    pub publisher: EventPublisher,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/subscriptions",
            post(create_subscription).get(list_subscriptions),
        )
        .route(
            "/subscriptions/{id}",
            get(get_subscription).patch(update_subscription),
        )
        .route("/deliveries", get(list_deliveries))
        .route("/deliveries/{id}", get(get_delivery))
        .route("/events", post(publish_event))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

impl CreateSubscriptionRequest {
    fn validate(&self) -> Result<(), WebhookError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| WebhookError::Validation(format!("url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WebhookError::Validation("url must be http or https".into()));
        }
        if self.events.is_empty() || self.events.iter().any(|e| e.trim().is_empty()) {
            return Err(WebhookError::Validation(
                "events must list at least one non-empty event type".into(),
            ));
        }
        if self.secret.as_deref().is_some_and(|s| s.is_empty()) {
            return Err(WebhookError::Validation("secret must not be empty".into()));
        }
        Ok(())
    }
}

/// Returned once on creation; the only response that includes the secret.
#[derive(Debug, Serialize)]
pub struct CreatedSubscription {
    #[serde(flatten)]
    pub subscription: SubscriptionView,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSubscriptionRequest {
    pub active: bool,
}

/// 64 hex chars from two v4 UUIDs.
fn generate_secret() -> String {
    format!(
        "whsec_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

async fn create_subscription(
    State(state): State<ApiState>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<CreatedSubscription>)> {
    request.validate()?;
    let secret = request.secret.unwrap_or_else(generate_secret);
    let events = request.events.into_iter().map(|e| e.trim().to_string());
    let sub = state
        .subscriptions
        .create(WebhookSubscription::new(request.url, events, secret))
        .await?;

    info!(
        target: "webhook_delivery",
        subscription_id = %sub.id,
        url = %sub.url,
        events = ?sub.events,
        "Subscription created"
    );
    Ok((
        StatusCode::CREATED,
        Json(CreatedSubscription {
            subscription: SubscriptionView::from(&sub),
            secret: sub.secret,
        }),
    ))
}

async fn list_subscriptions(State(state): State<ApiState>) -> Json<Vec<SubscriptionView>> {
    let subs = state.subscriptions.list().await;
    Json(subs.iter().map(SubscriptionView::from).collect())
}

async fn get_subscription(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    let sub = state
        .subscriptions
        .get(id)
        .await
        .ok_or(WebhookError::SubscriptionNotFound)?;
    Ok(Json(SubscriptionView::from(&sub)))
}

async fn update_subscription(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateSubscriptionRequest>,
) -> ApiResult<Json<SubscriptionView>> {
    let sub = state.subscriptions.set_active(id, request.active).await?;
    info!(
        target: "webhook_delivery",
        subscription_id = %id,
        active = sub.active,
        "Subscription updated"
    );
    Ok(Json(SubscriptionView::from(&sub)))
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeliveryQuery {
    pub status: Option<String>,
}

async fn list_deliveries(
    State(state): State<ApiState>,
    Query(query): Query<DeliveryQuery>,
) -> ApiResult<Json<Vec<WebhookDelivery>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DeliveryStatus>)
        .transpose()
        .map_err(WebhookError::Validation)?;
    Ok(Json(state.deliveries.list(status).await))
}

async fn get_delivery(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WebhookDelivery>> {
    state
        .deliveries
        .get(id)
        .await
        .map(Json)
        .ok_or(WebhookError::DeliveryNotFound)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub event: String,
    pub delivery_ids: Vec<Uuid>,
}

/// Producers only learn that the event was enqueued; delivery outcomes are
/// visible through `/deliveries`.
async fn publish_event(
    State(state): State<ApiState>,
    Json(event): Json<DomainEvent>,
) -> ApiResult<(StatusCode, Json<PublishResponse>)> {
    if event.event_type.trim().is_empty() {
        return Err(WebhookError::Validation("type must not be empty".into()));
    }
    let event_type = event.event_type.clone();
    let delivery_ids = state.publisher.publish_event(event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            event: event_type,
            delivery_ids,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Queue RPC
// ---------------------------------------------------------------------------

/// `POST /rpc/requests` waits for the reply; `POST /rpc/messages` only
/// publishes. Both use the endpoint's configured request queue.
pub fn rpc_router(endpoint: Arc<RpcEndpoint>) -> Router {
    Router::new()
        .route("/rpc/requests", post(rpc_request))
        .route("/rpc/messages", post(rpc_message))
        .with_state(endpoint)
}

#[derive(Debug, Serialize)]
pub struct RpcReply {
    pub result: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcAccepted {
    pub message_id: String,
}

async fn rpc_request(
    State(endpoint): State<Arc<RpcEndpoint>>,
    Json(data): Json<Value>,
) -> ApiResult<Json<RpcReply>> {
    let result = endpoint.request(&data).await?;
    Ok(Json(RpcReply { result }))
}

async fn rpc_message(
    State(endpoint): State<Arc<RpcEndpoint>>,
    Json(data): Json<Value>,
) -> ApiResult<(StatusCode, Json<RpcAccepted>)> {
    let message_id = endpoint.notify(&data).await?;
    Ok((StatusCode::ACCEPTED, Json(RpcAccepted { message_id })))
}
