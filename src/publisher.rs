//! Fans domain events out to matching subscriptions as queued deliveries.

use crate::delivery::DeliveryQueue;
use crate::error::WebhookError;
use crate::store::{DeliveryLog, SubscriptionRegistry};
use crate::types::{
    DeliveryJob, DomainEvent, PayloadMetadata, WebhookDelivery, WebhookPayload,
    WebhookSubscription,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Values stamped into every payload's `version` and `metadata`.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub source: String,
    pub environment: String,
    pub version: String,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            source: "gym-api".into(),
            environment: "development".into(),
            version: "1.0".into(),
        }
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    subscriptions: Arc<SubscriptionRegistry>,
    deliveries: Arc<DeliveryLog>,
    queue: DeliveryQueue,
    settings: PublisherSettings,
}

impl EventPublisher {
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        deliveries: Arc<DeliveryLog>,
        queue: DeliveryQueue,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            subscriptions,
            deliveries,
            queue,
            settings,
        }
    }

    /// Build one payload per matching subscription, persist a PENDING
    /// delivery row for each and enqueue the jobs. Returns the delivery IDs.
    ///
    /// All rows are written in one step before anything is enqueued, so a
    /// storage failure leaves no delivery behind. If the queue is closed the
    /// rows stay PENDING and are picked up on the next start. Delivery
    /// outcomes never surface here. No matching subscription is not an
    /// error.
    pub async fn publish_event(&self, event: DomainEvent) -> Result<Vec<Uuid>, WebhookError> {
        let subscriptions = self.subscriptions.find_matching(&event.event_type).await;
        if subscriptions.is_empty() {
            debug!(
                target: "webhook_delivery",
                event = %event.event_type,
                "No active subscriptions match event type"
            );
            return Ok(Vec::new());
        }

        let correlation_id = event
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (deliveries, jobs): (Vec<WebhookDelivery>, Vec<DeliveryJob>) = subscriptions
            .iter()
            .map(|sub| job_for(sub, self.build_payload(&event, &correlation_id)))
            .unzip();
        let delivery_ids: Vec<Uuid> = deliveries.iter().map(|d| d.id).collect();
        self.deliveries.insert_many(deliveries).await?;

        for job in jobs {
            let id = job.delivery_id;
            self.queue.enqueue(job)?;
            debug!(target: "webhook_delivery", delivery_id = %id, "Delivery enqueued");
        }

        info!(
            target: "webhook_delivery",
            event = %event.event_type,
            correlation_id = %correlation_id,
            subscription_count = subscriptions.len(),
            "Event queued for delivery"
        );
        Ok(delivery_ids)
    }

    fn build_payload(&self, event: &DomainEvent, correlation_id: &str) -> WebhookPayload {
        WebhookPayload {
            event: event.event_type.clone(),
            version: self.settings.version.clone(),
            id: Uuid::new_v4(),
            idempotency_key: Uuid::new_v4(),
            timestamp: Utc::now(),
            data: event.data.clone(),
            metadata: PayloadMetadata {
                source: self.settings.source.clone(),
                environment: self.settings.environment.clone(),
                correlation_id: correlation_id.to_string(),
            },
        }
    }
}

fn job_for(sub: &WebhookSubscription, payload: WebhookPayload) -> (WebhookDelivery, DeliveryJob) {
    let delivery = WebhookDelivery::pending(sub.id, payload);
    let job = DeliveryJob {
        delivery_id: delivery.id,
        subscription_url: sub.url.clone(),
        payload: delivery.payload.clone(),
        subscription_secret: sub.secret.clone(),
    };
    (delivery, job)
}
