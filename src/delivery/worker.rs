use crate::delivery::transport::{SignedRequest, WebhookTransport};
use crate::error::StoreError;
use crate::signature;
use crate::store::DeliveryLog;
use crate::types::{DeliveryJob, DeliveryStatus, WebhookDelivery};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const RESPONSE_BODY_LIMIT: usize = 1024;
const ERROR_MESSAGE_LIMIT: usize = 500;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(3600);

/// Exponential backoff: the delay after failed attempt `n` is
/// `base * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            max_delay: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// What happened to one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Delivered { status: u16 },
    /// Failed; reschedule after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Failed and out of attempts.
    Failed { attempts: u32 },
    /// The row was already terminal; nothing was sent.
    Skipped,
}

/// Signs and POSTs one job, then records the result on its delivery row.
pub struct DeliveryWorker {
    deliveries: Arc<DeliveryLog>,
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
}

impl DeliveryWorker {
    pub fn new(deliveries: Arc<DeliveryLog>, transport: Arc<dyn WebhookTransport>) -> Self {
        Self {
            deliveries,
            transport,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run a single attempt for `job`.
    pub async fn attempt(&self, job: &DeliveryJob) -> Result<AttemptOutcome, StoreError> {
        let row = self
            .deliveries
            .get(job.delivery_id)
            .await
            .ok_or(StoreError::DeliveryNotFound(job.delivery_id))?;
        if row.status.is_terminal() {
            return Ok(AttemptOutcome::Skipped);
        }

        let body = match signature::canonical_json(&job.payload) {
            Ok(b) => b,
            Err(e) => {
                return self
                    .record_failure(&row, format!("failed to serialize payload: {e}"), None, None)
                    .await;
            }
        };

        let request = SignedRequest {
            url: job.subscription_url.clone(),
            signature: signature::sign(&job.subscription_secret, &body),
            webhook_id: job.payload.id,
            timestamp: job.payload.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            body,
        };

        match self.transport.post(&request).await {
            Ok(resp) if resp.is_success() => {
                let updated = self
                    .deliveries
                    .update(row.id, |d| {
                        d.attempts += 1;
                        d.status = DeliveryStatus::Success;
                        d.response_status = Some(resp.status);
                        d.response_body = Some(truncate(&resp.body, RESPONSE_BODY_LIMIT));
                        d.error_message = None;
                        d.delivered_at = Some(Utc::now());
                        d.next_attempt_at = None;
                    })
                    .await?;
                info!(
                    target: "webhook_delivery",
                    delivery_id = %updated.id,
                    webhook_id = %updated.webhook_id,
                    event = %updated.event,
                    attempts = updated.attempts,
                    status_code = resp.status,
                    "Webhook delivered"
                );
                Ok(AttemptOutcome::Delivered { status: resp.status })
            }
            Ok(resp) => {
                self.record_failure(
                    &row,
                    format!("HTTP {}", resp.status),
                    Some(resp.status),
                    Some(resp.body),
                )
                .await
            }
            Err(e) => self.record_failure(&row, e.to_string(), None, None).await,
        }
    }

    async fn record_failure(
        &self,
        row: &WebhookDelivery,
        error: String,
        response_status: Option<u16>,
        response_body: Option<String>,
    ) -> Result<AttemptOutcome, StoreError> {
        let max_attempts = self.policy.max_attempts;
        let attempt = row.attempts + 1;
        let delay = self.policy.delay_after(attempt);
        let exhausted = attempt >= max_attempts;

        let updated = self
            .deliveries
            .update(row.id, |d| {
                d.attempts = attempt;
                d.error_message = Some(truncate(&error, ERROR_MESSAGE_LIMIT));
                d.response_status = response_status;
                d.response_body = response_body.map(|b| truncate(&b, RESPONSE_BODY_LIMIT));
                if exhausted {
                    d.status = DeliveryStatus::Failed;
                    d.next_attempt_at = None;
                } else {
                    d.status = DeliveryStatus::Retrying;
                    d.next_attempt_at = chrono::Duration::from_std(delay)
                        .ok()
                        .map(|delay| Utc::now() + delay);
                }
            })
            .await?;

        if exhausted {
            warn!(
                target: "webhook_delivery",
                delivery_id = %updated.id,
                webhook_id = %updated.webhook_id,
                event = %updated.event,
                attempts = attempt,
                error = %error,
                "Webhook delivery failed permanently"
            );
            Ok(AttemptOutcome::Failed { attempts: attempt })
        } else {
            warn!(
                target: "webhook_delivery",
                delivery_id = %updated.id,
                webhook_id = %updated.webhook_id,
                event = %updated.event,
                attempt,
                max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Webhook delivery failed, scheduling retry"
            );
            Ok(AttemptOutcome::Retry { attempt, delay })
        }
    }
}

fn truncate(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}
