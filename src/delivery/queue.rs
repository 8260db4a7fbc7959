use crate::delivery::worker::{AttemptOutcome, DeliveryWorker};
use crate::error::{StoreError, WebhookError};
use crate::store::{DeliveryLog, SubscriptionRegistry};
use crate::types::DeliveryJob;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Producer handle of the delivery queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<DeliveryJob>,
}

impl DeliveryQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeliveryJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, job: DeliveryJob) -> Result<(), WebhookError> {
        self.tx.send(job).map_err(|_| WebhookError::QueueClosed)
    }
}

/// Consume jobs with at most `concurrency` attempts in flight.
///
/// A failed attempt releases its slot, sleeps for the backoff delay and
/// puts the job back on the queue, so one delivery never has two attempts
/// running at once. An attempt whose result could not be written is
/// retried the same way after the base backoff; its row is unchanged. The
/// runner only holds a weak handle to the queue and stops once every
/// `DeliveryQueue` clone has been dropped.
pub fn spawn_runner(
    worker: Arc<DeliveryWorker>,
    queue: DeliveryQueue,
    mut rx: mpsc::UnboundedReceiver<DeliveryJob>,
    concurrency: usize,
) -> JoinHandle<()> {
    let requeue = queue.tx.downgrade();
    drop(queue);
    let slots = Arc::new(Semaphore::new(concurrency.max(1)));

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let permit = match slots.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let worker = worker.clone();
            let requeue = requeue.clone();

            tokio::spawn(async move {
                let outcome = worker.attempt(&job).await;
                drop(permit);

                match outcome {
                    Ok(AttemptOutcome::Retry { delay, .. }) => {
                        retry_later(&requeue, job, delay).await;
                    }
                    Ok(AttemptOutcome::Skipped) => {
                        debug!(
                            target: "webhook_delivery",
                            delivery_id = %job.delivery_id,
                            "Skipping job for finished delivery"
                        );
                    }
                    Ok(_) => {}
                    Err(StoreError::DeliveryNotFound(id)) => {
                        warn!(
                            target: "webhook_delivery",
                            delivery_id = %id,
                            "Dropping job for unknown delivery"
                        );
                    }
                    Err(e) => {
                        let delay = worker.policy().delay_after(1);
                        error!(
                            target: "webhook_delivery",
                            delivery_id = %job.delivery_id,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Delivery attempt could not be recorded"
                        );
                        retry_later(&requeue, job, delay).await;
                    }
                }
            });
        }
        debug!(target: "webhook_delivery", "Delivery runner stopped");
    })
}

async fn retry_later(
    requeue: &mpsc::WeakUnboundedSender<DeliveryJob>,
    job: DeliveryJob,
    delay: Duration,
) {
    tokio::time::sleep(delay).await;
    let sent = requeue.upgrade().map(|tx| tx.send(job));
    if !matches!(sent, Some(Ok(()))) {
        warn!(
            target: "webhook_delivery",
            "Delivery queue closed before retry; row stays unfinished"
        );
    }
}

/// Re-enqueue rows left PENDING or RETRYING by a previous process.
/// Rows whose subscription no longer exists are left as they are.
pub async fn requeue_unfinished(
    deliveries: &DeliveryLog,
    subscriptions: &SubscriptionRegistry,
    queue: &DeliveryQueue,
) -> Result<usize, WebhookError> {
    let mut requeued = 0;
    for row in deliveries.unfinished().await {
        let Some(sub) = subscriptions.get(row.subscription_id).await else {
            warn!(
                target: "webhook_delivery",
                delivery_id = %row.id,
                subscription_id = %row.subscription_id,
                "Unfinished delivery references a missing subscription"
            );
            continue;
        };
        queue.enqueue(DeliveryJob {
            delivery_id: row.id,
            subscription_url: sub.url,
            payload: row.payload,
            subscription_secret: sub.secret,
        })?;
        requeued += 1;
    }
    if requeued > 0 {
        info!(target: "webhook_delivery", requeued, "Recovered unfinished deliveries");
    }
    Ok(requeued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::transport::{
        SignedRequest, TransportError, TransportResponse, WebhookTransport,
    };
    use crate::delivery::worker::RetryPolicy;
    use crate::types::{
        DeliveryStatus, PayloadMetadata, WebhookDelivery, WebhookPayload, WebhookSubscription,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    struct FailNTimes {
        failures: usize,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl WebhookTransport for FailNTimes {
        async fn post(
            &self,
            _request: &SignedRequest,
        ) -> Result<TransportResponse, TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Ok(TransportResponse {
                    status: 500,
                    body: String::new(),
                })
            } else {
                Ok(TransportResponse {
                    status: 200,
                    body: String::new(),
                })
            }
        }
    }

    fn payload() -> WebhookPayload {
        WebhookPayload {
            event: "clase.created".into(),
            version: "1.0".into(),
            id: Uuid::new_v4(),
            idempotency_key: Uuid::new_v4(),
            timestamp: Utc::now(),
            data: serde_json::json!({}),
            metadata: PayloadMetadata {
                source: "gym-api".into(),
                environment: "test".into(),
                correlation_id: "c".into(),
            },
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        }
    }

    async fn wait_terminal(log: &DeliveryLog, id: Uuid) -> WebhookDelivery {
        for _ in 0..500 {
            if let Some(row) = log.get(id).await {
                if row.status.is_terminal() {
                    return row;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("delivery {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn runner_retries_until_success() {
        let log = Arc::new(DeliveryLog::in_memory());
        let transport = Arc::new(FailNTimes {
            failures: 2,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let worker = Arc::new(
            DeliveryWorker::new(log.clone(), transport.clone()).with_policy(fast_policy()),
        );
        let (queue, rx) = DeliveryQueue::channel();
        let _runner = spawn_runner(worker, queue.clone(), rx, 2);

        let delivery = WebhookDelivery::pending(Uuid::new_v4(), payload());
        let id = delivery.id;
        let job = DeliveryJob {
            delivery_id: id,
            subscription_url: "http://x".into(),
            payload: delivery.payload.clone(),
            subscription_secret: "s".into(),
        };
        log.insert(delivery).await.unwrap();
        queue.enqueue(job).unwrap();

        let row = wait_terminal(&log, id).await;
        assert_eq!(row.status, DeliveryStatus::Success);
        assert_eq!(row.attempts, 3);
    }

    /// Accepts every request but blocks the delivery log's temp file during
    /// the first one, so recording that attempt fails.
    struct BlocksFirstWrite {
        blocker: std::path::PathBuf,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WebhookTransport for BlocksFirstWrite {
        async fn post(
            &self,
            _request: &SignedRequest,
        ) -> Result<TransportResponse, TransportError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::fs::create_dir(&self.blocker).unwrap();
            } else if self.blocker.exists() {
                std::fs::remove_dir(&self.blocker).unwrap();
            }
            Ok(TransportResponse {
                status: 200,
                body: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn unrecorded_attempt_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(DeliveryLog::open(Some(dir.path())).unwrap());
        let transport = Arc::new(BlocksFirstWrite {
            blocker: dir.path().join("deliveries.json.tmp"),
            calls: AtomicUsize::new(0),
        });
        let worker = Arc::new(
            DeliveryWorker::new(log.clone(), transport.clone()).with_policy(fast_policy()),
        );
        let (queue, rx) = DeliveryQueue::channel();
        let _runner = spawn_runner(worker, queue.clone(), rx, 1);

        let delivery = WebhookDelivery::pending(Uuid::new_v4(), payload());
        let id = delivery.id;
        let job = DeliveryJob {
            delivery_id: id,
            subscription_url: "http://x".into(),
            payload: delivery.payload.clone(),
            subscription_secret: "s".into(),
        };
        log.insert(delivery).await.unwrap();
        queue.enqueue(job).unwrap();

        let row = wait_terminal(&log, id).await;
        assert_eq!(row.status, DeliveryStatus::Success);
        assert_eq!(row.attempts, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        let reopened = DeliveryLog::open(Some(dir.path())).unwrap();
        assert_eq!(reopened.get(id).await.unwrap().status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let log = Arc::new(DeliveryLog::in_memory());
        let transport = Arc::new(FailNTimes {
            failures: 0,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let worker = Arc::new(DeliveryWorker::new(log.clone(), transport.clone()));
        let (queue, rx) = DeliveryQueue::channel();

        let mut ids = Vec::new();
        for _ in 0..10 {
            let delivery = WebhookDelivery::pending(Uuid::new_v4(), payload());
            ids.push(delivery.id);
            let job = DeliveryJob {
                delivery_id: delivery.id,
                subscription_url: "http://x".into(),
                payload: delivery.payload.clone(),
                subscription_secret: "s".into(),
            };
            log.insert(delivery).await.unwrap();
            queue.enqueue(job).unwrap();
        }
        let _runner = spawn_runner(worker, queue.clone(), rx, 3);

        for id in ids {
            wait_terminal(&log, id).await;
        }
        assert!(transport.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn requeue_picks_up_unfinished_rows() {
        let log = DeliveryLog::in_memory();
        let subs = SubscriptionRegistry::in_memory();
        let sub = subs
            .create(WebhookSubscription::new("http://a", vec!["*".into()], "s"))
            .await
            .unwrap();

        log.insert(WebhookDelivery::pending(sub.id, payload())).await.unwrap();
        let mut done = WebhookDelivery::pending(sub.id, payload());
        done.status = DeliveryStatus::Success;
        log.insert(done).await.unwrap();
        log.insert(WebhookDelivery::pending(Uuid::new_v4(), payload()))
            .await
            .unwrap();

        let (queue, mut rx) = DeliveryQueue::channel();
        let requeued = requeue_unfinished(&log, &subs, &queue).await.unwrap();
        assert_eq!(requeued, 1);
        let job = rx.recv().await.unwrap();
        assert_eq!(job.subscription_url, "http://a");
        assert_eq!(job.subscription_secret, "s");
    }

    #[tokio::test]
    async fn enqueue_after_receiver_dropped_fails() {
        let (queue, rx) = DeliveryQueue::channel();
        drop(rx);
        let err = queue
            .enqueue(DeliveryJob {
                delivery_id: Uuid::new_v4(),
                subscription_url: "http://x".into(),
                payload: payload(),
                subscription_secret: "s".into(),
            })
            .unwrap_err();
        assert!(matches!(err, WebhookError::QueueClosed));
    }
}
