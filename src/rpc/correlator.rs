//! Correlates replies on a reply queue with the requests waiting for them.

use crate::error::RpcError;
use crate::rpc::broker::{Broker, Consumer, MessageProperties};
use crate::rpc::connection::ReconnectHook;
use crate::rpc::{ReplyEnvelope, RequestEnvelope};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(5000);

type Reply = Result<Value, RpcError>;

struct PendingRequest {
    sender: oneshot::Sender<Reply>,
    created_at: Instant,
    queue: String,
}

#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_registered: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_timeouts: AtomicU64,
    /// Callers that went away before a reply or timeout.
    pub total_cancelled: AtomicU64,
}

/// Requests waiting for a reply, keyed by correlation ID.
///
/// Every entry leaves the map through exactly one of `complete`, `expire`
/// or `cancel`; `DashMap::remove` decides which one wins.
#[derive(Default)]
pub struct PendingRequests {
    pending: DashMap<String, PendingRequest>,
    stats: PendingStats,
}

impl PendingRequests {
    pub fn register(&self, queue: &str) -> (String, oneshot::Receiver<Reply>) {
        let correlation_id = Uuid::new_v4().to_string();
        let (sender, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id.clone(),
            PendingRequest {
                sender,
                created_at: Instant::now(),
                queue: queue.to_string(),
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        (correlation_id, rx)
    }

    /// Hand a reply to its waiter. False when the ID is unknown, already
    /// timed out or the waiter is gone.
    pub fn complete(&self, correlation_id: &str, reply: Reply) -> bool {
        let Some((_, request)) = self.pending.remove(correlation_id) else {
            warn!(
                target: "queue_rpc",
                correlation_id,
                "Reply for unknown or expired correlation id"
            );
            return false;
        };
        match request.sender.send(reply) {
            Ok(()) => {
                self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "queue_rpc",
                    correlation_id,
                    queue = %request.queue,
                    response_time_ms = request.created_at.elapsed().as_millis() as u64,
                    "Completed pending request"
                );
                true
            }
            Err(_) => {
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Remove a request whose timer fired. False when a reply won the race.
    fn expire(&self, correlation_id: &str) -> bool {
        if self.pending.remove(correlation_id).is_some() {
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn cancel(&self, correlation_id: &str) {
        if self.pending.remove(correlation_id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

/// Removes the entry if the waiting call is dropped mid-flight.
struct CancelOnDrop<'a> {
    pending: &'a PendingRequests,
    correlation_id: &'a str,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.correlation_id);
    }
}

/// Client side of queue RPC.
///
/// `broker` is normally a [`ConnectionManager`](crate::rpc::ConnectionManager);
/// register the client as its reconnect hook so reply consumers come back
/// after an outage. Requests in flight during an outage are not failed
/// early; they run into their own timeout.
pub struct QueueRpcClient {
    broker: Arc<dyn Broker>,
    pending: Arc<PendingRequests>,
    consumers: DashMap<String, JoinHandle<()>>,
    consumer_start: Mutex<()>,
    default_timeout: Duration,
}

impl QueueRpcClient {
    pub fn new(broker: Arc<dyn Broker>, default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            broker,
            pending: Arc::new(PendingRequests::default()),
            consumers: DashMap::new(),
            consumer_start: Mutex::new(()),
            default_timeout,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    pub fn stats(&self) -> &PendingStats {
        self.pending.stats()
    }

    /// Fire-and-forget publish. Returns the generated message ID once the
    /// broker has accepted the message.
    pub async fn send_message<T: Serialize>(
        &self,
        queue: &str,
        data: &T,
    ) -> Result<String, RpcError> {
        let message_id = Uuid::new_v4().to_string();
        let body = encode(RequestEnvelope {
            correlation_id: None,
            message_id: Some(message_id.clone()),
            data: to_value(data)?,
            timestamp: Utc::now(),
        })?;

        self.broker.assert_queue(queue).await?;
        self.broker
            .publish(
                queue,
                body,
                MessageProperties {
                    message_id: Some(message_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        debug!(target: "queue_rpc", queue, message_id = %message_id, "Message published");
        Ok(message_id)
    }

    /// Publish `data` to `queue` and wait for the reply on `reply_queue`.
    ///
    /// Exactly one of reply or timeout is delivered. The timeout runs from
    /// the moment the request is registered and covers consumer setup and
    /// the publish. `None` uses the client's default timeout.
    pub async fn send_request<T: Serialize>(
        &self,
        queue: &str,
        reply_queue: &str,
        data: &T,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let data = to_value(data)?;

        let (correlation_id, mut rx) = self.pending.register(queue);
        let deadline = tokio::time::Instant::now() + timeout;
        let _guard = CancelOnDrop {
            pending: &self.pending,
            correlation_id: &correlation_id,
        };

        let body = encode(RequestEnvelope {
            correlation_id: Some(correlation_id.clone()),
            message_id: None,
            data,
            timestamp: Utc::now(),
        })?;
        let publish = async {
            self.ensure_reply_consumer(reply_queue).await?;
            self.broker.assert_queue(queue).await?;
            self.broker
                .publish(
                    queue,
                    body,
                    MessageProperties {
                        correlation_id: Some(correlation_id.clone()),
                        reply_to: Some(reply_queue.to_string()),
                        message_id: Some(Uuid::new_v4().to_string()),
                    },
                )
                .await?;
            Ok::<(), RpcError>(())
        };
        match tokio::time::timeout_at(deadline, publish).await {
            Ok(published) => published?,
            Err(_) => {
                self.pending.expire(&correlation_id);
                return Err(timed_out(queue, &correlation_id, timeout));
            }
        }
        debug!(
            target: "queue_rpc",
            queue,
            reply_queue,
            correlation_id = %correlation_id,
            timeout_ms = timeout.as_millis() as u64,
            "Request published"
        );

        tokio::select! {
            reply = &mut rx => reply.unwrap_or(Err(RpcError::Cancelled)),
            _ = tokio::time::sleep_until(deadline) => {
                if self.pending.expire(&correlation_id) {
                    Err(timed_out(queue, &correlation_id, timeout))
                } else {
                    // The reply was dispatched between the timer firing and
                    // the removal; it is already in the channel.
                    rx.await.unwrap_or(Err(RpcError::Cancelled))
                }
            }
        }
    }

    async fn ensure_reply_consumer(&self, reply_queue: &str) -> Result<(), RpcError> {
        if self.has_live_consumer(reply_queue) {
            return Ok(());
        }
        let _starting = self.consumer_start.lock().await;
        if self.has_live_consumer(reply_queue) {
            return Ok(());
        }
        self.start_consumer(self.broker.clone(), reply_queue).await?;
        Ok(())
    }

    fn has_live_consumer(&self, reply_queue: &str) -> bool {
        self.consumers
            .get(reply_queue)
            .is_some_and(|task| !task.is_finished())
    }

    async fn start_consumer(
        &self,
        broker: Arc<dyn Broker>,
        reply_queue: &str,
    ) -> Result<(), crate::error::BrokerError> {
        broker.assert_queue(reply_queue).await?;
        let consumer = broker.consume(reply_queue).await?;
        let task = tokio::spawn(dispatch_replies(
            consumer,
            self.pending.clone(),
            reply_queue.to_string(),
        ));
        if let Some(previous) = self.consumers.insert(reply_queue.to_string(), task) {
            previous.abort();
        }
        info!(target: "queue_rpc", reply_queue, "Reply consumer started");
        Ok(())
    }
}

#[async_trait]
impl ReconnectHook for QueueRpcClient {
    async fn on_connected(&self, broker: Arc<dyn Broker>) {
        let _starting = self.consumer_start.lock().await;
        let queues: Vec<String> = self.consumers.iter().map(|e| e.key().clone()).collect();
        for queue in queues {
            if self.has_live_consumer(&queue) {
                continue;
            }
            if let Err(e) = self.start_consumer(broker.clone(), &queue).await {
                warn!(
                    target: "queue_rpc",
                    reply_queue = %queue,
                    error = %e,
                    "Could not restart reply consumer"
                );
            }
        }
    }
}

async fn dispatch_replies(
    mut consumer: Consumer,
    pending: Arc<PendingRequests>,
    reply_queue: String,
) {
    while let Some(message) = consumer.next().await {
        let Some(correlation_id) = message.properties.correlation_id.clone() else {
            warn!(
                target: "queue_rpc",
                reply_queue = %reply_queue,
                "Discarding reply without correlation id"
            );
            message.ack();
            continue;
        };
        pending.complete(&correlation_id, decode_reply(&message.body));
        message.ack();
    }
    debug!(target: "queue_rpc", reply_queue = %reply_queue, "Reply consumer ended");
}

/// `{success, data, error}` replies are unwrapped; any other JSON body is
/// the result as-is.
fn decode_reply(body: &[u8]) -> Reply {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| RpcError::InvalidReply(e.to_string()))?;
    if value.get("success").is_some_and(Value::is_boolean) {
        let reply: ReplyEnvelope =
            serde_json::from_value(value).map_err(|e| RpcError::InvalidReply(e.to_string()))?;
        return if reply.success {
            Ok(reply.data)
        } else {
            Err(RpcError::Remote {
                message: reply.error.unwrap_or_else(|| "unknown error".into()),
            })
        };
    }
    Ok(value)
}

fn timed_out(queue: &str, correlation_id: &str, timeout: Duration) -> RpcError {
    warn!(
        target: "queue_rpc",
        queue,
        correlation_id,
        timeout_ms = timeout.as_millis() as u64,
        "Request timed out"
    );
    RpcError::Timeout {
        correlation_id: correlation_id.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    }
}

fn to_value<T: Serialize>(data: &T) -> Result<Value, RpcError> {
    serde_json::to_value(data).map_err(|e| RpcError::Serialization(e.to_string()))
}

fn encode(envelope: RequestEnvelope) -> Result<Vec<u8>, RpcError> {
    serde_json::to_vec(&envelope).map_err(|e| RpcError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::broker::MemoryBroker;
    use async_trait::async_trait;
    use serde_json::json;

    fn client(broker: &MemoryBroker, timeout_ms: u64) -> Arc<QueueRpcClient> {
        QueueRpcClient::new(Arc::new(broker.clone()), Duration::from_millis(timeout_ms))
    }

    /// Answer the next request on `queue` with `reply`.
    async fn answer_once(broker: MemoryBroker, queue: &'static str, reply: Value) {
        let mut consumer = broker.consume(queue).await.unwrap();
        let request = consumer.next().await.unwrap();
        let props = request.properties.clone();
        request.ack();
        broker
            .publish(
                props.reply_to.as_deref().unwrap(),
                serde_json::to_vec(&reply).unwrap(),
                MessageProperties {
                    correlation_id: props.correlation_id,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_at_configured_duration_and_clears_entry() {
        let broker = MemoryBroker::new();
        let client = client(&broker, 5000);

        let started = tokio::time::Instant::now();
        let err = client
            .send_request("nobody.listens", "replies", &json!({"ping": 1}), None)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(started.elapsed(), Duration::from_millis(5000));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.stats().total_timeouts.load(Ordering::Relaxed), 1);
    }

    /// Publishes after a fixed delay.
    struct SlowPublish {
        inner: MemoryBroker,
        delay: Duration,
    }

    #[async_trait]
    impl Broker for SlowPublish {
        async fn assert_queue(&self, queue: &str) -> Result<(), crate::error::BrokerError> {
            self.inner.assert_queue(queue).await
        }

        async fn publish(
            &self,
            queue: &str,
            body: Vec<u8>,
            properties: MessageProperties,
        ) -> Result<(), crate::error::BrokerError> {
            tokio::time::sleep(self.delay).await;
            self.inner.publish(queue, body, properties).await
        }

        async fn consume(&self, queue: &str) -> Result<Consumer, crate::error::BrokerError> {
            self.inner.consume(queue).await
        }

        async fn closed(&self) {
            self.inner.closed().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_publish_counts_against_the_timeout() {
        let broker = SlowPublish {
            inner: MemoryBroker::new(),
            delay: Duration::from_millis(3000),
        };
        let client = QueueRpcClient::new(Arc::new(broker), Duration::from_millis(5000));

        let started = tokio::time::Instant::now();
        let err = client
            .send_request("nobody.listens", "replies", &json!({}), None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(started.elapsed(), Duration::from_millis(5000));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_outliving_the_deadline_times_out() {
        let broker = SlowPublish {
            inner: MemoryBroker::new(),
            delay: Duration::from_secs(60),
        };
        let client = QueueRpcClient::new(Arc::new(broker), Duration::from_millis(500));

        let started = tokio::time::Instant::now();
        let err = client
            .send_request("requests", "replies", &json!({}), None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.stats().total_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn reply_resolves_request_and_clears_entry() {
        let broker = MemoryBroker::new();
        let client = client(&broker, 2000);
        tokio::spawn(answer_once(
            broker.clone(),
            "requests",
            json!({"success": true, "data": {"pong": 1}}),
        ));

        let reply = client
            .send_request("requests", "replies", &json!({"ping": 1}), None)
            .await
            .unwrap();
        assert_eq!(reply, json!({"pong": 1}));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.stats().total_completed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn remote_failure_is_not_a_timeout() {
        let broker = MemoryBroker::new();
        let client = client(&broker, 2000);
        tokio::spawn(answer_once(
            broker.clone(),
            "requests",
            json!({"success": false, "error": "clase not found"}),
        ));

        let err = client
            .send_request("requests", "replies", &json!({}), None)
            .await
            .unwrap_err();
        match err {
            RpcError::Remote { message } => assert_eq!(message, "clase not found"),
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bare_json_reply_is_returned_verbatim() {
        let broker = MemoryBroker::new();
        let client = client(&broker, 2000);
        tokio::spawn(answer_once(broker.clone(), "requests", json!([1, 2, 3])));

        let reply = client
            .send_request("requests", "replies", &json!({}), None)
            .await
            .unwrap();
        assert_eq!(reply, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_dropped() {
        let pending = PendingRequests::default();
        let (id, _rx) = pending.register("q");
        assert!(pending.expire(&id));
        assert!(!pending.complete(&id, Ok(json!(1))));
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropped_caller_leaves_no_entry() {
        let broker = MemoryBroker::new();
        let client = client(&broker, 60_000);

        let data = json!({});
        let call = client.send_request("requests", "replies", &data, None);
        let _ = tokio::time::timeout(Duration::from_millis(20), call).await;
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.stats().total_cancelled.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn send_message_returns_message_id() {
        let broker = MemoryBroker::new();
        let client = client(&broker, 1000);
        let id = client
            .send_message("events", &json!({"type": "pago.completed"}))
            .await
            .unwrap();

        let mut consumer = broker.consume("events").await.unwrap();
        let msg = consumer.next().await.unwrap();
        assert_eq!(msg.properties.message_id.as_deref(), Some(id.as_str()));
        let envelope: RequestEnvelope = serde_json::from_slice(&msg.body).unwrap();
        assert_eq!(envelope.data["type"], "pago.completed");
        assert_eq!(envelope.message_id.as_deref(), Some(id.as_str()));
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn decode_reply_rejects_non_json() {
        assert!(matches!(
            decode_reply(b"not json"),
            Err(RpcError::InvalidReply(_))
        ));
    }
}
