//! Request/reply over a message broker.
//!
//! The client side ([`QueueRpcClient`]) turns a publish plus a reply-queue
//! consumer into an awaitable call with a timeout; the service side
//! ([`RpcResponder`]) answers on the `replyTo` queue with the request's
//! correlation ID.

pub mod amqp;
pub mod broker;
pub mod connection;
pub mod correlator;
pub mod responder;

pub use amqp::{AmqpBroker, AmqpConnector};
pub use broker::{
    Broker, Consumer, InboundMessage, MemoryBroker, MemoryConnector, MessageProperties,
};
pub use connection::{ConnectionManager, ConnectionState, Connector, ReconnectHook};
pub use correlator::{PendingRequests, PendingStats, QueueRpcClient, DEFAULT_RPC_TIMEOUT};
pub use responder::{RequestHandler, RpcResponder};

use crate::config::BrokerConfig;
use crate::error::RpcError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

/// Body of every message the client publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Body of a reply. `success: false` carries the handler's error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplyEnvelope {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(message.into()),
        }
    }
}

/// A started connection manager plus a client bound to the configured
/// request and reply queues.
pub struct RpcEndpoint {
    pub manager: Arc<ConnectionManager>,
    pub client: Arc<QueueRpcClient>,
    request_queue: String,
    reply_queue: String,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RpcEndpoint {
    /// Wire a [`ConnectionManager`] over `connector`, register the client
    /// as its reconnect hook and start the supervisor.
    pub async fn start(
        config: &BrokerConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let manager = ConnectionManager::new(connector, config.reconnect_interval);
        let client = QueueRpcClient::new(manager.clone(), config.rpc_timeout);
        manager.add_hook(client.clone()).await;
        let supervisor = manager.start();
        info!(
            target: "queue_rpc",
            request_queue = %config.request_queue,
            reply_queue = %config.reply_queue,
            "Queue RPC endpoint started"
        );
        Self {
            manager,
            client,
            request_queue: config.request_queue.clone(),
            reply_queue: config.reply_queue.clone(),
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Request/reply on the configured queues with the configured timeout.
    pub async fn request<T: Serialize>(&self, data: &T) -> Result<Value, RpcError> {
        self.client
            .send_request(&self.request_queue, &self.reply_queue, data, None)
            .await
    }

    /// Fire-and-forget on the request queue.
    pub async fn notify<T: Serialize>(&self, data: &T) -> Result<String, RpcError> {
        self.client.send_message(&self.request_queue, data).await
    }

    /// Stop reconnecting and wait for the supervisor to release the
    /// connection.
    pub async fn shutdown(&self) {
        self.manager.close();
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            let _ = supervisor.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Inscripciones;

    #[async_trait]
    impl RequestHandler for Inscripciones {
        async fn handle(&self, data: Value) -> Result<Value, String> {
            Ok(json!({"inscripcion_id": 7, "clase_id": data["clase_id"]}))
        }
    }

    fn config() -> BrokerConfig {
        BrokerConfig {
            url: "memory://".into(),
            request_queue: "inscripciones.rpc".into(),
            reply_queue: "inscripciones.reply".into(),
            rpc_timeout: Duration::from_secs(2),
            reconnect_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn endpoint_requests_use_configured_queues() {
        let broker = MemoryBroker::new();
        RpcResponder::new("inscripciones.rpc", Arc::new(Inscripciones))
            .serve(Arc::new(broker.clone()))
            .await
            .unwrap();

        let endpoint =
            RpcEndpoint::start(&config(), Arc::new(MemoryConnector::new(broker.clone()))).await;
        assert!(endpoint.manager.wait_connected(Duration::from_secs(1)).await);

        let reply = endpoint.request(&json!({"clase_id": 12})).await.unwrap();
        assert_eq!(reply, json!({"inscripcion_id": 7, "clase_id": 12}));
        assert_eq!(endpoint.client.pending_count(), 0);

        endpoint.shutdown().await;
    }

    #[test]
    fn reply_envelope_shape() {
        assert_eq!(
            serde_json::to_value(ReplyEnvelope::err("boom")).unwrap(),
            json!({"success": false, "data": null, "error": "boom"})
        );
        assert_eq!(
            serde_json::to_value(ReplyEnvelope::ok(json!(1))).unwrap(),
            json!({"success": true, "data": 1})
        );
    }
}
