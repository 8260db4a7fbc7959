use crate::error::BrokerError;
use crate::rpc::broker::{Broker, InboundMessage, MessageProperties};
use crate::rpc::connection::ReconnectHook;
use crate::rpc::{ReplyEnvelope, RequestEnvelope};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handles the `data` of one request. An `Err` is sent back as
/// `{success: false, error}`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, data: Value) -> Result<Value, String>;
}

/// Service side of queue RPC: consumes `queue` and answers every request
/// that carries a `replyTo`.
pub struct RpcResponder {
    queue: String,
    handler: Arc<dyn RequestHandler>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcResponder {
    pub fn new(queue: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Arc<Self> {
        Arc::new(Self {
            queue: queue.into(),
            handler,
            task: Mutex::new(None),
        })
    }

    /// Start consuming on `broker`. Replaces a previous consumer task.
    pub async fn serve(&self, broker: Arc<dyn Broker>) -> Result<(), BrokerError> {
        broker.assert_queue(&self.queue).await?;
        let mut consumer = broker.consume(&self.queue).await?;
        let handler = self.handler.clone();
        let queue = self.queue.clone();

        let task = tokio::spawn(async move {
            while let Some(message) = consumer.next().await {
                if let Err(e) = respond(broker.as_ref(), handler.as_ref(), message).await {
                    warn!(
                        target: "queue_rpc",
                        queue = %queue,
                        error = %e,
                        "Reply could not be sent"
                    );
                }
            }
            debug!(target: "queue_rpc", queue = %queue, "Responder consumer ended");
        });

        if let Ok(mut slot) = self.task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
        info!(target: "queue_rpc", queue = %self.queue, "Responder serving");
        Ok(())
    }

    pub fn stop(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl ReconnectHook for RpcResponder {
    async fn on_connected(&self, broker: Arc<dyn Broker>) {
        if let Err(e) = self.serve(broker).await {
            warn!(
                target: "queue_rpc",
                queue = %self.queue,
                error = %e,
                "Responder could not resume"
            );
        }
    }
}

async fn respond(
    broker: &dyn Broker,
    handler: &dyn RequestHandler,
    message: InboundMessage,
) -> Result<(), BrokerError> {
    let data = match serde_json::from_slice::<RequestEnvelope>(&message.body) {
        Ok(envelope) => Ok(envelope.data),
        // Producers that skip the envelope send the data directly.
        Err(_) => serde_json::from_slice::<Value>(&message.body).map_err(|e| e.to_string()),
    };
    let reply = match data {
        Ok(data) => match handler.handle(data).await {
            Ok(result) => ReplyEnvelope::ok(result),
            Err(error) => ReplyEnvelope::err(error),
        },
        Err(e) => ReplyEnvelope::err(format!("malformed request: {e}")),
    };

    let Some(reply_to) = message.properties.reply_to.clone() else {
        message.ack();
        return Ok(());
    };
    let body = serde_json::to_vec(&reply).map_err(|e| BrokerError::PublishFailed {
        queue: reply_to.clone(),
        cause: e.to_string(),
    })?;
    let published = broker
        .publish(
            &reply_to,
            body,
            MessageProperties {
                correlation_id: message.properties.correlation_id.clone(),
                ..Default::default()
            },
        )
        .await;
    match published {
        Ok(()) => {
            message.ack();
            Ok(())
        }
        Err(e) => {
            message.nack(true);
            Err(e)
        }
    }
}
