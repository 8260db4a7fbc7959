//! AMQP 0-9-1 broker over `lapin`.
//!
//! One connection with one channel in publisher-confirm mode. Every queue is
//! declared durable and every message is published persistent to the default
//! exchange, routed by queue name.

use crate::error::BrokerError;
use crate::rpc::broker::{Broker, Consumer, InboundMessage, MessageProperties, Settle, Settlement};
use crate::rpc::connection::Connector;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unacked deliveries a consumer may hold at once.
const PREFETCH: u16 = 16;
const PERSISTENT: u8 = 2;

/// Opens [`AmqpBroker`] connections to `url`.
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let broker = AmqpBroker::connect(&self.url).await?;
        Ok(Arc::new(broker))
    }
}

pub struct AmqpBroker {
    connection: Arc<Connection>,
    channel: Channel,
    lost: Arc<watch::Sender<bool>>,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let failed = |e: lapin::Error| BrokerError::ConnectionFailed {
            url: url.to_string(),
            cause: e.to_string(),
        };
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(failed)?;
        let channel = connection.create_channel().await.map_err(failed)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(failed)?;
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .map_err(failed)?;

        let lost = Arc::new(watch::channel(false).0);
        let on_error = lost.clone();
        connection.on_error(move |e| {
            warn!(target: "queue_rpc", error = %e, "AMQP connection error");
            on_error.send_replace(true);
        });
        debug!(target: "queue_rpc", url, "AMQP channel open");

        Ok(Self {
            connection: Arc::new(connection),
            channel,
            lost,
        })
    }

    /// Lost connections report `NotConnected` so the manager reconnects;
    /// anything else is a per-call failure.
    fn classify(&self, e: lapin::Error, other: impl FnOnce(String) -> BrokerError) -> BrokerError {
        if *self.lost.borrow() || !self.connection.status().connected() {
            self.lost.send_replace(true);
            BrokerError::NotConnected
        } else {
            other(e.to_string())
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| {
                self.classify(e, |cause: String| BrokerError::ConsumeFailed {
                    queue: queue.to_string(),
                    cause,
                })
            })
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        let publish_failed = |cause: String| BrokerError::PublishFailed {
            queue: queue.to_string(),
            cause,
        };
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                to_amqp(&properties),
            )
            .await
            .map_err(|e| self.classify(e, publish_failed))?;
        let confirmation = confirm
            .await
            .map_err(|e| self.classify(e, publish_failed))?;
        if confirmation.is_nack() {
            return Err(publish_failed("broker rejected the message".into()));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let tag = format!("gym-webhooks-{}", Uuid::new_v4().simple());
        let mut deliveries = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                self.classify(e, |cause: String| BrokerError::ConsumeFailed {
                    queue: queue.to_string(),
                    cause,
                })
            })?;

        let (out, rx) = mpsc::channel(1);
        let channel = self.channel.clone();
        let lost = self.lost.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = deliveries.next() => next,
                    _ = out.closed() => break,
                };
                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        warn!(target: "queue_rpc", queue = %queue, error = %e, "Consumer failed");
                        lost.send_replace(true);
                        return;
                    }
                    None => {
                        lost.send_replace(true);
                        return;
                    }
                };
                let message = InboundMessage::new(
                    delivery.data,
                    from_amqp(&delivery.properties),
                    delivery.redelivered,
                    Box::new(AmqpSettle {
                        acker: delivery.acker,
                    }),
                );
                if out.send(message).await.is_err() {
                    break;
                }
            }
            // The reader went away; stop the broker from pushing more.
            if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                debug!(target: "queue_rpc", queue = %queue, error = %e, "Consumer cancel failed");
            }
            debug!(target: "queue_rpc", queue = %queue, "Consumer stopped");
        });

        Ok(Consumer::new(rx))
    }

    async fn closed(&self) {
        let mut lost = self.lost.subscribe();
        let _ = lost.wait_for(|lost| *lost).await;
    }
}

impl Drop for AmqpBroker {
    fn drop(&mut self) {
        if !self.connection.status().connected() {
            return;
        }
        let connection = self.connection.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = connection.close(200, "closing").await {
                    debug!(target: "queue_rpc", error = %e, "AMQP close failed");
                }
            });
        }
    }
}

struct AmqpSettle {
    acker: Acker,
}

impl Settle for AmqpSettle {
    fn settle(
        self: Box<Self>,
        outcome: Settlement,
        _body: Vec<u8>,
        _properties: MessageProperties,
    ) {
        // Without a runtime the broker redelivers once the channel closes.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let acker = self.acker;
        runtime.spawn(async move {
            let result = match outcome {
                Settlement::Ack => acker.ack(BasicAckOptions::default()).await,
                Settlement::Requeue | Settlement::Discard => {
                    acker
                        .nack(BasicNackOptions {
                            multiple: false,
                            requeue: outcome == Settlement::Requeue,
                        })
                        .await
                }
            };
            if let Err(e) = result {
                warn!(target: "queue_rpc", error = %e, ?outcome, "Could not settle message");
            }
        });
    }
}

fn to_amqp(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(ShortString::from("application/json"));
    if let Some(id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(id) = &properties.message_id {
        amqp = amqp.with_message_id(ShortString::from(id.clone()));
    }
    amqp
}

fn from_amqp(properties: &BasicProperties) -> MessageProperties {
    let text = |s: &Option<ShortString>| s.as_ref().map(|s| s.as_str().to_string());
    MessageProperties {
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()),
        message_id: text(properties.message_id()),
    }
}
