//! Message broker abstraction and an in-process implementation.
//!
//! `Broker` covers the small slice of AMQP the queue-RPC layer needs:
//! durable named queues, per-message properties and explicit
//! acknowledgement. The production implementation is
//! [`AmqpBroker`](crate::rpc::AmqpBroker). `MemoryBroker` implements the
//! same contract inside the process and can simulate an outage; tests use it
//! in place of a running broker.

use crate::error::BrokerError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Envelope {
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

/// How a consumed message leaves its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack,
    Requeue,
    Discard,
}

/// Reports the settlement of one message back to the broker it came from.
pub(crate) trait Settle: Send {
    fn settle(
        self: Box<Self>,
        outcome: Settlement,
        body: Vec<u8>,
        properties: MessageProperties,
    );
}

/// A consumed message. Dropping it without `ack` or `nack` puts it back on
/// its queue, as a broker does when a channel closes with unacked messages.
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    settle: Option<Box<dyn Settle>>,
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .field("settled", &self.settle.is_none())
            .finish()
    }
}

impl InboundMessage {
    pub(crate) fn new(
        body: Vec<u8>,
        properties: MessageProperties,
        redelivered: bool,
        settle: Box<dyn Settle>,
    ) -> Self {
        Self {
            body,
            properties,
            redelivered,
            settle: Some(settle),
        }
    }

    pub fn ack(mut self) {
        self.finish(Settlement::Ack);
    }

    pub fn nack(mut self, requeue: bool) {
        self.finish(if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        });
    }

    fn finish(&mut self, outcome: Settlement) {
        if let Some(settle) = self.settle.take() {
            settle.settle(
                outcome,
                std::mem::take(&mut self.body),
                std::mem::take(&mut self.properties),
            );
        }
    }
}

impl Drop for InboundMessage {
    fn drop(&mut self) {
        self.finish(Settlement::Requeue);
    }
}

/// Stream of messages from one queue. Ends when the connection it was
/// opened on goes away.
pub struct Consumer {
    rx: mpsc::Receiver<InboundMessage>,
}

impl Consumer {
    pub(crate) fn new(rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable queue; a no-op when it already exists.
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError>;

    /// Resolves once this connection is lost.
    async fn closed(&self);
}

// ---------------------------------------------------------------------------
// In-process broker
// ---------------------------------------------------------------------------

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

/// Requeues onto the in-process queue the message came from.
struct MemorySettle {
    requeue: mpsc::UnboundedSender<Envelope>,
}

impl Settle for MemorySettle {
    fn settle(
        self: Box<Self>,
        outcome: Settlement,
        body: Vec<u8>,
        properties: MessageProperties,
    ) {
        if outcome == Settlement::Requeue {
            let _ = self.requeue.send(Envelope {
                body,
                properties,
                redelivered: true,
            });
        }
    }
}

/// Connection generation. `epoch` moves on every outage so consumers
/// opened before it stop even if the broker is already back up.
#[derive(Debug, Clone, Copy)]
struct Link {
    up: bool,
    epoch: u64,
}

impl Link {
    fn lost_since(&self, epoch: u64) -> bool {
        !self.up || self.epoch != epoch
    }
}

/// In-process broker for tests. Queues and their messages survive
/// `go_down`/`go_up`, like durable queues survive a client reconnect. One
/// consumer reads a queue at a time; a second `consume` waits until the
/// first ends.
#[derive(Clone)]
pub struct MemoryBroker {
    queues: Arc<DashMap<String, MemoryQueue>>,
    link: Arc<watch::Sender<Link>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (link, _) = watch::channel(Link { up: true, epoch: 0 });
        Self {
            queues: Arc::new(DashMap::new()),
            link: Arc::new(link),
        }
    }

    pub fn is_up(&self) -> bool {
        self.link.borrow().up
    }

    /// Simulate an outage: open consumers end and every call fails with
    /// `NotConnected` until `go_up`.
    pub fn go_down(&self) {
        self.link.send_modify(|link| {
            link.up = false;
            link.epoch += 1;
        });
        debug!(target: "queue_rpc", "Memory broker down");
    }

    pub fn go_up(&self) {
        self.link.send_modify(|link| link.up = true);
        debug!(target: "queue_rpc", "Memory broker up");
    }

    fn ensure_up(&self) -> Result<u64, BrokerError> {
        let link = *self.link.borrow();
        if link.up {
            Ok(link.epoch)
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    #[allow(clippy::type_complexity)]
    fn queue(
        &self,
        name: &str,
    ) -> (
        mpsc::UnboundedSender<Envelope>,
        Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    ) {
        let entry = self.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            MemoryQueue {
                tx,
                rx: Arc::new(Mutex::new(rx)),
            }
        });
        (entry.tx.clone(), entry.rx.clone())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_up()?;
        self.queue(queue);
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_up()?;
        let (tx, _) = self.queue(queue);
        tx.send(Envelope {
            body,
            properties,
            redelivered: false,
        })
        .map_err(|e| BrokerError::PublishFailed {
            queue: queue.to_string(),
            cause: e.to_string(),
        })
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let epoch = self.ensure_up()?;
        let (requeue, source) = self.queue(queue);
        let mut link = self.link.subscribe();
        let (out, rx) = mpsc::channel(1);
        let queue = queue.to_string();

        tokio::spawn(async move {
            let mut source = tokio::select! {
                guard = source.lock_owned() => guard,
                _ = link.wait_for(|l| l.lost_since(epoch)) => return,
                _ = out.closed() => return,
            };
            loop {
                let envelope = tokio::select! {
                    next = source.recv() => match next {
                        Some(envelope) => envelope,
                        None => return,
                    },
                    _ = link.wait_for(|l| l.lost_since(epoch)) => break,
                    _ = out.closed() => break,
                };
                let message = InboundMessage::new(
                    envelope.body,
                    envelope.properties,
                    envelope.redelivered,
                    Box::new(MemorySettle {
                        requeue: requeue.clone(),
                    }),
                );
                // A message dropped here is requeued by InboundMessage::drop.
                tokio::select! {
                    sent = out.send(message) => if sent.is_err() { break },
                    _ = link.wait_for(|l| l.lost_since(epoch)) => break,
                }
            }
            debug!(target: "queue_rpc", queue = %queue, "Consumer stopped");
        });

        Ok(Consumer::new(rx))
    }

    async fn closed(&self) {
        let mut link = self.link.subscribe();
        let epoch = link.borrow().epoch;
        let _ = link.wait_for(|l| l.lost_since(epoch)).await;
    }
}

/// Hands out the shared `MemoryBroker` as long as it is up.
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl crate::rpc::Connector for MemoryConnector {
    fn url(&self) -> &str {
        "memory://"
    }

    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        if !self.broker.is_up() {
            return Err(BrokerError::ConnectionFailed {
                url: self.url().to_string(),
                cause: "broker unavailable".into(),
            });
        }
        Ok(Arc::new(self.broker.clone()))
    }
}
