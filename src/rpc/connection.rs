//! Auto-reconnecting broker connection.

use crate::error::BrokerError;
use crate::rpc::broker::{Broker, Consumer, MessageProperties};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Opens one broker connection. This is where an AMQP client plugs in.
#[async_trait]
pub trait Connector: Send + Sync {
    fn url(&self) -> &str;

    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}

/// Runs after every successful (re)connect, e.g. to restart consumers.
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    async fn on_connected(&self, broker: Arc<dyn Broker>);
}

/// Keeps one live connection, reconnecting every `retry_interval` while the
/// broker is unreachable.
///
/// State moves `Disconnected -> Connecting -> Connected` and back to
/// `Disconnected` when the connection closes. Calls made while not
/// connected fail fast with [`BrokerError::NotConnected`]; nothing is
/// buffered.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    retry_interval: Duration,
    current: RwLock<Option<Arc<dyn Broker>>>,
    state: watch::Sender<ConnectionState>,
    hooks: Mutex<Vec<Arc<dyn ReconnectHook>>>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, retry_interval: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            connector,
            retry_interval,
            current: RwLock::new(None),
            state,
            hooks: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until connected, or `timeout` elapses. Returns whether connected.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let connected = rx.wait_for(|s| *s == ConnectionState::Connected);
        let outcome = tokio::time::timeout(timeout, connected).await;
        matches!(outcome, Ok(Ok(_)))
    }

    /// Register a hook. It also runs right away when a connection is up.
    pub async fn add_hook(&self, hook: Arc<dyn ReconnectHook>) {
        self.hooks.lock().await.push(hook.clone());
        if let Some(broker) = self.current() {
            hook.on_connected(broker).await;
        }
    }

    /// Drop the current connection and let the supervisor reconnect.
    pub fn mark_disconnected(&self) {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connected {
                *s = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    /// Stop the supervisor. The current connection is released.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Start the supervisor task that owns connecting and reconnecting.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.supervise().await })
    }

    fn current(&self) -> Option<Arc<dyn Broker>> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    fn set_current(&self, broker: Option<Arc<dyn Broker>>) {
        if let Ok(mut current) = self.current.write() {
            *current = broker;
        }
    }

    async fn supervise(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        while !*shutdown.borrow() {
            self.state.send_replace(ConnectionState::Connecting);
            attempt += 1;

            match self.connector.connect().await {
                Ok(broker) => {
                    info!(
                        target: "queue_rpc",
                        url = self.connector.url(),
                        attempt,
                        "Broker connected"
                    );
                    attempt = 0;
                    self.set_current(Some(broker.clone()));
                    self.state.send_replace(ConnectionState::Connected);
                    self.run_hooks(&broker).await;

                    let mut state = self.state.subscribe();
                    tokio::select! {
                        _ = broker.closed() => {}
                        _ = state.wait_for(|s| *s != ConnectionState::Connected) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {}
                    }
                    self.set_current(None);
                    self.state.send_replace(ConnectionState::Disconnected);
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(
                        target: "queue_rpc",
                        url = self.connector.url(),
                        "Broker connection lost; reconnecting"
                    );
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    warn!(
                        target: "queue_rpc",
                        url = self.connector.url(),
                        attempt,
                        error = %e,
                        retry_in_ms = self.retry_interval.as_millis() as u64,
                        "Broker connection failed"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                _ = shutdown.wait_for(|stop| *stop) => {}
            }
        }

        self.set_current(None);
        self.state.send_replace(ConnectionState::Disconnected);
        debug!(target: "queue_rpc", "Connection supervisor stopped");
    }

    async fn run_hooks(&self, broker: &Arc<dyn Broker>) {
        let hooks = self.hooks.lock().await.clone();
        for hook in hooks {
            hook.on_connected(broker.clone()).await;
        }
    }

    fn connected(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        self.current().ok_or(BrokerError::NotConnected)
    }

    fn observe<T>(&self, result: Result<T, BrokerError>) -> Result<T, BrokerError> {
        if let Err(e) = &result {
            if e.is_connection_loss() {
                self.mark_disconnected();
            }
        }
        result
    }
}

#[async_trait]
impl Broker for ConnectionManager {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let broker = self.connected()?;
        self.observe(broker.assert_queue(queue).await)
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        let broker = self.connected()?;
        self.observe(broker.publish(queue, body, properties).await)
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let broker = self.connected()?;
        self.observe(broker.consume(queue).await)
    }

    async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|s| *s != ConnectionState::Connected)
            .await;
    }
}
