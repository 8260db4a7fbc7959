//! Webhook fan-out for gym domain events.
//!
//! Domain events are turned into signed payloads for every matching
//! subscription ([`publisher`]), persisted and delivered with bounded
//! exponential retry ([`delivery`]), and verified, de-duplicated and acted
//! upon by the receiving endpoints ([`receiver`]). [`rpc`] provides
//! request/reply over a message broker for the service-to-service calls.

pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod publisher;
pub mod receiver;
pub mod rpc;
pub mod signature;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{BrokerError, ConfigError, RpcError, StoreError, WebhookError};
pub use publisher::{EventPublisher, PublisherSettings};
pub use types::{DeliveryStatus, DomainEvent, WebhookDelivery, WebhookPayload, WebhookSubscription};
