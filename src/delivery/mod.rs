//! Signed, retried HTTP delivery of queued webhook jobs.

pub mod queue;
pub mod transport;
pub mod worker;

pub use queue::{requeue_unfinished, spawn_runner, DeliveryQueue};
pub use transport::{
    HttpTransport, SignedRequest, TransportError, TransportResponse, WebhookTransport,
};
pub use worker::{AttemptOutcome, DeliveryWorker, RetryPolicy};
