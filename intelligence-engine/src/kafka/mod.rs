//! Kafka publication: completion/failure/retry events and the dead-letter
//! channel.
//!
//! The engine depends on the sink traits; the concrete publishers wrap an
//! `rdkafka` `FutureProducer` with durable acks and send timeouts.

pub mod dlq;
pub mod producer;

use async_trait::async_trait;

use event_schema::{CompletionEvent, DlqEvent, Envelope, FailureEvent};

use crate::error::Result;

pub use dlq::DlqPublisher;
pub use producer::EventPublisher;

/// Publication surface for pipeline outcome events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish_completion(&self, original: &Envelope, event: CompletionEvent) -> Result<()>;

    async fn publish_failure(&self, original: &Envelope, event: FailureEvent) -> Result<()>;

    /// Republish a retry envelope onto the source topic.
    async fn publish_retry(&self, envelope: &Envelope) -> Result<()>;
}

/// Publication surface for terminally-failed records.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Durable publication: resolves only once the bus has acknowledged the
    /// record, so the caller can safely commit the source offset after.
    async fn publish(&self, event: DlqEvent) -> Result<()>;
}
