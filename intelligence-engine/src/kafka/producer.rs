//! Outcome event producer.
//!
//! One `FutureProducer` shared by all outcome topics, configured for
//! durability: `acks=all`, idempotence, bounded send timeout. The message
//! key is the correlation ID so related events co-locate on one partition;
//! the correlation ID also rides a message header for consumers that only
//! look at headers.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::time::timeout;
use tracing::{debug, warn};

use event_schema::{encode, CompletionEvent, Envelope, EventSource, FailureEvent};

use crate::config::{KafkaConfig, Topics};
use crate::correlation::inject_headers;
use crate::error::{EngineError, Result};
use crate::kafka::EventSink;

pub struct EventPublisher {
    producer: FutureProducer,
    topics: Topics,
    source: EventSource,
    send_timeout: Duration,
}

impl EventPublisher {
    pub fn new(config: &KafkaConfig, topics: Topics, source: EventSource) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .set("queue.buffering.max.messages", "100000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", "lz4")
            .create()
            .map_err(EngineError::Kafka)?;

        Ok(Self {
            producer,
            topics,
            source,
            send_timeout: Duration::from_secs(5),
        })
    }

    pub fn source(&self) -> EventSource {
        self.source.clone()
    }

    async fn send(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        let payload = encode(envelope)?;
        let key = envelope.correlation_id.to_string();
        let headers = inject_headers(OwnedHeaders::new(), &envelope.correlation_id);
        let record = FutureRecord::to(topic)
            .payload(&payload)
            .key(&key)
            .headers(headers);

        debug!(
            topic,
            event_type = %envelope.event_type,
            correlation = %&key[..8],
            "publishing event"
        );

        match timeout(self.send_timeout, self.producer.send(record, self.send_timeout)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(EngineError::Kafka(e)),
            Err(_) => {
                warn!(topic, "kafka send timed out after {:?}", self.send_timeout);
                Err(EngineError::Timeout(self.send_timeout))
            }
        }
    }

    /// Readiness probe via cluster metadata fetch, scoped to one topic.
    pub async fn health_check(&self) -> Result<()> {
        self.producer
            .client()
            .fetch_metadata(Some(&self.topics.completions), self.send_timeout)
            .map(|_| ())
            .map_err(EngineError::Kafka)
    }
}

#[async_trait]
impl EventSink for EventPublisher {
    async fn publish_completion(&self, original: &Envelope, event: CompletionEvent) -> Result<()> {
        let envelope = event.into_envelope(original, self.source.clone());
        self.send(&self.topics.completions, &envelope).await
    }

    async fn publish_failure(&self, original: &Envelope, event: FailureEvent) -> Result<()> {
        let envelope = event.into_envelope(original, self.source.clone());
        self.send(&self.topics.failures, &envelope).await
    }

    async fn publish_retry(&self, envelope: &Envelope) -> Result<()> {
        self.send(&self.topics.requests, envelope).await
    }
}
