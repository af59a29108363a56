//! Dead-letter publication.
//!
//! Exactly one DLQ event per terminally-failed input, carrying the original
//! envelope, the final error class and message, the full retry history, and
//! the failure timestamp. Publication is awaited through broker acks before
//! the worker may mark the source offset committable; on publish failure
//! the record is surrendered for redelivery instead.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tokio::time::timeout;
use tracing::{error, info};

use event_schema::{encode, DlqEvent, EventSource};

use crate::config::KafkaConfig;
use crate::correlation::inject_headers;
use crate::error::{EngineError, Result};
use crate::kafka::DeadLetterSink;
use crate::metrics;

pub struct DlqPublisher {
    producer: FutureProducer,
    topic: String,
    source: EventSource,
    send_timeout: Duration,
}

impl DlqPublisher {
    pub fn new(config: &KafkaConfig, topic: String, source: EventSource) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("message.timeout.ms", "10000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(EngineError::Kafka)?;

        Ok(Self {
            producer,
            topic,
            source,
            send_timeout: Duration::from_secs(10),
        })
    }
}

#[async_trait]
impl DeadLetterSink for DlqPublisher {
    async fn publish(&self, event: DlqEvent) -> Result<()> {
        let correlation_id = event.original.correlation_id;
        let error_class = event.error_class;
        let attempts = event.retry_history.len();

        let envelope = event.into_envelope(self.source.clone());
        let payload = encode(&envelope)?;
        let key = correlation_id.to_string();
        let headers = inject_headers(OwnedHeaders::new(), &correlation_id);
        let record = FutureRecord::to(&self.topic)
            .payload(&payload)
            .key(&key)
            .headers(headers);

        let delivery = timeout(self.send_timeout, self.producer.send(record, self.send_timeout))
            .await
            .map_err(|_| EngineError::Timeout(self.send_timeout))?;

        match delivery {
            Ok(_) => {
                metrics::pipeline().dlq_published.inc();
                info!(
                    correlation = %&key[..8],
                    class = %error_class,
                    attempts,
                    "record dead-lettered"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(correlation = %&key[..8], error = %e, "DLQ publication failed");
                Err(EngineError::Kafka(e))
            }
        }
    }
}
