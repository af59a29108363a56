//! Correlation context for distributed tracing.
//!
//! Every record being processed shares one [`RequestContext`], passed
//! explicitly into handlers, clients, and publishers. The correlation ID
//! rides a Kafka message header on every outbound event and an HTTP header
//! on every outbound analyzer/embedder/store call.

use std::time::{Duration, Instant};

use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use uuid::Uuid;

use event_schema::{Envelope, OperationType};

/// Kafka message header carrying the correlation ID
pub const KAFKA_CORRELATION_ID_HEADER: &str = "correlation-id";

/// HTTP header for correlation ID propagation into external services
pub const HTTP_CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Per-record processing context. One instance per record, shared by every
/// sub-call that record makes; cheap to clone.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: Uuid,
    pub event_id: Uuid,
    pub operation: Option<OperationType>,
    pub retry_count: u32,
    /// Absolute deadline for the whole operation
    pub deadline: Instant,
}

impl RequestContext {
    pub fn for_envelope(envelope: &Envelope, operation_timeout: Duration) -> Self {
        Self {
            correlation_id: envelope.correlation_id,
            event_id: envelope.event_id,
            operation: None,
            retry_count: envelope.retry_count,
            deadline: Instant::now() + operation_timeout,
        }
    }

    pub fn with_operation(mut self, operation: OperationType) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Truncated correlation prefix for quick log grepping.
    pub fn short_id(&self) -> String {
        self.correlation_id.to_string()[..8].to_string()
    }

    /// Time left before the operation deadline; zero when past it.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Add the correlation header to outbound Kafka headers.
pub fn inject_headers(headers: OwnedHeaders, correlation_id: &Uuid) -> OwnedHeaders {
    headers.insert(Header {
        key: KAFKA_CORRELATION_ID_HEADER,
        value: Some(correlation_id.to_string().as_bytes()),
    })
}

/// Read the correlation header off an inbound Kafka message, if present.
pub fn extract_correlation_id(msg: &BorrowedMessage<'_>) -> Option<Uuid> {
    let headers = msg.headers()?;
    for header in headers.iter() {
        if header.key == KAFKA_CORRELATION_ID_HEADER {
            let value = header.value?;
            let text = std::str::from_utf8(value).ok()?;
            return Uuid::parse_str(text).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_schema::{event_types, EventSource};
    use serde_json::json;

    #[test]
    fn test_context_carries_envelope_identity() {
        let envelope = Envelope::new(
            event_types::ANALYSIS_REQUESTED,
            EventSource::new("archon-intelligence", "test-0"),
            json!({"operation": "schema_discovery", "scope": "public"}),
        );

        let ctx = RequestContext::for_envelope(&envelope, Duration::from_secs(60))
            .with_operation(OperationType::SchemaDiscovery);

        assert_eq!(ctx.correlation_id, envelope.correlation_id);
        assert_eq!(ctx.event_id, envelope.event_id);
        assert_eq!(ctx.operation, Some(OperationType::SchemaDiscovery));
        assert_eq!(ctx.retry_count, 0);
    }

    #[test]
    fn test_short_id_is_eight_chars() {
        let envelope = Envelope::new(
            event_types::ANALYSIS_REQUESTED,
            EventSource::new("s", "i"),
            json!({}),
        );
        let ctx = RequestContext::for_envelope(&envelope, Duration::from_secs(1));

        assert_eq!(ctx.short_id().len(), 8);
        assert!(envelope.correlation_id.to_string().starts_with(&ctx.short_id()));
    }

    #[test]
    fn test_remaining_counts_down_to_zero() {
        let envelope = Envelope::new(
            event_types::ANALYSIS_REQUESTED,
            EventSource::new("s", "i"),
            json!({}),
        );
        let ctx = RequestContext::for_envelope(&envelope, Duration::ZERO);
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }
}
