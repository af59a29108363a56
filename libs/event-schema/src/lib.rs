//! Event schema registry for the intelligence pipeline topics.
//!
//! Defines the uniform envelope carried by every bus message, the typed
//! operation payloads, and the completion/failure/DLQ event shapes. All
//! decoding is total: either a fully validated value comes back or a typed
//! [`SchemaError`]; partial objects never escape this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod events;
pub mod payloads;

pub use events::{CompletionEvent, DlqEvent, FailureEvent, RetryAttempt};
pub use payloads::{OperationRequest, OperationType};

/// Current schema version for all events
pub const SCHEMA_VERSION: u32 = 1;

/// Event-type discriminators used on the intelligence topics
pub mod event_types {
    pub const ANALYSIS_REQUESTED: &str = "code-analysis-requested";
    pub const ANALYSIS_COMPLETED: &str = "code-analysis-completed";
    pub const ANALYSIS_FAILED: &str = "code-analysis-failed";
    pub const ANALYSIS_DEAD_LETTERED: &str = "code-analysis-dead-lettered";
}

/// Producing service + instance, carried on every envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    pub service: String,
    pub instance: String,
}

impl EventSource {
    pub fn new(service: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instance: instance.into(),
        }
    }
}

/// Uniform wrapper for every bus message.
///
/// Envelopes are immutable once published; a retried message is a new
/// envelope referencing the original through `correlation_id` with an
/// incremented `retry_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique event ID for idempotency and tracing
    pub event_id: Uuid,
    /// Event type discriminator (see [`event_types`])
    pub event_type: String,
    /// Shared by all envelopes belonging to one logical operation
    pub correlation_id: Uuid,
    /// Event timestamp (RFC-3339, UTC)
    pub timestamp: DateTime<Utc>,
    /// Source service that generated the event
    pub source: EventSource,
    /// Payload, typed per `event_type`
    pub payload: serde_json::Value,
    /// Number of retries this envelope represents (0 for the original)
    #[serde(default)]
    pub retry_count: u32,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, source: EventSource, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            payload,
            retry_count: 0,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// New envelope for the next retry of this message. The retry is a fresh
    /// event with its own `event_id`; only the correlation thread survives.
    pub fn next_retry(&self, source: EventSource) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: self.event_type.clone(),
            correlation_id: self.correlation_id,
            timestamp: Utc::now(),
            source,
            payload: self.payload.clone(),
            retry_count: self.retry_count + 1,
        }
    }
}

/// Closed error taxonomy carried on failure and DLQ events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    InvalidInput,
    UnsupportedLanguage,
    ParsingError,
    Timeout,
    ExternalServiceError,
    RateLimitExceeded,
    InternalError,
    CircuitBreakerOpen,
}

impl ErrorClass {
    /// Whether the pipeline may retry a failure of this class.
    pub fn retry_allowed(&self) -> bool {
        matches!(
            self,
            ErrorClass::Timeout
                | ErrorClass::ExternalServiceError
                | ErrorClass::RateLimitExceeded
                | ErrorClass::CircuitBreakerOpen
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::InvalidInput => "invalid_input",
            ErrorClass::UnsupportedLanguage => "unsupported_language",
            ErrorClass::ParsingError => "parsing_error",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ExternalServiceError => "external_service_error",
            ErrorClass::RateLimitExceeded => "rate_limit_exceeded",
            ErrorClass::InternalError => "internal_error",
            ErrorClass::CircuitBreakerOpen => "circuit_breaker_open",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode/validation failures. All of these classify as `invalid_input`
/// except [`SchemaError::Json`] on a structurally valid envelope payload,
/// which callers may surface as `parsing_error`.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown operation type: {0}")]
    UnknownOperation(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("payload validation failed: {0}")]
    Validation(String),
}

pub type SchemaResult<T> = std::result::Result<T, SchemaError>;

/// A fully decoded and validated analysis request.
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    pub envelope: Envelope,
    pub request: OperationRequest,
}

/// Decode just the envelope, without payload validation. Callers that need
/// the envelope for provenance even when the payload is bad (the DLQ path)
/// use this, then validate separately.
pub fn decode_envelope(bytes: &[u8]) -> SchemaResult<Envelope> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decode a raw bus message into a validated envelope + typed payload.
///
/// Fails with a typed error when required fields are missing, the event type
/// or operation is unknown, the timestamp is unparseable, or the payload
/// fails per-operation validation.
pub fn decode(bytes: &[u8]) -> SchemaResult<DecodedRequest> {
    let envelope: Envelope = decode_envelope(bytes)?;

    if envelope.event_type != event_types::ANALYSIS_REQUESTED {
        return Err(SchemaError::UnknownEventType(envelope.event_type));
    }

    let request = payloads::decode_request(&envelope.payload)?;
    request.validate()?;

    Ok(DecodedRequest { envelope, request })
}

/// Encode an envelope for publication. Deterministic: equal envelopes
/// produce identical bytes (struct fields serialize in declaration order).
pub fn encode(envelope: &Envelope) -> SchemaResult<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}
