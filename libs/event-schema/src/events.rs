//! Completion, failure, retry, and dead-letter event payloads.
//!
//! Constructors copy the originating `correlation_id` so every event in a
//! logical operation shares one correlation thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payloads::OperationType;
use crate::{event_types, Envelope, ErrorClass, EventSource};

/// Published when a handler terminates successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub operation: OperationType,
    pub result: serde_json::Value,
    /// True when one or more non-critical sub-computations were skipped
    #[serde(default)]
    pub partial_results: bool,
    /// Names of the degraded sub-computations, empty when complete
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
    pub processing_ms: u64,
}

impl CompletionEvent {
    pub fn into_envelope(self, original: &Envelope, source: EventSource) -> Envelope {
        let payload = serde_json::to_value(&self).unwrap_or_default();
        Envelope::new(event_types::ANALYSIS_COMPLETED, source, payload)
            .with_correlation_id(original.correlation_id)
    }
}

/// Published when a record fails terminally (alongside the DLQ event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationType>,
    pub error_class: ErrorClass,
    pub message: String,
    pub retry_count: u32,
}

impl FailureEvent {
    pub fn into_envelope(self, original: &Envelope, source: EventSource) -> Envelope {
        let payload = serde_json::to_value(&self).unwrap_or_default();
        Envelope::new(event_types::ANALYSIS_FAILED, source, payload)
            .with_correlation_id(original.correlation_id)
    }
}

/// One hop of the retry history carried on DLQ events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub backoff_ms: u64,
    pub error_class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Terminal failure record with full provenance, published to the DLQ topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEvent {
    pub original: Envelope,
    pub error_class: ErrorClass,
    pub message: String,
    #[serde(default)]
    pub retry_history: Vec<RetryAttempt>,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DlqEvent {
    pub fn new(
        original: Envelope,
        error_class: ErrorClass,
        message: impl Into<String>,
        retry_history: Vec<RetryAttempt>,
    ) -> Self {
        let message = message.into();
        let failure_reason = format!(
            "{} after {} retries: {}",
            error_class,
            retry_history.len(),
            message
        );
        Self {
            original,
            error_class,
            message,
            retry_history,
            failure_reason,
            failed_at: Utc::now(),
        }
    }

    pub fn into_envelope(self, source: EventSource) -> Envelope {
        let correlation_id = self.original.correlation_id;
        let payload = serde_json::to_value(&self).unwrap_or_default();
        Envelope::new(event_types::ANALYSIS_DEAD_LETTERED, source, payload)
            .with_correlation_id(correlation_id)
    }
}
