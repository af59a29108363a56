//! Per-record processing: decode → route → execute → publish → commit mark.
//!
//! Each worker exclusively owns its record until terminal outcome. The
//! return value tells the engine whether the record's offset may be marked
//! committable; `false` surrenders the record for redelivery (a publish or
//! scheduling failure left no durable terminal outcome).

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use event_schema::{
    decode_envelope, event_types, payloads, CompletionEvent, DlqEvent, Envelope, FailureEvent,
    SchemaError,
};

use crate::correlation::RequestContext;
use crate::engine::retry::RetryScheduler;
use crate::error::EngineError;
use crate::handlers::HandlerRegistry;
use crate::kafka::{DeadLetterSink, EventSink};
use crate::metrics;

pub struct Worker {
    pub registry: Arc<HandlerRegistry>,
    pub events: Arc<dyn EventSink>,
    pub dlq: Arc<dyn DeadLetterSink>,
    pub retries: RetryScheduler,
    pub max_retry_attempts: u32,
    pub operation_timeout: Duration,
}

impl Worker {
    /// Process one raw record to a terminal-or-scheduled state.
    ///
    /// Returns `true` when exactly one outcome was durably produced
    /// (completion, scheduled retry, or failure + DLQ) and the offset may
    /// advance; `false` to surrender the record.
    pub async fn process(&self, payload: &[u8]) -> bool {
        let envelope = match decode_envelope(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // The bytes never parsed as an envelope; dead-letter a
                // synthetic wrapper so the raw payload stays inspectable.
                warn!(error = %e, "undecodable record, dead-lettering raw payload");
                let envelope = synthetic_envelope(payload);
                return self
                    .terminal_failure(&envelope, None, &EngineError::from(e))
                    .await;
            }
        };

        let correlation = envelope.correlation_id.to_string();

        let request = match decode_request_checked(&envelope) {
            Ok(request) => request,
            Err(e) => {
                let error = EngineError::from(e);
                info!(
                    correlation = %&correlation[..8],
                    error = %error,
                    "request failed validation, dead-lettering"
                );
                return self.terminal_failure(&envelope, None, &error).await;
            }
        };

        let operation = request.operation();
        let ctx = RequestContext::for_envelope(&envelope, self.operation_timeout)
            .with_operation(operation);

        debug!(
            correlation = %ctx.short_id(),
            %operation,
            retry_count = envelope.retry_count,
            "processing record"
        );

        let started = Instant::now();
        let outcome = resilience::with_deadline(ctx.deadline, self.registry.dispatch(&request, &ctx))
            .await
            .map_err(EngineError::from)
            .and_then(|r| r);
        let elapsed = started.elapsed();

        metrics::pipeline().observe_handler(operation.as_str(), elapsed.as_secs_f64());

        match outcome {
            Ok(output) => {
                let completion = CompletionEvent {
                    operation,
                    result: output.result,
                    partial_results: output.partial_results,
                    degraded: output.degraded,
                    processing_ms: elapsed.as_millis() as u64,
                };
                match self.events.publish_completion(&envelope, completion).await {
                    Ok(()) => {
                        self.retries.complete(envelope.correlation_id).await;
                        metrics::pipeline().record_outcome(operation.as_str(), "completed");
                        debug!(correlation = %ctx.short_id(), %operation, ?elapsed, "completed");
                        true
                    }
                    Err(e) => {
                        warn!(
                            correlation = %ctx.short_id(),
                            error = %e,
                            "completion publish failed, surrendering record"
                        );
                        false
                    }
                }
            }
            Err(error) => {
                if let EngineError::Internal(detail) = &error {
                    error!(
                        correlation = %ctx.short_id(),
                        %operation,
                        detail,
                        "internal error while processing record"
                    );
                }

                if error.is_retryable() && envelope.retry_count < self.max_retry_attempts {
                    match self.retries.schedule(&envelope, &error).await {
                        Ok(()) => {
                            metrics::pipeline().record_outcome(operation.as_str(), "retried");
                            info!(
                                correlation = %ctx.short_id(),
                                %operation,
                                class = %error.class(),
                                next_attempt = envelope.retry_count + 1,
                                "retry scheduled"
                            );
                            true
                        }
                        Err(e) => {
                            warn!(
                                correlation = %ctx.short_id(),
                                error = %e,
                                "retry scheduling failed, surrendering record"
                            );
                            false
                        }
                    }
                } else {
                    self.terminal_failure(&envelope, Some(operation), &error)
                        .await
                }
            }
        }
    }

    /// Publish the failure event and the DLQ record. Only when both are
    /// durably on the bus does the offset become committable.
    async fn terminal_failure(
        &self,
        envelope: &Envelope,
        operation: Option<payloads::OperationType>,
        error: &EngineError,
    ) -> bool {
        let history = self.retries.take_history(envelope.correlation_id).await;
        let class = error.class();
        let message = error.to_string();

        let failure = FailureEvent {
            operation,
            error_class: class,
            message: message.clone(),
            retry_count: envelope.retry_count,
        };
        if let Err(e) = self.events.publish_failure(envelope, failure).await {
            warn!(
                correlation = %&envelope.correlation_id.to_string()[..8],
                error = %e,
                "failure publish failed, surrendering record"
            );
            return false;
        }

        let dlq_event = DlqEvent::new(envelope.clone(), class, message, history);
        match self.dlq.publish(dlq_event).await {
            Ok(()) => {
                let operation_label = operation.map(|op| op.as_str()).unwrap_or("unknown");
                metrics::pipeline().record_outcome(operation_label, "failed");
                metrics::pipeline().record_outcome(operation_label, "dead_lettered");
                true
            }
            Err(e) => {
                warn!(
                    correlation = %&envelope.correlation_id.to_string()[..8],
                    error = %e,
                    "DLQ publish failed, surrendering record"
                );
                false
            }
        }
    }
}

/// Validate the event type and payload of a decoded envelope.
fn decode_request_checked(
    envelope: &Envelope,
) -> Result<payloads::OperationRequest, SchemaError> {
    if envelope.event_type != event_types::ANALYSIS_REQUESTED {
        return Err(SchemaError::UnknownEventType(envelope.event_type.clone()));
    }
    let request = payloads::decode_request(&envelope.payload)?;
    request.validate()?;
    Ok(request)
}

/// Wrapper envelope for bytes that never parsed as an envelope, so the DLQ
/// record still carries the offending payload.
fn synthetic_envelope(payload: &[u8]) -> Envelope {
    Envelope {
        event_id: Uuid::new_v4(),
        event_type: event_types::ANALYSIS_REQUESTED.to_string(),
        correlation_id: Uuid::new_v4(),
        timestamp: chrono::Utc::now(),
        source: event_schema::EventSource::new("unknown", "unknown"),
        payload: json!({"raw": String::from_utf8_lossy(payload)}),
        retry_count: 0,
    }
}
