use std::time::Duration;

use event_schema::{ErrorClass, SchemaError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine-wide error type. Every failure in the pipeline maps onto the
/// closed taxonomy via [`EngineError::class`]; retry-vs-terminal decisions
/// are values computed from the class, never control flow by exception type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("parsing error: {0}")]
    Parsing(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("external service error ({service}): {message}")]
    ExternalService { service: &'static str, message: String },

    #[error("rate limit exceeded ({0})")]
    RateLimit(&'static str),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("circuit breaker open for {0}")]
    CircuitBreakerOpen(&'static str),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl EngineError {
    pub fn external(service: &'static str, message: impl Into<String>) -> Self {
        EngineError::ExternalService {
            service,
            message: message.into(),
        }
    }

    /// Map onto the wire-visible error class.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidInput(_) => ErrorClass::InvalidInput,
            EngineError::UnsupportedLanguage(_) => ErrorClass::UnsupportedLanguage,
            EngineError::Parsing(_) => ErrorClass::ParsingError,
            EngineError::Timeout(_) => ErrorClass::Timeout,
            EngineError::ExternalService { .. } => ErrorClass::ExternalServiceError,
            EngineError::Kafka(_) => ErrorClass::ExternalServiceError,
            EngineError::RateLimit(_) => ErrorClass::RateLimitExceeded,
            EngineError::Internal(_) => ErrorClass::InternalError,
            EngineError::CircuitBreakerOpen(_) => ErrorClass::CircuitBreakerOpen,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().retry_allowed()
    }
}

impl From<SchemaError> for EngineError {
    fn from(err: SchemaError) -> Self {
        match err {
            // Broken JSON is a parse failure; structurally valid JSON with
            // missing/mistyped fields is the caller's bad input.
            SchemaError::Json(e) => match e.classify() {
                serde_json::error::Category::Data => EngineError::InvalidInput(e.to_string()),
                _ => EngineError::Parsing(e.to_string()),
            },
            SchemaError::UnknownOperation(op) => {
                EngineError::InvalidInput(format!("unknown operation type: {op}"))
            }
            SchemaError::UnknownEventType(t) => {
                EngineError::InvalidInput(format!("unknown event type: {t}"))
            }
            SchemaError::Validation(msg) => EngineError::InvalidInput(msg),
        }
    }
}

impl From<resilience::TimeoutError> for EngineError {
    fn from(err: resilience::TimeoutError) -> Self {
        match err {
            resilience::TimeoutError::Elapsed(d) => EngineError::Timeout(d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_matches_taxonomy() {
        let cases: Vec<(EngineError, ErrorClass, bool)> = vec![
            (
                EngineError::InvalidInput("bad".into()),
                ErrorClass::InvalidInput,
                false,
            ),
            (
                EngineError::UnsupportedLanguage("cobol".into()),
                ErrorClass::UnsupportedLanguage,
                false,
            ),
            (
                EngineError::Parsing("bad json".into()),
                ErrorClass::ParsingError,
                false,
            ),
            (
                EngineError::Timeout(Duration::from_secs(30)),
                ErrorClass::Timeout,
                true,
            ),
            (
                EngineError::external("analyzer", "503"),
                ErrorClass::ExternalServiceError,
                true,
            ),
            (
                EngineError::RateLimit("embedder"),
                ErrorClass::RateLimitExceeded,
                true,
            ),
            (
                EngineError::Internal("bug".into()),
                ErrorClass::InternalError,
                false,
            ),
            (
                EngineError::CircuitBreakerOpen("analyzer"),
                ErrorClass::CircuitBreakerOpen,
                true,
            ),
        ];

        for (error, class, retryable) in cases {
            assert_eq!(error.class(), class, "{error}");
            assert_eq!(error.is_retryable(), retryable, "{error}");
        }
    }

    #[test]
    fn test_schema_errors_are_terminal() {
        let err: EngineError = SchemaError::Validation("source_path is empty".into()).into();
        assert_eq!(err.class(), ErrorClass::InvalidInput);
        assert!(!err.is_retryable());

        let err: EngineError = SchemaError::UnknownOperation("frobnicate".into()).into();
        assert_eq!(err.class(), ErrorClass::InvalidInput);
        assert!(!err.is_retryable());
    }
}
