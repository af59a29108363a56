/// Resilience primitives for the intelligence pipeline
///
/// Production-ready building blocks shared by the engine and its clients:
/// - **Circuit Breaker**: fails fast when a dependency rejects repeatedly,
///   with a single-probe half-open recovery phase
/// - **Retry**: exponential backoff with a hard cap and optional jitter,
///   shared by the in-process retry helper and the engine's delay queue
/// - **Timeout**: deadline enforcement for all external calls
///
/// # Example: analyzer call with circuit breaker
///
/// ```rust,no_run
/// use resilience::{CircuitBreaker, CircuitBreakerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
///     let result = breaker.call(|| async {
///         // Your HTTP call here
///         Ok::<_, String>(())
///     }).await;
///     let _ = result;
/// }
/// ```
pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, FailureKind,
};
pub use retry::{backoff_for_attempt, with_retry, BackoffPolicy, RetryError};
pub use timeout::{with_deadline, with_timeout, TimeoutError};
