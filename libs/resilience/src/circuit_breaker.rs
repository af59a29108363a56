/// Circuit breaker with a single-probe half-open phase
///
/// State transitions:
/// - Closed → Open: when consecutive qualifying failures reach the threshold
/// - Open → HalfOpen: after the reset timeout elapses
/// - HalfOpen → Closed: when probe successes reach the success threshold
/// - HalfOpen → Open: on a qualifying probe failure (refreshes `opened_at`)
///
/// At most one probe is admitted at a time while half-open; surplus callers
/// fail fast. A failure the caller classifies as non-qualifying (typically a
/// pure timeout) never moves the state machine.
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit is open, requests fail fast
    Open,
    /// Testing if the dependency recovered, one probe at a time
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for metrics: closed=0, open=1, half-open=2.
    pub fn code(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// How a failed call counts against the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Counts toward the failure threshold
    Qualifying,
    /// Returned to the caller but invisible to the state machine
    Ignored,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive qualifying failures to trip the circuit
    pub failure_threshold: u32,
    /// Probe successes in HalfOpen required to close
    pub success_threshold: u32,
    /// Duration to wait in Open before admitting a probe
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open - failing fast")]
    Open,
    #[error("call failed: {0}")]
    CallFailed(E),
}

#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<RwLock<BreakerState>>,
}

struct BreakerState {
    current: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    half_open_probes_in_flight: u32,
}

/// Outcome of the admission check; `probe` marks the single half-open slot.
struct Admission {
    probe: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(BreakerState {
                current: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                half_open_probes_in_flight: 0,
            })),
            config,
        }
    }

    /// Execute a future behind the breaker; every error is qualifying.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| FailureKind::Qualifying).await
    }

    /// Execute a future behind the breaker with a caller-supplied failure
    /// policy. Errors mapped to [`FailureKind::Ignored`] surface to the
    /// caller without moving the state machine.
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        f: F,
        classify: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureKind,
    {
        let admission = match self.try_admit() {
            Some(admission) => admission,
            None => return Err(CircuitBreakerError::Open),
        };

        match f().await {
            Ok(result) => {
                self.record_success(admission.probe);
                Ok(result)
            }
            Err(e) => {
                self.record_failure(classify(&e), admission.probe);
                Err(CircuitBreakerError::CallFailed(e))
            }
        }
    }

    /// Current state for monitoring; transitions Open → HalfOpen lazily when
    /// the reset timeout has elapsed, so readers observe the truth.
    pub fn current_state(&self) -> CircuitState {
        let mut state = self.state.write();
        self.refresh_open(&mut state);
        state.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.read().consecutive_failures
    }

    fn refresh_open(&self, state: &mut BreakerState) {
        if state.current == CircuitState::Open {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    info!("circuit breaker: open -> half-open");
                    state.current = CircuitState::HalfOpen;
                    state.half_open_successes = 0;
                    state.half_open_probes_in_flight = 0;
                }
            }
        }
    }

    fn try_admit(&self) -> Option<Admission> {
        let mut state = self.state.write();
        self.refresh_open(&mut state);

        match state.current {
            CircuitState::Closed => Some(Admission { probe: false }),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if state.half_open_probes_in_flight >= 1 {
                    None
                } else {
                    state.half_open_probes_in_flight += 1;
                    Some(Admission { probe: true })
                }
            }
        }
    }

    fn record_success(&self, probe: bool) {
        let mut state = self.state.write();
        state.consecutive_failures = 0;

        if probe {
            state.half_open_probes_in_flight = state.half_open_probes_in_flight.saturating_sub(1);
        }

        if state.current == CircuitState::HalfOpen {
            state.half_open_successes += 1;
            if state.half_open_successes >= self.config.success_threshold {
                info!("circuit breaker: half-open -> closed");
                state.current = CircuitState::Closed;
                state.opened_at = None;
                state.half_open_successes = 0;
            }
        }
    }

    fn record_failure(&self, kind: FailureKind, probe: bool) {
        let mut state = self.state.write();

        if probe {
            state.half_open_probes_in_flight = state.half_open_probes_in_flight.saturating_sub(1);
        }

        if kind == FailureKind::Ignored {
            return;
        }

        state.consecutive_failures += 1;

        match state.current {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = state.consecutive_failures,
                        "circuit breaker: closed -> open"
                    );
                    state.current = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit breaker: half-open -> open (probe failed)");
                state.current = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            reset_timeout: reset,
        })
    }

    #[tokio::test]
    async fn test_closed_to_open_on_consecutive_failures() {
        let cb = breaker(3, 1, Duration::from_secs(60));

        for _ in 0..3 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        assert_eq!(cb.current_state(), CircuitState::Open);

        // Next call fails fast without running the closure
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();
        let result = cb
            .call(|| async move {
                ran_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1, Duration::from_secs(60));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        let _ = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(cb.consecutive_failures(), 0);

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_threshold_reached_exactly_opens() {
        let cb = breaker(5, 1, Duration::from_secs(60));

        for _ in 0..4 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        assert_eq!(cb.current_state(), CircuitState::Closed);

        let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(cb.current_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_to_half_open_after_timeout() {
        let cb = breaker(2, 1, Duration::from_millis(50));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        assert_eq!(cb.current_state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes() {
        let cb = breaker(2, 1, Duration::from_millis(50));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = cb.call(|| async { Ok::<_, String>(42) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_needs_success_threshold() {
        let cb = breaker(2, 2, Duration::from_millis(50));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        let _ = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let cb = breaker(2, 1, Duration::from_millis(50));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        let _ = cb.call(|| async { Err::<(), _>("still down") }).await;
        assert_eq!(cb.current_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let cb = breaker(1, 1, Duration::from_millis(10));

        let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let cb_probe = cb.clone();
        let probe = tokio::spawn(async move {
            cb_probe
                .call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, String>(())
                })
                .await
        });

        started_rx.await.unwrap();

        // Second caller while the probe is in flight is rejected
        let second = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(second, Err(CircuitBreakerError::Open)));

        let _ = release_tx.send(());
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_ignored_failures_do_not_trip() {
        let cb = breaker(2, 1, Duration::from_secs(60));

        for _ in 0..5 {
            let result = cb
                .call_classified(
                    || async { Err::<(), _>("slow") },
                    |_| FailureKind::Ignored,
                )
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::CallFailed(_))));
        }

        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_typed_error_passthrough() {
        #[derive(Debug, PartialEq)]
        struct Custom(u32);

        let cb = breaker(5, 1, Duration::from_secs(60));
        let result = cb.call(|| async { Err::<(), _>(Custom(7)) }).await;
        match result {
            Err(CircuitBreakerError::CallFailed(e)) => assert_eq!(e, Custom(7)),
            other => panic!("expected CallFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(CircuitState::Closed.code(), 0);
        assert_eq!(CircuitState::Open.code(), 1);
        assert_eq!(CircuitState::HalfOpen.code(), 2);
    }
}
