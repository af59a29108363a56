//! Retry scheduling.
//!
//! An actor owning the delay queue and the retry-state map, keyed by
//! correlation ID. Workers submit through a command channel and move on;
//! nobody busy-waits. When a retry becomes eligible it is republished onto
//! the source topic with `retry_count` incremented, or re-dispatched
//! in-process, depending on the configured mode. State is evicted on
//! terminal outcome or TTL.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use event_schema::{Envelope, ErrorClass, EventSource, RetryAttempt};
use resilience::{backoff_for_attempt, BackoffPolicy};

use crate::error::{EngineError, Result};
use crate::kafka::EventSink;
use crate::metrics;

/// How eligible retries are delivered back into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// New envelope on the source topic (survives instance loss)
    Republish,
    /// Direct hand-off to this instance's worker pool
    InProcess,
}

#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    pub policy: BackoffPolicy,
    pub mode: RetryMode,
    pub state_ttl: Duration,
}

enum Command {
    Schedule {
        envelope: Envelope,
        error_class: ErrorClass,
        message: String,
        reply: oneshot::Sender<Result<()>>,
    },
    TakeHistory {
        correlation_id: Uuid,
        reply: oneshot::Sender<Vec<RetryAttempt>>,
    },
    Complete {
        correlation_id: Uuid,
    },
}

/// Cheap cloneable handle used by workers.
#[derive(Clone)]
pub struct RetryScheduler {
    tx: mpsc::Sender<Command>,
}

impl RetryScheduler {
    /// Schedule the next retry for a failed envelope. Resolves once the
    /// scheduler has durably taken ownership of the retry.
    pub async fn schedule(&self, envelope: &Envelope, error: &EngineError) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Schedule {
                envelope: envelope.clone(),
                error_class: error.class(),
                message: error.to_string(),
                reply,
            })
            .await
            .map_err(|_| EngineError::Internal("retry scheduler is gone".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("retry scheduler dropped the request".into()))?
    }

    /// Take (and clear) the accumulated retry history for a correlation.
    pub async fn take_history(&self, correlation_id: Uuid) -> Vec<RetryAttempt> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::TakeHistory {
                correlation_id,
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Evict retry state after a successful terminal outcome.
    pub async fn complete(&self, correlation_id: Uuid) {
        let _ = self.tx.send(Command::Complete { correlation_id }).await;
    }
}

struct RetryState {
    attempts: u32,
    first_seen: chrono::DateTime<chrono::Utc>,
    last_error: String,
    next_eligible_at: Instant,
    history: Vec<RetryAttempt>,
    touched: Instant,
}

/// Spawn the scheduler actor. `redispatch` must be provided in
/// [`RetryMode::InProcess`]; it is ignored otherwise.
pub fn spawn(
    config: RetrySchedulerConfig,
    events: Arc<dyn EventSink>,
    redispatch: Option<mpsc::Sender<Envelope>>,
    source: EventSource,
) -> RetryScheduler {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run_scheduler(config, events, redispatch, source, rx));
    RetryScheduler { tx }
}

async fn run_scheduler(
    config: RetrySchedulerConfig,
    events: Arc<dyn EventSink>,
    redispatch: Option<mpsc::Sender<Envelope>>,
    source: EventSource,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut states: HashMap<Uuid, RetryState> = HashMap::new();
    let mut queue: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut items: HashMap<u64, Envelope> = HashMap::new();
    let mut seq: u64 = 0;
    let mut sweep_interval = tokio::time::interval(Duration::from_secs(60));

    info!(mode = ?config.mode, "retry scheduler started");

    loop {
        let next_due = queue.peek().map(|Reverse((due, _))| *due);

        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                handle_command(
                    command,
                    &config,
                    &mut states,
                    &mut queue,
                    &mut items,
                    &mut seq,
                    &source,
                );
            }
            _ = sleep_until_or_forever(next_due) => {
                let now = Instant::now();
                while let Some(Reverse((due, id))) = queue.peek().copied() {
                    if due > now {
                        break;
                    }
                    queue.pop();
                    if let Some(envelope) = items.remove(&id) {
                        deliver(&config, &events, &redispatch, envelope, &mut queue, &mut items, &mut seq).await;
                    }
                }
            }
            _ = sweep_interval.tick() => {
                let ttl = config.state_ttl;
                states.retain(|id, state| {
                    let keep = state.touched.elapsed() < ttl;
                    if !keep {
                        debug!(
                            correlation = %&id.to_string()[..8],
                            attempts = state.attempts,
                            last_error = %state.last_error,
                            next_eligible_at = ?state.next_eligible_at,
                            "sweeping stale retry state"
                        );
                    }
                    keep
                });
                metrics::pipeline().retries_active.set(states.len() as i64);
            }
        }

        metrics::pipeline().retries_active.set(states.len() as i64);
    }

    debug!("retry scheduler stopped");
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn handle_command(
    command: Command,
    config: &RetrySchedulerConfig,
    states: &mut HashMap<Uuid, RetryState>,
    queue: &mut BinaryHeap<Reverse<(Instant, u64)>>,
    items: &mut HashMap<u64, Envelope>,
    seq: &mut u64,
    source: &EventSource,
) {
    match command {
        Command::Schedule {
            envelope,
            error_class,
            message,
            reply,
        } => {
            let attempt = envelope.retry_count + 1;
            let delay = backoff_for_attempt(&config.policy, attempt);
            let due = Instant::now() + delay;
            let retry_envelope = envelope.next_retry(source.clone());

            let state = states
                .entry(envelope.correlation_id)
                .or_insert_with(|| RetryState {
                    attempts: 0,
                    first_seen: Utc::now(),
                    last_error: String::new(),
                    next_eligible_at: due,
                    history: Vec::new(),
                    touched: Instant::now(),
                });
            state.attempts = attempt;
            state.last_error = message.clone();
            state.next_eligible_at = due;
            state.touched = Instant::now();
            state.history.push(RetryAttempt {
                attempt,
                backoff_ms: delay.as_millis() as u64,
                error_class,
                message,
                at: Utc::now(),
            });

            debug!(
                correlation = %&envelope.correlation_id.to_string()[..8],
                attempt,
                ?delay,
                first_seen = %state.first_seen,
                "retry scheduled"
            );

            *seq += 1;
            queue.push(Reverse((due, *seq)));
            items.insert(*seq, retry_envelope);
            let _ = reply.send(Ok(()));
        }
        Command::TakeHistory {
            correlation_id,
            reply,
        } => {
            let history = states
                .remove(&correlation_id)
                .map(|state| state.history)
                .unwrap_or_default();
            let _ = reply.send(history);
        }
        Command::Complete { correlation_id } => {
            states.remove(&correlation_id);
        }
    }
}

async fn deliver(
    config: &RetrySchedulerConfig,
    events: &Arc<dyn EventSink>,
    redispatch: &Option<mpsc::Sender<Envelope>>,
    envelope: Envelope,
    queue: &mut BinaryHeap<Reverse<(Instant, u64)>>,
    items: &mut HashMap<u64, Envelope>,
    seq: &mut u64,
) {
    let correlation = envelope.correlation_id.to_string();

    let delivered = match config.mode {
        RetryMode::Republish => match events.publish_retry(&envelope).await {
            Ok(()) => true,
            Err(e) => {
                error!(correlation = %&correlation[..8], error = %e, "retry republish failed, requeueing");
                false
            }
        },
        RetryMode::InProcess => match redispatch {
            Some(tx) => tx.send(envelope.clone()).await.is_ok(),
            None => {
                error!("in-process retry mode without a redispatch channel");
                false
            }
        },
    };

    if delivered {
        debug!(
            correlation = %&correlation[..8],
            retry_count = envelope.retry_count,
            "retry delivered"
        );
    } else {
        // The retry owns the record now; keep trying until the bus takes it
        warn!(correlation = %&correlation[..8], "requeueing undeliverable retry");
        let due = Instant::now() + Duration::from_secs(5);
        *seq += 1;
        queue.push(Reverse((due, *seq)));
        items.insert(*seq, envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use event_schema::{event_types, CompletionEvent, FailureEvent};
    use std::sync::Mutex;

    struct RecordingSink {
        retries: Mutex<Vec<Envelope>>,
        fail_first: Mutex<bool>,
    }

    impl RecordingSink {
        fn new(fail_first: bool) -> Self {
            Self {
                retries: Mutex::new(Vec::new()),
                fail_first: Mutex::new(fail_first),
            }
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish_completion(&self, _: &Envelope, _: CompletionEvent) -> Result<()> {
            Ok(())
        }
        async fn publish_failure(&self, _: &Envelope, _: FailureEvent) -> Result<()> {
            Ok(())
        }
        async fn publish_retry(&self, envelope: &Envelope) -> Result<()> {
            let mut fail_first = self.fail_first.lock().unwrap();
            if *fail_first {
                *fail_first = false;
                return Err(EngineError::external("kafka", "broker unavailable"));
            }
            self.retries.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    fn scheduler_config(base_ms: u64) -> RetrySchedulerConfig {
        RetrySchedulerConfig {
            policy: BackoffPolicy {
                base: Duration::from_millis(base_ms),
                cap: Duration::from_secs(1),
                jitter: false,
            },
            mode: RetryMode::Republish,
            state_ttl: Duration::from_secs(60),
        }
    }

    fn request_envelope() -> Envelope {
        Envelope::new(
            event_types::ANALYSIS_REQUESTED,
            EventSource::new("archon-intelligence", "test-0"),
            serde_json::json!({"operation": "schema_discovery", "scope": "public"}),
        )
    }

    fn source() -> EventSource {
        EventSource::new("archon-intelligence", "test-0")
    }

    #[tokio::test]
    async fn test_retry_republished_with_incremented_count() {
        let sink = Arc::new(RecordingSink::new(false));
        let scheduler = spawn(scheduler_config(10), sink.clone(), None, source());

        let envelope = request_envelope();
        scheduler
            .schedule(&envelope, &EngineError::Timeout(Duration::from_secs(1)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let retries = sink.retries.lock().unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].retry_count, 1);
        assert_eq!(retries[0].correlation_id, envelope.correlation_id);
        assert_ne!(retries[0].event_id, envelope.event_id);
    }

    #[tokio::test]
    async fn test_history_accumulates_and_drains() {
        let sink = Arc::new(RecordingSink::new(false));
        let scheduler = spawn(scheduler_config(5), sink, None, source());

        let envelope = request_envelope();
        scheduler
            .schedule(&envelope, &EngineError::Timeout(Duration::from_secs(1)))
            .await
            .unwrap();

        let mut second = envelope.clone();
        second.retry_count = 1;
        scheduler
            .schedule(&second, &EngineError::external("analyzer", "HTTP 503"))
            .await
            .unwrap();

        let history = scheduler.take_history(envelope.correlation_id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[1].attempt, 2);
        assert_eq!(history[0].error_class, ErrorClass::Timeout);
        assert_eq!(history[1].error_class, ErrorClass::ExternalServiceError);
        assert!(history[1].backoff_ms >= history[0].backoff_ms);

        // Take is destructive
        let drained = scheduler.take_history(envelope.correlation_id).await;
        assert!(drained.is_empty());
    }

    #[tokio::test]
    async fn test_failed_republish_is_requeued() {
        let sink = Arc::new(RecordingSink::new(true));
        let scheduler = spawn(scheduler_config(5), sink.clone(), None, source());

        let envelope = request_envelope();
        scheduler
            .schedule(&envelope, &EngineError::Timeout(Duration::from_secs(1)))
            .await
            .unwrap();

        // First delivery fails and requeues with a 5s delay; nothing lost
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.retries.lock().unwrap().is_empty());
        assert!(!*sink.fail_first.lock().unwrap());
    }

    #[tokio::test]
    async fn test_in_process_mode_redispatches() {
        let sink = Arc::new(RecordingSink::new(false));
        let (redispatch_tx, mut redispatch_rx) = mpsc::channel(8);
        let config = RetrySchedulerConfig {
            mode: RetryMode::InProcess,
            ..scheduler_config(5)
        };
        let scheduler = spawn(config, sink.clone(), Some(redispatch_tx), source());

        let envelope = request_envelope();
        scheduler
            .schedule(&envelope, &EngineError::Timeout(Duration::from_secs(1)))
            .await
            .unwrap();

        let redispatched = tokio::time::timeout(Duration::from_secs(1), redispatch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redispatched.retry_count, 1);
        assert!(sink.retries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_evicts_state() {
        let sink = Arc::new(RecordingSink::new(false));
        let scheduler = spawn(scheduler_config(5), sink, None, source());

        let envelope = request_envelope();
        scheduler
            .schedule(&envelope, &EngineError::Timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        scheduler.complete(envelope.correlation_id).await;

        let history = scheduler.take_history(envelope.correlation_id).await;
        assert!(history.is_empty());
    }
}
