//! Consumer engine: polling loop, worker pool, offset commit discipline,
//! and graceful shutdown.
//!
//! The engine is the single control task. It owns the subscription and the
//! offset tracker; workers run on a semaphore-bounded pool and report
//! committable positions back over an unbounded channel so a saturated pool
//! can never deadlock the control loop.

pub mod offsets;
pub mod retry;
pub mod worker;

pub use offsets::{OffsetTracker, RecordPosition};
pub use retry::{RetryMode, RetryScheduler, RetrySchedulerConfig};
pub use worker::Worker;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use event_schema::{encode, Envelope};

use crate::config::{Config, Topics};
use crate::error::{EngineError, Result};
use crate::metrics;

/// Shared liveness/readiness view of the engine, read by the health surface.
pub struct EngineStatus {
    subscribed: AtomicBool,
    draining: AtomicBool,
    last_loop_ms: AtomicI64,
}

impl EngineStatus {
    pub fn new() -> Self {
        Self {
            subscribed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            last_loop_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    fn heartbeat(&self) {
        self.last_loop_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn mark_subscribed(&self) {
        self.subscribed.store(true, Ordering::Relaxed);
    }

    fn mark_draining(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Relaxed)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// Liveness: the control loop ran within the wedge threshold.
    pub fn is_live(&self, threshold: Duration) -> bool {
        let last = self.last_loop_ms.load(Ordering::Relaxed);
        let age = Utc::now().timestamp_millis() - last;
        age <= threshold.as_millis() as i64
    }
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConsumerEngine {
    consumer: Arc<StreamConsumer>,
    worker: Arc<Worker>,
    status: Arc<EngineStatus>,
    topics: Topics,
    concurrency: usize,
    max_poll_records: usize,
    commit_interval: Duration,
    shutdown_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    redispatch_rx: mpsc::Receiver<Envelope>,
}

impl ConsumerEngine {
    pub fn new(
        config: &Config,
        worker: Arc<Worker>,
        status: Arc<EngineStatus>,
        shutdown: watch::Receiver<bool>,
        redispatch_rx: mpsc::Receiver<Envelope>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.kafka.consumer_group)
            .set("bootstrap.servers", &config.kafka.bootstrap_servers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                error!("failed to create Kafka consumer: {}", e);
                EngineError::Kafka(e)
            })?;

        Ok(Self {
            consumer: Arc::new(consumer),
            worker,
            status,
            topics: config.topics(),
            concurrency: config.processing.concurrency.max(1),
            max_poll_records: config.processing.max_poll_records.max(1),
            commit_interval: Duration::from_secs(config.processing.commit_interval_secs.max(1)),
            shutdown_timeout: config.shutdown_timeout(),
            shutdown,
            redispatch_rx,
        })
    }

    /// Run the consumer loop until shutdown, then drain.
    pub async fn run(mut self) -> Result<()> {
        self.consumer
            .subscribe(&[self.topics.requests.as_str()])
            .map_err(EngineError::Kafka)?;
        self.status.mark_subscribed();
        info!(topic = %self.topics.requests, "consumer subscribed");

        spawn_lag_monitor(self.consumer.clone(), self.shutdown.clone());

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (mark_tx, mut mark_rx) = mpsc::unbounded_channel::<RecordPosition>();
        let mut tracker = OffsetTracker::new();
        let mut commit_tick = tokio::time::interval(self.commit_interval);
        let mut polled_since_flush = 0usize;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                Some(position) = mark_rx.recv() => {
                    tracker.mark_committable(&position);
                }

                Some(envelope) = self.redispatch_rx.recv() => {
                    // In-process retry: a fresh unit of work with no offset
                    self.status.heartbeat();
                    let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                    let worker = self.worker.clone();
                    tokio::spawn(async move {
                        match encode(&envelope) {
                            Ok(bytes) => {
                                let _ = worker.process(&bytes).await;
                            }
                            Err(e) => error!(error = %e, "failed to encode redispatched envelope"),
                        }
                        drop(permit);
                    });
                }

                result = self.consumer.recv() => {
                    self.status.heartbeat();
                    match result {
                        Ok(msg) => {
                            let position = RecordPosition {
                                topic: msg.topic().to_string(),
                                partition: msg.partition(),
                                offset: msg.offset(),
                            };
                            if let Some(correlation_id) = crate::correlation::extract_correlation_id(&msg) {
                                debug!(
                                    correlation = %&correlation_id.to_string()[..8],
                                    offset = position.offset,
                                    "record received"
                                );
                            }
                            match msg.payload() {
                                Some(payload) => {
                                    let bytes = payload.to_vec();
                                    tracker.record_dispatched(&position);

                                    let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                                    let worker = self.worker.clone();
                                    let mark_tx = mark_tx.clone();
                                    tokio::spawn(async move {
                                        let committable = worker.process(&bytes).await;
                                        if committable {
                                            let _ = mark_tx.send(position);
                                        }
                                        drop(permit);
                                    });

                                    polled_since_flush += 1;
                                    if polled_since_flush >= self.max_poll_records {
                                        self.flush_commits(&mut tracker, CommitMode::Async);
                                        polled_since_flush = 0;
                                    }
                                }
                                None => {
                                    // Empty record carries nothing to process
                                    debug!(offset = position.offset, "skipping empty payload");
                                    tracker.record_dispatched(&position);
                                    tracker.mark_committable(&position);
                                }
                            }
                        }
                        Err(e) => {
                            error!("kafka consumer error: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }

                _ = commit_tick.tick() => {
                    self.status.heartbeat();
                    self.flush_commits(&mut tracker, CommitMode::Async);
                }
            }
        }

        self.drain(semaphore, &mut mark_rx, &mut tracker).await;
        Ok(())
    }

    /// Graceful shutdown: stop polling, let in-flight workers finish within
    /// the deadline, flush committable offsets, abandon stragglers.
    async fn drain(
        &self,
        semaphore: Arc<Semaphore>,
        mark_rx: &mut mpsc::UnboundedReceiver<RecordPosition>,
        tracker: &mut OffsetTracker,
    ) {
        self.status.mark_draining();
        info!(
            in_flight = self.concurrency - semaphore.available_permits(),
            timeout = ?self.shutdown_timeout,
            "shutdown requested, draining workers"
        );

        let drained = timeout(
            self.shutdown_timeout,
            semaphore.acquire_many(self.concurrency as u32),
        )
        .await;

        match drained {
            Ok(Ok(_)) => info!("all in-flight workers finished"),
            Ok(Err(_)) => warn!("worker pool closed during drain"),
            Err(_) => warn!(
                abandoned = self.concurrency - semaphore.available_permits(),
                "drain deadline reached, abandoning stragglers for redelivery"
            ),
        }

        while let Ok(position) = mark_rx.try_recv() {
            tracker.mark_committable(&position);
        }
        self.flush_commits(tracker, CommitMode::Sync);
        info!(uncommitted = tracker.in_flight(), "consumer engine stopped");
    }

    fn flush_commits(&self, tracker: &mut OffsetTracker, mode: CommitMode) {
        let ready = tracker.drain_committable();
        if ready.is_empty() {
            return;
        }

        let mut list = TopicPartitionList::new();
        for position in &ready {
            if let Err(e) = list.add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset),
            ) {
                warn!(error = %e, "failed to stage offset for commit");
            }
        }

        match self.consumer.commit(&list, mode) {
            Ok(()) => debug!(partitions = ready.len(), "offsets committed"),
            // A failed commit redelivers from the previous position
            Err(e) => warn!(error = %e, "offset commit failed"),
        }
    }
}

fn spawn_lag_monitor(consumer: Arc<StreamConsumer>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }

            let consumer = consumer.clone();
            let _ = tokio::task::spawn_blocking(move || update_partition_lag(&consumer)).await;
        }
    });
}

/// Best-effort per-partition lag: high watermark minus current position.
fn update_partition_lag(consumer: &StreamConsumer) {
    let Ok(assignment) = consumer.assignment() else {
        return;
    };
    let positions = consumer.position().ok();

    for element in assignment.elements() {
        let Ok((_low, high)) =
            consumer.fetch_watermarks(element.topic(), element.partition(), Duration::from_secs(2))
        else {
            continue;
        };

        let current = positions
            .as_ref()
            .and_then(|p| p.find_partition(element.topic(), element.partition()))
            .and_then(|p| p.offset().to_raw())
            .unwrap_or(0);

        metrics::pipeline()
            .partition_lag
            .with_label_values(&[element.topic(), &element.partition().to_string()])
            .set((high - current).max(0));
    }
}
