//! Pipeline metrics for observability.
//!
//! Singleton metric set registered with the default prometheus registry;
//! the `/metrics` endpoint gathers and encodes it. Cache counters live in
//! the cache itself and are mirrored into gauges at scrape time.

use std::sync::OnceLock;

use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
};

static METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

pub struct PipelineMetrics {
    /// Terminal outcomes by operation: completed | failed | retried | dead_lettered
    pub records_processed: IntCounterVec,
    pub handler_duration_seconds: HistogramVec,
    pub dlq_published: IntCounter,
    pub retries_active: IntGauge,
    /// Breaker state encoded closed=0, open=1, half-open=2
    pub breaker_state: IntGauge,
    pub partition_lag: IntGaugeVec,
    pub cache_hits: IntGauge,
    pub cache_misses: IntGauge,
    pub cache_evictions: IntGauge,
    pub cache_size: IntGauge,
    pub cache_hit_rate: Gauge,
}

impl PipelineMetrics {
    fn new() -> Self {
        let registry = prometheus::default_registry();

        let records_processed = IntCounterVec::new(
            Opts::new(
                "engine_records_processed_total",
                "Processed records by operation and outcome",
            ),
            &["operation", "outcome"],
        )
        .expect("valid metric definition");

        let handler_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "engine_handler_duration_seconds",
                "Handler execution latency",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["operation"],
        )
        .expect("valid metric definition");

        let dlq_published = IntCounter::new(
            "engine_dlq_published_total",
            "Records published to the dead-letter topic",
        )
        .expect("valid metric definition");

        let retries_active = IntGauge::new(
            "engine_retries_active",
            "Retry-state entries currently tracked by the scheduler",
        )
        .expect("valid metric definition");

        let breaker_state = IntGauge::new(
            "engine_analyzer_breaker_state",
            "Analyzer circuit breaker state (0=closed, 1=open, 2=half-open)",
        )
        .expect("valid metric definition");

        let partition_lag = IntGaugeVec::new(
            Opts::new("engine_partition_lag", "Consumer lag per partition"),
            &["topic", "partition"],
        )
        .expect("valid metric definition");

        let cache_hits = IntGauge::new("engine_cache_hits_total", "Analyzer cache hits")
            .expect("valid metric definition");
        let cache_misses = IntGauge::new("engine_cache_misses_total", "Analyzer cache misses")
            .expect("valid metric definition");
        let cache_evictions =
            IntGauge::new("engine_cache_evictions_total", "Analyzer cache evictions")
                .expect("valid metric definition");
        let cache_size = IntGauge::new("engine_cache_size", "Analyzer cache entry count")
            .expect("valid metric definition");
        let cache_hit_rate = Gauge::new("engine_cache_hit_rate", "Analyzer cache hit rate")
            .expect("valid metric definition");

        for collector in [
            Box::new(records_processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(handler_duration_seconds.clone()),
            Box::new(dlq_published.clone()),
            Box::new(retries_active.clone()),
            Box::new(breaker_state.clone()),
            Box::new(partition_lag.clone()),
            Box::new(cache_hits.clone()),
            Box::new(cache_misses.clone()),
            Box::new(cache_evictions.clone()),
            Box::new(cache_size.clone()),
            Box::new(cache_hit_rate.clone()),
        ] {
            // Double registration only happens in tests sharing a process
            let _ = registry.register(collector);
        }

        Self {
            records_processed,
            handler_duration_seconds,
            dlq_published,
            retries_active,
            breaker_state,
            partition_lag,
            cache_hits,
            cache_misses,
            cache_evictions,
            cache_size,
            cache_hit_rate,
        }
    }

    pub fn record_outcome(&self, operation: &str, outcome: &str) {
        self.records_processed
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn observe_handler(&self, operation: &str, seconds: f64) {
        self.handler_duration_seconds
            .with_label_values(&[operation])
            .observe(seconds);
    }

    /// Mirror cache counters into scrape-visible gauges.
    pub fn update_cache(&self, snapshot: &result_cache::CacheMetricsSnapshot) {
        self.cache_hits.set(snapshot.hits as i64);
        self.cache_misses.set(snapshot.misses as i64);
        self.cache_evictions.set(snapshot.evictions as i64);
        self.cache_size.set(snapshot.size as i64);
        self.cache_hit_rate.set(snapshot.hit_rate);
    }
}

pub fn pipeline() -> &'static PipelineMetrics {
    METRICS.get_or_init(PipelineMetrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialize_once() {
        let first = pipeline() as *const PipelineMetrics;
        let second = pipeline() as *const PipelineMetrics;
        assert_eq!(first, second);
    }

    #[test]
    fn test_outcome_counter_increments() {
        let metrics = pipeline();
        let before = metrics
            .records_processed
            .with_label_values(&["hybrid_score", "completed"])
            .get();
        metrics.record_outcome("hybrid_score", "completed");
        let after = metrics
            .records_processed
            .with_label_values(&["hybrid_score", "completed"])
            .get();
        assert_eq!(after, before + 1);
    }
}
