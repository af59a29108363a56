use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::retry::RetryMode;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub kafka: KafkaConfig,
    pub processing: ProcessingConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub analyzer: AnalyzerConfig,
    pub embedder: EmbedderConfig,
    pub cache: CacheConfig,
    pub stores: StoresConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub topic_prefix: String,
    pub consumer_group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Worker pool size
    pub concurrency: usize,
    /// Records taken from the stream between housekeeping passes
    pub max_poll_records: usize,
    /// Per-operation handler deadline
    pub operation_timeout_secs: u64,
    /// Graceful shutdown drain deadline
    pub shutdown_timeout_secs: u64,
    /// Offset commit flush interval
    pub commit_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub jitter: bool,
    pub mode: RetryMode,
    /// Retry-state entries older than this are swept
    pub state_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub success_threshold: u32,
    /// Whether pure timeouts count toward the failure threshold
    pub count_timeouts: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    pub url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedderConfig {
    pub url: String,
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    pub max_batch_size: usize,
    pub batch_linger_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoresConfig {
    pub pattern_url: String,
    pub vector_url: String,
    pub graph_url: String,
    pub schema_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub port: u16,
    /// Embedder must have responded within this window for readiness
    pub readiness_window_secs: u64,
}

/// Topic names for one deployment, derived from the environment prefix.
///
/// Convention: `{prefix}.{service}.{domain}.{event}.{version}`.
#[derive(Debug, Clone)]
pub struct Topics {
    pub requests: String,
    pub completions: String,
    pub failures: String,
    pub dlq: String,
}

impl Topics {
    pub fn new(prefix: &str, service: &str) -> Self {
        let base = format!("{prefix}.{service}.intelligence");
        Self {
            requests: format!("{base}.code-analysis-requested.v1"),
            completions: format!("{base}.code-analysis-completed.v1"),
            failures: format!("{base}.code-analysis-failed.v1"),
            dlq: format!("{base}.code-analysis-dead-lettered.v1"),
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> T
where
    T::Err: std::fmt::Debug,
{
    let raw = var_or(name, default);
    raw.parse()
        .unwrap_or_else(|e| panic!("{name} must be a valid value, got {raw:?}: {e:?}"))
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Config {
            service: ServiceConfig {
                service_name: var_or("SERVICE_NAME", "archon-intelligence"),
                instance_id: var_or(
                    "INSTANCE_ID",
                    &format!("engine-{}", std::process::id()),
                ),
            },
            kafka: KafkaConfig {
                bootstrap_servers: var_or("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092"),
                topic_prefix: var_or("KAFKA_TOPIC_PREFIX", "dev"),
                consumer_group: var_or("KAFKA_CONSUMER_GROUP", "archon-intelligence-engine-v1"),
            },
            processing: ProcessingConfig {
                concurrency: parse_var("PROCESSING_CONCURRENCY", "5"),
                max_poll_records: parse_var("MAX_POLL_RECORDS", "10"),
                operation_timeout_secs: parse_var("OPERATION_TIMEOUT", "120"),
                shutdown_timeout_secs: parse_var("SHUTDOWN_TIMEOUT", "30"),
                commit_interval_secs: parse_var("COMMIT_INTERVAL", "5"),
            },
            retry: RetryConfig {
                max_attempts: parse_var("MAX_RETRY_ATTEMPTS", "3"),
                backoff_base_secs: parse_var("RETRY_BACKOFF_BASE", "2"),
                backoff_max_secs: parse_var("RETRY_BACKOFF_MAX", "60"),
                jitter: parse_var("RETRY_BACKOFF_JITTER", "false"),
                mode: match var_or("RETRY_MODE", "republish").to_lowercase().as_str() {
                    "in_process" | "in-process" => RetryMode::InProcess,
                    _ => RetryMode::Republish,
                },
                state_ttl_secs: parse_var("RETRY_STATE_TTL", "3600"),
            },
            breaker: BreakerConfig {
                failure_threshold: parse_var("CIRCUIT_BREAKER_THRESHOLD", "5"),
                reset_timeout_secs: parse_var("CIRCUIT_BREAKER_TIMEOUT", "60"),
                success_threshold: parse_var("CIRCUIT_BREAKER_SUCCESS_THRESHOLD", "1"),
                count_timeouts: parse_var("CIRCUIT_BREAKER_COUNT_TIMEOUTS", "false"),
            },
            analyzer: AnalyzerConfig {
                url: var_or("ANALYZER_URL", "http://localhost:8053"),
                timeout_secs: parse_var("ANALYZER_TIMEOUT", "30"),
            },
            embedder: EmbedderConfig {
                url: var_or("EMBEDDER_URL", "http://localhost:8054"),
                max_concurrent: parse_var("EMBEDDER_MAX_CONCURRENT", "4"),
                timeout_secs: parse_var("EMBEDDER_TIMEOUT", "30"),
                max_batch_size: parse_var("EMBEDDER_MAX_BATCH_SIZE", "32"),
                batch_linger_ms: parse_var("EMBEDDER_BATCH_LINGER_MS", "25"),
            },
            cache: CacheConfig {
                max_size: parse_var("CACHE_MAX_SIZE", "1000"),
                ttl_secs: parse_var("CACHE_TTL_SECONDS", "3600"),
            },
            stores: StoresConfig {
                pattern_url: var_or("PATTERN_STORE_URL", "http://localhost:8061"),
                vector_url: var_or("VECTOR_STORE_URL", "http://localhost:8062"),
                graph_url: var_or("GRAPH_STORE_URL", "http://localhost:8063"),
                schema_url: var_or("SCHEMA_STORE_URL", "http://localhost:8064"),
                timeout_secs: parse_var("STORE_TIMEOUT", "10"),
            },
            health: HealthConfig {
                port: parse_var("HEALTH_CHECK_PORT", "8060"),
                readiness_window_secs: parse_var("READINESS_WINDOW", "300"),
            },
        }
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.kafka.topic_prefix, &self.service.service_name)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.processing.operation_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.processing.shutdown_timeout_secs)
    }

    /// Log the effective configuration with endpoints only, no secrets.
    pub fn log_summary(&self) {
        tracing::info!(
            brokers = %self.kafka.bootstrap_servers,
            group = %self.kafka.consumer_group,
            prefix = %self.kafka.topic_prefix,
            concurrency = self.processing.concurrency,
            max_poll_records = self.processing.max_poll_records,
            retry_max = self.retry.max_attempts,
            retry_mode = ?self.retry.mode,
            breaker_threshold = self.breaker.failure_threshold,
            analyzer = %self.analyzer.url,
            embedder = %self.embedder.url,
            cache_size = self.cache.max_size,
            "engine configuration loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_naming_convention() {
        let topics = Topics::new("dev", "archon-intelligence");
        assert_eq!(
            topics.requests,
            "dev.archon-intelligence.intelligence.code-analysis-requested.v1"
        );
        assert_eq!(
            topics.dlq,
            "dev.archon-intelligence.intelligence.code-analysis-dead-lettered.v1"
        );
    }

    #[test]
    fn test_defaults_without_env() {
        // Only defaults that no test environment overrides
        let config = Config::from_env();
        assert_eq!(config.processing.concurrency, 5);
        assert_eq!(config.processing.max_poll_records, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_base_secs, 2);
        assert_eq!(config.retry.backoff_max_secs, 60);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(!config.breaker.count_timeouts);
    }
}
