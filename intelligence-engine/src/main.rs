use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use intelligence_engine::clients::{AnalyzerClient, EmbedderClient};
use intelligence_engine::config::Config;
use intelligence_engine::engine::{
    retry, ConsumerEngine, EngineStatus, RetrySchedulerConfig, Worker,
};
use intelligence_engine::handlers::{HandlerDeps, HandlerRegistry};
use intelligence_engine::health::{run_health_server, HealthState};
use intelligence_engine::kafka::{DlqPublisher, EventPublisher};
use intelligence_engine::scoring::HybridScorer;
use intelligence_engine::stores::{
    HttpGraphStore, HttpPatternStore, HttpSchemaStore, HttpVectorStore,
};

use event_schema::EventSource;
use resilience::{BackoffPolicy, CircuitBreaker, CircuitBreakerConfig};
use result_cache::{CacheConfig, LruTtlCache};

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();

    tracing::info!("starting intelligence-engine");

    let config = Config::from_env();
    config.log_summary();

    let source = EventSource::new(
        config.service.service_name.clone(),
        config.service.instance_id.clone(),
    );
    let topics = config.topics();

    // Shared state: cache and breaker are process-wide with internal
    // synchronization; everything else is constructor-injected
    let cache = Arc::new(LruTtlCache::new(CacheConfig {
        max_size: config.cache.max_size,
        ttl: Duration::from_secs(config.cache.ttl_secs),
        shards: 16,
    }));
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: config.breaker.failure_threshold,
        success_threshold: config.breaker.success_threshold,
        reset_timeout: Duration::from_secs(config.breaker.reset_timeout_secs),
    });

    let analyzer = Arc::new(
        AnalyzerClient::new(
            &config.analyzer,
            breaker.clone(),
            cache.clone(),
            config.breaker.count_timeouts,
        )
        .context("failed to build analyzer client")?,
    );
    let embedder =
        Arc::new(EmbedderClient::new(&config.embedder).context("failed to build embedder client")?);

    let patterns = Arc::new(
        HttpPatternStore::new(&config.stores).context("failed to build pattern store client")?,
    );
    let vectors = Arc::new(
        HttpVectorStore::new(&config.stores).context("failed to build vector store client")?,
    );
    let graph =
        Arc::new(HttpGraphStore::new(&config.stores).context("failed to build graph store client")?);
    let schema = Arc::new(
        HttpSchemaStore::new(&config.stores).context("failed to build schema store client")?,
    );

    let deps = Arc::new(HandlerDeps {
        analyzer: analyzer.clone(),
        embedder: embedder.clone(),
        scorer: HybridScorer::default(),
        patterns,
        vectors,
        graph,
        schema,
    });
    let registry = Arc::new(HandlerRegistry::standard(deps));

    let publisher = Arc::new(
        EventPublisher::new(&config.kafka, topics.clone(), source.clone())
            .context("failed to build event publisher")?,
    );
    let dlq = Arc::new(
        DlqPublisher::new(&config.kafka, topics.dlq.clone(), source.clone())
            .context("failed to build DLQ publisher")?,
    );

    if let Err(e) = publisher.health_check().await {
        tracing::warn!(error = %e, "kafka metadata fetch failed at startup, continuing");
    }

    let (redispatch_tx, redispatch_rx) = mpsc::channel(256);
    let scheduler = retry::spawn(
        RetrySchedulerConfig {
            policy: BackoffPolicy {
                base: Duration::from_secs(config.retry.backoff_base_secs),
                cap: Duration::from_secs(config.retry.backoff_max_secs),
                jitter: config.retry.jitter,
            },
            mode: config.retry.mode,
            state_ttl: Duration::from_secs(config.retry.state_ttl_secs),
        },
        publisher.clone(),
        Some(redispatch_tx),
        source,
    );

    let worker = Arc::new(Worker {
        registry,
        events: publisher,
        dlq,
        retries: scheduler,
        max_retry_attempts: config.retry.max_attempts,
        operation_timeout: config.operation_timeout(),
    });

    let status = Arc::new(EngineStatus::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = ConsumerEngine::new(&config, worker, status.clone(), shutdown_rx, redispatch_rx)
        .context("failed to build consumer engine")?;
    let engine_task = tokio::spawn(engine.run());

    let health_state = Arc::new(HealthState {
        engine: status,
        breaker,
        cache,
        embedder,
        readiness_window: Duration::from_secs(config.health.readiness_window_secs),
    });
    let server = run_health_server(health_state, config.health.port)
        .context("failed to bind health server")?;
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tracing::info!(port = config.health.port, "health server started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("termination signal received");

    // Stop polling first so in-flight work can drain within the deadline
    let _ = shutdown_tx.send(true);
    let drain_budget = config.shutdown_timeout() + Duration::from_secs(5);
    match tokio::time::timeout(drain_budget, engine_task).await {
        Ok(Ok(Ok(()))) => tracing::info!("engine drained cleanly"),
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "engine exited with error"),
        Ok(Err(e)) => tracing::error!(error = %e, "engine task panicked"),
        Err(_) => tracing::warn!("engine drain exceeded budget, exiting anyway"),
    }

    server_handle.stop(true).await;
    let _ = server_task.await;

    tracing::info!("intelligence-engine stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            tracing_subscriber::EnvFilter::try_new(
                std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            )
        })
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json_format {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
