//! Health and metrics HTTP surface.
//!
//! `GET /health` reports liveness: the consumer control loop is not wedged.
//! `GET /ready` reports readiness: subscribed, analyzer breaker not open,
//! and the embedder responsive within the readiness window; 503 otherwise.
//! `GET /metrics` serves prometheus text exposition, with cache and breaker
//! gauges refreshed at scrape time.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpResponse, HttpServer};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;

use resilience::{CircuitBreaker, CircuitState};
use result_cache::LruTtlCache;

use crate::clients::{AnalysisResult, EmbedderClient};
use crate::engine::EngineStatus;
use crate::metrics;

const LIVENESS_THRESHOLD: Duration = Duration::from_secs(60);

pub struct HealthState {
    pub engine: Arc<EngineStatus>,
    pub breaker: CircuitBreaker,
    pub cache: Arc<LruTtlCache<AnalysisResult>>,
    pub embedder: Arc<EmbedderClient>,
    pub readiness_window: Duration,
}

async fn health(state: web::Data<Arc<HealthState>>) -> HttpResponse {
    let live = state.engine.is_live(LIVENESS_THRESHOLD);
    let body = json!({
        "status": if live { "ok" } else { "wedged" },
        "draining": state.engine.is_draining(),
    });

    if live {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn ready(state: web::Data<Arc<HealthState>>) -> HttpResponse {
    let subscribed = state.engine.is_subscribed() && !state.engine.is_draining();
    let breaker_state = state.breaker.current_state();
    let breaker_ok = breaker_state != CircuitState::Open;
    let embedder_ok = state.embedder.is_responsive(state.readiness_window);

    let ready = subscribed && breaker_ok && embedder_ok;
    let body = json!({
        "status": if ready { "ready" } else { "not_ready" },
        "components": {
            "consumer": { "subscribed": subscribed },
            "analyzer_breaker": {
                "state": match breaker_state {
                    CircuitState::Closed => "closed",
                    CircuitState::Open => "open",
                    CircuitState::HalfOpen => "half_open",
                },
                "ok": breaker_ok,
            },
            "embedder": { "responsive": embedder_ok },
        },
    });

    if ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn metrics_endpoint(state: web::Data<Arc<HealthState>>) -> HttpResponse {
    let pipeline = metrics::pipeline();
    pipeline.update_cache(&state.cache.metrics());
    pipeline
        .breaker_state
        .set(state.breaker.current_state().code());

    let families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        return HttpResponse::InternalServerError().body(format!("encode error: {e}"));
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

/// Build and bind the health server; the caller awaits the returned server.
pub fn run_health_server(
    state: Arc<HealthState>,
    port: u16,
) -> std::io::Result<actix_web::dev::Server> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/health", web::get().to(health))
            .route("/ready", web::get().to(ready))
            .route("/metrics", web::get().to(metrics_endpoint))
    })
    .bind(("0.0.0.0", port))?
    .disable_signals()
    .run();

    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbedderConfig;
    use actix_web::{body::to_bytes, http::StatusCode};
    use resilience::CircuitBreakerConfig;
    use result_cache::CacheConfig;

    fn test_state() -> Arc<HealthState> {
        let embedder = EmbedderClient::new(&EmbedderConfig {
            url: "http://localhost:1".into(),
            max_concurrent: 1,
            timeout_secs: 1,
            max_batch_size: 1,
            batch_linger_ms: 1,
        })
        .unwrap();

        Arc::new(HealthState {
            engine: Arc::new(EngineStatus::new()),
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            cache: Arc::new(LruTtlCache::new(CacheConfig::default())),
            embedder: Arc::new(embedder),
            readiness_window: Duration::from_secs(300),
        })
    }

    #[actix_web::test]
    async fn test_health_is_live_at_startup() {
        let state = test_state();
        let response = health(web::Data::new(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_ready_requires_subscription() {
        let state = test_state();
        // Engine never subscribed in this test
        let response = ready(web::Data::new(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = to_bytes(response.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["components"]["consumer"]["subscribed"], false);
        assert_eq!(body["components"]["analyzer_breaker"]["ok"], true);
    }

    #[actix_web::test]
    async fn test_open_breaker_blocks_readiness() {
        let state = test_state();
        for _ in 0..5 {
            let _ = state
                .breaker
                .call(|| async { Err::<(), _>("boom") })
                .await;
        }

        let response = ready(web::Data::new(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_metrics_exposition_renders() {
        let state = test_state();
        let response = metrics_endpoint(web::Data::new(state)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("engine_cache_hit_rate"));
        assert!(text.contains("engine_analyzer_breaker_state"));
    }
}
