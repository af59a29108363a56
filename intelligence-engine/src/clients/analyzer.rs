//! Analyzer client: cache, circuit breaker, and timeout around the external
//! semantic analysis service.
//!
//! Call path per request: cache lookup → breaker admission → HTTP with hard
//! timeout → response validation → cache insert. Malformed responses are
//! never cached; breaker-open returns without network I/O.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use resilience::{CircuitBreaker, CircuitBreakerError, FailureKind};
use result_cache::{CacheKey, LruTtlCache};

use crate::clients::{Analyzer, ServiceErrorBody};
use crate::config::AnalyzerConfig;
use crate::correlation::{RequestContext, HTTP_CORRELATION_ID_HEADER};
use crate::error::{EngineError, Result};

const SERVICE: &str = "analyzer";

/// One extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Validated analyzer response, also the cached value shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AnalysisResult {
    /// Shape validation before acceptance; rejected responses are not cached.
    fn validate(&self) -> Result<()> {
        if let Some(score) = self.semantic_score {
            if !(0.0..=1.0).contains(&score) || score.is_nan() {
                return Err(EngineError::Parsing(format!(
                    "analyzer returned semantic_score outside [0, 1]: {score}"
                )));
            }
        }
        for entity in &self.entities {
            if entity.name.is_empty() {
                return Err(EngineError::Parsing(
                    "analyzer returned entity with empty name".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct AnalyzeRequestBody<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

pub struct AnalyzerClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    breaker: CircuitBreaker,
    cache: Arc<LruTtlCache<AnalysisResult>>,
    count_timeouts: bool,
}

impl AnalyzerClient {
    pub fn new(
        config: &AnalyzerConfig,
        breaker: CircuitBreaker,
        cache: Arc<LruTtlCache<AnalysisResult>>,
        count_timeouts: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| EngineError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            breaker,
            cache,
            count_timeouts,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn call_endpoint(
        &self,
        path: &str,
        content: &str,
        context: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<AnalysisResult> {
        let key = CacheKey::for_content(content, context);
        if let Some(cached) = self.cache.get(key) {
            debug!(correlation = %ctx.short_id(), "analyzer cache hit");
            return Ok(cached);
        }

        let count_timeouts = self.count_timeouts;
        let result = self
            .breaker
            .call_classified(
                || self.request(path, content, context, ctx),
                |error: &EngineError| match error {
                    EngineError::Timeout(_) if !count_timeouts => FailureKind::Ignored,
                    // Client-side rejections say nothing about the dependency
                    EngineError::InvalidInput(_) | EngineError::Parsing(_) => FailureKind::Ignored,
                    _ => FailureKind::Qualifying,
                },
            )
            .await;

        match result {
            Ok(analysis) => {
                self.cache.put(key, analysis.clone());
                Ok(analysis)
            }
            Err(CircuitBreakerError::Open) => Err(EngineError::CircuitBreakerOpen(SERVICE)),
            Err(CircuitBreakerError::CallFailed(e)) => Err(e),
        }
    }

    async fn request(
        &self,
        path: &str,
        content: &str,
        context: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<AnalysisResult> {
        let url = format!("{}{}", self.base_url, path);
        let body = AnalyzeRequestBody { content, context };

        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .header(HTTP_CORRELATION_ID_HEADER, ctx.correlation_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(self.timeout)
                } else {
                    EngineError::external(SERVICE, e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let analysis: AnalysisResult = response
                .json()
                .await
                .map_err(|e| EngineError::Parsing(format!("analyzer response: {e}")))?;
            analysis.validate()?;
            return Ok(analysis);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimit(SERVICE));
        }
        if status.is_server_error() {
            return Err(EngineError::external(SERVICE, format!("HTTP {status}")));
        }

        // 4xx: a well-formed typed error maps onto the taxonomy; a malformed
        // body is a terminal parse failure.
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::external(SERVICE, e.to_string()))?;
        match serde_json::from_slice::<ServiceErrorBody>(&bytes) {
            Ok(body) => Err(map_typed_error(&body)),
            Err(_) => {
                warn!(
                    correlation = %ctx.short_id(),
                    %status,
                    "analyzer returned {status} with malformed error body"
                );
                Err(EngineError::Parsing(format!(
                    "analyzer returned HTTP {status} with malformed error body"
                )))
            }
        }
    }
}

fn map_typed_error(body: &ServiceErrorBody) -> EngineError {
    match body.error.as_str() {
        "unsupported_language" => EngineError::UnsupportedLanguage(body.message.clone()),
        "invalid_input" => EngineError::InvalidInput(body.message.clone()),
        "parsing_error" => EngineError::Parsing(body.message.clone()),
        "rate_limit_exceeded" => EngineError::RateLimit(SERVICE),
        other => EngineError::external(SERVICE, format!("{other}: {}", body.message)),
    }
}

#[async_trait]
impl Analyzer for AnalyzerClient {
    async fn analyze(
        &self,
        content: &str,
        context: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<AnalysisResult> {
        self.call_endpoint("/analyze/semantic", content, context, ctx)
            .await
    }

    async fn extract_document(
        &self,
        content: &str,
        ctx: &RequestContext,
    ) -> Result<AnalysisResult> {
        self.call_endpoint("/extract/document", content, None, ctx)
            .await
    }
}
