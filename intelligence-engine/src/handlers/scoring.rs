//! Hybrid score handler: pure computation with an optional pattern lookup.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use event_schema::payloads::{HybridScoreRequest, OperationRequest, OperationType};

use crate::correlation::RequestContext;
use crate::error::{EngineError, Result};
use crate::handlers::{HandlerDeps, HandlerOutput, OperationHandler};
use crate::scoring::ScoreInputs;
use crate::stores::PatternFilters;

pub struct HybridScoreHandler {
    deps: Arc<HandlerDeps>,
}

impl HybridScoreHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }

    /// Resolve the pattern being scored. Inline keyword data wins; a bare
    /// `pattern_id` triggers the one optional external lookup this handler
    /// is allowed.
    async fn resolve_pattern(
        &self,
        request: &HybridScoreRequest,
        ctx: &RequestContext,
    ) -> Result<(Vec<String>, Option<f64>, Option<f64>)> {
        let metadata = &request.pattern.metadata;
        if !request.pattern.keywords.is_empty() {
            return Ok((
                request.pattern.keywords.clone(),
                metadata.quality_score,
                metadata.success_rate,
            ));
        }

        let Some(pattern_id) = &request.pattern.pattern_id else {
            return Ok((Vec::new(), metadata.quality_score, metadata.success_rate));
        };

        debug!(correlation = %ctx.short_id(), pattern_id, "resolving stored pattern");
        let found = self
            .deps
            .patterns
            .pattern_lookup(
                &PatternFilters {
                    keywords: vec![pattern_id.clone()],
                    limit: Some(1),
                    ..Default::default()
                },
                ctx,
            )
            .await?;

        let stored = found.into_iter().next().ok_or_else(|| {
            EngineError::InvalidInput(format!("pattern {pattern_id} not found"))
        })?;

        Ok((
            stored.keywords,
            metadata.quality_score.or(stored.quality_score),
            metadata.success_rate.or(stored.success_rate),
        ))
    }
}

#[async_trait]
impl OperationHandler for HybridScoreHandler {
    fn operation(&self) -> OperationType {
        OperationType::HybridScore
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput> {
        let OperationRequest::HybridScore(request) = request else {
            return Err(EngineError::Internal(
                "hybrid score handler received foreign payload".into(),
            ));
        };

        let (pattern_keywords, quality_score, success_rate) =
            self.resolve_pattern(request, ctx).await?;

        let score = self.deps.scorer.score(&ScoreInputs {
            pattern_keywords: &pattern_keywords,
            context_keywords: &request.context.keywords,
            quality_score,
            success_rate,
            semantic_score: request.pattern.metadata.semantic_score,
            confidence_score: request.pattern.metadata.confidence_score,
            weights: request.weights,
            task: request.task_characteristics.as_ref(),
        });

        let result = json!({
            "hybrid_score": score.hybrid_score,
            "confidence": score.confidence,
            "breakdown": score.breakdown,
            "weights_used": score.weights_used,
            "raw_weights": score.raw_weights,
            "relevance": score.relevance,
        });
        Ok(HandlerOutput::complete(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{AnalysisResult, Analyzer, EmbedError, Embedder};
    use crate::scoring::HybridScorer;
    use crate::stores::{
        MockGraphStore, MockPatternStore, MockSchemaStore, MockVectorStore, StoredPattern,
    };
    use event_schema::payloads::{PatternCandidate, PatternMetadata, ScoringContext};
    use std::time::Duration;

    struct NoAnalyzer;

    #[async_trait]
    impl Analyzer for NoAnalyzer {
        async fn analyze(
            &self,
            _: &str,
            _: Option<&str>,
            _: &RequestContext,
        ) -> Result<AnalysisResult> {
            Err(EngineError::Internal("not used".into()))
        }
        async fn extract_document(&self, _: &str, _: &RequestContext) -> Result<AnalysisResult> {
            Err(EngineError::Internal("not used".into()))
        }
    }

    struct NoEmbedder;

    #[async_trait]
    impl Embedder for NoEmbedder {
        async fn embed(
            &self,
            _: &[String],
            _: &RequestContext,
        ) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
            Err(EmbedError::Service("not used".into()))
        }
    }

    fn deps_with_patterns(patterns: MockPatternStore) -> Arc<HandlerDeps> {
        Arc::new(HandlerDeps {
            analyzer: Arc::new(NoAnalyzer),
            embedder: Arc::new(NoEmbedder),
            scorer: HybridScorer::default(),
            patterns: Arc::new(patterns),
            vectors: Arc::new(MockVectorStore::new()),
            graph: Arc::new(MockGraphStore::new()),
            schema: Arc::new(MockSchemaStore::new()),
        })
    }

    fn ctx() -> RequestContext {
        let envelope = event_schema::Envelope::new(
            event_schema::event_types::ANALYSIS_REQUESTED,
            event_schema::EventSource::new("s", "i"),
            serde_json::json!({}),
        );
        RequestContext::for_envelope(&envelope, Duration::from_secs(30))
    }

    fn strings(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_inline_pattern_scores_without_io() {
        let handler = HybridScoreHandler::new(deps_with_patterns(MockPatternStore::new()));
        let request = OperationRequest::HybridScore(HybridScoreRequest {
            pattern: PatternCandidate {
                keywords: strings(&["fastapi", "async", "api", "rest"]),
                metadata: PatternMetadata {
                    quality_score: Some(0.85),
                    success_rate: Some(0.90),
                    semantic_score: Some(0.82),
                    confidence_score: None,
                },
                pattern_id: None,
            },
            context: ScoringContext {
                keywords: strings(&["fastapi", "rest", "endpoint"]),
            },
            weights: None,
            task_characteristics: None,
        });

        let output = handler.execute(&request, &ctx()).await.unwrap();
        assert!(!output.partial_results);
        let score = output.result["hybrid_score"].as_f64().unwrap();
        assert!((score - 0.737).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_stored_pattern_is_looked_up() {
        let mut patterns = MockPatternStore::new();
        patterns.expect_pattern_lookup().returning(|_, _| {
            Ok(vec![StoredPattern {
                id: "p-1".into(),
                parent_id: None,
                keywords: vec!["fastapi".into(), "rest".into()],
                quality_score: Some(0.9),
                success_rate: Some(0.8),
                metadata: serde_json::Value::Null,
            }])
        });

        let handler = HybridScoreHandler::new(deps_with_patterns(patterns));
        let request = OperationRequest::HybridScore(HybridScoreRequest {
            pattern: PatternCandidate {
                keywords: vec![],
                metadata: PatternMetadata::default(),
                pattern_id: Some("p-1".into()),
            },
            context: ScoringContext {
                keywords: strings(&["fastapi", "rest"]),
            },
            weights: None,
            task_characteristics: None,
        });

        let output = handler.execute(&request, &ctx()).await.unwrap();
        let keyword = output.result["breakdown"]["keyword"].as_f64().unwrap();
        assert!((keyword - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_stored_pattern_is_invalid_input() {
        let mut patterns = MockPatternStore::new();
        patterns.expect_pattern_lookup().returning(|_, _| Ok(vec![]));

        let handler = HybridScoreHandler::new(deps_with_patterns(patterns));
        let request = OperationRequest::HybridScore(HybridScoreRequest {
            pattern: PatternCandidate {
                keywords: vec![],
                metadata: PatternMetadata::default(),
                pattern_id: Some("missing".into()),
            },
            context: ScoringContext {
                keywords: strings(&["a"]),
            },
            weights: None,
            task_characteristics: None,
        });

        let result = handler.execute(&request, &ctx()).await;
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }
}
