//! Comprehensive analysis: entity extraction with optional embedding and
//! pattern enrichment.
//!
//! Entity extraction is the critical stage; enrichment stages degrade
//! individually. A terminal failure anywhere fails the message, a transient
//! failure in an optional stage yields a partial result instead.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use event_schema::payloads::{OperationRequest, OperationType};

use crate::correlation::RequestContext;
use crate::error::{EngineError, Result};
use crate::handlers::{HandlerDeps, HandlerOutput, OperationHandler};
use crate::stores::PatternFilters;

pub struct ComprehensiveAnalysisHandler {
    deps: Arc<HandlerDeps>,
}

impl ComprehensiveAnalysisHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl OperationHandler for ComprehensiveAnalysisHandler {
    fn operation(&self) -> OperationType {
        OperationType::ComprehensiveAnalysis
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput> {
        let OperationRequest::ComprehensiveAnalysis(request) = request else {
            return Err(EngineError::Internal(
                "comprehensive analysis handler received foreign payload".into(),
            ));
        };

        // Critical stage: no entities means nothing to enrich
        let extraction = self
            .deps
            .analyzer
            .extract_document(&request.content, ctx)
            .await?;

        let mut degraded = Vec::new();

        let embeddings = if request.include_embeddings && !extraction.entities.is_empty() {
            let texts: Vec<String> = extraction
                .entities
                .iter()
                .map(|e| e.name.clone())
                .collect();
            match self.deps.embedder.embed(&texts, ctx).await {
                Ok(vectors) => Some(vectors),
                Err(e) => {
                    warn!(correlation = %ctx.short_id(), error = %e, "embedding enrichment skipped");
                    degraded.push("embeddings".to_string());
                    None
                }
            }
        } else {
            None
        };

        let patterns = if request.include_patterns {
            match self
                .deps
                .analyzer
                .analyze(&request.content, request.context.as_deref(), ctx)
                .await
            {
                Ok(semantic) => {
                    let keywords: Vec<String> =
                        semantic.entities.iter().map(|e| e.name.clone()).collect();
                    let related = match self
                        .deps
                        .patterns
                        .pattern_lookup(
                            &PatternFilters {
                                keywords,
                                limit: Some(10),
                                ..Default::default()
                            },
                            ctx,
                        )
                        .await
                    {
                        Ok(found) => found,
                        Err(e) => {
                            warn!(correlation = %ctx.short_id(), error = %e, "pattern lookup skipped");
                            degraded.push("pattern_lookup".to_string());
                            Vec::new()
                        }
                    };
                    Some(json!({
                        "semantic_score": semantic.semantic_score,
                        "related_patterns": related,
                    }))
                }
                Err(e) if e.is_retryable() => {
                    warn!(correlation = %ctx.short_id(), error = %e, "pattern extraction skipped");
                    degraded.push("pattern_extraction".to_string());
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let entities: Vec<serde_json::Value> = extraction
            .entities
            .iter()
            .enumerate()
            .map(|(i, entity)| {
                let vector = embeddings
                    .as_ref()
                    .and_then(|vectors| vectors.get(i).cloned());
                json!({
                    "name": entity.name,
                    "kind": entity.kind,
                    "confidence": entity.confidence,
                    "vector": vector,
                })
            })
            .collect();

        let result = json!({
            "entities": entities,
            "language": extraction.language,
            "metadata": extraction.metadata,
            "patterns": patterns,
        });
        Ok(HandlerOutput::partial(result, degraded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{AnalysisResult, Analyzer, EmbedError, Embedder, Entity};
    use crate::scoring::HybridScorer;
    use crate::stores::{
        MockGraphStore, MockPatternStore, MockSchemaStore, MockVectorStore, StoreError,
    };
    use event_schema::payloads::ComprehensiveAnalysisRequest;
    use std::time::Duration;

    struct FakeAnalyzer {
        fail_analyze: bool,
    }

    #[async_trait]
    impl Analyzer for FakeAnalyzer {
        async fn analyze(
            &self,
            _content: &str,
            _context: Option<&str>,
            _ctx: &RequestContext,
        ) -> Result<AnalysisResult> {
            if self.fail_analyze {
                return Err(EngineError::external("analyzer", "HTTP 503"));
            }
            Ok(AnalysisResult {
                entities: vec![],
                vector: None,
                semantic_score: Some(0.8),
                language: Some("rust".into()),
                metadata: serde_json::Value::Null,
            })
        }

        async fn extract_document(
            &self,
            _content: &str,
            _ctx: &RequestContext,
        ) -> Result<AnalysisResult> {
            Ok(AnalysisResult {
                entities: vec![
                    Entity {
                        name: "handle_request".into(),
                        kind: "function".into(),
                        confidence: Some(0.9),
                    },
                    Entity {
                        name: "Config".into(),
                        kind: "struct".into(),
                        confidence: Some(0.8),
                    },
                ],
                vector: None,
                semantic_score: None,
                language: Some("rust".into()),
                metadata: serde_json::json!({"lines": 10}),
            })
        }
    }

    struct FakeEmbedder {
        fail: bool,
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(
            &self,
            texts: &[String],
            _ctx: &RequestContext,
        ) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
            if self.fail {
                return Err(EmbedError::Service("down".into()));
            }
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }
    }

    fn deps(fail_analyze: bool, fail_embed: bool, fail_patterns: bool) -> Arc<HandlerDeps> {
        let mut patterns = MockPatternStore::new();
        if fail_patterns {
            patterns
                .expect_pattern_lookup()
                .returning(|_, _| Err(StoreError::Unavailable("down".into())));
        } else {
            patterns.expect_pattern_lookup().returning(|_, _| Ok(vec![]));
        }

        Arc::new(HandlerDeps {
            analyzer: Arc::new(FakeAnalyzer { fail_analyze }),
            embedder: Arc::new(FakeEmbedder { fail: fail_embed }),
            scorer: HybridScorer::default(),
            patterns: Arc::new(patterns),
            vectors: Arc::new(MockVectorStore::new()),
            graph: Arc::new(MockGraphStore::new()),
            schema: Arc::new(MockSchemaStore::new()),
        })
    }

    fn request(include_embeddings: bool, include_patterns: bool) -> OperationRequest {
        OperationRequest::ComprehensiveAnalysis(ComprehensiveAnalysisRequest {
            content: "fn handle_request() {}".into(),
            context: None,
            include_embeddings,
            include_patterns,
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

    #[tokio::test]
    async fn test_full_enrichment_succeeds() {
        let handler = ComprehensiveAnalysisHandler::new(deps(false, false, false));
        let output = handler.execute(&request(true, true), &ctx()).await.unwrap();

        assert!(!output.partial_results);
        let entities = output.result["entities"].as_array().unwrap();
        assert_eq!(entities.len(), 2);
        assert!(entities[0]["vector"].is_array());
        assert!(output.result["patterns"].is_object());
    }

    #[tokio::test]
    async fn test_embedder_outage_degrades() {
        let handler = ComprehensiveAnalysisHandler::new(deps(false, true, false));
        let output = handler.execute(&request(true, false), &ctx()).await.unwrap();

        assert!(output.partial_results);
        assert_eq!(output.degraded, vec!["embeddings"]);
        let entities = output.result["entities"].as_array().unwrap();
        assert!(entities[0]["vector"].is_null());
    }

    #[tokio::test]
    async fn test_transient_pattern_failure_degrades() {
        let handler = ComprehensiveAnalysisHandler::new(deps(true, false, false));
        let output = handler.execute(&request(false, true), &ctx()).await.unwrap();

        assert!(output.partial_results);
        assert_eq!(output.degraded, vec!["pattern_extraction"]);
        assert!(output.result["patterns"].is_null());
    }

    #[tokio::test]
    async fn test_pattern_store_outage_degrades() {
        let handler = ComprehensiveAnalysisHandler::new(deps(false, false, true));
        let output = handler.execute(&request(false, true), &ctx()).await.unwrap();

        assert!(output.partial_results);
        assert_eq!(output.degraded, vec!["pattern_lookup"]);
    }
}
