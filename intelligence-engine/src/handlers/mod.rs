//! Operation handlers and the dispatch table.
//!
//! One handler per operation type. Handlers are stateless: all per-request
//! data lives on the stack or in the [`RequestContext`], and every external
//! collaborator comes in through a narrow trait so tests can substitute
//! fakes. The dispatcher is a static mapping; an unmapped operation is a
//! typed `invalid_input`, never a panic.

pub mod analysis;
pub mod assessment;
pub mod discovery;
pub mod scoring;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use event_schema::payloads::{OperationRequest, OperationType};

use crate::clients::{Analyzer, Embedder};
use crate::correlation::RequestContext;
use crate::error::{EngineError, Result};
use crate::scoring::HybridScorer;
use crate::stores::{GraphStore, PatternStore, SchemaStore, VectorStore};

/// Handler outcome: a structured payload plus degradation flags for
/// partial-result completions.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub result: Value,
    pub partial_results: bool,
    pub degraded: Vec<String>,
}

impl HandlerOutput {
    pub fn complete(result: Value) -> Self {
        Self {
            result,
            partial_results: false,
            degraded: Vec::new(),
        }
    }

    pub fn partial(result: Value, degraded: Vec<String>) -> Self {
        Self {
            result,
            partial_results: !degraded.is_empty(),
            degraded,
        }
    }
}

#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn operation(&self) -> OperationType;

    async fn execute(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput>;
}

/// Shared collaborators injected into every handler.
pub struct HandlerDeps {
    pub analyzer: Arc<dyn Analyzer>,
    pub embedder: Arc<dyn Embedder>,
    pub scorer: HybridScorer,
    pub patterns: Arc<dyn PatternStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub schema: Arc<dyn SchemaStore>,
}

/// Static operation → handler mapping.
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The full production table: one handler per operation type.
    pub fn standard(deps: Arc<HandlerDeps>) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(assessment::QualityAssessmentHandler::new(
            deps.clone(),
        )));
        registry.register(Arc::new(assessment::OnexComplianceHandler::new(
            deps.clone(),
        )));
        registry.register(Arc::new(assessment::ArchitecturalComplianceHandler::new(
            deps.clone(),
        )));
        registry.register(Arc::new(analysis::ComprehensiveAnalysisHandler::new(
            deps.clone(),
        )));
        registry.register(Arc::new(scoring::HybridScoreHandler::new(deps.clone())));
        registry.register(Arc::new(discovery::PatternExtractionHandler::new(
            deps.clone(),
        )));
        registry.register(Arc::new(discovery::InfrastructureScanHandler::new(
            deps.clone(),
        )));
        registry.register(Arc::new(discovery::ModelDiscoveryHandler::new(
            deps.clone(),
        )));
        registry.register(Arc::new(discovery::SchemaDiscoveryHandler::new(deps)));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(handler.operation(), handler);
    }

    pub fn operations(&self) -> Vec<OperationType> {
        self.handlers.keys().copied().collect()
    }

    pub async fn dispatch(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput> {
        let operation = request.operation();
        let handler = self.handlers.get(&operation).ok_or_else(|| {
            EngineError::InvalidInput(format!("no handler mapped for operation {operation}"))
        })?;
        handler.execute(request, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_schema::payloads::DiscoveryRequest;
    use std::time::Duration;

    fn test_ctx() -> RequestContext {
        let envelope = event_schema::Envelope::new(
            event_schema::event_types::ANALYSIS_REQUESTED,
            event_schema::EventSource::new("s", "i"),
            serde_json::json!({}),
        );
        RequestContext::for_envelope(&envelope, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_unmapped_operation_is_invalid_input() {
        let registry = HandlerRegistry::empty();
        let request = OperationRequest::SchemaDiscovery(DiscoveryRequest {
            scope: "public".into(),
            filters: vec![],
        });

        let result = registry.dispatch(&request, &test_ctx()).await;
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }
}
