//! Discovery handlers: pattern extraction, infrastructure scan, model and
//! schema discovery.
//!
//! These assemble structured payloads from the opaque capability stores.
//! Every sub-query may partially fail without failing the handler; a
//! handler fails only when nothing at all could be gathered.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use event_schema::payloads::{OperationRequest, OperationType};

use crate::correlation::RequestContext;
use crate::error::{EngineError, Result};
use crate::handlers::{HandlerDeps, HandlerOutput, OperationHandler};
use crate::stores::{GraphQuery, PatternFilters};

pub struct PatternExtractionHandler {
    deps: Arc<HandlerDeps>,
}

impl PatternExtractionHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl OperationHandler for PatternExtractionHandler {
    fn operation(&self) -> OperationType {
        OperationType::PatternExtraction
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput> {
        let OperationRequest::PatternExtraction(request) = request else {
            return Err(EngineError::Internal(
                "pattern extraction handler received foreign payload".into(),
            ));
        };

        // Critical: the analyzer supplies the candidate entities
        let extraction = self
            .deps
            .analyzer
            .analyze(&request.content, request.scope.as_deref(), ctx)
            .await?;

        let keywords: Vec<String> = extraction
            .entities
            .iter()
            .map(|e| e.name.to_lowercase())
            .collect();

        let mut degraded = Vec::new();

        let known_patterns = match self
            .deps
            .patterns
            .pattern_lookup(
                &PatternFilters {
                    keywords: keywords.clone(),
                    min_quality: None,
                    domain: request.scope.clone(),
                    limit: Some(20),
                },
                ctx,
            )
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(correlation = %ctx.short_id(), error = %e, "pattern store sub-query failed");
                degraded.push("pattern_lookup".to_string());
                Vec::new()
            }
        };

        let similar = match extraction.vector.as_deref() {
            Some(vector) => match self
                .deps
                .vectors
                .vector_search(vector, request.scope.as_deref(), 10, ctx)
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(correlation = %ctx.short_id(), error = %e, "vector sub-query failed");
                    degraded.push("vector_search".to_string());
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let filters = &request.filters;
        let extracted: Vec<serde_json::Value> = extraction
            .entities
            .iter()
            .filter(|e| filters.is_empty() || filters.contains(&e.kind))
            .map(|e| json!({"name": e.name, "kind": e.kind, "confidence": e.confidence}))
            .collect();

        let result = json!({
            "extracted_patterns": extracted,
            "known_patterns": known_patterns,
            "similar": similar,
            "semantic_score": extraction.semantic_score,
        });
        Ok(HandlerOutput::partial(result, degraded))
    }
}

pub struct InfrastructureScanHandler {
    deps: Arc<HandlerDeps>,
}

impl InfrastructureScanHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl OperationHandler for InfrastructureScanHandler {
    fn operation(&self) -> OperationType {
        OperationType::InfrastructureScan
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput> {
        let OperationRequest::InfrastructureScan(request) = request else {
            return Err(EngineError::Internal(
                "infrastructure scan handler received foreign payload".into(),
            ));
        };

        let targets: Vec<String> = if request.targets.is_empty() {
            vec![request.scope.clone()]
        } else {
            request.targets.clone()
        };

        let mut degraded = Vec::new();
        let mut components = Vec::new();
        for target in &targets {
            let query = GraphQuery {
                query: "MATCH (c:Component {scope: $scope}) RETURN c".to_string(),
                parameters: json!({"scope": target}),
            };
            match self.deps.graph.graph_query(&query, ctx).await {
                Ok(records) => components.push(json!({"target": target, "components": records})),
                Err(e) => {
                    warn!(correlation = %ctx.short_id(), target, error = %e, "scan target failed");
                    degraded.push(format!("target:{target}"));
                }
            }
        }

        // All targets failing means the scan produced nothing to report
        if components.is_empty() {
            return Err(EngineError::external(
                "graph-store",
                format!("infrastructure scan failed for all {} targets", targets.len()),
            ));
        }

        let result = json!({
            "scope": request.scope,
            "scanned": components,
        });
        Ok(HandlerOutput::partial(result, degraded))
    }
}

pub struct ModelDiscoveryHandler {
    deps: Arc<HandlerDeps>,
}

impl ModelDiscoveryHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl OperationHandler for ModelDiscoveryHandler {
    fn operation(&self) -> OperationType {
        OperationType::ModelDiscovery
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput> {
        let OperationRequest::ModelDiscovery(request) = request else {
            return Err(EngineError::Internal(
                "model discovery handler received foreign payload".into(),
            ));
        };

        let query = GraphQuery {
            query: "MATCH (m:Model {scope: $scope}) RETURN m".to_string(),
            parameters: json!({"scope": request.scope}),
        };
        let models = self.deps.graph.graph_query(&query, ctx).await?;

        let mut degraded = Vec::new();
        let related_patterns = match self
            .deps
            .patterns
            .pattern_lookup(
                &PatternFilters {
                    keywords: request.filters.clone(),
                    domain: Some(request.scope.clone()),
                    limit: Some(10),
                    ..Default::default()
                },
                ctx,
            )
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(correlation = %ctx.short_id(), error = %e, "related pattern sub-query failed");
                degraded.push("pattern_lookup".to_string());
                Vec::new()
            }
        };

        let result = json!({
            "scope": request.scope,
            "models": models,
            "related_patterns": related_patterns,
        });
        Ok(HandlerOutput::partial(result, degraded))
    }
}

pub struct SchemaDiscoveryHandler {
    deps: Arc<HandlerDeps>,
}

impl SchemaDiscoveryHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl OperationHandler for SchemaDiscoveryHandler {
    fn operation(&self) -> OperationType {
        OperationType::SchemaDiscovery
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput> {
        let OperationRequest::SchemaDiscovery(request) = request else {
            return Err(EngineError::Internal(
                "schema discovery handler received foreign payload".into(),
            ));
        };

        let snapshot = self
            .deps
            .schema
            .schema_introspect(&request.scope, ctx)
            .await?;

        let filters = &request.filters;
        let tables: Vec<_> = snapshot
            .tables
            .into_iter()
            .filter(|t| filters.is_empty() || filters.iter().any(|f| t.name.contains(f)))
            .collect();

        let result = json!({
            "scope": request.scope,
            "table_count": tables.len(),
            "tables": tables,
        });
        Ok(HandlerOutput::complete(result))
    }
}
