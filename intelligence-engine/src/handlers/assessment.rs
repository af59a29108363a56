//! Source-level assessment handlers: quality, ONEX rule compliance, and
//! architectural conformance.
//!
//! Each combines local rule evaluation with analyzer-backed semantics.
//! Analyzer outages degrade to local-only results; the degradation is
//! flagged on the completion event.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use event_schema::payloads::{OperationRequest, OperationType, SourceAssessmentRequest};

use crate::correlation::RequestContext;
use crate::error::{EngineError, Result};
use crate::handlers::{HandlerDeps, HandlerOutput, OperationHandler};
use crate::stores::GraphQuery;

const SUPPORTED_LANGUAGES: &[&str] = &["rust", "python", "typescript", "javascript", "go"];

fn check_language(request: &SourceAssessmentRequest) -> Result<()> {
    if let Some(language) = &request.language {
        let folded = language.to_lowercase();
        if !SUPPORTED_LANGUAGES.contains(&folded.as_str()) {
            return Err(EngineError::UnsupportedLanguage(language.clone()));
        }
    }
    Ok(())
}

fn expect_assessment<'a>(request: &'a OperationRequest) -> Result<&'a SourceAssessmentRequest> {
    match request {
        OperationRequest::QualityAssessment(r)
        | OperationRequest::OnexCompliance(r)
        | OperationRequest::ArchitecturalCompliance(r) => Ok(r),
        other => Err(EngineError::Internal(format!(
            "assessment handler received {} payload",
            other.operation()
        ))),
    }
}

/// Structural metrics computed locally, without the analyzer.
#[derive(Debug, Clone, Copy)]
struct SourceMetrics {
    lines: usize,
    comment_lines: usize,
    long_lines: usize,
    todo_count: usize,
}

fn measure(content: &str) -> SourceMetrics {
    let mut metrics = SourceMetrics {
        lines: 0,
        comment_lines: 0,
        long_lines: 0,
        todo_count: 0,
    };
    for line in content.lines() {
        metrics.lines += 1;
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") || trimmed.starts_with('#') {
            metrics.comment_lines += 1;
        }
        if line.len() > 120 {
            metrics.long_lines += 1;
        }
        if line.contains("TODO") || line.contains("FIXME") {
            metrics.todo_count += 1;
        }
    }
    metrics
}

/// Heuristic structural quality in `[0, 1]`.
fn structural_quality(metrics: &SourceMetrics) -> f64 {
    if metrics.lines == 0 {
        return 0.0;
    }
    let long_penalty = metrics.long_lines as f64 / metrics.lines as f64;
    let todo_penalty = (metrics.todo_count as f64 * 0.02).min(0.2);
    let comment_ratio = metrics.comment_lines as f64 / metrics.lines as f64;
    // Sparse commentary costs a little, dense commentary is not rewarded
    let comment_penalty = if comment_ratio < 0.02 { 0.05 } else { 0.0 };

    (1.0 - long_penalty * 0.5 - todo_penalty - comment_penalty).clamp(0.0, 1.0)
}

pub struct QualityAssessmentHandler {
    deps: Arc<HandlerDeps>,
}

impl QualityAssessmentHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl OperationHandler for QualityAssessmentHandler {
    fn operation(&self) -> OperationType {
        OperationType::QualityAssessment
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput> {
        let request = expect_assessment(request)?;
        check_language(request)?;

        let metrics = measure(&request.content);
        let structural = structural_quality(&metrics);

        let mut degraded = Vec::new();
        let semantic = match self.deps.analyzer.analyze(&request.content, None, ctx).await {
            Ok(analysis) => analysis.semantic_score,
            Err(e) if e.is_retryable() => {
                warn!(correlation = %ctx.short_id(), error = %e, "quality assessment degrading to local metrics");
                degraded.push("semantic_analysis".to_string());
                None
            }
            Err(e) => return Err(e),
        };

        let quality_score = match semantic {
            Some(semantic) => (structural * 0.6 + semantic * 0.4).clamp(0.0, 1.0),
            None => structural,
        };
        let passed = request
            .quality_threshold
            .map(|threshold| quality_score >= threshold);

        let result = json!({
            "source_path": request.source_path,
            "quality_score": quality_score,
            "structural_score": structural,
            "semantic_score": semantic,
            "passed": passed,
            "metrics": {
                "lines": metrics.lines,
                "comment_lines": metrics.comment_lines,
                "long_lines": metrics.long_lines,
                "todo_count": metrics.todo_count,
            },
        });
        Ok(HandlerOutput::partial(result, degraded))
    }
}

/// ONEX ruleset: source-layout conventions checked locally.
struct OnexViolation {
    rule: &'static str,
    detail: String,
}

fn onex_rule_check(request: &SourceAssessmentRequest) -> Vec<OnexViolation> {
    let mut violations = Vec::new();
    let metrics = measure(&request.content);

    if metrics.lines > 2000 {
        violations.push(OnexViolation {
            rule: "max-file-length",
            detail: format!("{} lines exceeds the 2000-line limit", metrics.lines),
        });
    }
    if metrics.long_lines > 0 {
        violations.push(OnexViolation {
            rule: "max-line-length",
            detail: format!("{} lines exceed 120 columns", metrics.long_lines),
        });
    }
    if request.source_path.contains(' ') {
        violations.push(OnexViolation {
            rule: "path-no-spaces",
            detail: format!("path {:?} contains spaces", request.source_path),
        });
    }
    if metrics.todo_count > 10 {
        violations.push(OnexViolation {
            rule: "todo-budget",
            detail: format!("{} TODO/FIXME markers", metrics.todo_count),
        });
    }
    violations
}

pub struct OnexComplianceHandler {
    deps: Arc<HandlerDeps>,
}

impl OnexComplianceHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl OperationHandler for OnexComplianceHandler {
    fn operation(&self) -> OperationType {
        OperationType::OnexCompliance
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput> {
        let request = expect_assessment(request)?;
        check_language(request)?;

        let violations = onex_rule_check(request);

        let mut degraded = Vec::new();
        let detected_language = match self.deps.analyzer.analyze(&request.content, None, ctx).await
        {
            Ok(analysis) => analysis.language,
            Err(e) if e.is_retryable() => {
                degraded.push("language_detection".to_string());
                None
            }
            Err(e) => return Err(e),
        };

        let result = json!({
            "source_path": request.source_path,
            "compliant": violations.is_empty(),
            "violations": violations
                .iter()
                .map(|v| json!({"rule": v.rule, "detail": v.detail}))
                .collect::<Vec<_>>(),
            "language": detected_language.or_else(|| request.language.clone()),
        });
        Ok(HandlerOutput::partial(result, degraded))
    }
}

pub struct ArchitecturalComplianceHandler {
    deps: Arc<HandlerDeps>,
}

impl ArchitecturalComplianceHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl OperationHandler for ArchitecturalComplianceHandler {
    fn operation(&self) -> OperationType {
        OperationType::ArchitecturalCompliance
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput> {
        let request = expect_assessment(request)?;
        check_language(request)?;

        let mut findings = Vec::new();
        for line in request.content.lines() {
            let trimmed = line.trim_start();
            // Layering rule: handlers and domain modules never reach into
            // concrete infrastructure directly
            if trimmed.contains("infrastructure::") && request.source_path.contains("domain") {
                findings.push(json!({
                    "rule": "layering",
                    "detail": format!("domain module imports infrastructure: {}", trimmed.trim()),
                }));
            }
        }

        let mut degraded = Vec::new();
        let dependency_records = {
            let query = GraphQuery {
                query: "MATCH (m:Module {path: $path})-[:DEPENDS_ON]->(d) RETURN d.path"
                    .to_string(),
                parameters: json!({"path": request.source_path}),
            };
            match self.deps.graph.graph_query(&query, ctx).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(correlation = %ctx.short_id(), error = %e, "dependency lookup degraded");
                    degraded.push("dependency_graph".to_string());
                    Vec::new()
                }
            }
        };

        let result = json!({
            "source_path": request.source_path,
            "compliant": findings.is_empty(),
            "findings": findings,
            "dependencies": dependency_records,
        });
        Ok(HandlerOutput::partial(result, degraded))
    }
}
