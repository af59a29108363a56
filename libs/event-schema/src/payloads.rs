//! Typed operation payloads and their validation rules.
//!
//! The request payload carries an `operation` discriminator; decoding turns
//! it into a tagged variant so an unknown operation is a typed error rather
//! than a runtime surprise deep inside a handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SchemaError, SchemaResult};

/// Discriminator selecting which handler processes a request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    QualityAssessment,
    OnexCompliance,
    PatternExtraction,
    ArchitecturalCompliance,
    ComprehensiveAnalysis,
    HybridScore,
    InfrastructureScan,
    ModelDiscovery,
    SchemaDiscovery,
}

impl OperationType {
    pub const ALL: [OperationType; 9] = [
        OperationType::QualityAssessment,
        OperationType::OnexCompliance,
        OperationType::PatternExtraction,
        OperationType::ArchitecturalCompliance,
        OperationType::ComprehensiveAnalysis,
        OperationType::HybridScore,
        OperationType::InfrastructureScan,
        OperationType::ModelDiscovery,
        OperationType::SchemaDiscovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::QualityAssessment => "quality_assessment",
            OperationType::OnexCompliance => "onex_compliance",
            OperationType::PatternExtraction => "pattern_extraction",
            OperationType::ArchitecturalCompliance => "architectural_compliance",
            OperationType::ComprehensiveAnalysis => "comprehensive_analysis",
            OperationType::HybridScore => "hybrid_score",
            OperationType::InfrastructureScan => "infrastructure_scan",
            OperationType::ModelDiscovery => "model_discovery",
            OperationType::SchemaDiscovery => "schema_discovery",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payload, tagged by operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationRequest {
    QualityAssessment(SourceAssessmentRequest),
    OnexCompliance(SourceAssessmentRequest),
    PatternExtraction(PatternExtractionRequest),
    ArchitecturalCompliance(SourceAssessmentRequest),
    ComprehensiveAnalysis(ComprehensiveAnalysisRequest),
    HybridScore(HybridScoreRequest),
    InfrastructureScan(ScanRequest),
    ModelDiscovery(DiscoveryRequest),
    SchemaDiscovery(DiscoveryRequest),
}

impl OperationRequest {
    pub fn operation(&self) -> OperationType {
        match self {
            OperationRequest::QualityAssessment(_) => OperationType::QualityAssessment,
            OperationRequest::OnexCompliance(_) => OperationType::OnexCompliance,
            OperationRequest::PatternExtraction(_) => OperationType::PatternExtraction,
            OperationRequest::ArchitecturalCompliance(_) => OperationType::ArchitecturalCompliance,
            OperationRequest::ComprehensiveAnalysis(_) => OperationType::ComprehensiveAnalysis,
            OperationRequest::HybridScore(_) => OperationType::HybridScore,
            OperationRequest::InfrastructureScan(_) => OperationType::InfrastructureScan,
            OperationRequest::ModelDiscovery(_) => OperationType::ModelDiscovery,
            OperationRequest::SchemaDiscovery(_) => OperationType::SchemaDiscovery,
        }
    }

    /// Per-operation payload validation. Total: every variant checks its own
    /// required fields and value ranges.
    pub fn validate(&self) -> SchemaResult<()> {
        match self {
            OperationRequest::QualityAssessment(r)
            | OperationRequest::OnexCompliance(r)
            | OperationRequest::ArchitecturalCompliance(r) => r.validate(),
            OperationRequest::PatternExtraction(r) => r.validate(),
            OperationRequest::ComprehensiveAnalysis(r) => r.validate(),
            OperationRequest::HybridScore(r) => r.validate(),
            OperationRequest::InfrastructureScan(r) => r.validate(),
            OperationRequest::ModelDiscovery(r) | OperationRequest::SchemaDiscovery(r) => {
                r.validate()
            }
        }
    }
}

/// Decode the `operation`-tagged payload of a request envelope.
pub fn decode_request(payload: &Value) -> SchemaResult<OperationRequest> {
    // Surface an unknown tag as UnknownOperation instead of a generic serde
    // message, which callers cannot classify.
    let tag = payload
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaError::Validation("missing operation discriminator".into()))?;

    if !OperationType::ALL.iter().any(|op| op.as_str() == tag) {
        return Err(SchemaError::UnknownOperation(tag.to_string()));
    }

    Ok(serde_json::from_value(payload.clone())?)
}

fn require_non_empty(field: &'static str, value: &str) -> SchemaResult<()> {
    if value.trim().is_empty() {
        Err(SchemaError::Validation(format!("{field} is empty")))
    } else {
        Ok(())
    }
}

fn require_unit_range(field: &'static str, value: f64) -> SchemaResult<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        Err(SchemaError::Validation(format!(
            "{field} must be within [0, 1], got {value}"
        )))
    } else {
        Ok(())
    }
}

/// Shared shape for source-level assessments (quality, ONEX rules,
/// architectural conformance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAssessmentRequest {
    pub source_path: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Minimum acceptable quality, when the caller enforces one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_threshold: Option<f64>,
}

impl SourceAssessmentRequest {
    fn validate(&self) -> SchemaResult<()> {
        require_non_empty("source_path", &self.source_path)?;
        require_non_empty("content", &self.content)?;
        if let Some(threshold) = self.quality_threshold {
            require_unit_range("quality_threshold", threshold)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternExtractionRequest {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
}

impl PatternExtractionRequest {
    fn validate(&self) -> SchemaResult<()> {
        require_non_empty("content", &self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensiveAnalysisRequest {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Enrich extracted entities with embedding vectors
    #[serde(default)]
    pub include_embeddings: bool,
    /// Extract pattern/relationship structure alongside entities
    #[serde(default)]
    pub include_patterns: bool,
}

impl ComprehensiveAnalysisRequest {
    fn validate(&self) -> SchemaResult<()> {
        require_non_empty("content", &self.content)
    }
}

/// Pattern candidate being scored against a task context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternCandidate {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub metadata: PatternMetadata,
    /// Present when scoring a stored pattern rather than an inline one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringContext {
    pub keywords: Vec<String>,
}

/// Caller-supplied scorer weights; merged over defaults before clamping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub keyword: f64,
    pub semantic: f64,
    pub quality: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCharacteristics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<TaskComplexity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridScoreRequest {
    pub pattern: PatternCandidate,
    pub context: ScoringContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<ScoreWeights>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_characteristics: Option<TaskCharacteristics>,
}

impl HybridScoreRequest {
    fn validate(&self) -> SchemaResult<()> {
        let m = &self.pattern.metadata;
        for (field, value) in [
            ("quality_score", m.quality_score),
            ("success_rate", m.success_rate),
            ("semantic_score", m.semantic_score),
            ("confidence_score", m.confidence_score),
        ] {
            if let Some(v) = value {
                require_unit_range(field, v)?;
            }
        }
        if let Some(w) = &self.weights {
            for (field, v) in [
                ("weights.keyword", w.keyword),
                ("weights.semantic", w.semantic),
                ("weights.quality", w.quality),
                ("weights.success_rate", w.success_rate),
            ] {
                if v < 0.0 || v.is_nan() {
                    return Err(SchemaError::Validation(format!(
                        "{field} must be non-negative, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub scope: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

impl ScanRequest {
    fn validate(&self) -> SchemaResult<()> {
        require_non_empty("scope", &self.scope)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub scope: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
}

impl DiscoveryRequest {
    fn validate(&self) -> SchemaResult<()> {
        require_non_empty("scope", &self.scope)
    }
}
