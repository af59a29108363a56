//! External service clients.
//!
//! Handlers depend on the narrow [`Analyzer`] and [`Embedder`] traits so
//! tests can substitute fakes; the concrete clients wrap HTTP with the
//! resilience stack (cache, breaker, timeout, bounded retry).

pub mod analyzer;
pub mod embedder;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::correlation::RequestContext;
use crate::error::Result;

pub use analyzer::{AnalyzerClient, AnalysisResult, Entity};
pub use embedder::{EmbedError, EmbedderClient};

/// Semantic analysis capability (external analyzer service).
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Semantic analysis of content, optionally against a task context.
    async fn analyze(
        &self,
        content: &str,
        context: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<AnalysisResult>;

    /// Structured entity extraction from a document.
    async fn extract_document(&self, content: &str, ctx: &RequestContext)
        -> Result<AnalysisResult>;
}

/// Vector generation capability (external embedder service).
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, same order. Callers may degrade on error.
    async fn embed(
        &self,
        texts: &[String],
        ctx: &RequestContext,
    ) -> std::result::Result<Vec<Vec<f32>>, EmbedError>;
}

/// Typed analyzer error body; mapped onto the engine taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceErrorBody {
    pub error: String,
    #[serde(default)]
    pub message: String,
}
