//! Opaque external capabilities: pattern, vector, graph, and schema stores.
//!
//! The engine addresses these only through narrow typed interfaces; any
//! concrete backend may sit behind them. Each capability call carries its
//! own timeout and returns a typed error that handlers degrade on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod http;

pub use http::{HttpGraphStore, HttpPatternStore, HttpSchemaStore, HttpVectorStore};

use crate::correlation::RequestContext;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store request timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store returned malformed data: {0}")]
    Malformed(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for crate::EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout => {
                crate::EngineError::Timeout(std::time::Duration::from_secs(0))
            }
            StoreError::Unavailable(msg) => crate::EngineError::external("store", msg),
            StoreError::Malformed(msg) => crate::EngineError::Parsing(msg),
        }
    }
}

/// Filters for a success-pattern lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// A stored success pattern. Hierarchy is expressed as `(id, parent_id)`
/// tuples; traversals follow IDs, never object pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPattern {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQuery {
    pub query: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    #[serde(default)]
    pub tables: Vec<TableInfo>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn pattern_lookup(
        &self,
        filters: &PatternFilters,
        ctx: &RequestContext,
    ) -> StoreResult<Vec<StoredPattern>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn vector_search<'a>(
        &self,
        embedding: &[f32],
        filter: Option<&'a str>,
        limit: usize,
        ctx: &RequestContext,
    ) -> StoreResult<Vec<VectorHit>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn graph_query(
        &self,
        query: &GraphQuery,
        ctx: &RequestContext,
    ) -> StoreResult<Vec<Value>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn schema_introspect(
        &self,
        scope: &str,
        ctx: &RequestContext,
    ) -> StoreResult<SchemaSnapshot>;
}
