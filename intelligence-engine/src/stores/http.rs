//! HTTP-backed capability implementations.
//!
//! Thin typed clients over the store services. Each call carries the
//! configured timeout and the correlation header; transport and decode
//! failures map onto [`StoreError`].

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::StoresConfig;
use crate::correlation::{RequestContext, HTTP_CORRELATION_ID_HEADER};
use crate::stores::{
    GraphQuery, GraphStore, PatternFilters, PatternStore, SchemaSnapshot, SchemaStore,
    StoreError, StoreResult, StoredPattern, VectorHit, VectorStore,
};

#[derive(Clone)]
struct StoreHttp {
    http: reqwest::Client,
    timeout: Duration,
}

impl StoreHttp {
    fn new(timeout: Duration) -> StoreResult<Self> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, timeout })
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        ctx: &RequestContext,
    ) -> StoreResult<R> {
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .header(HTTP_CORRELATION_ID_HEADER, ctx.correlation_id.to_string())
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StoreError::Timeout
                } else {
                    StoreError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Unavailable(format!("HTTP {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

pub struct HttpPatternStore {
    inner: StoreHttp,
    url: String,
}

impl HttpPatternStore {
    pub fn new(config: &StoresConfig) -> StoreResult<Self> {
        Ok(Self {
            inner: StoreHttp::new(Duration::from_secs(config.timeout_secs))?,
            url: format!("{}/patterns/search", config.pattern_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl PatternStore for HttpPatternStore {
    async fn pattern_lookup(
        &self,
        filters: &PatternFilters,
        ctx: &RequestContext,
    ) -> StoreResult<Vec<StoredPattern>> {
        self.inner.post_json(&self.url, filters, ctx).await
    }
}

pub struct HttpVectorStore {
    inner: StoreHttp,
    url: String,
}

impl HttpVectorStore {
    pub fn new(config: &StoresConfig) -> StoreResult<Self> {
        Ok(Self {
            inner: StoreHttp::new(Duration::from_secs(config.timeout_secs))?,
            url: format!("{}/vectors/search", config.vector_url.trim_end_matches('/')),
        })
    }
}

#[derive(Serialize)]
struct VectorSearchBody<'a> {
    embedding: &'a [f32],
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a str>,
    limit: usize,
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn vector_search<'a>(
        &self,
        embedding: &[f32],
        filter: Option<&'a str>,
        limit: usize,
        ctx: &RequestContext,
    ) -> StoreResult<Vec<VectorHit>> {
        let body = VectorSearchBody {
            embedding,
            filter,
            limit,
        };
        self.inner.post_json(&self.url, &body, ctx).await
    }
}

pub struct HttpGraphStore {
    inner: StoreHttp,
    url: String,
}

impl HttpGraphStore {
    pub fn new(config: &StoresConfig) -> StoreResult<Self> {
        Ok(Self {
            inner: StoreHttp::new(Duration::from_secs(config.timeout_secs))?,
            url: format!("{}/graph/query", config.graph_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl GraphStore for HttpGraphStore {
    async fn graph_query(
        &self,
        query: &GraphQuery,
        ctx: &RequestContext,
    ) -> StoreResult<Vec<Value>> {
        self.inner.post_json(&self.url, query, ctx).await
    }
}

pub struct HttpSchemaStore {
    inner: StoreHttp,
    url: String,
}

impl HttpSchemaStore {
    pub fn new(config: &StoresConfig) -> StoreResult<Self> {
        Ok(Self {
            inner: StoreHttp::new(Duration::from_secs(config.timeout_secs))?,
            url: format!("{}/schema/introspect", config.schema_url.trim_end_matches('/')),
        })
    }
}

#[derive(Serialize)]
struct IntrospectBody<'a> {
    scope: &'a str,
}

#[async_trait]
impl SchemaStore for HttpSchemaStore {
    async fn schema_introspect(
        &self,
        scope: &str,
        ctx: &RequestContext,
    ) -> StoreResult<SchemaSnapshot> {
        self.inner
            .post_json(&self.url, &IntrospectBody { scope }, ctx)
            .await
    }
}
