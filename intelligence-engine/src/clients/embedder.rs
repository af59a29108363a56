//! Embedder client: rate-limited, batched vector generation.
//!
//! Callers submit through a channel to a batcher task that coalesces
//! requests arriving within a short linger window, up to a configured batch
//! size. Outgoing requests are capped by a semaphore and carry their own
//! timeout plus a small internal retry, independent of the pipeline retry
//! subsystem. An embed failure is a typed error callers may degrade on.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use resilience::{with_retry, with_timeout, BackoffPolicy};

use crate::clients::Embedder;
use crate::config::EmbedderConfig;
use crate::correlation::{RequestContext, HTTP_CORRELATION_ID_HEADER};

#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedError {
    #[error("embedder request timed out")]
    Timeout,
    #[error("embedder service error: {0}")]
    Service(String),
    #[error("embedder returned {got} vectors for {want} inputs")]
    LengthMismatch { want: usize, got: usize },
    #[error("embedder client is shut down")]
    Closed,
}

struct EmbedJob {
    texts: Vec<String>,
    correlation_id: uuid::Uuid,
    reply: oneshot::Sender<Result<Vec<Vec<f32>>, EmbedError>>,
}

#[derive(Serialize)]
struct EmbedRequestBody<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponseBody {
    vectors: Vec<Vec<f32>>,
}

struct EmbedderShared {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    last_attempt_ms: AtomicI64,
    last_success_ms: AtomicI64,
}

pub struct EmbedderClient {
    tx: mpsc::Sender<EmbedJob>,
    shared: Arc<EmbedderShared>,
}

impl EmbedderClient {
    pub fn new(config: &EmbedderConfig) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| {
                crate::EngineError::Internal(format!("failed to build HTTP client: {e}"))
            })?;

        let shared = Arc::new(EmbedderShared {
            http,
            url: format!("{}/embed", config.url.trim_end_matches('/')),
            timeout: Duration::from_secs(config.timeout_secs),
            last_attempt_ms: AtomicI64::new(0),
            last_success_ms: AtomicI64::new(0),
        });

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_batcher(
            rx,
            shared.clone(),
            config.max_batch_size.max(1),
            Duration::from_millis(config.batch_linger_ms),
            Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        ));

        Ok(Self { tx, shared })
    }

    /// Whether the embedder looks responsive for readiness purposes.
    /// True when it has never been exercised, or when the most recent
    /// success is within the window despite later attempts.
    pub fn is_responsive(&self, window: Duration) -> bool {
        let attempt = self.shared.last_attempt_ms.load(Ordering::Relaxed);
        if attempt == 0 {
            return true;
        }
        let success = self.shared.last_success_ms.load(Ordering::Relaxed);
        let age_ms = Utc::now().timestamp_millis() - success;
        success > 0 && age_ms <= window.as_millis() as i64
    }
}

#[async_trait]
impl Embedder for EmbedderClient {
    async fn embed(
        &self,
        texts: &[String],
        ctx: &RequestContext,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = EmbedJob {
            texts: texts.to_vec(),
            correlation_id: ctx.correlation_id,
            reply: reply_tx,
        };

        self.tx.send(job).await.map_err(|_| EmbedError::Closed)?;
        reply_rx.await.map_err(|_| EmbedError::Closed)?
    }
}

/// Collect jobs arriving within the linger window into one upstream call.
/// Cross-caller batch composition follows admission order; no ordering is
/// promised between unrelated callers, only within each caller's inputs.
async fn run_batcher(
    mut rx: mpsc::Receiver<EmbedJob>,
    shared: Arc<EmbedderShared>,
    max_batch_size: usize,
    linger: Duration,
    semaphore: Arc<Semaphore>,
) {
    while let Some(first) = rx.recv().await {
        let mut jobs = vec![first];
        let mut total: usize = jobs[0].texts.len();
        let deadline = Instant::now() + linger;

        while total < max_batch_size {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(job)) => {
                    total += job.texts.len();
                    jobs.push(job);
                }
                Ok(None) | Err(_) => break,
            }
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            // Semaphore closes only at process teardown
            Err(_) => return,
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            dispatch_batch(shared, jobs).await;
            drop(permit);
        });
    }
    debug!("embedder batcher stopped");
}

async fn dispatch_batch(shared: Arc<EmbedderShared>, mut jobs: Vec<EmbedJob>) {
    let texts: Vec<String> = jobs.iter().flat_map(|j| j.texts.iter().cloned()).collect();
    let correlation_id = jobs[0].correlation_id;

    shared
        .last_attempt_ms
        .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

    let policy = BackoffPolicy {
        base: Duration::from_millis(100),
        cap: Duration::from_secs(1),
        jitter: true,
    };

    let result = with_retry(&policy, 2, || {
        request_vectors(&shared, &texts, correlation_id)
    })
    .await
    .map_err(|e| match e {
        resilience::RetryError::MaxRetriesExceeded { last, .. } => last,
    });

    match result {
        Ok(vectors) => {
            shared
                .last_success_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

            let mut offset = 0;
            for job in jobs.drain(..) {
                let take = job.texts.len();
                let slice = vectors[offset..offset + take].to_vec();
                offset += take;
                let _ = job.reply.send(Ok(slice));
            }
        }
        Err(error) => {
            warn!(batch = texts.len(), %error, "embed batch failed");
            for job in jobs.drain(..) {
                let _ = job.reply.send(Err(error.clone()));
            }
        }
    }
}

async fn request_vectors(
    shared: &EmbedderShared,
    texts: &[String],
    correlation_id: uuid::Uuid,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let send = shared
        .http
        .post(&shared.url)
        .header(HTTP_CORRELATION_ID_HEADER, correlation_id.to_string())
        .json(&EmbedRequestBody { texts })
        .send();

    let response = with_timeout(shared.timeout, send)
        .await
        .map_err(|_| EmbedError::Timeout)?
        .map_err(|e| {
            if e.is_timeout() {
                EmbedError::Timeout
            } else {
                EmbedError::Service(e.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(EmbedError::Service(format!("HTTP {status}")));
    }

    let body: EmbedResponseBody = response
        .json()
        .await
        .map_err(|e| EmbedError::Service(format!("malformed response: {e}")))?;

    if body.vectors.len() != texts.len() {
        return Err(EmbedError::LengthMismatch {
            want: texts.len(),
            got: body.vectors.len(),
        });
    }
    Ok(body.vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EmbedderConfig {
        EmbedderConfig {
            url: "http://localhost:1".to_string(),
            max_concurrent: 2,
            timeout_secs: 1,
            max_batch_size: 8,
            batch_linger_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_empty_input_short_circuits() {
        let client = EmbedderClient::new(&test_config()).unwrap();
        let envelope = event_schema::Envelope::new(
            event_schema::event_types::ANALYSIS_REQUESTED,
            event_schema::EventSource::new("s", "i"),
            serde_json::json!({}),
        );
        let ctx = RequestContext::for_envelope(&envelope, Duration::from_secs(1));

        let vectors = client.embed(&[], &ctx).await.unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn test_unexercised_client_is_responsive() {
        let client = EmbedderClient::new(&test_config()).unwrap();
        assert!(client.is_responsive(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_unreachable_service_surfaces_typed_error() {
        let client = EmbedderClient::new(&test_config()).unwrap();
        let envelope = event_schema::Envelope::new(
            event_schema::event_types::ANALYSIS_REQUESTED,
            event_schema::EventSource::new("s", "i"),
            serde_json::json!({}),
        );
        let ctx = RequestContext::for_envelope(&envelope, Duration::from_secs(5));

        let result = client.embed(&["hello".to_string()], &ctx).await;
        assert!(matches!(
            result,
            Err(EmbedError::Service(_)) | Err(EmbedError::Timeout)
        ));
        assert!(!client.is_responsive(Duration::from_secs(60)));
    }
}
