//! Client for the cluster orchestration API.
//!
//! The console never reimplements orchestration; it consumes two endpoints
//! of the platform's HTTP API: a bounded one-shot read of a pod's most
//! recent log lines, and a follow-mode log read that streams new bytes as
//! the container produces them. Both are exposed behind [`OrchestratorApi`]
//! so the stream layer can be driven by a scripted implementation in tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestration API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("orchestration API returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Raw byte chunks of a follow-mode log read. Chunk boundaries are
/// arbitrary: a chunk may end mid-line or mid-codepoint.
pub type ChunkStream = BoxStream<'static, Result<Bytes, OrchestratorError>>;

/// An open follow-mode log read. Dropping the stream closes the underlying
/// HTTP connection.
pub struct LiveTail {
    pub chunks: ChunkStream,
}

#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    /// Fetch the most recent `limit` lines of a container's log. Best
    /// effort: callers treat failure as non-fatal.
    async fn fetch_recent_lines(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        limit: u32,
    ) -> Result<Vec<String>, OrchestratorError>;

    /// Open a follow-mode read of a container's log. No historical
    /// backfill: the stream starts at the current end of the log.
    async fn open_live_tail(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> Result<LiveTail, OrchestratorError>;
}

/// Production implementation speaking the orchestrator's pod-log HTTP API.
pub struct HttpOrchestrator {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpOrchestrator {
    pub fn new(config: &Config) -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.orchestrator_insecure)
            .build()?;
        Ok(Self {
            client,
            base_url: config.orchestrator_url.trim_end_matches('/').to_string(),
            token: config.orchestrator_token.clone(),
        })
    }

    fn log_request(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}/log",
            self.base_url, namespace, pod
        );
        let mut request = self.client.get(url);
        if let Some(container) = container {
            request = request.query(&[("container", container)]);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
    }
}

/// Surface non-2xx responses with the orchestrator's own error text, which
/// names the missing pod/namespace.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, OrchestratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| status.to_string())
        .trim()
        .to_string();
    Err(OrchestratorError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl OrchestratorApi for HttpOrchestrator {
    async fn fetch_recent_lines(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        limit: u32,
    ) -> Result<Vec<String>, OrchestratorError> {
        let response = self
            .log_request(namespace, pod, container)
            .query(&[("tailLines", limit.to_string())])
            .send()
            .await?;
        let body = check_status(response).await?.text().await?;
        Ok(body.lines().map(str::to_string).collect())
    }

    async fn open_live_tail(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> Result<LiveTail, OrchestratorError> {
        let response = self
            .log_request(namespace, pod, container)
            .query(&[("follow", "true")])
            .send()
            .await?;
        let response = check_status(response).await?;
        let chunks = response.bytes_stream().map_err(OrchestratorError::from);
        Ok(LiveTail {
            chunks: Box::pin(chunks),
        })
    }
}
