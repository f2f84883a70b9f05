//! Outbound worker client
//!
//! The manager talks to workers through [`WorkerClient`]; the HTTP
//! implementation posts JSON instructions to each worker's address.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{ManagerError, Result};
use crate::protocol::{AbortSplit, AdoptRange, AssignRange, HeartbeatProbe, SplitInstruction, WorkerId};

/// Configuration for the worker client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Instructions the manager sends to a worker
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Ask for a heartbeat ack
    async fn probe(&self, worker: &WorkerId, probe: &HeartbeatProbe) -> Result<()>;

    /// Tell the owner to partition its shard
    async fn split(&self, worker: &WorkerId, instruction: &SplitInstruction) -> Result<()>;

    /// Tell a split target to take over a sub-range
    async fn assign(&self, worker: &WorkerId, assignment: &AssignRange) -> Result<()>;

    /// Tell a participant to drop an uncommitted partition
    async fn abort(&self, worker: &WorkerId, abort: &AbortSplit) -> Result<()>;

    /// Tell a worker to serve a range inherited from an evicted peer
    async fn adopt(&self, worker: &WorkerId, adopt: &AdoptRange) -> Result<()>;
}

/// JSON-over-HTTP worker client
pub struct HttpWorkerClient {
    client: Client,
}

impl HttpWorkerClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ManagerError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    async fn post<T: Serialize + Sync>(&self, worker: &WorkerId, path: &str, body: &T) -> Result<()> {
        let url = format!("http://{}{}", worker.address(), path);
        let failed = |reason: String| ManagerError::ConnectionFailed {
            endpoint: url.clone(),
            reason,
        };

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("worker answered {}", status)));
        }

        debug!("POST {} -> {}", url, status);
        Ok(())
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn probe(&self, worker: &WorkerId, probe: &HeartbeatProbe) -> Result<()> {
        self.post(worker, "/heartbeat", probe).await
    }

    async fn split(&self, worker: &WorkerId, instruction: &SplitInstruction) -> Result<()> {
        self.post(worker, "/split", instruction).await
    }

    async fn assign(&self, worker: &WorkerId, assignment: &AssignRange) -> Result<()> {
        self.post(worker, "/assign", assignment).await
    }

    async fn abort(&self, worker: &WorkerId, abort: &AbortSplit) -> Result<()> {
        self.post(worker, "/abort", abort).await
    }

    async fn adopt(&self, worker: &WorkerId, adopt: &AdoptRange) -> Result<()> {
        self.post(worker, "/adopt", adopt).await
    }
}
