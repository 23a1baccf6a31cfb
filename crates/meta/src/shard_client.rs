//! Shard control client
//!
//! Remote calls issued by procedures to storage nodes: open a shard (and
//! load its tables), close a shard, close a single table.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::{MetaError, Result};
use crate::metadata::{NodeInfo, ShardId};

/// Open request sent to the node that will serve the shard
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenShardRequest {
    pub shard_id: ShardId,
    pub shard_version: u64,
    /// Tables the node should load for the shard
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseShardRequest {
    pub shard_id: ShardId,
    pub shard_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTableRequest {
    pub shard_id: ShardId,
    pub schema: String,
    pub table: String,
}

/// Shard control RPC
///
/// Implementations must make each call safe to repeat: procedures re-issue a
/// call when a step is retried or resumed after a crash.
#[async_trait]
pub trait ShardClient: Send + Sync {
    async fn open_shard(&self, node: &NodeInfo, req: &OpenShardRequest) -> Result<()>;

    async fn close_shard(&self, node: &NodeInfo, req: &CloseShardRequest) -> Result<()>;

    async fn close_table(&self, node: &NodeInfo, req: &CloseTableRequest) -> Result<()>;
}

/// HTTP/JSON shard client
pub struct HttpShardClient {
    http_client: reqwest::Client,
}

impl HttpShardClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| MetaError::Internal(format!("build http client: {}", e)))?;
        Ok(Self { http_client })
    }

    async fn post<T: Serialize + Sync>(&self, node: &NodeInfo, path: &str, body: &T) -> Result<()> {
        let url = format!("http://{}/api/v1/shard/{}", node.addr, path);

        let resp = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| MetaError::StepExecution(format!("{} on {}: {}", path, node, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(MetaError::StepExecution(format!(
                "{} on {} returned {}: {}",
                path, node, status, text
            )));
        }

        debug!("{} on {} ok", path, node);
        Ok(())
    }
}

#[async_trait]
impl ShardClient for HttpShardClient {
    async fn open_shard(&self, node: &NodeInfo, req: &OpenShardRequest) -> Result<()> {
        self.post(node, "open", req).await
    }

    async fn close_shard(&self, node: &NodeInfo, req: &CloseShardRequest) -> Result<()> {
        self.post(node, "close", req).await
    }

    async fn close_table(&self, node: &NodeInfo, req: &CloseTableRequest) -> Result<()> {
        self.post(node, "closeTable", req).await
    }
}
