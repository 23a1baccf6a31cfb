// mock_shard_client.rs

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use meta::metadata::{NodeInfo, ShardId};
use meta::shard_client::{CloseShardRequest, CloseTableRequest, OpenShardRequest, ShardClient};
use meta::{MetaError, Result};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// One recorded shard control call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardCall {
    Open {
        node: String,
        shard_id: ShardId,
        tables: Vec<String>,
    },
    Close {
        node: String,
        shard_id: ShardId,
    },
    CloseTable {
        node: String,
        table: String,
    },
}

/// Records every call; calls to nodes listed in a fail set are rejected
#[derive(Default)]
pub struct MockShardClient {
    calls: Mutex<Vec<ShardCall>>,
    fail_open_on: Mutex<HashSet<String>>,
    fail_close_on: Mutex<HashSet<String>>,
    close_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockShardClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open_on(&self, node: &str) {
        self.fail_open_on.lock().insert(node.to_string());
    }

    pub fn fail_close_on(&self, node: &str) {
        self.fail_close_on.lock().insert(node.to_string());
    }

    /// Block close calls until [`MockShardClient::release_close`]
    pub fn hold_close(&self) {
        *self.close_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_close(&self) {
        if let Some(gate) = self.close_gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self) -> Vec<ShardCall> {
        self.calls.lock().clone()
    }

    pub fn opened_on(&self, node: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, ShardCall::Open { node: n, .. } if n == node))
            .count()
    }

    pub fn closed_on(&self, node: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, ShardCall::Close { node: n, .. } if n == node))
            .count()
    }

    fn check(set: &Mutex<HashSet<String>>, op: &str, node: &NodeInfo) -> Result<()> {
        if set.lock().contains(&node.name) {
            return Err(MetaError::StepExecution(format!(
                "{} on {} rejected",
                op, node.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ShardClient for MockShardClient {
    async fn open_shard(&self, node: &NodeInfo, req: &OpenShardRequest) -> Result<()> {
        self.calls.lock().push(ShardCall::Open {
            node: node.name.clone(),
            shard_id: req.shard_id,
            tables: req.tables.clone(),
        });
        Self::check(&self.fail_open_on, "open", node)
    }

    async fn close_shard(&self, node: &NodeInfo, req: &CloseShardRequest) -> Result<()> {
        self.calls.lock().push(ShardCall::Close {
            node: node.name.clone(),
            shard_id: req.shard_id,
        });
        let gate = self.close_gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        Self::check(&self.fail_close_on, "close", node)
    }

    async fn close_table(&self, node: &NodeInfo, req: &CloseTableRequest) -> Result<()> {
        self.calls.lock().push(ShardCall::CloseTable {
            node: node.name.clone(),
            table: req.table.clone(),
        });
        Ok(())
    }
}
