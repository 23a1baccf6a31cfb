// test_server.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meta::config::{BootstrapNode, BootstrapShard};
use meta::forward::{HttpRelay, StaticElection};
use meta::storage::{keys, MemoryStore, Revision, StoreError, StoreResult, TopologyStore, Versioned};
use meta::{MetaConfig, MetaServer};

use super::mock_shard_client::MockShardClient;

pub const CLUSTER: &str = "c";
pub const SCHEMA: &str = "s";

/// Cluster `c` with nodes a, b, c and one shard led by a, replicated on b
pub fn test_config() -> MetaConfig {
    let mut config = MetaConfig::default();
    config.cluster.name = CLUSTER.to_string();
    config.cluster.nodes = ["a", "b", "c"]
        .iter()
        .enumerate()
        .map(|(i, name)| BootstrapNode {
            name: name.to_string(),
            addr: format!("127.0.0.1:{}", 7001 + i),
        })
        .collect();
    config.cluster.shards = vec![BootstrapShard {
        leader: "a".to_string(),
        replicas: vec!["b".to_string()],
    }];
    config.procedure.max_step_retries = 1;
    config.procedure.retry_interval_ms = 10;
    config.procedure.step_timeout_ms = 5000;
    config
}

/// A leading server over `store`
pub fn leader_server(
    config: MetaConfig,
    store: Arc<dyn TopologyStore>,
    shard_client: Arc<MockShardClient>,
) -> Arc<MetaServer> {
    let election = Arc::new(StaticElection::new(config.election.self_addr.clone(), None));
    build(config, store, shard_client, election)
}

pub fn build(
    config: MetaConfig,
    store: Arc<dyn TopologyStore>,
    shard_client: Arc<MockShardClient>,
    election: Arc<StaticElection>,
) -> Arc<MetaServer> {
    let relay = Arc::new(
        HttpRelay::new(config.election.forward_timeout()).expect("build relay client"),
    );
    Arc::new(MetaServer::with_components(
        config,
        store,
        shard_client,
        election,
        relay,
    ))
}

/// Started leader with the default test topology and tables t1..t3 on shard 1
pub async fn seeded_leader(
    store: Arc<dyn TopologyStore>,
    shard_client: Arc<MockShardClient>,
) -> Arc<MetaServer> {
    let server = leader_server(test_config(), store, shard_client);
    server.start().await.expect("start");

    let cluster = server.clusters().get_cluster(CLUSTER).await.unwrap();
    for table in ["t1", "t2", "t3"] {
        cluster.create_table(SCHEMA, table, Some(1)).await.unwrap();
    }
    server
}

pub fn memory_store() -> Arc<dyn TopologyStore> {
    Arc::new(MemoryStore::new())
}

/// Store whose procedure log writes start failing after a budget is used up
pub struct FlakyStore {
    inner: Arc<dyn TopologyStore>,
    procedure_writes_left: AtomicUsize,
    /// Writes still to reject once the budget is spent
    failures_left: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn TopologyStore>, procedure_writes: usize) -> Self {
        Self::with_failures(inner, procedure_writes, usize::MAX)
    }

    /// Reject `failures` procedure writes after the budget, then accept again
    pub fn with_failures(
        inner: Arc<dyn TopologyStore>,
        procedure_writes: usize,
        failures: usize,
    ) -> Self {
        Self {
            inner,
            procedure_writes_left: AtomicUsize::new(procedure_writes),
            failures_left: AtomicUsize::new(failures),
        }
    }

    fn spend(&self, key: &str) -> StoreResult<()> {
        if !key.starts_with(keys::PROCEDURE_PREFIX) {
            return Ok(());
        }
        let spent = self
            .procedure_writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if spent.is_ok() {
            return Ok(());
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match failed {
            Ok(_) => Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            ))),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl TopologyStore for FlakyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        self.inner.get(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Versioned)>> {
        self.inner.scan_prefix(prefix).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Revision>,
        value: serde_json::Value,
    ) -> StoreResult<Revision> {
        self.spend(key)?;
        self.inner.compare_and_set(key, expected, value).await
    }

    async fn compare_and_delete(&self, key: &str, expected: Revision) -> StoreResult<()> {
        self.spend(key)?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn increment(&self, key: &str) -> StoreResult<u64> {
        self.inner.increment(key).await
    }
}

/// Poll `condition` until it holds or `deadline` passes
pub async fn eventually<F>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
