//! Meta - control plane of a distributed analytical database
//!
//! Tracks cluster topology (nodes, shards, tables) and runs topology changes
//! as durable, resumable procedures
//!
//! # Features
//! - Versioned topology store with compare-and-set writes
//! - Shard leader transfer, shard split and table drop procedures
//! - One active procedure per shard, recovery after restart
//! - Table routing and shard table queries
//! - Transparent forwarding of mutating requests to the leader replica
//!
//! # Usage Example
//! ```ignore
//! use meta::{MetaConfig, MetaServer};
//!
//! let server = Arc::new(MetaServer::new(MetaConfig::default()).await?);
//! server.start().await?;
//! let app = meta::api::HttpApi::new(server.clone()).router();
//! ```

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod forward;
pub mod metadata;
pub mod procedure;
pub mod shard_client;
pub mod storage;

pub use config::MetaConfig;
pub use error::{MetaError, Result};

use std::sync::Arc;

use tracing::info;

use cluster::ClusterManager;
use config::StorageBackend;
use forward::{ForwardClient, HttpRelay, LeaderElection, RelayTransport, StaticElection};
use procedure::{ProcedureContext, ProcedureFactory, ProcedureManager, ProcedureStorage};
use shard_client::{HttpShardClient, ShardClient};
use storage::{FileStore, MemoryStore, TopologyStore};

/// Meta server
///
/// Replicas of one deployment share a single topology store; exactly one of
/// them leads and executes mutations.
pub struct MetaServer {
    config: MetaConfig,
    store: Arc<dyn TopologyStore>,
    clusters: Arc<ClusterManager>,
    factory: ProcedureFactory,
    procedures: Arc<ProcedureManager>,
    forward: ForwardClient,
}

impl MetaServer {
    /// Create a server with the store, shard client and leadership the
    /// configuration describes
    pub async fn new(config: MetaConfig) -> Result<Self> {
        let store: Arc<dyn TopologyStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::File => Arc::new(FileStore::open(&config.storage.data_dir).await?),
        };
        let shard_client = Arc::new(HttpShardClient::new(config.procedure.rpc_timeout())?);
        let election = Arc::new(StaticElection::new(
            config.election.self_addr.clone(),
            config.election.leader_addr.clone(),
        ));
        let relay = Arc::new(HttpRelay::new(config.election.forward_timeout())?);

        Ok(Self::with_components(
            config,
            store,
            shard_client,
            election,
            relay,
        ))
    }

    /// Create a server from explicit components
    pub fn with_components(
        config: MetaConfig,
        store: Arc<dyn TopologyStore>,
        shard_client: Arc<dyn ShardClient>,
        election: Arc<dyn LeaderElection>,
        relay: Arc<dyn RelayTransport>,
    ) -> Self {
        let clusters = Arc::new(ClusterManager::new(store.clone()));
        let procedure_storage = Arc::new(ProcedureStorage::new(store.clone()));
        let factory = ProcedureFactory::new(clusters.clone(), procedure_storage.clone());
        let procedures = Arc::new(ProcedureManager::new(
            config.procedure.clone(),
            procedure_storage,
            ProcedureContext {
                clusters: clusters.clone(),
                shard_client,
            },
        ));
        let forward = ForwardClient::new(election, relay);

        info!(
            "Meta server initialized: cluster={}, backend={:?}",
            config.cluster.name, config.storage.backend
        );

        Self {
            config,
            store,
            clusters,
            factory,
            procedures,
            forward,
        }
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TopologyStore> {
        &self.store
    }

    pub fn clusters(&self) -> &Arc<ClusterManager> {
        &self.clusters
    }

    pub fn factory(&self) -> &ProcedureFactory {
        &self.factory
    }

    pub fn procedures(&self) -> &Arc<ProcedureManager> {
        &self.procedures
    }

    pub fn forward(&self) -> &ForwardClient {
        &self.forward
    }

    /// Bootstrap and recover if this replica leads
    pub async fn start(&self) -> Result<()> {
        if !self.forward.election().is_leader().await {
            info!("Starting as follower, mutations go to the leader");
            return Ok(());
        }

        self.bootstrap().await?;
        let resumed = self.procedures.recover().await?;
        info!("Recovery resumed {} procedures", resumed);
        Ok(())
    }

    /// Create the configured cluster, nodes and initial shards
    ///
    /// Nodes are (re-)registered on every start; shards are created only
    /// while the cluster has none.
    pub async fn bootstrap(&self) -> Result<()> {
        let bootstrap = &self.config.cluster;
        let cluster = self.clusters.get_or_create_cluster(&bootstrap.name).await?;

        for node in &bootstrap.nodes {
            cluster.register_node(&node.name, &node.addr).await?;
        }

        if cluster.shards().is_empty() {
            for shard in &bootstrap.shards {
                cluster
                    .create_shard(&shard.leader, shard.replicas.clone())
                    .await?;
            }
        }

        info!(
            "Cluster {} ready: {} nodes, {} shards",
            cluster.name(),
            cluster.nodes().len(),
            cluster.shards().len()
        );
        Ok(())
    }

    /// Start view refresh and procedure gc
    pub fn start_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.clusters
                .clone()
                .start_refresh_task(self.config.cluster.view_refresh_interval()),
            self.procedures.clone().start_gc_task(),
        ]
    }
}
