//! Cluster management
//!
//! The topology authority: owns one cached [`Cluster`] view per cluster and
//! is the only component that mutates topology records.

mod route;
mod topology;

pub use route::{RouteEntry, RouteTablesResult};
pub use topology::Cluster;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::{MetaError, Result};
use crate::metadata::{validate_name, ClusterInfo, ShardId};
use crate::storage::{encode, keys, StoreError, TopologyStore};

/// Cluster manager
pub struct ClusterManager {
    store: Arc<dyn TopologyStore>,
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
}

impl ClusterManager {
    pub fn new(store: Arc<dyn TopologyStore>) -> Self {
        Self {
            store,
            clusters: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TopologyStore> {
        &self.store
    }

    /// Get a cluster, loading it from the store on first access
    pub async fn get_cluster(&self, name: &str) -> Result<Arc<Cluster>> {
        let cached = self.clusters.read().get(name).cloned();
        if let Some(cluster) = cached {
            return Ok(cluster);
        }

        let cluster = Cluster::load(self.store.clone(), name)
            .await?
            .ok_or_else(|| MetaError::ClusterNotFound(name.to_string()))?;

        // Another caller may have loaded it meanwhile; keep the first one
        let mut clusters = self.clusters.write();
        Ok(clusters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(cluster))
            .clone())
    }

    /// Create an empty cluster
    pub async fn create_cluster(&self, name: &str) -> Result<Arc<Cluster>> {
        validate_name("cluster", name)?;

        let info = ClusterInfo::new(name.to_string());
        match self
            .store
            .compare_and_set(&keys::cluster(name), None, encode(&info)?)
            .await
        {
            Ok(_) => info!("Created cluster {}", name),
            Err(StoreError::Conflict { .. }) => {
                return Err(MetaError::AlreadyExists(format!("cluster {}", name)))
            }
            Err(e) => return Err(e.into()),
        }

        self.get_cluster(name).await
    }

    pub async fn get_or_create_cluster(&self, name: &str) -> Result<Arc<Cluster>> {
        match self.get_cluster(name).await {
            Err(MetaError::ClusterNotFound(_)) => match self.create_cluster(name).await {
                Err(MetaError::AlreadyExists(_)) => self.get_cluster(name).await,
                other => other,
            },
            other => other,
        }
    }

    /// Names of clusters loaded so far
    pub fn loaded_clusters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn alloc_shard_id(&self, cluster: &str) -> Result<ShardId> {
        self.get_cluster(cluster).await?.alloc_shard_id().await
    }

    pub async fn drop_table(&self, cluster: &str, schema: &str, table: &str) -> Result<bool> {
        self.get_cluster(cluster).await?.drop_table(schema, table).await
    }

    pub async fn route_tables(
        &self,
        cluster: &str,
        schema: &str,
        tables: &[String],
    ) -> Result<RouteTablesResult> {
        Ok(self.get_cluster(cluster).await?.route_tables(schema, tables))
    }

    pub async fn get_shard_tables(
        &self,
        cluster: &str,
        shard_ids: &[ShardId],
        node_name: &str,
    ) -> Result<BTreeMap<ShardId, Vec<String>>> {
        Ok(self
            .get_cluster(cluster)
            .await?
            .get_shard_tables(shard_ids, node_name))
    }

    /// Reload every loaded cluster from the store
    pub async fn refresh_all(&self) {
        let clusters: Vec<Arc<Cluster>> = self.clusters.read().values().cloned().collect();
        for cluster in clusters {
            if let Err(e) = cluster.refresh().await {
                warn!("Failed to refresh cluster {}: {}", cluster.name(), e);
            }
        }
    }

    /// Start the periodic view refresh task
    pub fn start_refresh_task(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                debug!("Refreshing cluster views");
                self.refresh_all().await;
            }
        })
    }
}
