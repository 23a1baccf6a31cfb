//! Procedure construction
//!
//! Requests are validated against the current topology before a procedure ID
//! is allocated, so a rejected request leaves no trace in the procedure log.

use std::collections::HashSet;
use std::sync::Arc;

use super::{
    DropTableProcedure, Procedure, ProcedureKind, ProcedureRecord, ProcedureStorage,
    SplitProcedure, TransferLeaderProcedure,
};
use crate::cluster::ClusterManager;
use crate::error::{MetaError, Result};
use crate::metadata::{validate_name, NodeName, ShardId};

#[derive(Debug, Clone)]
pub struct TransferLeaderRequest {
    pub cluster_name: String,
    pub shard_id: ShardId,
    pub old_leader: NodeName,
    pub new_leader: NodeName,
}

#[derive(Debug, Clone)]
pub struct SplitRequest {
    pub cluster_name: String,
    pub schema_name: String,
    /// Source shard
    pub shard_id: ShardId,
    pub tables: Vec<String>,
    /// Node that will lead the new shard
    pub target_node: NodeName,
}

#[derive(Debug, Clone)]
pub struct DropTableRequest {
    pub cluster_name: String,
    pub schema_name: String,
    pub table: String,
}

/// Procedure factory
pub struct ProcedureFactory {
    clusters: Arc<ClusterManager>,
    storage: Arc<ProcedureStorage>,
}

impl ProcedureFactory {
    pub fn new(clusters: Arc<ClusterManager>, storage: Arc<ProcedureStorage>) -> Self {
        Self { clusters, storage }
    }

    pub async fn make_transfer_leader(
        &self,
        req: TransferLeaderRequest,
    ) -> Result<TransferLeaderProcedure> {
        validate_name("node", &req.old_leader)?;
        validate_name("node", &req.new_leader)?;
        if req.old_leader == req.new_leader {
            return Err(MetaError::Validation(format!(
                "old and new leader are both {}",
                req.old_leader
            )));
        }

        let cluster = self.clusters.get_cluster(&req.cluster_name).await?;
        cluster.shard(req.shard_id)?;
        cluster.node(&req.old_leader)?;
        cluster.node(&req.new_leader)?;

        let id = self.storage.alloc_id().await?;
        Ok(TransferLeaderProcedure::new(
            id,
            req.cluster_name,
            req.shard_id,
            req.old_leader,
            req.new_leader,
        ))
    }

    pub async fn make_split(&self, req: SplitRequest) -> Result<SplitProcedure> {
        validate_name("schema", &req.schema_name)?;
        validate_name("node", &req.target_node)?;
        if req.tables.is_empty() {
            return Err(MetaError::Validation("split table list is empty".into()));
        }
        let mut seen = HashSet::new();
        for table in &req.tables {
            if !seen.insert(table.as_str()) {
                return Err(MetaError::Validation(format!(
                    "table {} listed twice",
                    table
                )));
            }
        }

        let cluster = self.clusters.get_cluster(&req.cluster_name).await?;
        cluster.shard(req.shard_id)?;
        cluster.node(&req.target_node)?;
        for name in &req.tables {
            let table = cluster.table(&req.schema_name, name)?;
            if table.shard_id != req.shard_id {
                return Err(MetaError::Validation(format!(
                    "table {}.{} is on shard {}, not {}",
                    req.schema_name, name, table.shard_id, req.shard_id
                )));
            }
        }

        let id = self.storage.alloc_id().await?;
        Ok(SplitProcedure::new(
            id,
            req.cluster_name,
            req.schema_name,
            req.shard_id,
            req.tables,
            req.target_node,
        ))
    }

    pub async fn make_drop_table(&self, req: DropTableRequest) -> Result<DropTableProcedure> {
        let cluster = self.clusters.get_cluster(&req.cluster_name).await?;
        let table = cluster.table(&req.schema_name, &req.table)?;

        let id = self.storage.alloc_id().await?;
        Ok(DropTableProcedure::new(
            id,
            req.cluster_name,
            req.schema_name,
            req.table,
            table.shard_id,
        ))
    }
}

/// Rebuild a procedure from its durable record
pub fn restore(record: &ProcedureRecord) -> Result<Box<dyn Procedure>> {
    fn decode<T: serde::de::DeserializeOwned>(record: &ProcedureRecord) -> Result<T> {
        serde_json::from_value(record.payload.clone()).map_err(|e| {
            MetaError::Persistence(format!("decode procedure {}: {}", record.id, e))
        })
    }

    let procedure: Box<dyn Procedure> = match record.kind {
        ProcedureKind::TransferLeader => Box::new(decode::<TransferLeaderProcedure>(record)?),
        ProcedureKind::Split => Box::new(decode::<SplitProcedure>(record)?),
        ProcedureKind::DropTable => Box::new(decode::<DropTableProcedure>(record)?),
    };

    if procedure.id() != record.id || procedure.resource_key() != record.resource_key {
        return Err(MetaError::Persistence(format!(
            "procedure {} payload does not match its record",
            record.id
        )));
    }
    Ok(procedure)
}
