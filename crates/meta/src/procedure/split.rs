//! Shard split
//!
//! Moves a subset of a shard's tables onto a newly created shard led by a
//! target node:
//!
//! 1. `alloc_shard_id`
//! 2. `validate_tables`
//! 3. `open_new_shard`
//! 4. `move_tables`
//!
//! Steps 3 and 4 do not roll back. A split that fails part-way through step 4
//! leaves the tables listed in `moved` on the new shard and the rest on the
//! source; both halves are valid assignments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    encode_payload, Procedure, ProcedureContext, ProcedureId, ProcedureKind, ResourceKey,
};
use crate::error::{MetaError, Result};
use crate::metadata::{NodeName, ShardId};
use crate::shard_client::OpenShardRequest;

const STEPS: &[&str] = &[
    "alloc_shard_id",
    "validate_tables",
    "open_new_shard",
    "move_tables",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitProcedure {
    id: ProcedureId,
    cluster: String,
    schema: String,
    /// Source shard
    shard_id: ShardId,
    tables: Vec<String>,
    target_node: NodeName,
    #[serde(default)]
    new_shard_id: Option<ShardId>,
    /// Tables already reassigned to the new shard
    #[serde(default)]
    moved: Vec<String>,
}

impl SplitProcedure {
    pub fn new(
        id: ProcedureId,
        cluster: String,
        schema: String,
        shard_id: ShardId,
        tables: Vec<String>,
        target_node: NodeName,
    ) -> Self {
        Self {
            id,
            cluster,
            schema,
            shard_id,
            tables,
            target_node,
            new_shard_id: None,
            moved: Vec::new(),
        }
    }

    fn allocated(&self) -> Result<ShardId> {
        self.new_shard_id.ok_or_else(|| {
            MetaError::InvalidState(format!("procedure {}: new shard id not allocated", self.id))
        })
    }

    async fn alloc_shard_id(&mut self, ctx: &ProcedureContext) -> Result<()> {
        if self.new_shard_id.is_some() {
            return Ok(());
        }
        let cluster = ctx.clusters.get_cluster(&self.cluster).await?;
        let new_shard_id = cluster.alloc_shard_id().await?;
        self.new_shard_id = Some(new_shard_id);
        info!(
            "Procedure {}: splitting shard {} into new shard {}",
            self.id, self.shard_id, new_shard_id
        );
        Ok(())
    }

    async fn validate_tables(&self, ctx: &ProcedureContext) -> Result<()> {
        let new_shard_id = self.allocated()?;
        let cluster = ctx.clusters.get_cluster(&self.cluster).await?;
        cluster.shard(self.shard_id)?;

        for name in &self.tables {
            let table = cluster.table(&self.schema, name)?;
            if table.shard_id != self.shard_id && table.shard_id != new_shard_id {
                return Err(MetaError::Validation(format!(
                    "table {}.{} is on shard {}, not {}",
                    self.schema, name, table.shard_id, self.shard_id
                )));
            }
        }
        Ok(())
    }

    async fn open_new_shard(&self, ctx: &ProcedureContext) -> Result<()> {
        let new_shard_id = self.allocated()?;
        let cluster = ctx.clusters.get_cluster(&self.cluster).await?;
        let node = cluster.node(&self.target_node)?;
        let shard = cluster.ensure_shard(new_shard_id, &self.target_node).await?;

        ctx.shard_client
            .open_shard(
                &node,
                &OpenShardRequest {
                    shard_id: new_shard_id,
                    shard_version: shard.version,
                    tables: self.tables.clone(),
                },
            )
            .await
    }

    async fn move_tables(&mut self, ctx: &ProcedureContext) -> Result<()> {
        let new_shard_id = self.allocated()?;
        let cluster = ctx.clusters.get_cluster(&self.cluster).await?;

        for name in &self.tables {
            if self.moved.contains(name) {
                continue;
            }
            cluster
                .move_table(&self.schema, name, self.shard_id, new_shard_id)
                .await?;
            self.moved.push(name.clone());
        }

        info!(
            "Procedure {}: moved {} tables from shard {} to {}",
            self.id,
            self.moved.len(),
            self.shard_id,
            new_shard_id
        );
        Ok(())
    }
}

#[async_trait]
impl Procedure for SplitProcedure {
    fn id(&self) -> ProcedureId {
        self.id
    }

    fn kind(&self) -> ProcedureKind {
        ProcedureKind::Split
    }

    fn resource_key(&self) -> ResourceKey {
        ResourceKey::shard(&self.cluster, self.shard_id)
    }

    fn step_names(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn execute_step(&mut self, step: usize, ctx: &ProcedureContext) -> Result<()> {
        match step {
            0 => self.alloc_shard_id(ctx).await,
            1 => self.validate_tables(ctx).await,
            2 => self.open_new_shard(ctx).await,
            3 => self.move_tables(ctx).await,
            _ => Err(MetaError::InvalidState(format!("split has no step {}", step))),
        }
    }

    async fn rollback(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        if let Some(new_shard_id) = self.new_shard_id {
            warn!(
                "Procedure {}: split of shard {} stopped; new shard {} keeps {:?}",
                self.id, self.shard_id, new_shard_id, self.moved
            );
        }
        Ok(())
    }

    fn payload(&self) -> Result<serde_json::Value> {
        encode_payload(self)
    }

    fn result(&self) -> Option<serde_json::Value> {
        self.new_shard_id.map(serde_json::Value::from)
    }
}
