//! Table drop
//!
//! 1. `close_table`: unload the table on its shard's leader
//! 2. `drop_table`: delete the table record

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    encode_payload, Procedure, ProcedureContext, ProcedureId, ProcedureKind, ResourceKey,
};
use crate::error::{MetaError, Result};
use crate::metadata::ShardId;
use crate::shard_client::CloseTableRequest;

const STEPS: &[&str] = &["close_table", "drop_table"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropTableProcedure {
    id: ProcedureId,
    cluster: String,
    schema: String,
    table: String,
    /// Shard owning the table when the procedure was built
    shard_id: ShardId,
    #[serde(default)]
    dropped: bool,
}

impl DropTableProcedure {
    pub fn new(
        id: ProcedureId,
        cluster: String,
        schema: String,
        table: String,
        shard_id: ShardId,
    ) -> Self {
        Self {
            id,
            cluster,
            schema,
            table,
            shard_id,
            dropped: false,
        }
    }

    async fn close_table(&self, ctx: &ProcedureContext) -> Result<()> {
        let cluster = ctx.clusters.get_cluster(&self.cluster).await?;
        let shard = cluster.shard(self.shard_id)?;
        let leader = cluster.node(&shard.leader)?;

        ctx.shard_client
            .close_table(
                &leader,
                &CloseTableRequest {
                    shard_id: self.shard_id,
                    schema: self.schema.clone(),
                    table: self.table.clone(),
                },
            )
            .await
    }

    async fn drop_table(&mut self, ctx: &ProcedureContext) -> Result<()> {
        let existed = ctx
            .clusters
            .drop_table(&self.cluster, &self.schema, &self.table)
            .await?;
        self.dropped = true;
        info!(
            "Procedure {}: dropped {}.{} (existed={})",
            self.id, self.schema, self.table, existed
        );
        Ok(())
    }
}

#[async_trait]
impl Procedure for DropTableProcedure {
    fn id(&self) -> ProcedureId {
        self.id
    }

    fn kind(&self) -> ProcedureKind {
        ProcedureKind::DropTable
    }

    fn resource_key(&self) -> ResourceKey {
        ResourceKey::shard(&self.cluster, self.shard_id)
    }

    fn step_names(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn execute_step(&mut self, step: usize, ctx: &ProcedureContext) -> Result<()> {
        match step {
            0 => self.close_table(ctx).await,
            1 => self.drop_table(ctx).await,
            _ => Err(MetaError::InvalidState(format!(
                "drop table has no step {}",
                step
            ))),
        }
    }

    /// A closed table stays closed; the record is left for a later retry
    async fn rollback(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        Ok(())
    }

    fn payload(&self) -> Result<serde_json::Value> {
        encode_payload(self)
    }

    fn result(&self) -> Option<serde_json::Value> {
        self.dropped.then_some(serde_json::Value::Bool(true))
    }
}
