//! Shard leader transfer
//!
//! 1. `verify_leader`: the recorded leader must be the expected old leader
//! 2. `close_old_leader`: demote the shard on the old leader
//! 3. `open_new_leader`: promote the shard on the new leader
//! 4. `commit_leader`: swap the leader in the shard record (CAS)
//!
//! The shard record names the old leader until step 4 commits, so a failure
//! or crash at any earlier point leaves the old leader authoritative.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    encode_payload, Procedure, ProcedureContext, ProcedureId, ProcedureKind, ResourceKey,
};
use crate::error::{MetaError, Result};
use crate::metadata::{NodeName, ShardId};
use crate::shard_client::{CloseShardRequest, OpenShardRequest};

const STEPS: &[&str] = &[
    "verify_leader",
    "close_old_leader",
    "open_new_leader",
    "commit_leader",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLeaderProcedure {
    id: ProcedureId,
    cluster: String,
    shard_id: ShardId,
    old_leader: NodeName,
    new_leader: NodeName,
    /// Set before the close call is issued, so a rollback reopens the shard
    /// even if the call's outcome is unknown
    #[serde(default)]
    old_leader_closed: bool,
    #[serde(default)]
    new_leader_opened: bool,
    #[serde(default)]
    committed: bool,
}

impl TransferLeaderProcedure {
    pub fn new(
        id: ProcedureId,
        cluster: String,
        shard_id: ShardId,
        old_leader: NodeName,
        new_leader: NodeName,
    ) -> Self {
        Self {
            id,
            cluster,
            shard_id,
            old_leader,
            new_leader,
            old_leader_closed: false,
            new_leader_opened: false,
            committed: false,
        }
    }

    async fn verify_leader(&self, ctx: &ProcedureContext) -> Result<()> {
        let cluster = ctx.clusters.get_cluster(&self.cluster).await?;
        let shard = cluster.shard(self.shard_id)?;
        if shard.leader != self.old_leader {
            return Err(MetaError::Validation(format!(
                "shard {} is led by {}, not {}",
                self.shard_id, shard.leader, self.old_leader
            )));
        }
        cluster.node(&self.new_leader)?;
        Ok(())
    }

    async fn close_old_leader(&mut self, ctx: &ProcedureContext) -> Result<()> {
        let cluster = ctx.clusters.get_cluster(&self.cluster).await?;
        let node = cluster.node(&self.old_leader)?;
        let shard = cluster.shard(self.shard_id)?;

        self.old_leader_closed = true;
        ctx.shard_client
            .close_shard(
                &node,
                &CloseShardRequest {
                    shard_id: self.shard_id,
                    shard_version: shard.version,
                },
            )
            .await
    }

    async fn open_new_leader(&mut self, ctx: &ProcedureContext) -> Result<()> {
        let cluster = ctx.clusters.get_cluster(&self.cluster).await?;
        let node = cluster.node(&self.new_leader)?;
        let shard = cluster.shard(self.shard_id)?;
        let tables = cluster
            .shard_tables(self.shard_id)
            .into_iter()
            .map(|t| t.name)
            .collect();

        self.new_leader_opened = true;
        ctx.shard_client
            .open_shard(
                &node,
                &OpenShardRequest {
                    shard_id: self.shard_id,
                    shard_version: shard.version + 1,
                    tables,
                },
            )
            .await
    }

    async fn commit_leader(&mut self, ctx: &ProcedureContext) -> Result<()> {
        let cluster = ctx.clusters.get_cluster(&self.cluster).await?;
        let shard = cluster
            .update_shard_leader(self.shard_id, &self.old_leader, &self.new_leader)
            .await?;
        self.committed = true;

        info!(
            "Procedure {}: shard {} leader is now {} (version {})",
            self.id, self.shard_id, shard.leader, shard.version
        );
        Ok(())
    }
}

#[async_trait]
impl Procedure for TransferLeaderProcedure {
    fn id(&self) -> ProcedureId {
        self.id
    }

    fn kind(&self) -> ProcedureKind {
        ProcedureKind::TransferLeader
    }

    fn resource_key(&self) -> ResourceKey {
        ResourceKey::shard(&self.cluster, self.shard_id)
    }

    fn step_names(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn execute_step(&mut self, step: usize, ctx: &ProcedureContext) -> Result<()> {
        match step {
            0 => self.verify_leader(ctx).await,
            1 => self.close_old_leader(ctx).await,
            2 => self.open_new_leader(ctx).await,
            3 => self.commit_leader(ctx).await,
            _ => Err(MetaError::InvalidState(format!(
                "transfer leader has no step {}",
                step
            ))),
        }
    }

    async fn rollback(&mut self, ctx: &ProcedureContext) -> Result<()> {
        if self.committed {
            return Ok(());
        }

        let cluster = ctx.clusters.get_cluster(&self.cluster).await?;
        let shard = cluster.shard(self.shard_id)?;

        if self.new_leader_opened {
            match cluster.node(&self.new_leader) {
                Ok(node) => {
                    let req = CloseShardRequest {
                        shard_id: self.shard_id,
                        shard_version: shard.version,
                    };
                    if let Err(e) = ctx.shard_client.close_shard(&node, &req).await {
                        warn!(
                            "Procedure {}: close shard {} on {} failed: {}",
                            self.id, self.shard_id, self.new_leader, e
                        );
                    }
                }
                Err(e) => warn!("Procedure {}: {}", self.id, e),
            }
            self.new_leader_opened = false;
        }

        if self.old_leader_closed {
            let node = cluster.node(&self.old_leader)?;
            let tables = cluster
                .shard_tables(self.shard_id)
                .into_iter()
                .map(|t| t.name)
                .collect();
            ctx.shard_client
                .open_shard(
                    &node,
                    &OpenShardRequest {
                        shard_id: self.shard_id,
                        shard_version: shard.version,
                        tables,
                    },
                )
                .await?;
            self.old_leader_closed = false;
            info!(
                "Procedure {}: reopened shard {} on {}",
                self.id, self.shard_id, self.old_leader
            );
        }

        Ok(())
    }

    fn payload(&self) -> Result<serde_json::Value> {
        encode_payload(self)
    }
}
