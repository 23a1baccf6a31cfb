//! Procedure engine
//!
//! Topology-mutating operations run as procedures: an ordered list of steps
//! executed asynchronously by the [`ProcedureManager`], with the step cursor
//! and payload persisted after every step so a restarted server resumes where
//! the last durable record left off.
//!
//! Only one active procedure may hold a given [`ResourceKey`] at a time.

mod drop_table;
mod factory;
mod manager;
mod split;
mod storage;
mod transfer_leader;

pub use drop_table::DropTableProcedure;
pub use factory::{
    restore, DropTableRequest, ProcedureFactory, SplitRequest, TransferLeaderRequest,
};
pub use manager::ProcedureManager;
pub use split::SplitProcedure;
pub use storage::ProcedureStorage;
pub use transfer_leader::TransferLeaderProcedure;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterManager;
use crate::error::{MetaError, Result};
use crate::metadata::ShardId;
use crate::shard_client::ShardClient;

/// Procedure ID, allocated from a durable counter
pub type ProcedureId = u64;

/// Resource a procedure holds exclusively: one shard of one cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn shard(cluster: &str, shard_id: ShardId) -> Self {
        Self(format!("{}:{}", cluster, shard_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureKind {
    TransferLeader,
    Split,
    DropTable,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureKind::TransferLeader => write!(f, "TransferLeader"),
            ProcedureKind::Split => write!(f, "Split"),
            ProcedureKind::DropTable => write!(f, "DropTable"),
        }
    }
}

/// Procedure state
///
/// ```text
/// Init ──> Running ──> Finished
///  │          │  └───> Failed
///  │          │  └───> Cancelled
///  │          └──> Cancelling ──> Cancelled | Failed
///  └──> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureState {
    Init,
    Running,
    Cancelling,
    Finished,
    Failed,
    Cancelled,
}

impl ProcedureState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcedureState::Finished | ProcedureState::Failed | ProcedureState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ProcedureState) -> bool {
        use ProcedureState::*;
        matches!(
            (self, next),
            (Init, Running)
                | (Init, Failed)
                | (Running, Cancelling)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
        )
    }
}

impl fmt::Display for ProcedureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Durable record of a procedure
///
/// `step` counts completed steps: a record with `step = 2` resumes at the
/// third step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureRecord {
    pub id: ProcedureId,
    pub kind: ProcedureKind,
    pub resource_key: ResourceKey,
    pub state: ProcedureState,
    pub step: usize,
    pub step_count: usize,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcedureRecord {
    /// Init record for a freshly built procedure
    pub fn new(procedure: &dyn Procedure) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: procedure.id(),
            kind: procedure.kind(),
            resource_key: procedure.resource_key(),
            state: ProcedureState::Init,
            step: 0,
            step_count: procedure.step_names().len(),
            payload: procedure.payload()?,
            error: None,
            result: procedure.result(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: ProcedureState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MetaError::InvalidState(format!(
                "procedure {}: {} -> {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Capture the procedure's payload and result after a step
    pub fn sync_from(&mut self, procedure: &dyn Procedure) -> Result<()> {
        self.payload = procedure.payload()?;
        self.result = procedure.result();
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Everything a step may touch
#[derive(Clone)]
pub struct ProcedureContext {
    pub clusters: Arc<ClusterManager>,
    pub shard_client: Arc<dyn ShardClient>,
}

/// A resumable, step-wise topology operation
///
/// Every step must be safe to execute again after a crash: the manager
/// persists the cursor only once a step has returned, so the step in flight
/// at the time of a crash runs a second time on recovery.
#[async_trait]
pub trait Procedure: Send + Sync {
    fn id(&self) -> ProcedureId;

    fn kind(&self) -> ProcedureKind;

    fn resource_key(&self) -> ResourceKey;

    fn step_names(&self) -> &'static [&'static str];

    async fn execute_step(&mut self, step: usize, ctx: &ProcedureContext) -> Result<()>;

    /// Compensate for the steps executed so far
    async fn rollback(&mut self, ctx: &ProcedureContext) -> Result<()>;

    /// Serializable state needed to resume
    fn payload(&self) -> Result<serde_json::Value>;

    /// Value exposed to clients once known
    fn result(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Encode a procedure payload
pub(crate) fn encode_payload<T: Serialize>(payload: &T) -> Result<serde_json::Value> {
    serde_json::to_value(payload).map_err(|e| MetaError::Persistence(e.to_string()))
}
