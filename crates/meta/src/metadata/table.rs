//! Table definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ShardId;

/// Table ID, unique within a cluster
pub type TableId = u64;

/// Table and its shard assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub schema: String,
    /// The single shard currently owning the table
    pub shard_id: ShardId,
    /// Bumped on every reassignment
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl TableInfo {
    pub fn new(id: TableId, schema: String, name: String, shard_id: ShardId) -> Self {
        Self {
            id,
            name,
            schema,
            shard_id,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Copy of this table pointing at `shard_id`
    pub fn reassigned(&self, shard_id: ShardId) -> Self {
        Self {
            shard_id,
            version: self.version + 1,
            ..self.clone()
        }
    }
}
