//! Routing results

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metadata::{ShardId, TableId};

/// Where a table currently lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub table: String,
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub shard_version: u64,
    /// Leader node of the shard
    pub node_name: String,
    pub node_addr: String,
}

/// Result of routing a batch of tables
///
/// Tables unknown to the cluster are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTablesResult {
    /// Version of the local topology view the routes were read from
    pub cluster_version: u64,
    pub entries: BTreeMap<String, RouteEntry>,
}
