//! Cluster record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cluster record
///
/// Nodes, shards and tables are stored under the cluster's own keys; this
/// record only marks the cluster as existing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Cluster name
    pub name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl ClusterInfo {
    pub fn new(name: String) -> Self {
        Self {
            name,
            created_at: Utc::now(),
        }
    }
}
