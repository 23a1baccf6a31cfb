//! Node information definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node name, unique within a cluster
pub type NodeName = String;

/// Storage node registered in a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name
    pub name: NodeName,
    /// Shard control address (host:port)
    pub addr: String,
    /// Registration time
    pub registered_at: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(name: NodeName, addr: String) -> Self {
        Self {
            name,
            addr,
            registered_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}
