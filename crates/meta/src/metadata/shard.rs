//! Shard information definitions

use serde::{Deserialize, Serialize};

use super::NodeName;

/// Shard ID
///
/// Allocated from a per-cluster durable counter and never reused.
pub type ShardId = u32;

/// Shard information
///
/// `leader` is not optional: a committed shard always has exactly one leader,
/// and the only way to change it is [`ShardInfo::with_leader`], which swaps
/// one node for another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Shard ID
    pub id: ShardId,
    /// Current leader
    pub leader: NodeName,
    /// Replica node list (contains the leader)
    pub replicas: Vec<NodeName>,
    /// Epoch, bumped on every leadership or membership change
    pub version: u64,
}

impl ShardInfo {
    /// Create new shard led by `leader`
    pub fn new(id: ShardId, leader: NodeName, replicas: Vec<NodeName>) -> Self {
        let mut shard = Self {
            id,
            leader: leader.clone(),
            replicas,
            version: 0,
        };
        shard.add_replica(leader);
        shard
    }

    /// Add replica node
    pub fn add_replica(&mut self, node: NodeName) {
        if !self.replicas.contains(&node) {
            self.replicas.push(node);
        }
    }

    /// Whether `node` hosts a replica of this shard
    pub fn is_hosted_on(&self, node: &str) -> bool {
        self.replicas.iter().any(|n| n == node)
    }

    /// Copy of this shard led by `leader` with the epoch bumped
    pub fn with_leader(&self, leader: NodeName) -> Self {
        let mut next = self.clone();
        next.add_replica(leader.clone());
        next.leader = leader;
        next.version += 1;
        next
    }
}

impl std::fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard {} (leader={}, version={})", self.id, self.leader, self.version)
    }
}
