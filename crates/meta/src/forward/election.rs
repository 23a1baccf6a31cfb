//! Leadership
//!
//! The forwarding path only needs two answers: whether this replica leads,
//! and where the leader is.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

#[async_trait]
pub trait LeaderElection: Send + Sync {
    async fn is_leader(&self) -> bool;

    /// Address of the current leader, if known
    async fn current_leader_addr(&self) -> Option<String>;
}

/// Leadership fixed by configuration, switchable at runtime
///
/// Leads when no leader address is set or the leader address is its own.
pub struct StaticElection {
    self_addr: String,
    leader_addr: RwLock<Option<String>>,
}

impl StaticElection {
    pub fn new(self_addr: String, leader_addr: Option<String>) -> Self {
        Self {
            self_addr,
            leader_addr: RwLock::new(leader_addr),
        }
    }

    /// Point at a new leader; `None` makes this replica the leader
    pub fn set_leader(&self, leader_addr: Option<String>) {
        info!("Leader changed to {:?}", leader_addr);
        *self.leader_addr.write() = leader_addr;
    }
}

#[async_trait]
impl LeaderElection for StaticElection {
    async fn is_leader(&self) -> bool {
        match &*self.leader_addr.read() {
            None => true,
            Some(addr) => *addr == self.self_addr,
        }
    }

    async fn current_leader_addr(&self) -> Option<String> {
        Some(
            self.leader_addr
                .read()
                .clone()
                .unwrap_or_else(|| self.self_addr.clone()),
        )
    }
}
