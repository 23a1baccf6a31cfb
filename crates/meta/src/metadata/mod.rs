//! Cluster metadata definitions
//!
//! Records for clusters, nodes, shards and tables as they are kept in the
//! topology store

mod cluster;
mod node;
mod shard;
mod table;

pub use cluster::ClusterInfo;
pub use node::{NodeInfo, NodeName};
pub use shard::{ShardId, ShardInfo};
pub use table::{TableId, TableInfo};

use crate::error::{MetaError, Result};

/// Check that a name can be embedded in a store key
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MetaError::Validation(format!("{} name is empty", kind)));
    }
    if name.contains('/') {
        return Err(MetaError::Validation(format!(
            "{} name {:?} must not contain '/'",
            kind, name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("table", "t1").is_ok());
        assert!(validate_name("table", "").is_err());
        assert!(validate_name("schema", "a/b").is_err());
    }
}
