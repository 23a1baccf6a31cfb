//! Topology store
//!
//! Durable, versioned key-value storage for cluster topology and the
//! procedure log. Every key carries a revision taken from a store-wide
//! counter that increases on each write; all mutations are compare-and-set
//! against that revision so concurrent writers detect staleness instead of
//! overwriting each other.
//!
//! # Implementations
//! - [`MemoryStore`]: process-local, for tests and ephemeral deployments
//! - [`FileStore`]: JSON snapshot on disk, written atomically on every mutation

mod file;
pub mod keys;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Store-wide revision number
pub type Revision = u64;

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Revision conflict on {key}: expected {expected:?}, found {actual:?}")]
    Conflict {
        key: String,
        expected: Option<Revision>,
        actual: Option<Revision>,
    },
    #[error("Counter {0} overflowed")]
    CounterOverflow(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored value together with the revision of its last write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub revision: Revision,
    pub value: serde_json::Value,
}

impl Versioned {
    /// Decode the value into a typed record
    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Encode a typed record into a store value
pub fn encode<T: Serialize>(value: &T) -> StoreResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Durable versioned key-value store
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>>;

    /// Read every key starting with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Versioned)>>;

    /// Write `value` if the key's current revision equals `expected`
    ///
    /// `expected = None` requires the key to be absent. Returns the revision
    /// assigned to the new value.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Revision>,
        value: serde_json::Value,
    ) -> StoreResult<Revision>;

    /// Delete the key if its current revision equals `expected`
    async fn compare_and_delete(&self, key: &str, expected: Revision) -> StoreResult<()>;

    /// Atomically increment a durable counter and return the new value
    ///
    /// The first call for a counter returns 1. Values are never handed out
    /// twice, including across restarts of a durable store.
    async fn increment(&self, key: &str) -> StoreResult<u64>;
}

/// In-memory state shared by the store implementations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct KvState {
    revision: Revision,
    entries: BTreeMap<String, Versioned>,
    counters: BTreeMap<String, u64>,
}

impl KvState {
    pub(crate) fn get(&self, key: &str) -> Option<Versioned> {
        self.entries.get(key).cloned()
    }

    pub(crate) fn scan_prefix(&self, prefix: &str) -> Vec<(String, Versioned)> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn compare_and_set(
        &mut self,
        key: &str,
        expected: Option<Revision>,
        value: serde_json::Value,
    ) -> StoreResult<Revision> {
        let actual = self.entries.get(key).map(|v| v.revision);
        if actual != expected {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        self.revision += 1;
        let revision = self.revision;
        self.entries
            .insert(key.to_string(), Versioned { revision, value });
        Ok(revision)
    }

    pub(crate) fn compare_and_delete(&mut self, key: &str, expected: Revision) -> StoreResult<()> {
        let actual = self.entries.get(key).map(|v| v.revision);
        if actual != Some(expected) {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: Some(expected),
                actual,
            });
        }

        self.revision += 1;
        self.entries.remove(key);
        Ok(())
    }

    pub(crate) fn increment(&mut self, key: &str) -> StoreResult<u64> {
        let counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter = counter
            .checked_add(1)
            .ok_or_else(|| StoreError::CounterOverflow(key.to_string()))?;
        Ok(*counter)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cas_requires_matching_revision() {
        let mut state = KvState::default();

        let r1 = state.compare_and_set("/a", None, json!(1)).unwrap();
        assert!(matches!(
            state.compare_and_set("/a", None, json!(2)),
            Err(StoreError::Conflict { actual: Some(_), .. })
        ));

        let r2 = state.compare_and_set("/a", Some(r1), json!(2)).unwrap();
        assert!(r2 > r1);
        assert!(state.compare_and_set("/a", Some(r1), json!(3)).is_err());
        assert_eq!(state.get("/a").unwrap().value, json!(2));

        assert!(state.compare_and_delete("/a", r1).is_err());
        state.compare_and_delete("/a", r2).unwrap();
        assert!(state.get("/a").is_none());
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let mut state = KvState::default();
        state.compare_and_set("/c/x/shards/1", None, json!(1)).unwrap();
        state.compare_and_set("/c/x/shards/2", None, json!(2)).unwrap();
        state.compare_and_set("/c/x/tables/t", None, json!(3)).unwrap();
        state.compare_and_set("/c/xy/shards/1", None, json!(4)).unwrap();

        let shards = state.scan_prefix("/c/x/shards/");
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].0, "/c/x/shards/1");
    }

    #[test]
    fn test_counter_is_monotonic() {
        let mut state = KvState::default();
        assert_eq!(state.increment("/n").unwrap(), 1);
        assert_eq!(state.increment("/n").unwrap(), 2);
        assert_eq!(state.increment("/m").unwrap(), 1);
    }
}
