//! In-memory topology store

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KvState, Revision, StoreResult, TopologyStore, Versioned};

/// Process-local store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<KvState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys (counters excluded)
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TopologyStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        Ok(self.state.lock().get(key))
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Versioned)>> {
        Ok(self.state.lock().scan_prefix(prefix))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Revision>,
        value: serde_json::Value,
    ) -> StoreResult<Revision> {
        self.state.lock().compare_and_set(key, expected, value)
    }

    async fn compare_and_delete(&self, key: &str, expected: Revision) -> StoreResult<()> {
        self.state.lock().compare_and_delete(key, expected)
    }

    async fn increment(&self, key: &str) -> StoreResult<u64> {
        self.state.lock().increment(key)
    }
}
