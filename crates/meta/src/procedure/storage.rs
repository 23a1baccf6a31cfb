//! Procedure log
//!
//! One record per procedure under `/procedures/{id}`, overwritten by
//! compare-and-set on every state change. The latest record is the durable
//! cursor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{ProcedureId, ProcedureRecord};
use crate::error::{MetaError, Result};
use crate::storage::{encode, keys, Revision, StoreError, TopologyStore};

pub struct ProcedureStorage {
    store: Arc<dyn TopologyStore>,
    /// Revision of the last record written or read, per procedure
    revisions: Mutex<HashMap<ProcedureId, Revision>>,
}

impl ProcedureStorage {
    pub fn new(store: Arc<dyn TopologyStore>) -> Self {
        Self {
            store,
            revisions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn alloc_id(&self) -> Result<ProcedureId> {
        self.store
            .increment(keys::PROCEDURE_ID_COUNTER)
            .await
            .map_err(persistence)
    }

    /// Write the first record of a procedure
    pub async fn create(&self, record: &ProcedureRecord) -> Result<()> {
        let value = encode(record).map_err(persistence)?;
        let revision = self
            .store
            .compare_and_set(&keys::procedure(record.id), None, value)
            .await
            .map_err(persistence)?;
        self.revisions.lock().insert(record.id, revision);
        debug!("Created procedure record {}", record.id);
        Ok(())
    }

    /// Overwrite the record of a procedure
    pub async fn update(&self, record: &ProcedureRecord) -> Result<()> {
        let cached = self.revisions.lock().get(&record.id).copied();
        let expected = match cached {
            Some(revision) => Some(revision),
            None => self
                .store
                .get(&keys::procedure(record.id))
                .await
                .map_err(persistence)?
                .map(|v| v.revision),
        };

        let value = encode(record).map_err(persistence)?;
        let revision = self
            .store
            .compare_and_set(&keys::procedure(record.id), expected, value)
            .await
            .map_err(persistence)?;
        self.revisions.lock().insert(record.id, revision);
        debug!(
            "Persisted procedure {}: state={}, step={}",
            record.id, record.state, record.step
        );
        Ok(())
    }

    pub async fn get(&self, id: ProcedureId) -> Result<ProcedureRecord> {
        let versioned = self
            .store
            .get(&keys::procedure(id))
            .await?
            .ok_or(MetaError::ProcedureNotFound(id))?;
        Ok(versioned.decode()?)
    }

    /// Every record, in ID order
    pub async fn load_all(&self) -> Result<Vec<ProcedureRecord>> {
        let entries = self.store.scan_prefix(keys::PROCEDURE_PREFIX).await?;

        let mut records = Vec::with_capacity(entries.len());
        let mut revisions = HashMap::with_capacity(entries.len());
        for (_, versioned) in entries {
            let record: ProcedureRecord = versioned.decode()?;
            revisions.insert(record.id, versioned.revision);
            records.push(record);
        }
        self.revisions.lock().extend(revisions);

        Ok(records)
    }

    /// Delete a record; `false` if it changed or vanished meanwhile
    pub async fn delete(&self, id: ProcedureId) -> Result<bool> {
        let key = keys::procedure(id);
        let Some(current) = self.store.get(&key).await? else {
            self.revisions.lock().remove(&id);
            return Ok(false);
        };

        match self.store.compare_and_delete(&key, current.revision).await {
            Ok(()) => {
                self.revisions.lock().remove(&id);
                Ok(true)
            }
            Err(StoreError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn persistence(err: StoreError) -> MetaError {
    MetaError::Persistence(err.to_string())
}
