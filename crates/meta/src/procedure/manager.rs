//! Procedure manager
//!
//! Accepts procedures, serializes them per resource key and drives each one
//! on its own tokio task. Progress is written to the procedure log after
//! every step, before the next step starts.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

use super::{
    restore, Procedure, ProcedureContext, ProcedureId, ProcedureRecord, ProcedureState,
    ProcedureStorage, ResourceKey,
};
use crate::config::ProcedureConfig;
use crate::error::{MetaError, Result};

/// Latest progress of a running procedure
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub state: ProcedureState,
    pub step: usize,
    pub result: Option<serde_json::Value>,
}

impl Progress {
    fn of(record: &ProcedureRecord) -> Self {
        Self {
            state: record.state,
            step: record.step,
            result: record.result.clone(),
        }
    }
}

struct RunningProcedure {
    cancel: Arc<AtomicBool>,
    progress: watch::Receiver<Progress>,
}

/// Procedure manager
pub struct ProcedureManager {
    config: ProcedureConfig,
    storage: Arc<ProcedureStorage>,
    ctx: ProcedureContext,
    /// Resource key -> holding procedure
    locks: Mutex<HashMap<ResourceKey, ProcedureId>>,
    running: Mutex<HashMap<ProcedureId, RunningProcedure>>,
}

impl ProcedureManager {
    pub fn new(
        config: ProcedureConfig,
        storage: Arc<ProcedureStorage>,
        ctx: ProcedureContext,
    ) -> Self {
        Self {
            config,
            storage,
            ctx,
            locks: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ProcedureConfig {
        &self.config
    }

    /// Lock the procedure's resource, persist its Init record and start it
    ///
    /// Returns as soon as the procedure is scheduled. A resource already held
    /// by another procedure is rejected with `ResourceBusy`.
    pub async fn submit(self: &Arc<Self>, procedure: Box<dyn Procedure>) -> Result<ProcedureId> {
        let id = procedure.id();
        let key = procedure.resource_key();
        self.acquire(&key, id)?;

        let record = match ProcedureRecord::new(procedure.as_ref()) {
            Ok(record) => record,
            Err(e) => {
                self.release(&key, id);
                return Err(e);
            }
        };
        if let Err(e) = self.storage.create(&record).await {
            self.release(&key, id);
            return Err(e);
        }

        info!(
            "Submitted procedure {} ({}) on {}",
            id, record.kind, record.resource_key
        );
        self.spawn(procedure, record);
        Ok(id)
    }

    /// Resume every non-terminal procedure found in the log
    ///
    /// When several non-terminal records share a resource key, the lowest ID
    /// resumes and the others are marked Failed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let mut by_key: BTreeMap<ResourceKey, Vec<ProcedureRecord>> = BTreeMap::new();
        for record in self.storage.load_all().await? {
            if !record.state.is_terminal() {
                by_key
                    .entry(record.resource_key.clone())
                    .or_default()
                    .push(record);
            }
        }

        let mut resumed = 0;
        for (key, mut records) in by_key {
            records.sort_by_key(|r| r.id);
            let mut records = records.into_iter();
            let Some(first) = records.next() else {
                continue;
            };

            for duplicate in records {
                let cause = format!("superseded by procedure {} on {}", first.id, key);
                self.mark_failed(duplicate, cause).await;
            }

            if self.running.lock().contains_key(&first.id) {
                continue;
            }

            let procedure = match restore(&first) {
                Ok(procedure) => procedure,
                Err(e) => {
                    self.mark_failed(first, e.to_string()).await;
                    continue;
                }
            };
            if let Err(e) = self.acquire(&key, first.id) {
                warn!("Cannot resume procedure {}: {}", first.id, e);
                continue;
            }

            info!(
                "Resuming procedure {} ({}) on {} at step {} in state {}",
                first.id, first.kind, key, first.step, first.state
            );
            self.spawn(procedure, first);
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Request cancellation; honoured at the next step boundary
    pub async fn cancel(&self, id: ProcedureId) -> Result<()> {
        let flag = self.running.lock().get(&id).map(|r| r.cancel.clone());
        if let Some(flag) = flag {
            flag.store(true, Ordering::SeqCst);
            info!("Cancellation requested for procedure {}", id);
            return Ok(());
        }

        let record = self.storage.get(id).await?;
        Err(MetaError::InvalidState(format!(
            "procedure {} is {} and not running here",
            id, record.state
        )))
    }

    pub async fn get(&self, id: ProcedureId) -> Result<ProcedureRecord> {
        self.storage.get(id).await
    }

    /// All records, in ID order
    pub async fn list(&self) -> Result<Vec<ProcedureRecord>> {
        self.storage.load_all().await
    }

    /// Procedure currently holding `key`
    pub fn active_resource(&self, key: &ResourceKey) -> Option<ProcedureId> {
        self.locks.lock().get(key).copied()
    }

    /// Wait until the procedure's progress satisfies `condition`, or it stops
    /// running here, then return its durable record
    pub async fn wait_until<F>(&self, id: ProcedureId, mut condition: F) -> Result<ProcedureRecord>
    where
        F: FnMut(&Progress) -> bool,
    {
        let progress = self.running.lock().get(&id).map(|r| r.progress.clone());
        if let Some(mut progress) = progress {
            let stopped = |p: &Progress| p.state.is_terminal();
            if progress
                .wait_for(|p| condition(p) || stopped(p))
                .await
                .is_err()
            {
                debug!("Procedure {} finished while waiting", id);
            }
        }
        self.storage.get(id).await
    }

    pub async fn wait_for_terminal(&self, id: ProcedureId) -> Result<ProcedureRecord> {
        self.wait_until(id, |p| p.state.is_terminal()).await
    }

    /// Delete terminal records, keeping the `keep` most recent
    pub async fn gc_finished(&self, keep: usize) -> Result<usize> {
        let mut terminal: Vec<ProcedureRecord> = self
            .storage
            .load_all()
            .await?
            .into_iter()
            .filter(|r| r.state.is_terminal())
            .collect();
        if terminal.len() <= keep {
            return Ok(0);
        }

        terminal.sort_by_key(|r| std::cmp::Reverse(r.id));
        let mut removed = 0;
        for record in terminal.into_iter().skip(keep) {
            if self.storage.delete(record.id).await? {
                removed += 1;
            }
        }

        info!("Removed {} finished procedure records", removed);
        Ok(removed)
    }

    /// Start the periodic procedure log cleanup task
    pub fn start_gc_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.config.gc_interval_secs);
        let keep = self.config.gc_keep;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = self.gc_finished(keep).await {
                    warn!("Procedure gc failed: {}", e);
                }
            }
        })
    }

    fn acquire(&self, key: &ResourceKey, id: ProcedureId) -> Result<()> {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(&holder) if holder != id => Err(MetaError::ResourceBusy {
                key: key.to_string(),
                holder,
            }),
            _ => {
                locks.insert(key.clone(), id);
                Ok(())
            }
        }
    }

    fn release(&self, key: &ResourceKey, id: ProcedureId) {
        let mut locks = self.locks.lock();
        if locks.get(key) == Some(&id) {
            locks.remove(key);
        }
    }

    fn spawn(self: &Arc<Self>, procedure: Box<dyn Procedure>, record: ProcedureRecord) {
        let cancel = Arc::new(AtomicBool::new(false));
        let (progress, receiver) = watch::channel(Progress::of(&record));
        self.running.lock().insert(
            record.id,
            RunningProcedure {
                cancel: cancel.clone(),
                progress: receiver,
            },
        );

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(procedure, record, cancel, progress).await;
        });
    }

    async fn run(
        self: Arc<Self>,
        mut procedure: Box<dyn Procedure>,
        mut record: ProcedureRecord,
        cancel: Arc<AtomicBool>,
        progress: watch::Sender<Progress>,
    ) {
        let id = record.id;
        let key = record.resource_key.clone();

        let recorded = match self
            .drive(procedure.as_mut(), &mut record, &cancel, &progress)
            .await
        {
            Ok(()) => true,
            Err(e) => self.abort(procedure.as_mut(), &mut record, e).await,
        };

        self.running.lock().remove(&id);
        if recorded {
            self.release(&key, id);
        } else {
            error!(
                "Procedure {} could not record its outcome; {} stays locked until recovery",
                id, key
            );
        }
        // Terminal progress is published only once the resource is released
        progress.send_replace(Progress::of(&record));
    }

    /// Run the remaining steps; `Err` only if progress could not be recorded
    async fn drive(
        &self,
        procedure: &mut dyn Procedure,
        record: &mut ProcedureRecord,
        cancel: &AtomicBool,
        progress: &watch::Sender<Progress>,
    ) -> Result<()> {
        if record.state == ProcedureState::Init {
            record.transition(ProcedureState::Running)?;
            self.persist(record, progress).await?;
        }

        let steps = procedure.step_names();
        while record.state == ProcedureState::Running && record.step < steps.len() {
            if cancel.load(Ordering::SeqCst) {
                info!("Procedure {} cancelling before step {}", record.id, steps[record.step]);
                record.transition(ProcedureState::Cancelling)?;
                self.persist(record, progress).await?;
                break;
            }

            let step = record.step;
            match self.execute_step(procedure, record.id, step).await {
                Ok(()) => {
                    record.step += 1;
                    record.sync_from(procedure)?;
                    self.persist(record, progress).await?;
                }
                Err(cause) => {
                    error!(
                        "Procedure {} failed at step {}: {}",
                        record.id, steps[step], cause
                    );
                    let cause = match self.rollback(procedure).await {
                        Ok(()) => cause.to_string(),
                        Err(e) => format!("{}; rollback failed: {}", cause, e),
                    };
                    record.sync_from(procedure)?;
                    record.error = Some(cause);
                    record.transition(ProcedureState::Failed)?;
                    self.persist(record, progress).await?;
                    return Ok(());
                }
            }
        }

        match record.state {
            ProcedureState::Running => {
                record.transition(ProcedureState::Finished)?;
                self.persist(record, progress).await?;
                info!("Procedure {} ({}) finished", record.id, record.kind);
            }
            ProcedureState::Cancelling => {
                let next = match self.rollback(procedure).await {
                    Ok(()) => ProcedureState::Cancelled,
                    Err(e) => {
                        record.error = Some(format!("rollback failed: {}", e));
                        ProcedureState::Failed
                    }
                };
                record.sync_from(procedure)?;
                record.transition(next)?;
                self.persist(record, progress).await?;
                info!("Procedure {} ({}) is {}", record.id, record.kind, next);
            }
            _ => {}
        }

        Ok(())
    }

    async fn execute_step(
        &self,
        procedure: &mut dyn Procedure,
        id: ProcedureId,
        step: usize,
    ) -> Result<()> {
        let name = procedure.step_names().get(step).copied().unwrap_or("unknown");
        let step_timeout = self.config.step_timeout();
        let mut attempt = 0;

        loop {
            let outcome = match timeout(step_timeout, procedure.execute_step(step, &self.ctx)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(MetaError::StepExecution(format!(
                    "step {} timed out after {:?}",
                    name, step_timeout
                ))),
            };

            match outcome {
                Ok(()) => {
                    debug!("Procedure {} completed step {}", id, name);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_step_retries => {
                    attempt += 1;
                    warn!(
                        "Procedure {} step {} failed (retry {}/{}): {}",
                        id, name, attempt, self.config.max_step_retries, e
                    );
                    sleep(Duration::from_millis(self.config.retry_interval_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn rollback(&self, procedure: &mut dyn Procedure) -> Result<()> {
        let step_timeout = self.config.step_timeout();
        match timeout(step_timeout, procedure.rollback(&self.ctx)).await {
            Ok(result) => result,
            Err(_) => Err(MetaError::StepExecution(format!(
                "rollback timed out after {:?}",
                step_timeout
            ))),
        }
    }

    async fn persist(
        &self,
        record: &ProcedureRecord,
        progress: &watch::Sender<Progress>,
    ) -> Result<()> {
        self.storage.update(record).await?;
        if !record.state.is_terminal() {
            progress.send_replace(Progress::of(record));
        }
        Ok(())
    }

    /// Handle a failure to record progress
    ///
    /// Compensates if steps remain, then tries once to record Failed. Returns
    /// whether the outcome is durable.
    async fn abort(
        &self,
        procedure: &mut dyn Procedure,
        record: &mut ProcedureRecord,
        cause: MetaError,
    ) -> bool {
        error!("Procedure {} stopped: {}", record.id, cause);

        if !record.state.is_terminal() {
            let mut message = cause.to_string();
            if record.step < record.step_count {
                if let Err(e) = self.rollback(procedure).await {
                    message = format!("{}; rollback failed: {}", message, e);
                }
            }
            if let Err(e) = record.sync_from(procedure) {
                warn!("Procedure {} payload not captured: {}", record.id, e);
            }
            record.error = Some(message);
            if let Err(e) = record.transition(ProcedureState::Failed) {
                warn!("{}", e);
            }
        }

        match self.storage.update(record).await {
            Ok(()) => true,
            Err(e) => {
                error!("Procedure {} outcome not recorded: {}", record.id, e);
                false
            }
        }
    }

    async fn mark_failed(&self, mut record: ProcedureRecord, cause: String) {
        warn!("Marking procedure {} failed: {}", record.id, cause);
        record.error = Some(cause);
        if let Err(e) = record.transition(ProcedureState::Failed) {
            warn!("{}", e);
            return;
        }
        if let Err(e) = self.storage.update(&record).await {
            error!("Failed to mark procedure {} failed: {}", record.id, e);
        }
    }
}
