use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::RegistryError;
use crate::run::{ModelState, RunConfig, RunId, RunRecord, RunResult};

type RecordCell = Arc<Mutex<RunRecord>>;

/// Authoritative map from run id to run record.
///
/// The outer map lock is held only to look up, insert or remove a cell.
/// Each record sits behind its own async mutex so updates to one run are
/// serialized without blocking others, and a caller can keep a record locked
/// across awaits via [`RunRegistry::lock`].
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, RecordCell>>,
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry")
            .field("runs", &self.runs.read().len())
            .finish()
    }
}

impl RunRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, run_id: RunId) -> Result<RecordCell, RegistryError> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or(RegistryError::UnknownRun(run_id))
    }

    /// Insert a fresh `Accepted` record under a newly generated id.
    pub fn create(&self) -> RunRecord {
        let mut runs = self.runs.write();
        let mut run_id = RunId::new();
        while runs.contains_key(&run_id) {
            run_id = RunId::new();
        }
        let record = RunRecord::new(run_id);
        runs.insert(run_id, Arc::new(Mutex::new(record.clone())));
        debug!(run_id = %run_id, "run created");
        record
    }

    /// Attach the configuration and move the run to `Ready`.
    pub async fn attach_config(
        &self,
        run_id: RunId,
        config: RunConfig,
    ) -> Result<RunRecord, RegistryError> {
        let cell = self.cell(run_id)?;
        let mut record = cell.lock().await;
        record.attach_config(config)?;
        Ok(record.clone())
    }

    /// Atomically move a run to `next`, rejecting backward or skipping moves.
    pub async fn transition(
        &self,
        run_id: RunId,
        next: ModelState,
        result: Option<RunResult>,
        reason: Option<String>,
    ) -> Result<RunRecord, RegistryError> {
        let cell = self.cell(run_id)?;
        let mut record = cell.lock().await;
        record.advance(next, result, reason)?;
        debug!(run_id = %run_id, state = %next, "run transitioned");
        Ok(record.clone())
    }

    /// Snapshot of the current record.
    pub async fn get(&self, run_id: RunId) -> Result<RunRecord, RegistryError> {
        let cell = self.cell(run_id)?;
        let record = cell.lock().await;
        Ok(record.clone())
    }

    /// Lock one record for a compound update.
    ///
    /// If the run is removed while the guard is held, writes through the guard
    /// land on the detached record and are not visible afterwards.
    pub async fn lock(&self, run_id: RunId) -> Result<OwnedMutexGuard<RunRecord>, RegistryError> {
        let cell = self.cell(run_id)?;
        Ok(cell.lock_owned().await)
    }

    /// Delete the record. No tombstone is kept.
    pub fn remove(&self, run_id: RunId) -> Result<(), RegistryError> {
        self.runs
            .write()
            .remove(&run_id)
            .map(|_| debug!(run_id = %run_id, "run removed"))
            .ok_or(RegistryError::UnknownRun(run_id))
    }

    /// Whether a record exists for `run_id`.
    pub fn contains(&self, run_id: RunId) -> bool {
        self.runs.read().contains_key(&run_id)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Whether the registry holds no records.
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}
