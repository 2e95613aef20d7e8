//! Sweep controller: the registry of sweeps, the reconciliation tick and the
//! commands that mutate them.
//!
//! The registry sits behind one `parking_lot::Mutex`. Nothing awaits while
//! holding it: a tick snapshots what it needs, releases the lock, talks to
//! workers, then re-locks to apply what it learned. The apply steps re-check
//! each trial's stage and worker handle, so a stop or delete that lands while
//! worker I/O is in flight always wins, and workers launched for trials that
//! disappeared in the meantime are cancelled.
//!
//! Record store writes are serialized by a second, async lock that is always
//! taken before the registry lock. A tick can therefore never write back the
//! record of a sweep that a concurrent `delete_sweep` already removed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use sw_optimizer::{
    LaunchOutcome, LaunchRequest, Sweep, SweepConfig, SweepView, WorkerRef, WorkerReport,
    WorkerStatus,
};
use sw_types::{LaunchError, SwError, SwResult, SweepError};
use tracing::{debug, error, info, warn};

use crate::drive::SharedDrive;
use crate::launcher::WorkerLauncher;
use crate::store::RecordStore;

/// Prefix for generated sweep ids.
pub const SWEEP_ID_PREFIX: &str = "sweep";

/// Always-present presentation tab.
pub const DASHBOARD_TAB: &str = "Dashboard";

/// Sweeps by id.
#[derive(Debug, Default)]
pub struct SweepRegistry {
    sweeps: BTreeMap<String, Sweep>,
}

impl SweepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sweeps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweeps.is_empty()
    }

    pub fn contains(&self, sweep_id: &str) -> bool {
        self.sweeps.contains_key(sweep_id)
    }

    pub fn get(&self, sweep_id: &str) -> Option<&Sweep> {
        self.sweeps.get(sweep_id)
    }

    pub fn get_mut(&mut self, sweep_id: &str) -> Option<&mut Sweep> {
        self.sweeps.get_mut(sweep_id)
    }

    /// Insert a sweep, refusing to replace an existing one.
    pub fn insert(&mut self, sweep: Sweep) -> Result<(), SweepError> {
        let sweep_id = sweep.sweep_id().to_string();
        if self.sweeps.contains_key(&sweep_id) {
            return Err(SweepError::Duplicate { sweep_id });
        }
        self.sweeps.insert(sweep_id, sweep);
        Ok(())
    }

    pub fn remove(&mut self, sweep_id: &str) -> Option<Sweep> {
        self.sweeps.remove(sweep_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sweep> {
        self.sweeps.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sweeps.keys().cloned().collect()
    }
}

/// What one reconciliation tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    /// Non-complete sweeps present when the tick started.
    pub sweeps: usize,
    pub polled: usize,
    /// Trial stage changes caused by worker reports.
    pub transitions: usize,
    pub launched: usize,
    pub launch_failures: usize,
    /// Workers cancelled because their trial was stopped or deleted mid-launch.
    pub orphaned: usize,
    /// Sweeps that completed during this tick.
    pub completed: usize,
}

/// One presentation tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutTab {
    pub name: String,
    /// Sweep rendered by this tab; `None` for the dashboard.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_id: Option<String>,
}

fn not_found(sweep_id: &str) -> SwError {
    SweepError::NotFound {
        sweep_id: sweep_id.to_string(),
    }
    .into()
}

/// Owns the sweep registry and drives it against a worker launcher.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SweepController {
    registry: Arc<Mutex<SweepRegistry>>,
    persist: Arc<tokio::sync::Mutex<()>>,
    launcher: Arc<dyn WorkerLauncher>,
    store: Arc<dyn RecordStore>,
    drive: SharedDrive,
}

impl std::fmt::Debug for SweepController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepController")
            .field("sweeps", &self.registry.lock().len())
            .field("launcher", &self.launcher.name())
            .field("store", &self.store.name())
            .field("drive", &self.drive.root())
            .finish()
    }
}

impl SweepController {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        store: Arc<dyn RecordStore>,
        drive: SharedDrive,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(SweepRegistry::new())),
            persist: Arc::new(tokio::sync::Mutex::new(())),
            launcher,
            store,
            drive,
        }
    }

    pub fn drive(&self) -> &SharedDrive {
        &self.drive
    }

    /// Re-register every sweep found in the record store. Records that fail
    /// to rebuild are skipped with a warning. Returns how many were restored.
    pub async fn restore(&self) -> SwResult<usize> {
        let records = self.store.list().await?;
        let mut restored = 0;

        for record in records {
            let sweep_id = record.sweep_id().to_string();
            let sweep = match Sweep::from_record(record) {
                Ok(sweep) => sweep,
                Err(e) => {
                    warn!(sweep_id = %sweep_id, error = %e, "skipping unrecoverable sweep record");
                    continue;
                }
            };
            let inserted = self.registry.lock().insert(sweep);
            match inserted {
                Ok(()) => restored += 1,
                Err(e) => warn!(sweep_id = %sweep_id, error = %e, "sweep already registered"),
            }
        }

        info!(restored, store = self.store.name(), "sweeps restored");
        Ok(restored)
    }

    /// Register a new sweep. Nothing is launched until the next tick.
    pub async fn run_sweep(&self, mut config: SweepConfig) -> SwResult<String> {
        config.ensure_id(SWEEP_ID_PREFIX);
        let sweep = Sweep::from_config(config).map_err(|e| match e {
            SwError::Validation(message) => SweepError::InvalidConfig { message }.into(),
            other => other,
        })?;
        let sweep_id = sweep.sweep_id().to_string();
        let record = sweep.record();

        let _persist = self.persist.lock().await;
        let exists = self.registry.lock().contains(&sweep_id);
        if exists {
            return Err(SweepError::Duplicate { sweep_id }.into());
        }
        self.store.put(&sweep_id, &record).await?;
        let inserted = self.registry.lock().insert(sweep);
        inserted?;

        info!(
            sweep_id = %sweep_id,
            n_trials = record.config.n_trials,
            simultaneous_trials = record.config.simultaneous_trials,
            strategy = ?record.config.strategy,
            "sweep registered"
        );
        Ok(sweep_id)
    }

    /// Cancel every in-flight trial and mark the sweep complete. Stopping a
    /// sweep that is already complete does nothing.
    pub async fn stop_sweep(&self, sweep_id: &str) -> SwResult<()> {
        let workers = {
            let mut registry = self.registry.lock();
            let sweep = registry.get_mut(sweep_id).ok_or_else(|| not_found(sweep_id))?;
            if sweep.is_complete() {
                debug!(sweep_id, "stop on a complete sweep");
                return Ok(());
            }
            sweep.stop()?
        };

        info!(sweep_id, cancelled = workers.len(), "sweep stopped");
        self.cancel_workers(&workers).await;
        self.persist_sweeps(&[sweep_id.to_string()]).await;
        Ok(())
    }

    /// Stop whatever is in flight and forget the sweep: registry entry,
    /// durable record and shared drive namespace.
    pub async fn delete_sweep(&self, sweep_id: &str) -> SwResult<String> {
        let mut sweep = {
            let _persist = self.persist.lock().await;
            let removed = self.registry.lock().remove(sweep_id);
            let sweep = removed.ok_or_else(|| not_found(sweep_id))?;
            if let Err(e) = self.store.delete(sweep_id).await {
                warn!(sweep_id, error = %e, "failed to delete sweep record");
            }
            sweep
        };

        let workers = sweep.stop().unwrap_or_else(|e| {
            error!(sweep_id, error = %e, "illegal transition while stopping deleted sweep");
            Vec::new()
        });
        self.cancel_workers(&workers).await;

        if let Err(e) = self.drive.remove_sweep(sweep_id).await {
            warn!(sweep_id, error = %e, "failed to remove sweep namespace");
        }

        info!(sweep_id, cancelled = workers.len(), "sweep deleted");
        Ok(format!("Deleted the sweep `{sweep_id}`"))
    }

    /// Run one reconciliation pass over every sweep that is not complete.
    ///
    /// Never fails: launch errors become failed trials, poll errors are
    /// retried on the next tick, and store errors are logged.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        // Snapshot the workers to poll.
        let (sweep_ids, polls) = {
            let registry = self.registry.lock();
            let mut sweep_ids = Vec::new();
            let mut polls = Vec::new();
            for sweep in registry.iter().filter(|s| !s.is_complete()) {
                sweep_ids.push(sweep.sweep_id().to_string());
                for (trial_id, worker) in sweep.active_workers() {
                    polls.push((sweep.sweep_id().to_string(), trial_id, worker));
                }
            }
            (sweep_ids, polls)
        };
        summary.sweeps = sweep_ids.len();

        let mut reports = Vec::with_capacity(polls.len());
        for (sweep_id, trial_id, worker) in polls {
            match self.launcher.poll(&worker).await {
                Ok(report) => reports.push((sweep_id, trial_id, worker, report)),
                Err(e @ LaunchError::UnknownWorker { .. }) => {
                    warn!(sweep_id = %sweep_id, trial = trial_id, worker = %worker, "worker lost");
                    let report =
                        WorkerReport::new(WorkerStatus::Failed).with_message(e.to_string());
                    reports.push((sweep_id, trial_id, worker, report));
                }
                Err(e) => {
                    warn!(
                        sweep_id = %sweep_id,
                        trial = trial_id,
                        worker = %worker,
                        error = %e,
                        "poll failed"
                    );
                }
            }
        }
        summary.polled = reports.len();

        // Apply reports, then plan launches into the freed slots.
        let mut dirty = BTreeSet::new();
        let launches: Vec<LaunchRequest> = {
            let mut registry = self.registry.lock();
            for (sweep_id, trial_id, worker, report) in &reports {
                let Some(sweep) = registry.get_mut(sweep_id) else {
                    continue;
                };
                match sweep.apply_report(*trial_id, worker, report) {
                    Ok(true) => {
                        summary.transitions += 1;
                        dirty.insert(sweep_id.clone());
                        let stage = sweep.experiments()[*trial_id].stage();
                        debug!(
                            sweep_id = %sweep_id,
                            trial = trial_id,
                            %stage,
                            "trial stage changed"
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!(
                            sweep_id = %sweep_id,
                            trial = trial_id,
                            error = %e,
                            "protocol violation"
                        )
                    }
                }
            }

            let mut launches = Vec::new();
            for sweep_id in &sweep_ids {
                let Some(sweep) = registry.get_mut(sweep_id) else {
                    continue;
                };
                let planned = sweep.plan_launches();
                if !planned.is_empty() || sweep.refresh_completion() {
                    dirty.insert(sweep_id.clone());
                }
                launches.extend(planned);
            }
            launches
        };

        // Launch in emission order, outside the lock.
        let mut results = Vec::with_capacity(launches.len());
        for request in launches {
            let result = self.launcher.launch(&request).await;
            results.push((request, result));
        }

        let orphans = {
            let mut registry = self.registry.lock();
            let mut orphans = Vec::new();
            for (request, result) in results {
                let component = request.component_name();
                let Some(sweep) = registry.get_mut(&request.sweep_id) else {
                    // Deleted while launching.
                    if let Ok(worker) = result {
                        orphans.push(worker);
                    }
                    continue;
                };
                if let Err(e) = &result {
                    warn!(component = %component, error = %e, "launch failed");
                }
                match sweep.apply_launch(request.trial_id, result) {
                    Ok(LaunchOutcome::Dispatched) => summary.launched += 1,
                    Ok(LaunchOutcome::Failed) => summary.launch_failures += 1,
                    Ok(LaunchOutcome::Orphaned(worker)) => orphans.push(worker),
                    Ok(LaunchOutcome::Discarded) => {}
                    Err(e) => error!(component = %component, error = %e, "protocol violation"),
                }
            }

            for sweep_id in &sweep_ids {
                if let Some(sweep) = registry.get_mut(sweep_id) {
                    if sweep.refresh_completion() {
                        dirty.insert(sweep_id.clone());
                        if !sweep.is_stopped() {
                            summary.completed += 1;
                            info!(
                                sweep_id = %sweep_id,
                                stage = %sweep.stage(),
                                trials_done = sweep.trials_done(),
                                "sweep complete"
                            );
                        }
                    }
                }
            }
            orphans
        };

        if !orphans.is_empty() {
            warn!(count = orphans.len(), "cancelling orphaned workers");
        }
        summary.orphaned = orphans.len();
        self.cancel_workers(&orphans).await;

        let dirty: Vec<String> = dirty.into_iter().collect();
        self.persist_sweeps(&dirty).await;

        if summary.launched > 0 || summary.transitions > 0 || summary.launch_failures > 0 {
            debug!(?summary, "tick");
        }
        summary
    }

    /// Copy-on-read views of every sweep, ordered by id.
    pub fn list_sweeps(&self) -> Vec<SweepView> {
        self.registry.lock().iter().map(Sweep::view).collect()
    }

    pub fn get_sweep(&self, sweep_id: &str) -> SwResult<SweepView> {
        self.registry
            .lock()
            .get(sweep_id)
            .map(Sweep::view)
            .ok_or_else(|| not_found(sweep_id))
    }

    pub fn sweep_ids(&self) -> Vec<String> {
        self.registry.lock().ids()
    }

    /// The dashboard tab followed by one tab per shown sweep.
    pub fn layout(&self) -> Vec<LayoutTab> {
        let registry = self.registry.lock();
        let mut tabs = vec![LayoutTab {
            name: DASHBOARD_TAB.to_string(),
            sweep_id: None,
        }];
        tabs.extend(registry.iter().filter(|s| s.show()).map(|s| LayoutTab {
            name: s.sweep_id().to_string(),
            sweep_id: Some(s.sweep_id().to_string()),
        }));
        tabs
    }

    /// Worker component names whose logs can be shown, per sweep. `None`
    /// covers every sweep.
    pub fn log_targets(&self, sweep_id: Option<&str>) -> SwResult<BTreeMap<String, Vec<String>>> {
        let registry = self.registry.lock();
        match sweep_id {
            Some(id) => {
                let sweep = registry.get(id).ok_or_else(|| not_found(id))?;
                Ok(BTreeMap::from([(id.to_string(), sweep.component_names())]))
            }
            None => Ok(registry
                .iter()
                .map(|s| (s.sweep_id().to_string(), s.component_names()))
                .collect()),
        }
    }

    async fn cancel_workers(&self, workers: &[WorkerRef]) {
        for worker in workers {
            if let Err(e) = self.launcher.cancel(worker).await {
                warn!(worker = %worker, error = %e, "cancel failed");
            }
        }
    }

    /// Write back the records of the given sweeps that still exist.
    async fn persist_sweeps(&self, sweep_ids: &[String]) {
        if sweep_ids.is_empty() {
            return;
        }
        let _persist = self.persist.lock().await;
        let records: Vec<_> = {
            let registry = self.registry.lock();
            sweep_ids
                .iter()
                .filter_map(|id| registry.get(id).map(Sweep::record))
                .collect()
        };
        for record in records {
            if let Err(e) = self.store.put(record.sweep_id(), &record).await {
                warn!(sweep_id = %record.sweep_id(), error = %e, "failed to persist sweep");
            }
        }
    }
}
