//! Simulated (in-process) worker launcher for sandbox mode.
//!
//! Workers are plain table entries: nothing runs. Tests drive them by hand
//! with [`SimulatedLauncher::set_status`], while sandbox runs can let them
//! progress on their own with [`SimulatedLauncherConfig::polls_to_finish`].

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use sw_optimizer::{LaunchRequest, WorkerRef, WorkerReport, WorkerStatus};
use sw_types::LaunchError;
use tokio::sync::Semaphore;
use tracing::info;

use crate::launcher::{LaunchResult, WorkerLauncher};

/// Configuration for the simulated launcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedLauncherConfig {
    /// Workers succeed on their own after this many polls. `None` leaves them
    /// `Pending` until told otherwise.
    pub polls_to_finish: Option<u32>,
}

#[derive(Debug, Clone)]
struct SimWorker {
    request: LaunchRequest,
    status: WorkerStatus,
    metrics: HashMap<String, f64>,
    message: Option<String>,
    polls: u32,
}

impl SimWorker {
    /// Advance an auto-progressing worker by one poll.
    fn advance(&mut self, polls_to_finish: u32) {
        if matches!(self.status, WorkerStatus::Succeeded | WorkerStatus::Failed) {
            return;
        }
        self.polls += 1;
        if self.polls >= polls_to_finish {
            self.status = WorkerStatus::Succeeded;
            // Later trials score better, so sandbox sweeps have a visible best.
            let score = 1.0 / (self.request.trial_id as f64 + 1.0);
            self.metrics.insert(self.request.objective.clone(), score);
        } else {
            self.status = WorkerStatus::Running;
        }
    }
}

/// A fully in-process launcher that records every call it receives.
#[derive(Debug)]
pub struct SimulatedLauncher {
    config: SimulatedLauncherConfig,
    workers: DashMap<WorkerRef, SimWorker>,
    next_id: AtomicU64,
    failures_pending: AtomicUsize,
    launched: Mutex<Vec<LaunchRequest>>,
    cancelled: Mutex<Vec<WorkerRef>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl SimulatedLauncher {
    pub fn new(config: SimulatedLauncherConfig) -> Self {
        Self {
            config,
            workers: DashMap::new(),
            next_id: AtomicU64::new(0),
            failures_pending: AtomicUsize::new(0),
            launched: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    /// Create a simulated launcher whose workers only move when told to.
    pub fn with_defaults() -> Self {
        Self::new(SimulatedLauncherConfig::default())
    }

    /// Overwrite a worker's status. Returns `false` for unknown handles.
    pub fn set_status(&self, worker: &WorkerRef, status: WorkerStatus) -> bool {
        match self.workers.get_mut(worker) {
            Some(mut entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Mark a worker failed with `message`.
    pub fn fail(&self, worker: &WorkerRef, message: &str) -> bool {
        match self.workers.get_mut(worker) {
            Some(mut entry) => {
                entry.status = WorkerStatus::Failed;
                entry.message = Some(message.to_string());
                true
            }
            None => false,
        }
    }

    pub fn set_metric(&self, worker: &WorkerRef, name: &str, value: f64) -> bool {
        match self.workers.get_mut(worker) {
            Some(mut entry) => {
                entry.metrics.insert(name.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Drop a worker so later polls report it as unknown.
    pub fn forget(&self, worker: &WorkerRef) -> bool {
        self.workers.remove(worker).is_some()
    }

    /// Reject the next `count` launch requests.
    pub fn fail_next_launches(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Block launches until [`release_launches`](Self::release_launches)
    /// hands out permits.
    pub fn hold_launches(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held launches through.
    pub fn release_launches(&self, count: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(count);
        }
    }

    /// Handle issued for a given trial, if it was launched.
    pub fn worker_for(&self, sweep_id: &str, trial_id: usize) -> Option<WorkerRef> {
        self.workers
            .iter()
            .find(|entry| entry.request.sweep_id == sweep_id && entry.request.trial_id == trial_id)
            .map(|entry| entry.key().clone())
    }

    /// Every request accepted so far, in arrival order.
    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.launched.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<WorkerRef> {
        self.cancelled.lock().clone()
    }

    /// Workers that are neither finished nor cancelled.
    pub fn live_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|entry| matches!(entry.status, WorkerStatus::Pending | WorkerStatus::Running))
            .count()
    }
}

#[async_trait]
impl WorkerLauncher for SimulatedLauncher {
    async fn launch(&self, request: &LaunchRequest) -> LaunchResult<WorkerRef> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| LaunchError::Unavailable {
                    message: e.to_string(),
                })?
                .forget();
        }

        let rejected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(LaunchError::Rejected {
                reason: format!("simulated rejection of {}", request.component_name()),
            });
        }

        let worker = WorkerRef::new(format!(
            "sim-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        self.workers.insert(
            worker.clone(),
            SimWorker {
                request: request.clone(),
                status: WorkerStatus::Pending,
                metrics: HashMap::new(),
                message: None,
                polls: 0,
            },
        );
        self.launched.lock().push(request.clone());

        info!(
            worker = %worker,
            component = %request.component_name(),
            "simulated worker launched"
        );
        Ok(worker)
    }

    async fn poll(&self, worker: &WorkerRef) -> LaunchResult<WorkerReport> {
        let mut entry = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| LaunchError::UnknownWorker {
                worker: worker.to_string(),
            })?;

        if let Some(polls_to_finish) = self.config.polls_to_finish {
            entry.advance(polls_to_finish);
        }

        Ok(WorkerReport {
            status: entry.status,
            metrics: entry.metrics.clone(),
            message: entry.message.clone(),
        })
    }

    async fn cancel(&self, worker: &WorkerRef) -> LaunchResult<()> {
        if let Some(mut entry) = self.workers.get_mut(worker) {
            if matches!(entry.status, WorkerStatus::Pending | WorkerStatus::Running) {
                entry.status = WorkerStatus::Failed;
                entry.message = Some("cancelled".to_string());
            }
        }
        self.cancelled.lock().push(worker.clone());
        info!(worker = %worker, "simulated worker cancelled");
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
