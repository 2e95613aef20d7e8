//! Worker launcher that runs each trial as a local child process.
//!
//! A trial runs `<program> <args..> <script_path> --name=value ...` with its
//! trial directory on the shared drive as working directory. The process
//! learns where it is through `SWEEPER_SWEEP_ID`, `SWEEPER_TRIAL_ID` and
//! `SWEEPER_TRIAL_DIR`, and reports metrics by writing `metrics.json` there.
//! Its stdout and stderr are captured next to it.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use sw_optimizer::{LaunchRequest, WorkerRef, WorkerReport, WorkerStatus};
use sw_types::LaunchError;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::drive::SharedDrive;
use crate::launcher::{LaunchResult, WorkerLauncher};

/// Command line every trial is started with, ahead of the script path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessLauncherConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ProcessLauncherConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct TrialProcess {
    sweep_id: String,
    trial_id: usize,
    child: Child,
}

#[derive(Debug)]
pub struct ProcessLauncher {
    config: ProcessLauncherConfig,
    drive: SharedDrive,
    children: DashMap<WorkerRef, TrialProcess>,
    next_id: AtomicU64,
}

fn io_error(e: std::io::Error) -> LaunchError {
    LaunchError::Io {
        message: e.to_string(),
    }
}

impl ProcessLauncher {
    pub fn new(config: ProcessLauncherConfig, drive: SharedDrive) -> Self {
        Self {
            config,
            drive,
            children: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Processes started and not yet reported finished or cancelled.
    pub fn tracked(&self) -> usize {
        self.children.len()
    }

    fn log_file(dir: &std::path::Path, name: &str) -> LaunchResult<Stdio> {
        std::fs::File::create(dir.join(name))
            .map(Stdio::from)
            .map_err(io_error)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> LaunchResult<WorkerRef> {
        let dir = self
            .drive
            .ensure_trial_dir(&request.sweep_id, request.trial_id)
            .await
            .map_err(|e| LaunchError::Io {
                message: e.to_string(),
            })?;

        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(&request.script_path)
            .args(request.cli_args())
            .env("SWEEPER_SWEEP_ID", &request.sweep_id)
            .env("SWEEPER_TRIAL_ID", request.trial_id.to_string())
            .env("SWEEPER_TRIAL_DIR", &dir)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Self::log_file(&dir, "stdout.log")?)
            .stderr(Self::log_file(&dir, "stderr.log")?)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Rejected {
                reason: format!("failed to start {}: {e}", self.config.program),
            })?;

        let worker = WorkerRef::new(format!(
            "proc-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        info!(
            worker = %worker,
            component = %request.component_name(),
            pid = child.id(),
            "trial process started"
        );
        self.children.insert(
            worker.clone(),
            TrialProcess {
                sweep_id: request.sweep_id.clone(),
                trial_id: request.trial_id,
                child,
            },
        );
        Ok(worker)
    }

    async fn poll(&self, worker: &WorkerRef) -> LaunchResult<WorkerReport> {
        let (sweep_id, trial_id, status, message) = {
            let mut entry = self
                .children
                .get_mut(worker)
                .ok_or_else(|| LaunchError::UnknownWorker {
                    worker: worker.to_string(),
                })?;
            let process = entry.value_mut();
            let (status, message) = match process.child.try_wait().map_err(io_error)? {
                None => (WorkerStatus::Running, None),
                Some(exit) if exit.success() => (WorkerStatus::Succeeded, None),
                Some(exit) => (WorkerStatus::Failed, Some(format!("trial process {exit}"))),
            };
            (process.sweep_id.clone(), process.trial_id, status, message)
        };

        let metrics = match self.drive.read_metrics(&sweep_id, trial_id).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(worker = %worker, error = %e, "unreadable metrics file");
                HashMap::new()
            }
        };

        // Exit is final and nothing polls a finished trial again.
        if status != WorkerStatus::Running {
            self.children.remove(worker);
        }

        Ok(WorkerReport {
            status,
            metrics,
            message,
        })
    }

    async fn cancel(&self, worker: &WorkerRef) -> LaunchResult<()> {
        let Some((_, mut process)) = self.children.remove(worker) else {
            return Ok(());
        };
        if process.child.try_wait().map_err(io_error)?.is_none() {
            process.child.start_kill().map_err(io_error)?;
            info!(worker = %worker, "trial process killed");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "process"
    }
}
