//! Worker launcher abstraction.
//!
//! A launcher starts one worker per trial, reports its progress when polled
//! and cancels it on request. Implementations may drive a remote cluster,
//! spawn local processes (see [`crate::process::ProcessLauncher`]) or
//! simulate everything in-process (see [`crate::simulated::SimulatedLauncher`]).

use async_trait::async_trait;
use sw_optimizer::{LaunchRequest, WorkerRef, WorkerReport};
use sw_types::LaunchError;

/// Result alias for launcher operations.
pub type LaunchResult<T> = Result<T, LaunchError>;

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for `request`. The returned handle identifies it in
    /// later `poll`/`cancel` calls.
    async fn launch(&self, request: &LaunchRequest) -> LaunchResult<WorkerRef>;

    /// Current status of a worker plus any metrics it has reported.
    ///
    /// Returns [`LaunchError::UnknownWorker`] if the handle was never issued
    /// or has been forgotten.
    async fn poll(&self, worker: &WorkerRef) -> LaunchResult<WorkerReport>;

    /// Stop a worker. Cancelling a finished worker is not an error.
    async fn cancel(&self, worker: &WorkerRef) -> LaunchResult<()>;

    /// Human-readable launcher name.
    fn name(&self) -> &str;
}
