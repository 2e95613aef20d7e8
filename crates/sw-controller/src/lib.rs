//! # sw-controller
//!
//! The sweep controller and everything it talks to: worker launchers
//! (process-backed and simulated), record stores, the shared drive, the
//! command queue and the long-running service.

pub mod commands;
pub mod config;
pub mod controller;
pub mod drive;
pub mod launcher;
pub mod process;
pub mod service;
pub mod simulated;
pub mod store;

pub use commands::{
    command_table, spawn_command_loop, CommandHandle, CommandInfo, CommandReply, SweepCommand,
};
pub use config::{LauncherConfig, ServiceConfig};
pub use controller::{LayoutTab, SweepController, SweepRegistry, TickSummary, DASHBOARD_TAB};
pub use drive::SharedDrive;
pub use launcher::{LaunchResult, WorkerLauncher};
pub use process::{ProcessLauncher, ProcessLauncherConfig};
pub use simulated::{SimulatedLauncher, SimulatedLauncherConfig};
pub use store::{JsonFileRecordStore, MemoryRecordStore, RecordStore, StoreResult};
