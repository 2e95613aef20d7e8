//! Service configuration.
//!
//! Loaded from an optional JSON file, then overridden from `SWEEPER_*`
//! environment variables, then validated.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sw_types::SwResult;

use crate::process::ProcessLauncherConfig;
use crate::simulated::SimulatedLauncherConfig;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SWEEPER_CONFIG";

/// Which worker launcher the service runs trials with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LauncherConfig {
    /// Local child processes.
    Process(ProcessLauncherConfig),
    /// In-process sandbox; nothing is executed.
    Simulated(SimulatedLauncherConfig),
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self::Process(ProcessLauncherConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address of the JSON-lines command listener.
    pub listen_addr: String,
    pub tick_interval_ms: u64,
    /// Directory of durable sweep records. Records are kept in memory only
    /// when unset.
    pub store_dir: Option<PathBuf>,
    pub drive_root: PathBuf,
    /// Commands buffered ahead of the controller before senders wait.
    pub command_queue_depth: usize,
    pub launcher: LauncherConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7501".to_string(),
            tick_interval_ms: 1000,
            store_dir: None,
            drive_root: PathBuf::from(".sweeper/drive"),
            command_queue_depth: 64,
            launcher: LauncherConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    pub fn with_drive_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.drive_root = root.into();
        self
    }

    pub fn with_launcher(mut self, launcher: LauncherConfig) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> SwResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            sw_types::config_error!("cannot read config file {}: {e}", path.display())
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| sw_types::config_error!("invalid config file {}: {e}", path.display()))
    }

    /// File (if `SWEEPER_CONFIG` or `path` names one), then environment, then
    /// validation.
    pub fn load(path: Option<&Path>) -> SwResult<Self> {
        let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SWEEPER_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> SwResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("SWEEPER_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(ms) = lookup("SWEEPER_TICK_INTERVAL_MS") {
            self.tick_interval_ms = ms
                .parse()
                .map_err(|_| {
                    sw_types::config_error!("SWEEPER_TICK_INTERVAL_MS is not a number: {ms}")
                })?;
        }
        if let Some(dir) = lookup("SWEEPER_STORE_DIR") {
            self.store_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(root) = lookup("SWEEPER_DRIVE_ROOT") {
            self.drive_root = PathBuf::from(root);
        }
        if let Some(depth) = lookup("SWEEPER_COMMAND_QUEUE_DEPTH") {
            self.command_queue_depth = depth.parse().map_err(|_| {
                sw_types::config_error!("SWEEPER_COMMAND_QUEUE_DEPTH is not a number: {depth}")
            })?;
        }
        if let Some(kind) = lookup("SWEEPER_LAUNCHER") {
            self.launcher = match kind.as_str() {
                "process" => match &self.launcher {
                    LauncherConfig::Process(_) => self.launcher.clone(),
                    LauncherConfig::Simulated(_) => LauncherConfig::default(),
                },
                "simulated" => match &self.launcher {
                    LauncherConfig::Simulated(_) => self.launcher.clone(),
                    LauncherConfig::Process(_) => {
                        LauncherConfig::Simulated(SimulatedLauncherConfig::default())
                    }
                },
                other => return Err(sw_types::config_error!("unknown launcher kind: {other}")),
            };
        }
        if let Some(program) = lookup("SWEEPER_LAUNCHER_PROGRAM") {
            if let LauncherConfig::Process(process) = &mut self.launcher {
                process.program = program;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> SwResult<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| sw_types::config_error!("listen_addr {:?}: {e}", self.listen_addr))?;
        if self.tick_interval_ms == 0 {
            return Err(sw_types::config_error!("tick_interval_ms must be positive"));
        }
        if self.command_queue_depth == 0 {
            return Err(sw_types::config_error!("command_queue_depth must be positive"));
        }
        if let LauncherConfig::Process(process) = &self.launcher {
            if process.program.trim().is_empty() {
                return Err(sw_types::config_error!("launcher program is empty"));
            }
        }
        Ok(())
    }
}
