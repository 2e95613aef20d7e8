//! Command surface of the controller.
//!
//! Commands travel as JSON objects tagged by `"command"` and are answered
//! with a reply tagged by `"reply"`. They reach the controller through a
//! bounded queue ([`CommandHandle`]) and are executed one at a time in
//! arrival order, independently of the reconciliation tick.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sw_optimizer::{SweepConfig, SweepView};
use sw_types::SwResult;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::controller::{LayoutTab, SweepController};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SweepCommand {
    RunSweep {
        config: SweepConfig,
    },
    StopSweep {
        sweep_id: String,
    },
    DeleteSweep {
        sweep_id: String,
    },
    /// One sweep, or all of them.
    ShowSweeps {
        #[serde(default)]
        sweep_id: Option<String>,
    },
    ShowLogs {
        #[serde(default)]
        sweep_id: Option<String>,
    },
}

impl SweepCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunSweep { .. } => "run sweep",
            Self::StopSweep { .. } => "stop sweep",
            Self::DeleteSweep { .. } => "delete sweep",
            Self::ShowSweeps { .. } => "show sweeps",
            Self::ShowLogs { .. } => "show logs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum CommandReply {
    SweepStarted {
        sweep_id: String,
    },
    SweepStopped {
        sweep_id: String,
    },
    SweepDeleted {
        message: String,
    },
    Sweeps {
        sweeps: Vec<SweepView>,
        layout: Vec<LayoutTab>,
    },
    /// Worker component names per sweep.
    LogTargets {
        targets: BTreeMap<String, Vec<String>>,
    },
    Error {
        message: String,
    },
}

impl CommandReply {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl From<SwResult<CommandReply>> for CommandReply {
    fn from(result: SwResult<CommandReply>) -> Self {
        result.unwrap_or_else(|e| Self::Error {
            message: e.to_string(),
        })
    }
}

/// Name and help text of a client command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// Every command the controller accepts.
pub fn command_table() -> Vec<CommandInfo> {
    vec![
        CommandInfo {
            name: "run sweep",
            description: "Run a sweep by providing a script, a search space and trial budgets.",
        },
        CommandInfo {
            name: "stop sweep",
            description: "Stop all trials of a sweep.",
        },
        CommandInfo {
            name: "delete sweep",
            description: "Delete a sweep, stopping its trials and removing its files.",
        },
        CommandInfo {
            name: "show sweeps",
            description: "Show all sweeps, or one of them, with their trials.",
        },
        CommandInfo {
            name: "show logs",
            description: "Show the worker components whose logs belong to a sweep.",
        },
    ]
}

/// Execute a single command against the controller.
pub async fn execute(
    controller: &SweepController,
    command: SweepCommand,
) -> SwResult<CommandReply> {
    match command {
        SweepCommand::RunSweep { config } => {
            let sweep_id = controller.run_sweep(config).await?;
            Ok(CommandReply::SweepStarted { sweep_id })
        }
        SweepCommand::StopSweep { sweep_id } => {
            controller.stop_sweep(&sweep_id).await?;
            Ok(CommandReply::SweepStopped { sweep_id })
        }
        SweepCommand::DeleteSweep { sweep_id } => {
            let message = controller.delete_sweep(&sweep_id).await?;
            Ok(CommandReply::SweepDeleted { message })
        }
        SweepCommand::ShowSweeps { sweep_id } => {
            let sweeps = match sweep_id {
                Some(id) => vec![controller.get_sweep(&id)?],
                None => controller.list_sweeps(),
            };
            Ok(CommandReply::Sweeps {
                sweeps,
                layout: controller.layout(),
            })
        }
        SweepCommand::ShowLogs { sweep_id } => {
            let targets = controller.log_targets(sweep_id.as_deref())?;
            Ok(CommandReply::LogTargets { targets })
        }
    }
}

type Envelope = (SweepCommand, oneshot::Sender<CommandReply>);

/// Sending side of the command queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<Envelope>,
}

impl CommandHandle {
    /// Queue a command and wait for its reply.
    pub async fn request(&self, command: SweepCommand) -> CommandReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send((command, reply_tx)).await.is_err() {
            return CommandReply::Error {
                message: "command loop has stopped".to_string(),
            };
        }
        reply_rx.await.unwrap_or_else(|_| CommandReply::Error {
            message: "command dropped without a reply".to_string(),
        })
    }
}

/// Start the task that drains the command queue. It ends once every
/// [`CommandHandle`] has been dropped.
pub fn spawn_command_loop(
    controller: SweepController,
    queue_depth: usize,
) -> (CommandHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Envelope>(queue_depth);

    let task = tokio::spawn(async move {
        while let Some((command, reply_tx)) = rx.recv().await {
            let name = command.name();
            let reply = CommandReply::from(execute(&controller, command).await);
            if let CommandReply::Error { message } = &reply {
                warn!(command = name, error = %message, "command failed");
            } else {
                debug!(command = name, "command handled");
            }
            // The requester may have gone away.
            let _ = reply_tx.send(reply);
        }
        debug!("command loop finished");
    });

    (CommandHandle { tx }, task)
}
