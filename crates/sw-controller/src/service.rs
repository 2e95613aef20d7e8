//! Long-running service: the reconciliation loop plus a TCP listener that
//! accepts one JSON command per line and answers with one JSON reply per
//! line.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sw_types::SwResult;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::commands::{spawn_command_loop, CommandHandle, CommandReply, SweepCommand};
use crate::config::{LauncherConfig, ServiceConfig};
use crate::controller::SweepController;
use crate::drive::SharedDrive;
use crate::launcher::WorkerLauncher;
use crate::process::ProcessLauncher;
use crate::simulated::SimulatedLauncher;
use crate::store::{JsonFileRecordStore, MemoryRecordStore, RecordStore};

/// Tick the controller every `interval` until `shutdown` flips to `true`.
/// A tick that overruns the interval delays the next one instead of
/// triggering a burst.
pub fn spawn_tick_loop(
    controller: SweepController,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    controller.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("tick loop finished");
    })
}

/// Pause after a failed `accept`, so a full file table is not spun on.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Accept connections until `shutdown` flips to `true`. Failed accepts are
/// logged and retried.
pub async fn serve(
    listener: TcpListener,
    commands: CommandHandle,
    shutdown: watch::Receiver<bool>,
) {
    let listener = &listener;
    serve_connections(move || listener.accept(), commands, shutdown).await;
}

async fn serve_connections<A, F>(
    mut accept: A,
    commands: CommandHandle,
    mut shutdown: watch::Receiver<bool>,
) where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        tokio::select! {
            accepted = accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "client connected");
                    let commands = commands.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, commands).await {
                            warn!(%peer, error = %e, "client connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept a connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn handle_connection(socket: TcpStream, commands: CommandHandle) -> SwResult<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<SweepCommand>(&line) {
            Ok(command) => commands.request(command).await,
            Err(e) => CommandReply::Error {
                message: format!("invalid command: {e}"),
            },
        };
        let mut bytes = serde_json::to_vec(&reply)?;
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
    }
    Ok(())
}

/// Build the launcher, record store and drive described by `config`.
pub fn build_controller(config: &ServiceConfig) -> SwResult<SweepController> {
    let drive = SharedDrive::new(&config.drive_root)?;

    let store: Arc<dyn RecordStore> = match &config.store_dir {
        Some(dir) => Arc::new(JsonFileRecordStore::new(dir)?),
        None => Arc::new(MemoryRecordStore::new()),
    };

    let launcher: Arc<dyn WorkerLauncher> = match &config.launcher {
        LauncherConfig::Process(process) => {
            Arc::new(ProcessLauncher::new(process.clone(), drive.clone()))
        }
        LauncherConfig::Simulated(simulated) => Arc::new(SimulatedLauncher::new(simulated.clone())),
    };

    info!(
        launcher = launcher.name(),
        store = store.name(),
        drive = %drive.root().display(),
        "controller configured"
    );
    Ok(SweepController::new(launcher, store, drive))
}

/// Run the whole service until `shutdown` flips to `true`.
pub async fn run(config: ServiceConfig, shutdown: watch::Receiver<bool>) -> SwResult<()> {
    config.validate()?;
    let controller = build_controller(&config)?;
    controller.restore().await?;

    let (commands, command_task) =
        spawn_command_loop(controller.clone(), config.command_queue_depth);
    let tick_task = spawn_tick_loop(controller, config.tick_interval(), shutdown.clone());

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(
        addr = %config.listen_addr,
        tick_interval_ms = config.tick_interval_ms,
        "sweeper service listening"
    );

    serve(listener, commands, shutdown).await;

    // Open connections keep command handles alive, so the queue never drains.
    if let Err(e) = tick_task.await {
        warn!(error = %e, "tick loop panicked");
    }
    command_task.abort();
    info!("sweeper service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedLauncherConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn sandbox_config(root: &std::path::Path) -> ServiceConfig {
        ServiceConfig::default()
            .with_drive_root(root.join("drive"))
            .with_store_dir(root.join("records"))
            .with_tick_interval(Duration::from_millis(10))
            .with_launcher(LauncherConfig::Simulated(SimulatedLauncherConfig {
                polls_to_finish: Some(1),
            }))
    }

    #[tokio::test]
    async fn test_tick_loop_drives_sweeps_to_completion() {
        let temp_dir = tempdir().unwrap();
        let controller = build_controller(&sandbox_config(temp_dir.path())).unwrap();
        let space = sw_optimizer::SearchSpace::new().add_int("model.layers", 1, 8);
        controller
            .run_sweep(sw_optimizer::SweepConfig::new("s1", "train.py", space).with_budget(4, 2))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_tick_loop(controller.clone(), Duration::from_millis(5), shutdown_rx);

        for _ in 0..400 {
            if controller.get_sweep("s1").unwrap().trials_done == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let view = controller.get_sweep("s1").unwrap();
        assert_eq!(view.trials_done, 4);
        assert_eq!(view.stage, sw_types::Stage::Succeeded);
        assert_eq!(view.best_trial, Some(3));
    }

    #[tokio::test]
    async fn test_json_lines_session() {
        let temp_dir = tempdir().unwrap();
        let controller = build_controller(&sandbox_config(temp_dir.path())).unwrap();
        let (commands, _command_task) = spawn_command_loop(controller, 8);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, commands, shutdown_rx));

        let socket = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = socket.into_split();
        let mut replies = BufReader::new(reader).lines();

        let run_sweep = serde_json::json!({
            "command": "run_sweep",
            "config": {
                "sweep_id": "s1",
                "script_path": "train.py",
                "search_space": {"parameters": [{
                    "name": "lr",
                    "kind": {"distribution": "uniform", "low": 0.1, "high": 0.2}
                }]},
                "n_trials": 2
            }
        })
        .to_string();
        let requests = [
            run_sweep.as_str(),
            r#"{"command":"show_sweeps","sweep_id":"s1"}"#,
            r#"{"command":"delete_sweep","sweep_id":"s1"}"#,
            r#"{"command":"delete_sweep","sweep_id":"s1"}"#,
            "not json",
        ];

        let mut answers = Vec::new();
        for request in requests {
            writer.write_all(format!("{request}\n").as_bytes()).await.unwrap();
            let line = replies.next_line().await.unwrap().unwrap();
            answers.push(serde_json::from_str::<serde_json::Value>(&line).unwrap());
        }

        assert_eq!(answers[0]["reply"], "sweep_started");
        assert_eq!(answers[0]["sweep_id"], "s1");
        assert_eq!(answers[1]["reply"], "sweeps");
        assert_eq!(answers[1]["layout"][0]["name"], "Dashboard");
        assert_eq!(answers[2]["message"], "Deleted the sweep `s1`");
        assert_eq!(answers[3]["reply"], "error");
        assert!(answers[3]["message"].as_str().unwrap().contains("not found"));
        assert!(answers[4]["message"].as_str().unwrap().starts_with("invalid command"));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_the_listener() {
        let temp_dir = tempdir().unwrap();
        let controller = build_controller(&sandbox_config(temp_dir.path())).unwrap();
        let (commands, _command_task) = spawn_command_loop(controller, 8);

        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let failures = Arc::new(AtomicUsize::new(3));
        let accept = {
            let failures = failures.clone();
            move || {
                let listener = listener.clone();
                let failures = failures.clone();
                async move {
                    let failing = failures
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    if failing {
                        return Err(io::Error::new(io::ErrorKind::Other, "too many open files"));
                    }
                    listener.accept().await
                }
            }
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve_connections(accept, commands, shutdown_rx));

        let socket = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = socket.into_split();
        let mut replies = BufReader::new(reader).lines();
        writer.write_all(b"{\"command\":\"show_sweeps\"}\n").await.unwrap();
        let line = replies.next_line().await.unwrap().unwrap();
        let reply: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(reply["reply"], "sweeps");
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }
}
