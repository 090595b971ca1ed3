use crate::manager::Manager;
use crate::paths::Paths;
use crate::pid;
use crate::protocol;
use crate::sys;
use color_eyre::eyre::bail;
use std::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Hosts the supervisor on `paths` until a `kill` request, SIGINT or SIGTERM.
/// Children are left running on exit and adopted by the next run.
pub async fn run(paths: Paths) -> color_eyre::Result<()> {
    fs::create_dir_all(paths.base_dir())?;

    if pid::is_supervisor_running(&paths)? {
        bail!(
            "a supervisor is already running for {}",
            paths.base_dir().display()
        );
    }

    let manager = Manager::load(paths.clone())?;
    pid::write_pid_file(&paths)?;

    // Remove stale socket file if it exists
    let socket_path = paths.socket_file();
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;

    let adopted = manager.restore_pids().await;
    if !adopted.is_empty() {
        info!("adopted running programs: {}", adopted.join(", "));
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let monitor = manager.spawn_monitor(shutdown_rx.clone());
    info!("supervisor listening on {}", socket_path.display());

    let result = run_accept_loop(&manager, &listener, &shutdown_tx, &mut shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = monitor.await {
        warn!("monitor task ended abnormally: {e}");
    }
    manager.shutdown().await;

    // Cleanup
    let _ = fs::remove_file(paths.socket_file());
    pid::remove_pid_file(&paths);

    result
}

async fn run_accept_loop(
    manager: &Manager,
    listener: &UnixListener,
    shutdown_tx: &watch::Sender<bool>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> color_eyre::Result<()> {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _addr) = accept_result?;
                let tx = shutdown_tx.clone();
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &tx, &manager).await {
                        error!("connection error: {e}");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("kill requested");
                    break;
                }
            }
            result = sys::signal_shutdown() => {
                result?;
                info!("termination signal received");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: tokio::net::UnixStream,
    shutdown_tx: &watch::Sender<bool>,
    manager: &Manager,
) -> color_eyre::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    buf_reader.read_line(&mut line).await?;

    if line.is_empty() {
        return Ok(());
    }

    let response = match protocol::decode_request(&line) {
        Ok(request) => manager.dispatch(request, shutdown_tx).await,
        Err(e) => protocol::Response::error(format!("bad request: {e}")),
    };
    let encoded = protocol::encode_response(&response)?;
    writer.write_all(&encoded).await?;
    writer.shutdown().await?;

    Ok(())
}
