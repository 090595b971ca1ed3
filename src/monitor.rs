use crate::paths::Paths;
use crate::process::TrackedProcess;
use crate::protocol::ProgramStatus;
use crate::registry::Registry;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// One reconciliation pass over every program, then CPU sampling and log
/// rotation for all of them. The caller holds the registry lock throughout,
/// including the restart delay before a relaunch.
pub async fn tick(registry: &mut Registry, paths: &Paths) {
    for name in registry.names() {
        reconcile(registry, &name, paths).await;
    }
    registry.sample_cpu();
    registry.rotate_logs(paths);
}

async fn reconcile(registry: &mut Registry, name: &str, paths: &Paths) {
    let max_failures = registry.settings.max_failures;
    let failure_reset = registry.settings.failure_reset;
    let restart_delay = registry.settings.restart_delay;

    let Some(program) = registry.get_mut(name) else {
        return;
    };
    let supervised = program.spec.enabled && !program.state.is_broken;
    let state = &mut program.state;

    let tracked = state.process.is_some();
    let running = state
        .process
        .as_mut()
        .is_some_and(TrackedProcess::is_running);

    if !supervised {
        // Observed but not supervised: only drop a pid that is known dead.
        if tracked && !running && !state.user_action_in_progress {
            state.process = None;
            if state.status == ProgramStatus::Running {
                state.status = ProgramStatus::Stopped;
            }
        }
        return;
    }

    if tracked && !running {
        if state.user_action_in_progress {
            return;
        }

        state.process = None;
        state.consecutive_failures += 1;
        state.total_restarts += 1;
        state.last_restart = Some(Local::now());
        state.status = ProgramStatus::Restarting;
        warn!(
            "'{name}' exited unexpectedly ({}/{max_failures} consecutive failures)",
            state.consecutive_failures
        );

        if state.consecutive_failures >= max_failures {
            state.is_broken = true;
            state.status = ProgramStatus::Broken;
            error!("'{name}' marked broken after {max_failures} consecutive failures");
            registry.persist_pids(paths);
            return;
        }

        tokio::time::sleep(restart_delay).await;
        let _ = registry.launch(name, paths);
    } else if running {
        if state.consecutive_failures > 0
            && state.uptime().is_some_and(|uptime| uptime >= failure_reset)
        {
            info!(
                "'{name}' stable for {}s, resetting failure counter",
                failure_reset.as_secs()
            );
            state.consecutive_failures = 0;
        }
    } else if !state.user_action_in_progress && state.status == ProgramStatus::Stopped {
        let _ = registry.launch(name, paths);
    }
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

/// Runs [`tick`] every [`TICK_INTERVAL`] until `shutdown_rx` flips to true.
pub fn spawn_monitor(
    registry: Arc<RwLock<Registry>>,
    paths: Paths,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            {
                let mut reg = registry.write().await;
                tick(&mut reg, &paths).await;
            }

            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                _ = shutdown_rx.changed() => {}
            }

            if *shutdown_rx.borrow() {
                return;
            }
        }
    })
}
