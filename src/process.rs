use crate::config::{ProgramSpec, Settings};
use crate::cpu::CpuHistory;
use crate::log;
use crate::paths::Paths;
use crate::protocol::ProgramStatus;
use crate::runtime;
use crate::sys;
use chrono::{DateTime, Local};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const REAP_GRACE: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("runtime executable not found: {}", .0.display())]
    RuntimeNotFound(PathBuf),
    #[error("failed to spawn process: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// TrackedProcess
// ---------------------------------------------------------------------------

/// A process the supervisor is responsible for.
///
/// `Owned` children were launched by this supervisor instance and can be
/// polled for exit. `Adopted` pids were recovered from the persisted pid
/// table; only the liveness checker can observe their death.
#[derive(Debug)]
pub enum TrackedProcess {
    Owned { child: Child, pid: u32 },
    Adopted(u32),
}

impl TrackedProcess {
    pub fn pid(&self) -> u32 {
        match self {
            TrackedProcess::Owned { pid, .. } => *pid,
            TrackedProcess::Adopted(pid) => *pid,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, TrackedProcess::Owned { .. })
    }

    /// Non-blocking liveness check, dispatched per variant. For owned
    /// children a clean `try_wait` is double-checked against the process
    /// table, which catches a child killed behind our back but not yet reaped.
    pub fn is_running(&mut self) -> bool {
        match self {
            TrackedProcess::Owned { child, pid } => match child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => sys::is_pid_alive(*pid),
                Err(e) => {
                    debug!("try_wait failed for pid {pid}: {e}");
                    sys::is_pid_alive(*pid)
                }
            },
            TrackedProcess::Adopted(pid) => sys::is_pid_alive(*pid),
        }
    }

    async fn reap(&mut self) {
        if let TrackedProcess::Owned { child, .. } = self {
            let _ = tokio::time::timeout(REAP_GRACE, child.wait()).await;
        }
    }
}

// ---------------------------------------------------------------------------
// ProgramState
// ---------------------------------------------------------------------------

/// Supervisor-owned runtime state of one program. Only mutated while the
/// registry lock is held.
#[derive(Debug, Default)]
pub struct ProgramState {
    pub status: ProgramStatus,
    pub process: Option<TrackedProcess>,
    pub start_time: Option<DateTime<Local>>,
    pub consecutive_failures: u32,
    pub total_restarts: u32,
    pub last_restart: Option<DateTime<Local>>,
    pub is_broken: bool,
    pub user_action_in_progress: bool,
    pub cpu_history: CpuHistory,
}

impl ProgramState {
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(TrackedProcess::pid)
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.process.as_ref()?;
        (Local::now() - self.start_time?).to_std().ok()
    }

    pub fn clear_breaker(&mut self) {
        self.is_broken = false;
        self.consecutive_failures = 0;
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Launches `spec` in its own process group with stdout and stderr appended
/// to the program's log file.
pub fn spawn(
    spec: &ProgramSpec,
    settings: &Settings,
    paths: &Paths,
) -> Result<TrackedProcess, ProcessError> {
    let launch = runtime::resolve(spec, settings, paths)?;

    let log_file = log::open_append(&paths.log_file(&spec.name))?;
    let stderr = log_file.try_clone()?;

    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.args)
        .current_dir(&launch.cwd)
        .envs(&launch.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .kill_on_drop(false);

    let child = cmd.spawn()?;
    let Some(pid) = child.id() else {
        return Err(ProcessError::SpawnFailed(std::io::Error::other(
            "child exited before its pid could be read",
        )));
    };

    Ok(TrackedProcess::Owned { child, pid })
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// SIGTERM to the process group, poll for up to [`STOP_TIMEOUT`], then
/// SIGKILL the group. Runs without the registry lock.
pub async fn terminate(name: &str, mut process: TrackedProcess) {
    let pid = process.pid();
    if !process.is_running() {
        return;
    }

    if let Err(e) = sys::signal_group(pid, Signal::SIGTERM) {
        warn!("failed to send SIGTERM to '{name}' (pid {pid}): {e}");
    }

    let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
    while process.is_running() {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "'{name}' (pid {pid}) did not exit within {}s, sending SIGKILL",
                STOP_TIMEOUT.as_secs()
            );
            if let Err(e) = sys::signal_group(pid, Signal::SIGKILL) {
                warn!("failed to send SIGKILL to '{name}' (pid {pid}): {e}");
            }
            process.reap().await;
            return;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}
