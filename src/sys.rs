use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use std::io;

// =========================================================================
// Liveness
// =========================================================================

/// Reports whether `pid` refers to a live, non-zombie process.
///
/// Prefers OS process-table inspection through `sysinfo`; on platforms it
/// does not support, falls back to a `kill(pid, 0)` existence probe.
pub fn is_pid_alive(pid: u32) -> bool {
    if to_nix_pid(pid).is_none() {
        return false;
    }
    if sysinfo::IS_SUPPORTED_SYSTEM {
        inspect_pid(pid)
    } else {
        probe_pid(pid).unwrap_or(false)
    }
}

fn inspect_pid(pid: u32) -> bool {
    use sysinfo::{ProcessStatus, ProcessesToUpdate, System};

    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

/// Existence probe via signal 0. `EPERM` means the process exists but
/// belongs to someone else.
pub fn probe_pid(pid: u32) -> io::Result<bool> {
    let Some(pid) = to_nix_pid(pid) else {
        return Ok(false);
    };
    match signal::kill(pid, None) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(Errno::EPERM) => Ok(true),
        Err(e) => Err(io::Error::other(e)),
    }
}

fn to_nix_pid(pid: u32) -> Option<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

// =========================================================================
// Signalling
// =========================================================================

/// Sends `sig` to the whole process group led by `pid`.
///
/// Children are launched as group leaders, so the group id normally equals
/// the pid. If the process shares the supervisor's own group (an adopted
/// process started some other way), only the process itself is signalled.
/// A process that is already gone is not an error.
pub fn signal_group(pid: u32, sig: Signal) -> io::Result<()> {
    let Some(target) = to_nix_pid(pid) else {
        return Ok(());
    };

    let result = match unistd::getpgid(Some(target)) {
        Ok(pgid) if pgid != unistd::getpgrp() => signal::killpg(pgid, sig),
        Ok(_) => signal::kill(target, sig),
        Err(Errno::ESRCH) => return Ok(()),
        Err(_) => signal::kill(target, sig),
    };

    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

// =========================================================================
// Shutdown signals
// =========================================================================

/// Resolves on the first SIGTERM or SIGINT delivered to the supervisor.
pub async fn signal_shutdown() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}
