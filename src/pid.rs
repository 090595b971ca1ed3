use crate::paths::Paths;
use crate::sys;
use std::fs;
use std::io;

pub fn write_pid_file(paths: &Paths) -> io::Result<()> {
    fs::create_dir_all(paths.base_dir())?;
    fs::write(paths.pid_file(), std::process::id().to_string())
}

pub fn read_pid_file(paths: &Paths) -> Option<u32> {
    fs::read_to_string(paths.pid_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn remove_pid_file(paths: &Paths) {
    let _ = fs::remove_file(paths.pid_file());
}

/// Whether another supervisor already owns this base directory. A pid file
/// left behind by a dead supervisor is removed.
pub fn is_supervisor_running(paths: &Paths) -> io::Result<bool> {
    let Some(pid) = read_pid_file(paths) else {
        return Ok(false);
    };
    if sys::probe_pid(pid)? {
        return Ok(true);
    }
    remove_pid_file(paths);
    Ok(false)
}
