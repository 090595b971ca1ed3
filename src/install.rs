//! Install pipeline for uploaded programs: archive checks and extraction,
//! dependency environment provisioning, dependency installation, and the
//! backup/restore pair that makes updates reversible.
//!
//! Every external step appends its output to the program's own log file
//! between section markers, so a failed install can be diagnosed with
//! `overseer log <name>`.

use crate::config::{RuntimeKind, Settings};
use crate::log;
use crate::runtime;
use crate::sys;
use nix::sys::signal::Signal;
use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const PYTHON_MANIFEST: &str = "requirements.txt";
const NODE_MANIFEST: &str = "package.json";
const PYTHON_ENV_DIR: &str = ".venv";
const NODE_DEPS_DIR: &str = "node_modules";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("archive too large ({size} bytes, limit is {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },
    #[error("archive contains an unsafe path: {0}")]
    UnsafeEntry(String),
    #[error("invalid archive: {0}")]
    InvalidArchive(String),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{step} failed: {detail}")]
    StepFailed { step: String, detail: String },
    #[error("{step} timed out after {}s", .timeout.as_secs())]
    Timeout { step: String, timeout: Duration },
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

pub fn check_size(size: u64, limit: u64) -> Result<(), InstallError> {
    if size > limit {
        return Err(InstallError::TooLarge { size, limit });
    }
    Ok(())
}

/// Rejects absolute paths, drive prefixes and any `..` segment. Both `/` and
/// `\` count as separators.
fn is_safe_entry(name: &str) -> bool {
    if name.starts_with('/') || name.starts_with('\\') {
        return false;
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return false;
    }
    !name.split(['/', '\\']).any(|segment| segment == "..")
}

/// Unpacks a zip archive into `dest`, then lifts the contents of a lone
/// top-level directory up one level.
///
/// Every entry is validated before anything is written, so an unsafe archive
/// leaves `dest` untouched.
pub fn extract_archive(bytes: &[u8], dest: &Path) -> Result<(), InstallError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| InstallError::InvalidArchive(e.to_string()))?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| InstallError::InvalidArchive(e.to_string()))?;
        let name = entry.name().to_string();
        if !is_safe_entry(&name) {
            return Err(InstallError::UnsafeEntry(name));
        }
        let Some(relative) = entry.enclosed_name() else {
            return Err(InstallError::UnsafeEntry(name));
        };
        entries.push(relative);
    }

    fs::create_dir_all(dest)?;
    for (i, relative) in entries.into_iter().enumerate() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| InstallError::InvalidArchive(e.to_string()))?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))?;
        }
    }

    flatten_single_dir(dest)?;
    Ok(())
}

/// Archive shape normalisation: `dest/app/{a,b}` becomes `dest/{a,b}`.
fn flatten_single_dir(dest: &Path) -> io::Result<()> {
    let mut entries = fs::read_dir(dest)?.collect::<io::Result<Vec<_>>>()?;
    if entries.len() != 1 || !entries[0].file_type()?.is_dir() {
        return Ok(());
    }
    let inner = entries.remove(0).path();

    // Move the wrapper out first so a child sharing its name cannot collide.
    let mut holding = dest.as_os_str().to_owned();
    holding.push(".flatten");
    let holding = PathBuf::from(holding);
    fs::rename(&inner, &holding)?;
    for entry in fs::read_dir(&holding)? {
        let entry = entry?;
        fs::rename(entry.path(), dest.join(entry.file_name()))?;
    }
    fs::remove_dir(&holding)
}

/// [`extract_archive`] on the blocking pool, bounded by `timeout`.
///
/// `dest` must be a fresh directory owned by this call. On failure it is
/// removed; after a timeout that happens only once the abandoned extraction
/// has stopped writing.
pub async fn extract_with_timeout(
    bytes: Vec<u8>,
    dest: PathBuf,
    timeout: Duration,
) -> Result<(), InstallError> {
    let target = dest.clone();
    let mut task = tokio::task::spawn_blocking(move || extract_archive(&bytes, &target));
    let result = match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(InstallError::Io(io::Error::other(e))),
        Err(_) => {
            tokio::spawn(async move {
                let _ = task.await;
                if let Err(e) = remove_path(&dest) {
                    warn!("failed to remove {}: {e}", dest.display());
                }
            });
            return Err(InstallError::Timeout {
                step: "archive extraction".to_string(),
                timeout,
            });
        }
    };
    if result.is_err() {
        let _ = remove_path(&dest);
    }
    result
}

/// Extracts a new program's archive into `staging` and moves it to
/// `program_dir` once complete, so a failed or timed-out extraction never
/// leaves anything at `program_dir`.
pub async fn stage_upload(
    bytes: Vec<u8>,
    program_dir: &Path,
    staging: PathBuf,
    timeout: Duration,
) -> Result<(), InstallError> {
    remove_path(&staging)?;
    extract_with_timeout(bytes, staging.clone(), timeout).await?;
    if let Err(e) = fs::rename(&staging, program_dir) {
        let _ = remove_path(&staging);
        return Err(e.into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Directory copies
// ---------------------------------------------------------------------------

/// Recursive copy that recreates symlinks instead of following them.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());

        if file_type.is_symlink() {
            let link = fs::read_link(&from)?;
            std::os::unix::fs::symlink(link, &to)?;
        } else if file_type.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Directory entries an update must carry over from the old copy.
pub fn preserved_entries(kind: RuntimeKind) -> &'static [&'static str] {
    match kind {
        RuntimeKind::Python => &[PYTHON_ENV_DIR],
        RuntimeKind::Node => &[NODE_DEPS_DIR],
    }
}

pub fn backup(program_dir: &Path, backup_dir: &Path) -> io::Result<()> {
    remove_path(backup_dir)?;
    copy_dir(program_dir, backup_dir)
}

/// Puts the backup back in place of whatever the failed update left behind.
pub fn restore(program_dir: &Path, backup_dir: &Path) -> io::Result<()> {
    remove_path(program_dir)?;
    fs::rename(backup_dir, program_dir)
}

pub fn discard_backup(backup_dir: &Path) {
    if let Err(e) = remove_path(backup_dir) {
        warn!("failed to remove backup {}: {e}", backup_dir.display());
    }
}

/// Replaces the contents of `program_dir` with those of `staging`, keeping
/// the entries named in `keep`. `staging` is consumed.
pub fn swap_in(program_dir: &Path, staging: &Path, keep: &[&str]) -> io::Result<()> {
    for entry in fs::read_dir(program_dir)? {
        let entry = entry?;
        if keep.iter().any(|k| entry.file_name() == *k) {
            continue;
        }
        remove_path(&entry.path())?;
    }

    for entry in fs::read_dir(staging)? {
        let entry = entry?;
        let target = program_dir.join(entry.file_name());
        if target.exists() {
            // A kept entry wins over one shipped in the archive.
            debug!("keeping existing {}", target.display());
            remove_path(&entry.path())?;
            continue;
        }
        fs::rename(entry.path(), target)?;
    }
    fs::remove_dir(staging)
}

/// Stages a new archive for `program_dir`: extract into `staging`, back the
/// current copy up to `backup_dir`, then swap the new files in.
///
/// On error the program directory is as it was before the call and no
/// staging or backup directory is left behind.
pub async fn stage_update(
    bytes: Vec<u8>,
    program_dir: PathBuf,
    staging: PathBuf,
    backup_dir: PathBuf,
    kind: RuntimeKind,
    timeout: Duration,
) -> Result<(), InstallError> {
    remove_path(&staging)?;
    extract_with_timeout(bytes, staging.clone(), timeout).await?;

    let result = tokio::task::spawn_blocking(move || -> io::Result<()> {
        if let Err(e) = backup(&program_dir, &backup_dir) {
            let _ = remove_path(&backup_dir);
            let _ = remove_path(&staging);
            return Err(e);
        }
        if let Err(e) = swap_in(&program_dir, &staging, preserved_entries(kind)) {
            let _ = remove_path(&staging);
            restore(&program_dir, &backup_dir)?;
            return Err(e);
        }
        Ok(())
    })
    .await
    .map_err(io::Error::other)?;

    Ok(result?)
}

// ---------------------------------------------------------------------------
// External steps
// ---------------------------------------------------------------------------

/// Everything a background install needs, captured before the registry lock
/// is released.
#[derive(Debug, Clone)]
pub struct InstallJob {
    pub name: String,
    pub kind: RuntimeKind,
    pub program_dir: PathBuf,
    /// Dependency environment for python programs.
    pub env_dir: PathBuf,
    pub log: PathBuf,
    pub settings: Settings,
}

/// Runs one external command with output appended to `log_path`, killing
/// its process group if it outlives `timeout`.
pub async fn run_step(
    log_path: &Path,
    title: &str,
    program: &Path,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<(), InstallError> {
    log::append_section(log_path, title)?;
    log::append(
        log_path,
        &format!("$ {} {}\n", program.display(), args.join(" ")),
    )?;

    let out = log::open_append(log_path)?;
    let err = out.try_clone()?;
    let spawned = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .process_group(0)
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            log::append(log_path, &format!("[FAILED] {title}: {e}\n"))?;
            return Err(InstallError::StepFailed {
                step: title.to_string(),
                detail: e.to_string(),
            });
        }
    };

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => {
            log::append(log_path, &format!("[OK] {title}\n"))?;
            Ok(())
        }
        Ok(Ok(status)) => {
            log::append(log_path, &format!("[FAILED] {title}: {status}\n"))?;
            Err(InstallError::StepFailed {
                step: title.to_string(),
                detail: status.to_string(),
            })
        }
        Ok(Err(e)) => {
            log::append(log_path, &format!("[FAILED] {title}: {e}\n"))?;
            Err(InstallError::StepFailed {
                step: title.to_string(),
                detail: e.to_string(),
            })
        }
        Err(_) => {
            if let Some(pid) = child.id()
                && let Err(e) = sys::signal_group(pid, Signal::SIGKILL)
            {
                warn!("failed to kill timed out step '{title}' (pid {pid}): {e}");
            }
            let _ = child.wait().await;
            log::append(
                log_path,
                &format!("[FAILED] {title}: timed out after {}s\n", timeout.as_secs()),
            )?;
            Err(InstallError::Timeout {
                step: title.to_string(),
                timeout,
            })
        }
    }
}

/// Creates the python environment unless it already exists. Node programs
/// keep dependencies in `node_modules` and need no separate environment.
pub async fn provision(job: &InstallJob) -> Result<(), InstallError> {
    if job.kind != RuntimeKind::Python {
        return Ok(());
    }
    if runtime::env_python(&job.env_dir).exists() {
        log::append(
            &job.log,
            &format!(
                "Using existing environment at {}\n",
                job.env_dir.display()
            ),
        )?;
        return Ok(());
    }

    let python = PathBuf::from(&job.settings.python);
    run_step(
        &job.log,
        "Creating virtual environment",
        &python,
        &[
            "-m".to_string(),
            "venv".to_string(),
            job.env_dir.to_string_lossy().into_owned(),
        ],
        &job.program_dir,
        job.settings.provision_timeout,
    )
    .await
}

/// Installs from the runtime's manifest when one is present.
pub async fn install_deps(job: &InstallJob) -> Result<(), InstallError> {
    let dir = &job.program_dir;
    match job.kind {
        RuntimeKind::Python => {
            if !dir.join(PYTHON_MANIFEST).is_file() {
                log::append(
                    &job.log,
                    "No requirements.txt found, skipping dependency installation\n",
                )?;
                return Ok(());
            }
            let python = runtime::env_python(&job.env_dir);
            run_step(
                &job.log,
                "Installing dependencies from requirements.txt",
                &python,
                &[
                    "-m".to_string(),
                    "pip".to_string(),
                    "install".to_string(),
                    "-r".to_string(),
                    PYTHON_MANIFEST.to_string(),
                ],
                dir,
                job.settings.dependency_timeout,
            )
            .await
        }
        RuntimeKind::Node => {
            if !dir.join(NODE_MANIFEST).is_file() {
                log::append(
                    &job.log,
                    "No package.json found, skipping dependency installation\n",
                )?;
                return Ok(());
            }
            let npm = npm_executable(&job.settings).ok_or_else(|| InstallError::StepFailed {
                step: "npm install".to_string(),
                detail: format!("`{}` not found", job.settings.npm),
            })?;
            run_step(
                &job.log,
                "Installing dependencies from package.json",
                &npm,
                &["install".to_string()],
                dir,
                job.settings.dependency_timeout,
            )
            .await
        }
    }
}

fn npm_executable(settings: &Settings) -> Option<PathBuf> {
    if settings.npm.contains('/') {
        let npm = PathBuf::from(&settings.npm);
        return npm.exists().then_some(npm);
    }
    runtime::find_on_path(&settings.npm)
}

/// Provision then install dependencies, with a closing result line in the
/// program log.
pub async fn install(job: &InstallJob, title: &str) -> Result<(), InstallError> {
    log::append_section(
        &job.log,
        &format!("{title}: {} ({})", job.name, job.kind),
    )?;

    let result: Result<(), InstallError> = async {
        provision(job).await?;
        install_deps(job).await
    }
    .await;

    match &result {
        Ok(()) => log::append(&job.log, &format!("[OK] {title} completed\n"))?,
        Err(e) => log::append(&job.log, &format!("[FAILED] {title}: {e}\n"))?,
    }
    result
}
