//! Action coordinator: the command and query surface over the registry.
//!
//! Commands validate and mutate under the registry lock and return a
//! [`Response`]. Anything that can block for seconds (terminating a process
//! group, installing dependencies) runs in a tracked background task that
//! re-acquires the lock only to commit its result. While such a task is in
//! flight the program's `user_action_in_progress` flag keeps the monitor's
//! hands off it.

use crate::config::{self, ConfigError, ProgramSpec, RuntimeKind, Settings};
use crate::install::{self, InstallError, InstallJob};
use crate::log;
use crate::monitor;
use crate::paths::{Paths, sanitize_name};
use crate::persist;
use crate::process::{self, ProcessError};
use crate::protocol::{ProgramEdit, ProgramStatus, Request, Response, UploadOptions};
use crate::registry::{Program, Registry};
use crate::runtime;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("program '{0}' not found")]
    NotFound(String),
    #[error("program '{0}' already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("invalid program name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Launch(#[from] ProcessError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<CommandError> for Response {
    fn from(e: CommandError) -> Self {
        Response::error(e.to_string())
    }
}

fn respond(result: Result<String, CommandError>) -> Response {
    match result {
        Ok(message) => Response::success(message),
        Err(e) => e.into(),
    }
}

fn busy(name: &str, status: ProgramStatus) -> CommandError {
    CommandError::InvalidState(format!(
        "program '{name}' is busy ({status}), try again once the current action completes"
    ))
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Manager {
    paths: Paths,
    registry: Arc<RwLock<Registry>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Manager {
    pub fn new(paths: Paths, settings: Settings, specs: Vec<ProgramSpec>) -> Self {
        Self {
            paths,
            registry: Arc::new(RwLock::new(Registry::new(settings, specs))),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Reads settings and the program list from the base directory. Missing
    /// runtime executables are logged, not fatal.
    pub fn load(paths: Paths) -> Result<Self, ConfigError> {
        let settings = config::load_settings(&paths.settings_file())?;
        let specs = config::load_programs(&paths.programs_file())?;
        for warning in runtime::missing_runtimes(&settings, &paths) {
            warn!("{warning}");
        }
        info!("loaded {} program(s)", specs.len());
        Ok(Self::new(paths, settings, specs))
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn registry(&self) -> Arc<RwLock<Registry>> {
        Arc::clone(&self.registry)
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Reap finished actions so a long-lived supervisor does not
        // accumulate them.
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!("background task failed: {e}");
            }
        }
        tasks.spawn(task);
    }

    fn staging_dir(&self, name: &str) -> PathBuf {
        static ATTEMPTS: AtomicU64 = AtomicU64::new(0);
        self.paths
            .program_staging_dir(name, ATTEMPTS.fetch_add(1, Ordering::Relaxed))
    }

    /// Waits until every background action, including ones spawned while
    /// waiting, has finished.
    pub async fn wait_for_tasks(&self) {
        loop {
            let mut tasks = match self.tasks.lock() {
                Ok(mut tasks) => std::mem::take(&mut *tasks),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("background task failed: {e}");
                }
            }
        }
    }

    // -- Supervision --

    pub async fn tick(&self) {
        let mut reg = self.registry.write().await;
        monitor::tick(&mut reg, &self.paths).await;
    }

    pub fn spawn_monitor(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        monitor::spawn_monitor(self.registry(), self.paths.clone(), shutdown_rx)
    }

    /// Adopts live processes recorded by a previous supervisor instance and
    /// rewrites the pid table to what was actually adopted.
    pub async fn restore_pids(&self) -> Vec<String> {
        let table = match persist::load(&self.paths.pid_table_file()) {
            Ok(table) => table,
            Err(e) => {
                warn!("ignoring unreadable pid table: {e}");
                persist::PidTable::new()
            }
        };
        let mut reg = self.registry.write().await;
        let adopted = reg.adopt(table);
        reg.persist_pids(&self.paths);
        adopted
    }

    /// Persists the pid table and leaves every child running for the next
    /// supervisor instance to adopt.
    pub async fn shutdown(&self) {
        let reg = self.registry.read().await;
        reg.persist_pids(&self.paths);
        info!(
            "supervisor shutting down, {} of {} program(s) left running",
            reg.pid_table().len(),
            reg.len()
        );
    }

    pub async fn dispatch(&self, request: Request, shutdown_tx: &watch::Sender<bool>) -> Response {
        match request {
            Request::List => self.list().await,
            Request::Log {
                name,
                lines,
                offset,
            } => self.log_page(&name, lines, offset).await,
            Request::Start { name } => self.start(&name).await,
            Request::Stop { name } => self.stop(&name).await,
            Request::Restart { name } => self.restart(&name).await,
            Request::Add { spec } => self.add(spec).await,
            Request::Remove { name } => self.remove(&name).await,
            Request::Edit { name, edit } => self.edit(&name, edit).await,
            Request::Upload { program, archive } => match self.read_archive(&archive).await {
                Ok(bytes) => self.upload(program, bytes).await,
                Err(e) => e.into(),
            },
            Request::Update { name, archive } => match self.read_archive(&archive).await {
                Ok(bytes) => self.update(&name, bytes).await,
                Err(e) => e.into(),
            },
            Request::Reload => self.reload().await,
            Request::ResetRestarts { name } => self.reset_restarts(name.as_deref()).await,
            Request::Kill => {
                let _ = shutdown_tx.send(true);
                Response::success("supervisor shutting down")
            }
        }
    }

    /// Size is checked from metadata so an oversized archive is never read.
    async fn read_archive(&self, path: &Path) -> Result<Vec<u8>, CommandError> {
        let limit = self.registry.read().await.settings.max_upload_bytes;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(InstallError::Io)?;
        install::check_size(meta.len(), limit)?;
        Ok(tokio::fs::read(path).await.map_err(InstallError::Io)?)
    }

    // -- Queries --

    pub async fn list(&self) -> Response {
        let reg = self.registry.read().await;
        Response::ProgramList {
            programs: reg.snapshot(&self.paths),
        }
    }

    pub async fn log_page(&self, name: &str, lines: usize, offset: usize) -> Response {
        if !self.registry.read().await.contains(name) {
            return CommandError::NotFound(name.to_string()).into();
        }
        match log::read_page(&self.paths.log_file(name), lines, offset) {
            Ok(page) => Response::LogPage {
                name: name.to_string(),
                page,
            },
            Err(e) => Response::error(format!("failed to read log for '{name}': {e}")),
        }
    }

    // -- Lifecycle commands --

    /// Clears the breaker and launches synchronously under the lock.
    pub async fn start(&self, name: &str) -> Response {
        respond(self.try_start(name).await)
    }

    async fn try_start(&self, name: &str) -> Result<String, CommandError> {
        let mut reg = self.registry.write().await;
        let program = reg
            .get_mut(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;
        let state = &mut program.state;
        if state.user_action_in_progress {
            return Err(busy(name, state.status));
        }

        program.spec.enabled = true;
        state.clear_breaker();
        if let Some(process) = state.process.as_mut()
            && process.is_running()
        {
            state.status = ProgramStatus::Running;
            return Ok(format!("program '{name}' is already running"));
        }
        state.process = None;

        let pid = reg.launch(name, &self.paths)?;
        Ok(format!("started '{name}' (pid {pid})"))
    }

    /// Disables the program and terminates it in the background. A stop
    /// during a restart is handed to the restart worker, which terminates the
    /// process and then skips the relaunch.
    pub async fn stop(&self, name: &str) -> Response {
        respond(self.try_stop(name).await)
    }

    async fn try_stop(&self, name: &str) -> Result<String, CommandError> {
        let mut reg = self.registry.write().await;
        let program = reg
            .get_mut(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;
        let state = &mut program.state;
        if state.status == ProgramStatus::Stopping {
            return Ok(format!("program '{name}' is already stopping"));
        }
        if state.status == ProgramStatus::Restarting && state.user_action_in_progress {
            program.spec.enabled = false;
            state.status = ProgramStatus::Stopping;
            return Ok(format!("stopping '{name}'"));
        }
        if state.user_action_in_progress {
            return Err(busy(name, state.status));
        }

        program.spec.enabled = false;
        let Some(process) = state.process.take() else {
            // A broken program keeps its breaker until start or restart.
            if !state.is_broken {
                state.status = ProgramStatus::Stopped;
            }
            state.start_time = None;
            reg.persist_pids(&self.paths);
            return Ok(format!("program '{name}' is stopped"));
        };

        state.status = ProgramStatus::Stopping;
        state.user_action_in_progress = true;
        drop(reg);

        let manager = self.clone();
        let name = name.to_string();
        let message = format!("stopping '{name}'");
        self.spawn_task(async move {
            process::terminate(&name, process).await;

            let mut reg = manager.registry.write().await;
            if let Some(program) = reg.get_mut(&name) {
                let state = &mut program.state;
                state.status = ProgramStatus::Stopped;
                state.start_time = None;
                state.user_action_in_progress = false;
                info!("stopped '{name}'");
            }
            reg.persist_pids(&manager.paths);
        });
        Ok(message)
    }

    /// Terminates in the background, waits the restart delay, relaunches.
    pub async fn restart(&self, name: &str) -> Response {
        respond(self.try_restart(name).await)
    }

    async fn try_restart(&self, name: &str) -> Result<String, CommandError> {
        let mut reg = self.registry.write().await;
        let delay = reg.settings.restart_delay;
        let program = reg
            .get_mut(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;
        let state = &mut program.state;
        if matches!(
            state.status,
            ProgramStatus::Stopping | ProgramStatus::Restarting
        ) {
            return Ok(format!("program '{name}' is already {}", state.status));
        }
        if state.user_action_in_progress {
            return Err(busy(name, state.status));
        }

        program.spec.enabled = true;
        state.clear_breaker();
        state.status = ProgramStatus::Restarting;
        state.user_action_in_progress = true;
        let process = state.process.take();
        drop(reg);

        let manager = self.clone();
        let name = name.to_string();
        let message = format!("restarting '{name}'");
        self.spawn_task(async move {
            if let Some(process) = process {
                process::terminate(&name, process).await;
            }
            {
                let mut reg = manager.registry.write().await;
                if let Some(program) = reg.get_mut(&name) {
                    program.state.clear_breaker();
                }
            }

            tokio::time::sleep(delay).await;

            let mut reg = manager.registry.write().await;
            let Some(program) = reg.get_mut(&name) else {
                return;
            };
            program.state.user_action_in_progress = false;
            if program.spec.enabled {
                let _ = reg.launch(&name, &manager.paths);
            } else {
                program.state.status = ProgramStatus::Stopped;
                program.state.start_time = None;
                info!("stopped '{name}' instead of restarting it");
                reg.persist_pids(&manager.paths);
            }
        });
        Ok(message)
    }

    // -- Configuration commands --

    /// True when `name`, or another program's name with the same sanitized
    /// form, is registered. The sanitized form keys log files and upload dirs.
    fn name_taken(reg: &Registry, name: &str, except: Option<&str>) -> bool {
        let wanted = sanitize_name(name);
        reg.names()
            .iter()
            .filter(|existing| Some(existing.as_str()) != except)
            .any(|existing| existing == name || sanitize_name(existing) == wanted)
    }

    fn validate_name(name: &str) -> Result<(), CommandError> {
        if sanitize_name(name).is_empty() {
            return Err(CommandError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    pub async fn add(&self, spec: ProgramSpec) -> Response {
        respond(self.try_add(spec).await)
    }

    async fn try_add(&self, spec: ProgramSpec) -> Result<String, CommandError> {
        Self::validate_name(&spec.name)?;
        let name = spec.name.clone();
        let enabled = spec.enabled;

        let mut reg = self.registry.write().await;
        if Self::name_taken(&reg, &name, None) {
            return Err(CommandError::AlreadyExists(name));
        }
        reg.insert(Program::new(spec));
        if let Err(e) = reg.save_programs(&self.paths) {
            reg.remove(&name);
            return Err(e.into());
        }
        info!("added '{name}'");

        if !enabled {
            return Ok(format!("added '{name}'"));
        }
        match reg.launch(&name, &self.paths) {
            Ok(pid) => Ok(format!("added '{name}' and started it (pid {pid})")),
            Err(e) => Ok(format!("added '{name}' but it failed to start: {e}")),
        }
    }

    /// Drops a stopped program along with its log files and, for uploaded
    /// programs, its code directory.
    pub async fn remove(&self, name: &str) -> Response {
        respond(self.try_remove(name).await)
    }

    async fn try_remove(&self, name: &str) -> Result<String, CommandError> {
        let mut reg = self.registry.write().await;
        let program = reg
            .get(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;
        let state = &program.state;
        if state.user_action_in_progress {
            return Err(busy(name, state.status));
        }
        if state.process.is_some()
            || !matches!(
                state.status,
                ProgramStatus::Stopped | ProgramStatus::Error | ProgramStatus::Broken
            )
        {
            return Err(CommandError::InvalidState(format!(
                "program '{name}' must be stopped before removal (status: {})",
                state.status
            )));
        }

        let Some(program) = reg.remove(name) else {
            return Err(CommandError::NotFound(name.to_string()));
        };
        if let Err(e) = reg.save_programs(&self.paths) {
            reg.insert(program);
            return Err(e.into());
        }
        reg.persist_pids(&self.paths);
        drop(reg);

        let mut doomed = vec![self.paths.log_file(name), self.paths.log_backup(name)];
        if program.spec.uploaded {
            doomed.push(self.paths.program_dir(name));
            doomed.push(self.paths.program_backup_dir(name));
        }
        for path in doomed {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to delete {}: {e}", path.display()),
            }
        }

        info!("removed '{name}'");
        Ok(format!("removed '{name}'"))
    }

    /// Partial update. A rename needs the program stopped and carries its
    /// runtime state, log files and upload directory over to the new name.
    pub async fn edit(&self, name: &str, edit: ProgramEdit) -> Response {
        respond(self.try_edit(name, edit).await)
    }

    async fn try_edit(&self, name: &str, edit: ProgramEdit) -> Result<String, CommandError> {
        let mut reg = self.registry.write().await;
        let program = reg
            .get(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;
        let state = &program.state;
        let running = state.process.is_some();
        let new_name = edit.new_name.clone().filter(|n| n != name);

        if let Some(new_name) = &new_name {
            Self::validate_name(new_name)?;
            if running
                || state.user_action_in_progress
                || !matches!(state.status, ProgramStatus::Stopped | ProgramStatus::Error)
            {
                return Err(CommandError::InvalidState(format!(
                    "program '{name}' must be stopped to rename (status: {})",
                    state.status
                )));
            }
            if Self::name_taken(&reg, new_name, Some(name)) {
                return Err(CommandError::AlreadyExists(new_name.clone()));
            }
        }

        let mut spec = program.spec.clone();
        apply_edit(&mut spec, &edit);

        if let Some(new_name) = &new_name {
            self.move_program_files(name, new_name, &mut spec)?;
        }

        let final_name = new_name.clone().unwrap_or_else(|| name.to_string());
        if let Some(program) = reg.get_mut(name) {
            program.spec = spec;
        }
        if new_name.is_some() {
            reg.rename(name, &final_name);
            info!("renamed '{name}' to '{final_name}'");
        }
        reg.save_programs(&self.paths)?;

        if running {
            Ok(format!(
                "updated '{final_name}', restart required for changes to take effect"
            ))
        } else {
            Ok(format!("updated '{final_name}'"))
        }
    }

    /// Moves the upload directory first, since it is the step most likely
    /// to fail, then the log files.
    fn move_program_files(
        &self,
        old: &str,
        new: &str,
        spec: &mut ProgramSpec,
    ) -> Result<(), CommandError> {
        if spec.uploaded {
            let old_dir = self.paths.program_dir(old);
            let new_dir = self.paths.program_dir(new);
            if old_dir.exists() {
                std::fs::rename(&old_dir, &new_dir).map_err(InstallError::Io)?;
            }
            spec.cwd = spec.cwd.take().map(|p| rebase(p, &old_dir, &new_dir));
            spec.venv = spec.venv.take().map(|p| rebase(p, &old_dir, &new_dir));
        }

        for (from, to) in [
            (self.paths.log_file(old), self.paths.log_file(new)),
            (self.paths.log_backup(old), self.paths.log_backup(new)),
        ] {
            if from.exists()
                && let Err(e) = std::fs::rename(&from, &to)
            {
                warn!("failed to move {} to {}: {e}", from.display(), to.display());
            }
        }
        Ok(())
    }

    /// Zeroes restart counters for one program, or all when `name` is None.
    pub async fn reset_restarts(&self, name: Option<&str>) -> Response {
        respond(self.try_reset_restarts(name).await)
    }

    async fn try_reset_restarts(&self, name: Option<&str>) -> Result<String, CommandError> {
        let mut reg = self.registry.write().await;
        let names = match name {
            Some(name) if !reg.contains(name) => {
                return Err(CommandError::NotFound(name.to_string()));
            }
            Some(name) => vec![name.to_string()],
            None => reg.names(),
        };
        for name in &names {
            if let Some(program) = reg.get_mut(name) {
                program.state.total_restarts = 0;
                program.state.consecutive_failures = 0;
            }
        }
        reg.persist_pids(&self.paths);

        Ok(match name {
            Some(name) => format!("restart counters reset for '{name}'"),
            None => "restart counters reset for all programs".to_string(),
        })
    }

    /// Re-reads both config files. Running processes are untouched; on a
    /// config error the previous configuration stays in effect.
    pub async fn reload(&self) -> Response {
        respond(self.try_reload().await)
    }

    async fn try_reload(&self) -> Result<String, CommandError> {
        let settings = config::load_settings(&self.paths.settings_file())?;
        let specs = config::load_programs(&self.paths.programs_file())?;
        for warning in runtime::missing_runtimes(&settings, &self.paths) {
            warn!("{warning}");
        }

        let mut reg = self.registry.write().await;
        reg.settings = settings;
        let added = reg.apply_specs(specs);
        info!("configuration reloaded, {added} new program(s)");
        Ok(format!("configuration reloaded ({added} new program(s))"))
    }

    // -- Install pipeline --

    /// Extracts a new program's archive, registers it as `installing` and
    /// provisions it in the background.
    pub async fn upload(&self, options: UploadOptions, bytes: Vec<u8>) -> Response {
        respond(self.try_upload(options, bytes).await)
    }

    async fn try_upload(
        &self,
        options: UploadOptions,
        bytes: Vec<u8>,
    ) -> Result<String, CommandError> {
        let name = options.name.clone();
        Self::validate_name(&name)?;
        let (settings, limit) = {
            let reg = self.registry.read().await;
            if Self::name_taken(&reg, &name, None) {
                return Err(CommandError::AlreadyExists(name));
            }
            (reg.settings.clone(), reg.settings.max_upload_bytes)
        };
        install::check_size(bytes.len() as u64, limit)?;

        let program_dir = self.paths.program_dir(&name);
        std::fs::create_dir_all(self.paths.upload_dir()).map_err(InstallError::Io)?;
        if program_dir.exists() {
            return Err(CommandError::AlreadyExists(name));
        }
        install::stage_upload(
            bytes,
            &program_dir,
            self.staging_dir(&name),
            settings.extract_timeout,
        )
        .await?;

        let spec = ProgramSpec {
            name: name.clone(),
            script: options.script,
            kind: options.kind,
            enabled: options.enabled,
            uploaded: true,
            comment: options.comment,
            venv: (options.kind == RuntimeKind::Python).then(|| program_dir.join(".venv")),
            cwd: Some(program_dir.clone()),
            args: options.args,
            environment: options.environment,
        };
        let job = InstallJob {
            name: name.clone(),
            kind: spec.kind,
            program_dir: program_dir.clone(),
            env_dir: runtime::dependency_env(&spec, &settings, &self.paths),
            log: self.paths.log_file(&name),
            settings,
        };

        {
            let mut reg = self.registry.write().await;
            if Self::name_taken(&reg, &name, None) {
                let _ = std::fs::remove_dir_all(&program_dir);
                return Err(CommandError::AlreadyExists(name));
            }
            let mut program = Program::new(spec);
            program.state.status = ProgramStatus::Installing;
            program.state.user_action_in_progress = true;
            reg.insert(program);
            if let Err(e) = reg.save_programs(&self.paths) {
                warn!("failed to save program list: {e}");
            }
        }
        info!("'{name}' uploaded, installing in the background");

        let manager = self.clone();
        let auto_start = options.enabled;
        self.spawn_task(async move {
            let result = install::install(&job, "Install").await;
            let name = job.name;

            let mut reg = manager.registry.write().await;
            let Some(program) = reg.get_mut(&name) else {
                return;
            };
            program.state.user_action_in_progress = false;
            let launch = match result {
                Ok(()) if auto_start && program.spec.enabled => true,
                Ok(()) => {
                    program.state.status = ProgramStatus::Stopped;
                    info!("'{name}' installed");
                    false
                }
                Err(e) => {
                    program.state.status = ProgramStatus::Error;
                    error!("installing '{name}' failed: {e}");
                    false
                }
            };
            if launch {
                let _ = reg.launch(&name, &manager.paths);
            }
        });

        Ok(format!(
            "program '{name}' is being installed, check its log for progress"
        ))
    }

    /// Swaps in new code for a stopped uploaded program, then reinstalls
    /// dependencies in the background. A failed install restores the
    /// previous copy.
    pub async fn update(&self, name: &str, bytes: Vec<u8>) -> Response {
        respond(self.try_update(name, bytes).await)
    }

    async fn try_update(&self, name: &str, bytes: Vec<u8>) -> Result<String, CommandError> {
        let (spec, settings, previous) = {
            let mut reg = self.registry.write().await;
            let limit = reg.settings.max_upload_bytes;
            let settings = reg.settings.clone();
            let program = reg
                .get_mut(name)
                .ok_or_else(|| CommandError::NotFound(name.to_string()))?;
            let state = &mut program.state;
            if !program.spec.uploaded {
                return Err(CommandError::InvalidState(format!(
                    "program '{name}' was not uploaded, only uploaded programs can be updated"
                )));
            }
            if state.user_action_in_progress {
                return Err(busy(name, state.status));
            }
            if state.process.is_some()
                || !matches!(state.status, ProgramStatus::Stopped | ProgramStatus::Error)
            {
                return Err(CommandError::InvalidState(format!(
                    "program '{name}' must be stopped before updating (status: {})",
                    state.status
                )));
            }
            install::check_size(bytes.len() as u64, limit)?;

            let previous = state.status;
            state.status = ProgramStatus::Installing;
            state.user_action_in_progress = true;
            (program.spec.clone(), settings, previous)
        };

        let program_dir = self.paths.program_dir(name);
        let backup_dir = self.paths.program_backup_dir(name);
        let staged = install::stage_update(
            bytes,
            program_dir.clone(),
            self.staging_dir(name),
            backup_dir.clone(),
            spec.kind,
            settings.extract_timeout,
        )
        .await;
        if let Err(e) = staged {
            let mut reg = self.registry.write().await;
            if let Some(program) = reg.get_mut(name) {
                program.state.status = previous;
                program.state.user_action_in_progress = false;
            }
            return Err(e.into());
        }

        let job = InstallJob {
            name: name.to_string(),
            kind: spec.kind,
            program_dir: program_dir.clone(),
            env_dir: runtime::dependency_env(&spec, &settings, &self.paths),
            log: self.paths.log_file(name),
            settings,
        };
        info!("'{name}' code replaced, reinstalling in the background");

        let manager = self.clone();
        self.spawn_task(async move {
            let result = install::install(&job, "Update").await;
            let name = job.name;

            let status = match result {
                Ok(()) => {
                    install::discard_backup(&backup_dir);
                    info!("'{name}' updated");
                    ProgramStatus::Stopped
                }
                Err(e) => {
                    error!("updating '{name}' failed, restoring previous version: {e}");
                    let _ = log::append(&job.log, "Restoring previous version\n");
                    if let Err(e) = install::restore(&program_dir, &backup_dir) {
                        error!("failed to restore '{name}' from backup: {e}");
                    }
                    ProgramStatus::Error
                }
            };

            let mut reg = manager.registry.write().await;
            if let Some(program) = reg.get_mut(&name) {
                program.state.status = status;
                program.state.user_action_in_progress = false;
            }
        });

        Ok(format!(
            "program '{name}' is being updated, check its log for progress"
        ))
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn apply_edit(spec: &mut ProgramSpec, edit: &ProgramEdit) {
    if let Some(script) = &edit.script {
        spec.script = script.clone();
    }
    if let Some(kind) = edit.kind {
        spec.kind = kind;
    }
    if let Some(enabled) = edit.enabled {
        spec.enabled = enabled;
    }
    if let Some(comment) = &edit.comment {
        spec.comment = non_empty(comment);
    }
    if let Some(venv) = &edit.venv {
        spec.venv = non_empty(venv).map(PathBuf::from);
    }
    if let Some(cwd) = &edit.cwd {
        spec.cwd = non_empty(cwd).map(PathBuf::from);
    }
    if let Some(args) = &edit.args {
        spec.args = args.clone();
    }
    if let Some(environment) = &edit.environment {
        spec.environment = environment.clone();
    }
}

fn rebase(path: PathBuf, old_root: &Path, new_root: &Path) -> PathBuf {
    match path.strip_prefix(old_root) {
        Ok(rest) if rest.as_os_str().is_empty() => new_root.to_path_buf(),
        Ok(rest) => new_root.join(rest),
        Err(_) => path,
    }
}
