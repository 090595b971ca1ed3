//! The in-memory table of programs and their runtime state.
//!
//! One [`Registry`] lives behind one `RwLock` shared by the monitor, the
//! action coordinator and the install pipeline. Everything here is
//! synchronous and assumes the caller holds the lock.

use crate::config::{self, ConfigError, ProgramSpec, Settings};
use crate::cpu::CpuSampler;
use crate::log;
use crate::paths::Paths;
use crate::persist::{self, PidRecord, PidTable};
use crate::process::{self, ProcessError, ProgramState, TrackedProcess};
use crate::protocol::{ProgramInfo, ProgramStatus};
use chrono::Local;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub struct Program {
    pub spec: ProgramSpec,
    pub state: ProgramState,
}

impl Program {
    pub fn new(spec: ProgramSpec) -> Self {
        Self {
            spec,
            state: ProgramState::default(),
        }
    }

    pub fn info(&self, paths: &Paths) -> ProgramInfo {
        let state = &self.state;
        ProgramInfo {
            spec: self.spec.clone(),
            status: state.status,
            pid: state.pid(),
            owned: state.process.as_ref().is_some_and(TrackedProcess::is_owned),
            uptime: state.uptime().map(|d| d.as_secs()),
            start_time: state.process.as_ref().and(state.start_time),
            consecutive_failures: state.consecutive_failures,
            total_restarts: state.total_restarts,
            last_restart: state.last_restart,
            is_broken: state.is_broken,
            user_action_in_progress: state.user_action_in_progress,
            log_size: log::file_size(&paths.log_file(&self.spec.name)),
            cpu_percent: state.cpu_history.latest(),
            cpu_history: state.cpu_history.to_vec(),
        }
    }
}

pub struct Registry {
    pub settings: Settings,
    programs: BTreeMap<String, Program>,
    cpu: CpuSampler,
}

impl Registry {
    pub fn new(settings: Settings, specs: Vec<ProgramSpec>) -> Self {
        let programs = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), Program::new(spec)))
            .collect();
        Self {
            settings,
            programs,
            cpu: CpuSampler::new(),
        }
    }

    // -- Table access --

    pub fn get(&self, name: &str) -> Option<&Program> {
        self.programs.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Program> {
        self.programs.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    pub fn insert(&mut self, program: Program) {
        self.programs.insert(program.spec.name.clone(), program);
    }

    pub fn remove(&mut self, name: &str) -> Option<Program> {
        self.programs.remove(name)
    }

    /// Moves a program and its runtime state to a new key.
    pub fn rename(&mut self, old: &str, new: &str) -> bool {
        let Some(mut program) = self.programs.remove(old) else {
            return false;
        };
        program.spec.name = new.to_string();
        self.programs.insert(new.to_string(), program);
        true
    }

    pub fn names(&self) -> Vec<String> {
        self.programs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn specs(&self) -> Vec<ProgramSpec> {
        self.programs.values().map(|p| p.spec.clone()).collect()
    }

    pub fn snapshot(&self, paths: &Paths) -> Vec<ProgramInfo> {
        self.programs.values().map(|p| p.info(paths)).collect()
    }

    // -- Launching --

    /// Launches `name` now. On success the program is `running` and the pid
    /// table is persisted; on failure it is `error` with no process.
    pub fn launch(&mut self, name: &str, paths: &Paths) -> Result<u32, ProcessError> {
        let Some(program) = self.programs.get_mut(name) else {
            return Err(ProcessError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("program '{name}' is not registered"),
            )));
        };

        match process::spawn(&program.spec, &self.settings, paths) {
            Ok(tracked) => {
                let pid = tracked.pid();
                program.state.process = Some(tracked);
                program.state.status = ProgramStatus::Running;
                program.state.start_time = Some(Local::now());
                info!("started '{name}' (pid {pid})");
                self.persist_pids(paths);
                Ok(pid)
            }
            Err(e) => {
                program.state.process = None;
                program.state.status = ProgramStatus::Error;
                warn!("failed to start '{name}': {e}");
                Err(e)
            }
        }
    }

    // -- Persistence --

    pub fn pid_table(&self) -> PidTable {
        self.programs
            .iter()
            .filter_map(|(name, program)| {
                let pid = program.state.pid()?;
                crate::sys::is_pid_alive(pid).then(|| {
                    (
                        name.clone(),
                        PidRecord {
                            pid,
                            start_time: program.state.start_time,
                            total_restarts: program.state.total_restarts,
                        },
                    )
                })
            })
            .collect()
    }

    pub fn persist_pids(&self, paths: &Paths) {
        if let Err(e) = persist::save(&paths.pid_table_file(), &self.pid_table()) {
            warn!("failed to persist pid table: {e}");
        }
    }

    pub fn save_programs(&self, paths: &Paths) -> Result<(), ConfigError> {
        config::save_programs(&paths.programs_file(), &self.specs())
    }

    /// Takes over still-running processes recorded by a previous supervisor.
    pub fn adopt(&mut self, table: PidTable) -> Vec<String> {
        let mut adopted = Vec::new();
        for (name, record) in persist::live_entries(table) {
            let Some(program) = self.programs.get_mut(&name) else {
                continue;
            };
            if program.state.process.is_some() {
                continue;
            }
            program.state.process = Some(TrackedProcess::Adopted(record.pid));
            program.state.status = ProgramStatus::Running;
            program.state.start_time = Some(record.start_time.unwrap_or_else(Local::now));
            program.state.total_restarts = record.total_restarts;
            info!("adopted '{name}' (pid {})", record.pid);
            adopted.push(name);
        }
        adopted
    }

    // -- Reload --

    /// Replaces specs from a fresh config read. Runtime state, including
    /// running processes, is kept; unknown names get fresh state.
    pub fn apply_specs(&mut self, specs: Vec<ProgramSpec>) -> usize {
        let mut added = 0;
        for spec in specs {
            match self.programs.get_mut(&spec.name) {
                Some(program) => program.spec = spec,
                None => {
                    added += 1;
                    self.insert(Program::new(spec));
                }
            }
        }
        added
    }

    // -- Observability --

    /// One CPU sample per program; programs without a live process get 0.
    pub fn sample_cpu(&mut self) {
        let pids: Vec<u32> = self
            .programs
            .values()
            .filter_map(|p| p.state.pid())
            .collect();
        self.cpu.refresh(&pids);

        for program in self.programs.values_mut() {
            let usage = program
                .state
                .pid()
                .and_then(|pid| self.cpu.usage(pid))
                .unwrap_or(0.0);
            program.state.cpu_history.push(usage);
        }
    }

    pub fn rotate_logs(&self, paths: &Paths) {
        for name in self.programs.keys() {
            let path = paths.log_file(name);
            match log::rotate_if_needed(&path, self.settings.max_log_bytes) {
                Ok(true) => info!("rotated log for '{name}'"),
                Ok(false) => {}
                Err(e) => warn!("failed to rotate log for '{name}': {e}"),
            }
        }
    }
}
