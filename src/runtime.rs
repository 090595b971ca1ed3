use crate::config::{ProgramSpec, RuntimeKind, Settings};
use crate::paths::Paths;
use crate::process::ProcessError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A fully resolved launch: executable, argv, working directory and extra
/// environment.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

/// Program cwd, then global cwd, then the base directory.
pub fn working_dir(spec: &ProgramSpec, settings: &Settings, paths: &Paths) -> PathBuf {
    match (&spec.cwd, &settings.cwd) {
        (Some(cwd), _) => paths.resolve(cwd),
        (None, Some(cwd)) => paths.resolve(cwd),
        (None, None) => paths.base_dir().to_path_buf(),
    }
}

/// Program environment, then the global one.
pub fn dependency_env(spec: &ProgramSpec, settings: &Settings, paths: &Paths) -> PathBuf {
    match &spec.venv {
        Some(venv) => paths.resolve(venv),
        None => paths.resolve(&settings.venv),
    }
}

pub fn env_python(env: &Path) -> PathBuf {
    env.join("bin").join("python")
}

/// The configured node executable, or the first `node` on `PATH`.
pub fn node_executable(settings: &Settings) -> Option<PathBuf> {
    match &settings.node {
        Some(node) => Some(node.clone()),
        None => find_on_path("node"),
    }
}

pub fn find_on_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

pub fn resolve(
    spec: &ProgramSpec,
    settings: &Settings,
    paths: &Paths,
) -> Result<LaunchCommand, ProcessError> {
    let cwd = working_dir(spec, settings, paths);
    let script = cwd.join(&spec.script);
    if !script.is_file() {
        return Err(ProcessError::ScriptNotFound(script));
    }
    let script_arg = script.to_string_lossy().into_owned();

    let (program, mut args) = match spec.kind {
        RuntimeKind::Python => {
            let python = env_python(&dependency_env(spec, settings, paths));
            if !python.exists() {
                return Err(ProcessError::RuntimeNotFound(python));
            }
            (python, vec!["-u".to_string(), script_arg])
        }
        RuntimeKind::Node => {
            let node = node_executable(settings)
                .ok_or_else(|| ProcessError::RuntimeNotFound(PathBuf::from("node")))?;
            if !node.exists() {
                return Err(ProcessError::RuntimeNotFound(node));
            }
            (node, vec![script_arg])
        }
    };
    args.extend(spec.args.iter().cloned());

    Ok(LaunchCommand {
        program,
        args,
        cwd,
        env: spec.env_vars(),
    })
}

/// Returns a warning for every runtime executable the global settings point
/// at but that does not exist. Individual programs may not need them, so
/// callers only log these.
pub fn missing_runtimes(settings: &Settings, paths: &Paths) -> Vec<String> {
    let mut warnings = Vec::new();
    let python = env_python(&paths.resolve(&settings.venv));
    if !python.exists() {
        warnings.push(format!(
            "global python environment not found at {}",
            python.display()
        ));
    }
    match node_executable(settings) {
        Some(node) if node.exists() => {}
        Some(node) => warnings.push(format!("node executable not found at {}", node.display())),
        None => warnings.push("node executable not found on PATH".to_string()),
    }
    warnings
}
