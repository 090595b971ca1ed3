use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_VENV: &str = ".venv";
pub const DEFAULT_PYTHON: &str = "python3";
pub const DEFAULT_NPM: &str = "npm";
pub const DEFAULT_RESTART_DELAY_SECS: f64 = 1.0;
pub const DEFAULT_MAX_FAILURES: u32 = 10;
pub const DEFAULT_FAILURE_RESET_SECS: f64 = 60.0;
pub const DEFAULT_MAX_LOG_MB: u64 = 10;
pub const DEFAULT_MAX_UPLOAD_MB: u64 = 50;
pub const DEFAULT_PROVISION_TIMEOUT_SECS: f64 = 60.0;
pub const DEFAULT_DEPENDENCY_TIMEOUT_SECS: f64 = 300.0;
pub const DEFAULT_EXTRACT_TIMEOUT_SECS: f64 = 120.0;

const MB: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("unknown field `{field}` in {section}")]
    UnknownField { section: String, field: String },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("{0}")]
    Io(String),
}

// ---------------------------------------------------------------------------
// Program specs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Python,
    Node,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Python => write!(f, "python"),
            RuntimeKind::Node => write!(f, "node"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(RuntimeKind::Python),
            "node" => Ok(RuntimeKind::Node),
            other => Err(format!("unknown runtime type '{other}' (expected python or node)")),
        }
    }
}

/// Operator-declared description of one supervised program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub name: String,
    pub script: String,
    #[serde(rename = "type")]
    pub kind: RuntimeKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub uploaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ProgramSpec {
    pub fn new(name: &str, script: &str, kind: RuntimeKind) -> Self {
        Self {
            name: name.to_string(),
            script: script.to_string(),
            kind,
            enabled: true,
            uploaded: false,
            comment: None,
            venv: None,
            cwd: None,
            args: Vec::new(),
            environment: Vec::new(),
        }
    }

    /// `KEY=VALUE` entries folded into a map; later entries win, entries
    /// without `=` are skipped.
    pub fn env_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        for entry in &self.environment {
            if let Some((key, value)) = entry.split_once('=') {
                vars.insert(key.to_string(), value.to_string());
            }
        }
        vars
    }
}

#[derive(Debug, Deserialize)]
struct RawProgram {
    name: String,
    script: String,
    #[serde(rename = "type")]
    kind: RuntimeKind,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    uploaded: bool,
    comment: Option<String>,
    venv: Option<PathBuf>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    environment: Vec<String>,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProgramsFile {
    #[serde(default)]
    programs: Vec<RawProgram>,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

#[derive(Serialize)]
struct ProgramsFile<'a> {
    programs: &'a [ProgramSpec],
}

pub fn parse_programs(content: &str) -> Result<Vec<ProgramSpec>, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let raw: RawProgramsFile =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;

    if let Some(field) = raw.extra.keys().next() {
        return Err(ConfigError::UnknownField {
            section: "programs file".to_string(),
            field: field.clone(),
        });
    }

    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(raw.programs.len());
    for program in raw.programs {
        if let Some(field) = program.extra.keys().next() {
            return Err(ConfigError::UnknownField {
                section: format!("program `{}`", program.name),
                field: field.clone(),
            });
        }
        if crate::paths::sanitize_name(&program.name).is_empty() {
            return Err(ConfigError::Invalid(format!(
                "program name `{}` has no usable characters",
                program.name
            )));
        }
        if !seen.insert(program.name.clone()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate program name `{}`",
                program.name
            )));
        }
        specs.push(ProgramSpec {
            name: program.name,
            script: program.script,
            kind: program.kind,
            enabled: program.enabled,
            uploaded: program.uploaded,
            comment: program.comment,
            venv: program.venv,
            cwd: program.cwd,
            args: program.args,
            environment: program.environment,
        });
    }

    Ok(specs)
}

/// Loads the program list. A missing file means no programs.
pub fn load_programs(path: &Path) -> Result<Vec<ProgramSpec>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_programs(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ConfigError::Io(format!("{}: {e}", path.display()))),
    }
}

pub fn save_programs(path: &Path, specs: &[ProgramSpec]) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(&ProgramsFile { programs: specs })
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    write_atomic(path, content.as_bytes())
        .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))
}

/// Writes through a sibling temp file so readers never see a torn file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Supervisor-wide settings loaded from `overseer.toml`.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Global dependency environment, relative to the base directory.
    pub venv: PathBuf,
    pub cwd: Option<PathBuf>,
    pub node: Option<PathBuf>,
    pub python: String,
    pub npm: String,
    pub restart_delay: Duration,
    pub max_failures: u32,
    pub failure_reset: Duration,
    pub max_log_bytes: u64,
    pub max_upload_bytes: u64,
    pub provision_timeout: Duration,
    pub dependency_timeout: Duration,
    pub extract_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            venv: PathBuf::from(DEFAULT_VENV),
            cwd: None,
            node: None,
            python: DEFAULT_PYTHON.to_string(),
            npm: DEFAULT_NPM.to_string(),
            restart_delay: Duration::from_secs_f64(DEFAULT_RESTART_DELAY_SECS),
            max_failures: DEFAULT_MAX_FAILURES,
            failure_reset: Duration::from_secs_f64(DEFAULT_FAILURE_RESET_SECS),
            max_log_bytes: DEFAULT_MAX_LOG_MB * MB,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * MB,
            provision_timeout: Duration::from_secs_f64(DEFAULT_PROVISION_TIMEOUT_SECS),
            dependency_timeout: Duration::from_secs_f64(DEFAULT_DEPENDENCY_TIMEOUT_SECS),
            extract_timeout: Duration::from_secs_f64(DEFAULT_EXTRACT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    venv: Option<PathBuf>,
    cwd: Option<PathBuf>,
    node: Option<PathBuf>,
    python: Option<String>,
    npm: Option<String>,
    restart: RawRestart,
    logging: RawLogging,
    install: RawInstall,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawRestart {
    delay_seconds: Option<f64>,
    max_consecutive_failures: Option<u32>,
    failure_reset_seconds: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawLogging {
    max_size_mb: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawInstall {
    max_upload_mb: Option<u64>,
    provision_timeout_seconds: Option<f64>,
    dependency_timeout_seconds: Option<f64>,
    extract_timeout_seconds: Option<f64>,
}

fn seconds(key: &str, value: Option<f64>, default: f64) -> Result<Duration, ConfigError> {
    let secs = value.unwrap_or(default);
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigError::Invalid(format!("`{key}` must be a non-negative number, got {secs}")))
}

fn megabytes(key: &str, value: Option<u64>, default: u64) -> Result<u64, ConfigError> {
    let mb = value.unwrap_or(default);
    mb.checked_mul(MB)
        .ok_or_else(|| ConfigError::Invalid(format!("`{key}` is too large, got {mb}")))
}

pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    let raw: RawSettings =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;

    if let Some(field) = raw.extra.keys().next() {
        return Err(ConfigError::UnknownField {
            section: "settings".to_string(),
            field: field.clone(),
        });
    }

    let max_failures = raw
        .restart
        .max_consecutive_failures
        .unwrap_or(DEFAULT_MAX_FAILURES);
    if max_failures == 0 {
        return Err(ConfigError::Invalid(
            "`restart.max_consecutive_failures` must be at least 1".to_string(),
        ));
    }

    Ok(Settings {
        venv: raw.venv.unwrap_or_else(|| PathBuf::from(DEFAULT_VENV)),
        cwd: raw.cwd,
        node: raw.node,
        python: raw.python.unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
        npm: raw.npm.unwrap_or_else(|| DEFAULT_NPM.to_string()),
        restart_delay: seconds(
            "restart.delay_seconds",
            raw.restart.delay_seconds,
            DEFAULT_RESTART_DELAY_SECS,
        )?,
        max_failures,
        failure_reset: seconds(
            "restart.failure_reset_seconds",
            raw.restart.failure_reset_seconds,
            DEFAULT_FAILURE_RESET_SECS,
        )?,
        max_log_bytes: megabytes(
            "logging.max_size_mb",
            raw.logging.max_size_mb,
            DEFAULT_MAX_LOG_MB,
        )?,
        max_upload_bytes: megabytes(
            "install.max_upload_mb",
            raw.install.max_upload_mb,
            DEFAULT_MAX_UPLOAD_MB,
        )?,
        provision_timeout: seconds(
            "install.provision_timeout_seconds",
            raw.install.provision_timeout_seconds,
            DEFAULT_PROVISION_TIMEOUT_SECS,
        )?,
        dependency_timeout: seconds(
            "install.dependency_timeout_seconds",
            raw.install.dependency_timeout_seconds,
            DEFAULT_DEPENDENCY_TIMEOUT_SECS,
        )?,
        extract_timeout: seconds(
            "install.extract_timeout_seconds",
            raw.install.extract_timeout_seconds,
            DEFAULT_EXTRACT_TIMEOUT_SECS,
        )?,
    })
}

/// Loads the settings file; unlike the program list it must exist.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    parse_settings(&content)
}
