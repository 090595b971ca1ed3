use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var("OVERSEER_HOME") {
            return Ok(Self {
                base_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::data_dir() else {
            bail!("could not determine data directory");
        };
        Ok(Self {
            base_dir: base.join("overseer"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base_dir: base }
    }

    /// Directory every relative path in the configuration is resolved against.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Joins `path` onto the base directory unless it is already absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.base_dir.join("overseer.toml")
    }

    pub fn programs_file(&self) -> PathBuf {
        self.base_dir.join("programs.toml")
    }

    pub fn pid_table_file(&self) -> PathBuf {
        self.base_dir.join("overseer.pids.json")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.base_dir.join("overseer.pid")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.base_dir.join("overseer.sock")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.base_dir.join("uploaded_programs")
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{}.log", sanitize_name(name)))
    }

    pub fn log_backup(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{}.log.1", sanitize_name(name)))
    }

    pub fn program_dir(&self, name: &str) -> PathBuf {
        self.upload_dir().join(sanitize_name(name))
    }

    pub fn program_backup_dir(&self, name: &str) -> PathBuf {
        self.upload_dir()
            .join(format!("{}.backup", sanitize_name(name)))
    }

    /// Scratch directory for one extraction attempt. Attempts never share a
    /// directory, so an abandoned extraction cannot write into a later one.
    pub fn program_staging_dir(&self, name: &str, attempt: u64) -> PathBuf {
        self.upload_dir()
            .join(format!("{}.staging-{attempt}", sanitize_name(name)))
    }
}

/// Maps a user-supplied program name onto a safe file-name stem.
///
/// Every character outside `[A-Za-z0-9_-]` becomes `_`, runs of `_` collapse
/// to one, and leading/trailing `_` are trimmed. The result can be empty.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('_').to_string()
}
