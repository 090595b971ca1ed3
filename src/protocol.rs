use crate::config::{ProgramSpec, RuntimeKind};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_log_lines() -> usize {
    crate::log::DEFAULT_PAGE_LINES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    List,
    Log {
        name: String,
        #[serde(default = "default_log_lines")]
        lines: usize,
        #[serde(default)]
        offset: usize,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Restart {
        name: String,
    },
    Add {
        spec: ProgramSpec,
    },
    Remove {
        name: String,
    },
    Edit {
        name: String,
        edit: ProgramEdit,
    },
    Upload {
        program: UploadOptions,
        archive: PathBuf,
    },
    Update {
        name: String,
        archive: PathBuf,
    },
    Reload,
    ResetRestarts {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Kill,
}

/// Result of every command, and the carrier for query payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
    ProgramList {
        programs: Vec<ProgramInfo>,
    },
    LogPage {
        name: String,
        page: LogPage,
    },
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Response::Success {
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Response::Error { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Response::Success { message } => message.as_deref(),
            Response::Error { message } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    #[default]
    Stopped,
    Running,
    Stopping,
    Restarting,
    Installing,
    Broken,
    Error,
}

impl std::fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgramStatus::Stopped => write!(f, "stopped"),
            ProgramStatus::Running => write!(f, "running"),
            ProgramStatus::Stopping => write!(f, "stopping"),
            ProgramStatus::Restarting => write!(f, "restarting"),
            ProgramStatus::Installing => write!(f, "installing"),
            ProgramStatus::Broken => write!(f, "broken"),
            ProgramStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of one program for display and polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub spec: ProgramSpec,
    pub status: ProgramStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// False when the process was adopted from a previous supervisor run.
    #[serde(default)]
    pub owned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Local>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub total_restarts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<DateTime<Local>>,
    #[serde(default)]
    pub is_broken: bool,
    #[serde(default)]
    pub user_action_in_progress: bool,
    #[serde(default)]
    pub log_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub cpu_history: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPage {
    pub content: String,
    pub total_lines: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub has_more: bool,
}

impl LogPage {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Partial update for `edit`. `None` leaves a field alone; for optional text
/// fields an empty string clears the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramEdit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RuntimeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Vec<String>>,
}

/// Declaration of a program whose code arrives as an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadOptions {
    pub name: String,
    pub script: String,
    pub kind: RuntimeKind,
    /// Start the program once installation succeeds.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(req)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    let trimmed = line.trim_end();
    Ok(serde_json::from_str(trimmed)?)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(resp)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    let trimmed = line.trim_end();
    Ok(serde_json::from_str(trimmed)?)
}
