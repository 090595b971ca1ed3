use crate::config::write_atomic;
use crate::sys;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;

/// One persisted live process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidRecord {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Local>>,
    #[serde(default)]
    pub total_restarts: u32,
}

pub type PidTable = BTreeMap<String, PidRecord>;

pub fn save(path: &Path, table: &PidTable) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(table).map_err(io::Error::other)?;
    write_atomic(path, &json)
}

/// Reads the table written by a previous supervisor run. A missing or
/// unreadable file yields an empty table.
pub fn load(path: &Path) -> io::Result<PidTable> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PidTable::new()),
        Err(e) => return Err(e),
    };
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Entries whose pid is still alive right now.
pub fn live_entries(table: PidTable) -> impl Iterator<Item = (String, PidRecord)> {
    table
        .into_iter()
        .filter(|(_, record)| sys::is_pid_alive(record.pid))
}
