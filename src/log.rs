use crate::protocol::LogPage;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_PAGE_LINES: usize = 100;

const SECTION_RULE: &str = "=====";

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

/// Opens `path` for appending, creating it and its directory if needed.
///
/// Children inherit this descriptor. `O_APPEND` makes every write land at the
/// current end of file, which is what lets copytruncate rotation work without
/// the writer noticing.
pub fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

pub fn append(path: &Path, text: &str) -> io::Result<()> {
    let mut file = open_append(path)?;
    file.write_all(text.as_bytes())
}

pub fn section_header(title: &str) -> String {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("\n{SECTION_RULE} {title} ({now}) {SECTION_RULE}\n")
}

pub fn append_section(path: &Path, title: &str) -> io::Result<()> {
    append(path, &section_header(title))
}

// ---------------------------------------------------------------------------
// rotate_if_needed: copytruncate rotation
// ---------------------------------------------------------------------------

pub fn backup_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".1");
    p.into()
}

/// Rotates `path` into `<path>.1` once it reaches `max_bytes`.
///
/// The live file is copied and then truncated in place rather than renamed,
/// so a child holding it open keeps writing to the same inode. Returns
/// whether a rotation happened; a missing file is not an error.
pub fn rotate_if_needed(path: &Path, max_bytes: u64) -> io::Result<bool> {
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if len < max_bytes {
        return Ok(false);
    }

    std::fs::copy(path, backup_path(path))?;
    OpenOptions::new().write(true).open(path)?.set_len(0)?;
    Ok(true)
}

pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// read_page: paginated tail
// ---------------------------------------------------------------------------

/// Reads a window of `lines` lines ending `offset` lines before the end of
/// the file. Line numbers in the result are 1-based and inclusive.
///
/// The file is streamed twice (count, then collect) so large logs are never
/// held in memory beyond the requested window.
pub fn read_page(path: &Path, lines: usize, offset: usize) -> io::Result<LogPage> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LogPage::empty()),
        Err(e) => return Err(e),
    };

    let mut total_lines = 0usize;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    while reader.read_until(b'\n', &mut buf)? > 0 {
        total_lines += 1;
        buf.clear();
    }

    let end = total_lines.saturating_sub(offset);
    let start = end.saturating_sub(lines);

    let mut content = String::new();
    if end > start {
        let mut reader = BufReader::new(File::open(path)?);
        let mut index = 0usize;
        while index < end {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            if index >= start {
                content.push_str(&String::from_utf8_lossy(&buf));
            }
            index += 1;
        }
    }

    Ok(LogPage {
        content,
        total_lines,
        start_line: if end > start { start + 1 } else { 0 },
        end_line: end,
        has_more: start > 0,
    })
}
