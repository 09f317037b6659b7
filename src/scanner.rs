//! Discovery of session transcripts under the projects directory.
//!
//! The projects directory holds one subdirectory per workspace, named with
//! the encoded working directory (see [`crate::paths`]), each containing
//! `<session-id>.jsonl` transcripts. Scanning is read-only and tolerant:
//! a missing directory or an unreadable file is logged and skipped, never
//! an error for the caller.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde_json::Value;
use tracing::{debug, warn};

use crate::paths;

/// How many leading lines to inspect for a content-declared `cwd`.
const CWD_PROBE_LINES: usize = 20;

/// Filesystem-level facts about one discovered transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session id, taken from the filename stem.
    pub session_id: String,
    /// Working directory of the session.
    pub cwd: PathBuf,
    /// Directory name the transcript was found under.
    pub encoded_cwd: String,
    /// Full path to the transcript file.
    pub path: PathBuf,
    /// File modification time.
    pub last_modified: DateTime<Local>,
    /// File size in bytes.
    pub file_size: u64,
}

/// Scans the projects directory for transcripts, newest first.
///
/// The working directory comes from the transcript content when an early
/// line declares one (the encoding of the directory name is lossy for
/// components that start with a dot), with the decoded directory name as
/// the fallback.
pub fn scan_sessions(projects_dir: &Path) -> Vec<SessionInfo> {
    let entries = match fs::read_dir(projects_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %projects_dir.display(), error = %e, "projects directory not readable");
            return Vec::new();
        }
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let dir_path = entry.path();
        if !dir_path.is_dir() {
            continue;
        }
        let encoded = entry.file_name().to_string_lossy().into_owned();

        let files = match fs::read_dir(&dir_path) {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %dir_path.display(), error = %e, "skipping unreadable project dir");
                continue;
            }
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            match session_info(&path, &encoded) {
                Some(info) => sessions.push(info),
                None => debug!(path = %path.display(), "skipping unreadable transcript"),
            }
        }
    }

    sessions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    debug!(count = sessions.len(), "scanned sessions");
    sessions
}

/// Scans and keeps only sessions modified within `max_age`.
pub fn scan_recent_sessions(projects_dir: &Path, max_age: Duration) -> Vec<SessionInfo> {
    let cutoff = Local::now()
        - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
    scan_sessions(projects_dir)
        .into_iter()
        .filter(|s| s.last_modified >= cutoff)
        .collect()
}

/// Builds a [`SessionInfo`] for a transcript path, deriving the encoded
/// directory name from its parent. Used by the watcher when events carry
/// only a path.
pub(crate) fn session_info_for(path: &Path) -> Option<SessionInfo> {
    let encoded = path.parent()?.file_name()?.to_string_lossy().into_owned();
    session_info(path, &encoded)
}

fn session_info(path: &Path, encoded: &str) -> Option<SessionInfo> {
    let metadata = fs::metadata(path).ok()?;
    let session_id = path.file_stem()?.to_string_lossy().into_owned();
    let cwd = cwd_from_transcript(path).unwrap_or_else(|| paths::decode(encoded));

    Some(SessionInfo {
        session_id,
        cwd,
        encoded_cwd: encoded.to_string(),
        path: path.to_path_buf(),
        last_modified: DateTime::<Local>::from(metadata.modified().ok()?),
        file_size: metadata.len(),
    })
}

/// Reads a content-declared working directory from the first few lines.
fn cwd_from_transcript(path: &Path) -> Option<PathBuf> {
    let file = fs::File::open(path).ok()?;
    let reader = BufReader::new(file);
    for line in reader.lines().take(CWD_PROBE_LINES) {
        let line = line.ok()?;
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if let Some(cwd) = value.get("cwd").and_then(Value::as_str) {
            if !cwd.is_empty() {
                return Some(PathBuf::from(cwd));
            }
        }
    }
    None
}
