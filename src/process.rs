//! Process-table inspection for session liveness.
//!
//! A session counts as active when its transcript was touched within the
//! activity window, or when an agent process is currently running with the
//! session's working directory. The process side queries the system tools
//! `ps` and `lsof`; both calls are bounded by a timeout and every failure
//! degrades to "no processes found" rather than an error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::scanner::SessionInfo;

/// Working directories of running agent processes, with their pids.
pub type ActivitySnapshot = HashMap<PathBuf, Vec<u32>>;

/// Source of the running-process snapshot.
///
/// Abstracted so coordination logic can be tested without a process table.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Takes one snapshot of running agent working directories.
    async fn snapshot(&self) -> ActivitySnapshot;
}

/// Inspector backed by `ps` and `lsof`.
#[derive(Debug, Clone)]
pub struct CommandInspector {
    agent_binary: String,
    timeout: Duration,
}

impl CommandInspector {
    pub fn new(agent_binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent_binary: agent_binary.into(),
            timeout,
        }
    }

    /// Lists pids whose command name matches the agent binary.
    async fn agent_pids(&self) -> Vec<u32> {
        let output = match self.run("ps", &["-eo", "pid,comm"]).await {
            Some(output) => output,
            None => return Vec::new(),
        };

        let mut pids = Vec::new();
        for line in output.lines().skip(1) {
            let mut fields = line.split_whitespace();
            let (Some(pid), Some(comm)) = (fields.next(), fields.next()) else {
                continue;
            };
            // comm may be a full path; match on the basename.
            let name = comm.rsplit('/').next().unwrap_or(comm);
            if name == self.agent_binary {
                if let Ok(pid) = pid.parse::<u32>() {
                    pids.push(pid);
                }
            }
        }
        pids
    }

    /// Resolves one pid's working directory via `lsof`.
    async fn cwd_of(&self, pid: u32) -> Option<PathBuf> {
        let pid_arg = pid.to_string();
        let output = self
            .run("lsof", &["-a", "-p", &pid_arg, "-d", "cwd", "-Fn"])
            .await?;
        let cwd = parse_lsof_cwd(&output)?;
        if !cwd.is_dir() {
            debug!(pid, path = %cwd.display(), "lsof cwd is not a directory, skipping");
            return None;
        }
        Some(cwd)
    }

    async fn run(&self, program: &str, args: &[&str]) -> Option<String> {
        let result = timeout(self.timeout, Command::new(program).args(args).output()).await;
        match result {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => {
                debug!(program, status = ?output.status.code(), "command exited nonzero");
                None
            }
            Ok(Err(e)) => {
                warn!(program, error = %e, "command failed to start");
                None
            }
            Err(_) => {
                warn!(program, timeout = ?self.timeout, "command timed out");
                None
            }
        }
    }
}

/// Extracts the cwd path from `lsof -Fn` field output.
///
/// Only `n/`-prefixed lines are absolute paths; a bare `n` prefix also
/// appears on non-path name fields.
fn parse_lsof_cwd(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .find(|line| line.starts_with("n/"))
        .map(|line| PathBuf::from(&line[1..]))
}

#[async_trait]
impl ProcessInspector for CommandInspector {
    async fn snapshot(&self) -> ActivitySnapshot {
        let mut snapshot = ActivitySnapshot::new();
        for pid in self.agent_pids().await {
            // A pid can exit between ps and lsof; just skip it.
            if let Some(cwd) = self.cwd_of(pid).await {
                snapshot.entry(cwd).or_default().push(pid);
            }
        }
        debug!(dirs = snapshot.len(), "process snapshot taken");
        snapshot
    }
}

/// Whether a session counts as active: recent transcript writes OR a
/// running agent whose working directory is exactly the session's.
pub fn is_active(session: &SessionInfo, window: Duration, snapshot: &ActivitySnapshot) -> bool {
    let age = Local::now() - session.last_modified;
    if let Ok(window) = chrono::Duration::from_std(window) {
        if age <= window {
            return true;
        }
    }
    snapshot.contains_key(&session.cwd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::path::Path;

    fn sample_session(cwd: &str, modified_secs_ago: i64) -> SessionInfo {
        SessionInfo {
            session_id: "sess-1".to_string(),
            cwd: PathBuf::from(cwd),
            encoded_cwd: crate::paths::encode(Path::new(cwd)),
            path: PathBuf::from("/tmp/sess-1.jsonl"),
            last_modified: Local::now() - ChronoDuration::seconds(modified_secs_ago),
            file_size: 128,
        }
    }

    #[test]
    fn recent_write_is_active_without_processes() {
        let session = sample_session("/work/app", 5);
        assert!(is_active(&session, Duration::from_secs(60), &ActivitySnapshot::new()));
    }

    #[test]
    fn stale_session_without_process_is_inactive() {
        let session = sample_session("/work/app", 3600);
        assert!(!is_active(&session, Duration::from_secs(60), &ActivitySnapshot::new()));
    }

    #[test]
    fn running_process_keeps_stale_session_active() {
        let session = sample_session("/work/app", 3600);
        let mut snapshot = ActivitySnapshot::new();
        snapshot.insert(PathBuf::from("/work/app"), vec![4242]);
        assert!(is_active(&session, Duration::from_secs(60), &snapshot));
    }

    #[test]
    fn process_match_is_exact_not_prefix() {
        let session = sample_session("/work/app", 3600);
        let mut snapshot = ActivitySnapshot::new();
        snapshot.insert(PathBuf::from("/work/app/subdir"), vec![4242]);
        snapshot.insert(PathBuf::from("/work"), vec![4243]);
        assert!(!is_active(&session, Duration::from_secs(60), &snapshot));
    }

    #[test]
    fn lsof_parse_accepts_only_path_name_fields() {
        let output = "p1234\nn/work/app\n";
        assert_eq!(parse_lsof_cwd(output), Some(PathBuf::from("/work/app")));

        // An 'n'-prefixed field that is not an absolute path is not a cwd.
        assert_eq!(parse_lsof_cwd("p1234\nno such file\n"), None);
        assert_eq!(parse_lsof_cwd(""), None);
    }

    #[tokio::test]
    async fn snapshot_with_unmatchable_binary_is_empty() {
        let inspector =
            CommandInspector::new("no-such-agent-binary-zz", Duration::from_secs(5));
        let snapshot = inspector.snapshot().await;
        assert!(snapshot.is_empty());
    }
}
