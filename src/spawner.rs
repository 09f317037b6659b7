//! Launching agent sessions in external terminals.
//!
//! When the user wants a session in a real terminal window rather than an
//! embedded PTY, the spawner detects what is available (tmux, iTerm2,
//! Terminal.app) and opens one with the agent started in the requested
//! working directory. Every failure path returns `false` and logs; spawning
//! is best-effort by nature.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::pty::resolve_binary;

/// How long a terminal launch command may take.
const SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A terminal program sessions can be launched into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Iterm2,
    TerminalApp,
    Tmux,
    Unknown,
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Iterm2 => "iterm2",
            Self::TerminalApp => "terminal",
            Self::Tmux => "tmux",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Picks the best available terminal: a surrounding tmux session first,
/// then iTerm2, then Terminal.app.
pub fn detect_terminal() -> TerminalKind {
    if std::env::var_os("TMUX").is_some() {
        return TerminalKind::Tmux;
    }
    if iterm2_available() {
        return TerminalKind::Iterm2;
    }
    if terminal_app_available() {
        return TerminalKind::TerminalApp;
    }
    TerminalKind::Unknown
}

/// All terminals usable right now, in preference order.
pub fn available_terminals() -> Vec<TerminalKind> {
    let mut available = Vec::new();
    if std::env::var_os("TMUX").is_some() {
        available.push(TerminalKind::Tmux);
    }
    if iterm2_available() {
        available.push(TerminalKind::Iterm2);
    }
    if terminal_app_available() {
        available.push(TerminalKind::TerminalApp);
    }
    available
}

fn iterm2_available() -> bool {
    Path::new("/Applications/iTerm.app").exists()
}

fn terminal_app_available() -> bool {
    // Location depends on the macOS version.
    Path::new("/System/Applications/Utilities/Terminal.app").exists()
        || Path::new("/Applications/Utilities/Terminal.app").exists()
}

/// Something that can open an agent session in a terminal.
#[async_trait]
pub trait TerminalSpawner: Send + Sync {
    /// Opens a terminal running the agent in `cwd`. Returns whether the
    /// launch command succeeded.
    async fn spawn_session(&self, cwd: &Path, kind: TerminalKind) -> bool;
}

/// Spawner backed by `osascript` and `tmux`.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    agent_binary: String,
}

impl CommandSpawner {
    pub fn new(agent_binary: impl Into<String>) -> Self {
        Self {
            agent_binary: agent_binary.into(),
        }
    }

    async fn spawn_iterm2(&self, cwd: &Path) -> bool {
        let script = format!(
            r#"
tell application "iTerm2"
    activate
    tell current window
        create tab with default profile
        tell current session
            write text "cd {} && {}"
        end tell
    end tell
end tell
"#,
            escape_applescript(&cwd.to_string_lossy()),
            self.agent_binary,
        );
        run_spawn_command("osascript", &["-e", &script]).await
    }

    async fn spawn_terminal_app(&self, cwd: &Path) -> bool {
        let script = format!(
            r#"
tell application "Terminal"
    activate
    do script "cd {} && {}"
end tell
"#,
            escape_applescript(&cwd.to_string_lossy()),
            self.agent_binary,
        );
        run_spawn_command("osascript", &["-e", &script]).await
    }

    async fn spawn_tmux(&self, cwd: &Path) -> bool {
        let window_name = format!("{}-{}", self.agent_binary, window_suffix(cwd));
        let cwd = cwd.to_string_lossy();
        run_spawn_command(
            "tmux",
            &["new-window", "-c", &cwd, "-n", &window_name, &self.agent_binary],
        )
        .await
    }
}

#[async_trait]
impl TerminalSpawner for CommandSpawner {
    async fn spawn_session(&self, cwd: &Path, kind: TerminalKind) -> bool {
        if !cwd.is_dir() {
            error!(cwd = %cwd.display(), "invalid working directory");
            return false;
        }
        if resolve_binary(&self.agent_binary).is_err() {
            error!(binary = %self.agent_binary, "agent binary not found on PATH");
            return false;
        }

        info!(cwd = %cwd.display(), terminal = %kind, "spawning terminal session");
        match kind {
            TerminalKind::Iterm2 => self.spawn_iterm2(cwd).await,
            TerminalKind::TerminalApp => self.spawn_terminal_app(cwd).await,
            TerminalKind::Tmux => self.spawn_tmux(cwd).await,
            TerminalKind::Unknown => {
                error!("no usable terminal detected");
                false
            }
        }
    }
}

async fn run_spawn_command(program: &str, args: &[&str]) -> bool {
    let result = timeout(SPAWN_TIMEOUT, Command::new(program).args(args).output()).await;
    match result {
        Ok(Ok(output)) if output.status.success() => true,
        Ok(Ok(output)) => {
            error!(
                program,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "terminal launch failed"
            );
            false
        }
        Ok(Err(e)) => {
            error!(program, error = %e, "terminal launch could not start");
            false
        }
        Err(_) => {
            warn!(program, "terminal launch timed out");
            false
        }
    }
}

fn escape_applescript(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Short window-name suffix from the directory's final component.
fn window_suffix(cwd: &Path) -> String {
    cwd.file_name()
        .map(|n| n.to_string_lossy().chars().take(10).collect())
        .unwrap_or_else(|| "session".to_string())
}
