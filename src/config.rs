//! Configuration for agentdeck.
//!
//! All settings come from environment variables with built-in defaults, so
//! a hosting application can run the pipeline with zero setup.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `AGENTDECK_PROJECTS_DIR` | `~/.claude/projects` | Root of the transcript tree |
//! | `AGENTDECK_AGENT_BIN` | `claude` | Command name of the monitored agent |
//! | `AGENTDECK_ACTIVITY_WINDOW_SECS` | 60 | File-recency window for liveness |
//! | `AGENTDECK_REFRESH_SECS` | 5 | Periodic rescan interval |
//! | `AGENTDECK_DEBOUNCE_MS` | 500 | Watcher debounce window |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::utils::DEFAULT_DEBOUNCE_MS;

/// Default command name of the monitored agent binary.
const DEFAULT_AGENT_BIN: &str = "claude";

/// Default transcript root relative to home.
const DEFAULT_PROJECTS_DIR: &str = ".claude/projects";

/// Default liveness window in seconds.
const DEFAULT_ACTIVITY_WINDOW_SECS: u64 = 60;

/// Default periodic refresh interval in seconds.
const DEFAULT_REFRESH_SECS: u64 = 5;

/// Default per-command budget for process inspection.
const DEFAULT_INSPECTION_TIMEOUT_SECS: u64 = 5;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Runtime configuration for the session pipeline and terminal subsystem.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory containing per-project transcript subdirectories.
    pub projects_dir: PathBuf,

    /// Command name of the monitored agent binary.
    pub agent_binary: String,

    /// How recently a transcript must have been written to count as live.
    pub activity_window: Duration,

    /// Sleep between periodic rescans.
    pub refresh_interval: Duration,

    /// Watcher debounce window for coalescing bursts of file events.
    pub debounce_interval: Duration,

    /// Hard ceiling for each external process-inspection command.
    pub inspection_timeout: Duration,
}

impl Config {
    /// Loads configuration from environment variables, applying defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDirectory`] if no projects directory is
    /// configured and the home directory cannot be determined, or
    /// [`ConfigError::InvalidValue`] for unparsable numeric overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let projects_dir = match env::var("AGENTDECK_PROJECTS_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let base = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base.home_dir().join(DEFAULT_PROJECTS_DIR)
            }
        };

        let agent_binary = env::var("AGENTDECK_AGENT_BIN")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_AGENT_BIN.to_string());

        let activity_window = Duration::from_secs(parse_env_u64(
            "AGENTDECK_ACTIVITY_WINDOW_SECS",
            DEFAULT_ACTIVITY_WINDOW_SECS,
        )?);
        let refresh_interval =
            Duration::from_secs(parse_env_u64("AGENTDECK_REFRESH_SECS", DEFAULT_REFRESH_SECS)?);
        let debounce_interval =
            Duration::from_millis(parse_env_u64("AGENTDECK_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)?);

        Ok(Self {
            projects_dir,
            agent_binary,
            activity_window,
            refresh_interval,
            debounce_interval,
            inspection_timeout: Duration::from_secs(DEFAULT_INSPECTION_TIMEOUT_SECS),
        })
    }
}

/// Parses an optional numeric environment variable.
fn parse_env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: "expected a non-negative integer".to_string(),
        }),
        _ => Ok(default),
    }
}
