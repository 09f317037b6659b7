//! Error types for agentdeck.
//!
//! Each subsystem defines its own error enum next to its code; this module
//! provides the crate-level [`DeckError`] that callers who don't care about
//! the specific subsystem can bubble everything into.

use thiserror::Error;

use crate::config::ConfigError;
use crate::parser::ParseError;
use crate::pty::PtyError;
use crate::watcher::WatcherError;

/// Errors that can occur across agentdeck operations.
#[derive(Error, Debug)]
pub enum DeckError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transcript parsing error.
    #[error("transcript error: {0}")]
    Parse(#[from] ParseError),

    /// File watching error.
    #[error("file watch error: {0}")]
    Watch(#[from] WatcherError),

    /// Embedded terminal session error.
    #[error("pty error: {0}")]
    Pty(#[from] PtyError),
}

/// A specialized `Result` type for agentdeck operations.
pub type Result<T> = std::result::Result<T, DeckError>;
