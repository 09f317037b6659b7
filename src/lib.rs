//! AgentDeck - session intelligence for local Claude Code agents.
//!
//! This crate discovers agent session transcripts under
//! `~/.claude/projects/**/*.jsonl`, parses them into structured session and
//! tool-use records, tracks which sessions are backed by a live agent
//! process, and keeps everything reconciled in an observable in-memory
//! store. It also embeds agents directly: a PTY subsystem spawns the agent
//! binary under a real terminal with input, interrupt escalation, and a
//! two-level shutdown, and a spawner opens sessions in external terminals.
//!
//! # Overview
//!
//! Data flows in one direction. The [`scanner`] discovers transcripts and
//! the [`watcher`] reports changes to them; the [`parser`] turns transcript
//! lines into [`parser::SessionSnapshot`]s, incrementally for files that
//! are still growing; the [`process`] module decides whether a session is
//! live; and the [`monitor`] coordinates all of it into the [`store`],
//! which downstream code reads and observes.
//!
//! # Modules
//!
//! - [`config`]: configuration from environment variables
//! - [`error`]: crate-level error type
//! - [`paths`]: working-directory encoding used by project directory names
//! - [`scanner`]: transcript discovery
//! - [`parser`]: transcript JSONL parsing
//! - [`process`]: process-table liveness inspection
//! - [`store`]: observable session/agent store
//! - [`watcher`]: filesystem watcher with debounced classification
//! - [`monitor`]: coordination of discovery, parsing, and liveness
//! - [`pty`]: embedded pseudo-terminal sessions
//! - [`spawner`]: launching sessions in external terminals
//! - [`utils`]: shared utilities (debouncing, etc.)

pub mod config;
pub mod error;
pub mod monitor;
pub mod parser;
pub mod paths;
pub mod process;
pub mod pty;
pub mod scanner;
pub mod spawner;
pub mod store;
pub mod utils;
pub mod watcher;

pub use config::{Config, ConfigError};
pub use error::{DeckError, Result};
pub use monitor::Monitor;
pub use parser::{
    ParseError, SessionSnapshot, ToolCategory, ToolStatus, ToolUseRecord,
};
pub use process::{ActivitySnapshot, CommandInspector, ProcessInspector};
pub use pty::{InterruptOutcome, PtyError, PtyEvent, PtySession};
pub use scanner::SessionInfo;
pub use spawner::{detect_terminal, CommandSpawner, TerminalKind, TerminalSpawner};
pub use store::{
    AgentRecord, AgentStatus, SessionRecord, SessionStore, StoreChange, StoreCounts,
};
pub use utils::{DebounceError, Debouncer, DEFAULT_DEBOUNCE_MS};
pub use watcher::{SessionEvent, SessionWatcher, WatcherError, WatcherState};
