//! Transcript parser for agent session JSONL files.
//!
//! Each transcript is an append-only file with one JSON object per line.
//! The parser turns a whole file into a [`SessionSnapshot`], or — given a
//! byte offset — returns only the newly appended entries so a live session
//! can be tailed without re-reading history.
//!
//! # Incremental contract
//!
//! [`parse_incremental`] only ever advances the returned offset past
//! complete lines (a trailing partial line is left for the next read), so
//! replaying a file in any number of line-aligned batches through
//! [`SessionSnapshot::apply`] yields the same final state as one full pass.
//! The pending invocation/result match map lives inside the snapshot for the
//! same reason: a result arriving in a later batch still finds its
//! invocation.
//!
//! # Recognized line format
//!
//! Top-level fields: `type`, `timestamp`, `sessionId`, `slug`, `gitBranch`,
//! `cwd`, `summary`, and a `message` whose `content` is either a string or a
//! list of blocks (`text`, `tool_use`, `tool_result`). Malformed lines are
//! skipped without aborting the parse.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Maximum width of a tool-use preview before truncation.
const PREVIEW_WIDTH: usize = 60;

/// Maximum width of a stored tool result or error text.
const RESULT_WIDTH: usize = 200;

/// Minimum length for a user text block to become the summary fallback.
const MIN_SUMMARY_LEN: usize = 10;

/// Marker prefixed to resumed-conversation transcripts.
const CONTINUATION_MARKER: &str = "This session is being continued";

/// Errors that can occur while reading a transcript.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Failed to open or stat the transcript file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Category of a tool, derived from its naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    /// A built-in tool such as `Read` or `Bash`.
    Builtin,
    /// A skill or slash command (`/review`, `foo__bar`).
    Skill,
    /// An MCP server tool (`mcp__github__get_file`).
    Mcp,
}

impl ToolCategory {
    /// Classifies a tool by name. The `mcp__` prefix wins over the generic
    /// double-underscore rule.
    pub fn classify(name: &str) -> Self {
        if name.starts_with("mcp__") {
            Self::Mcp
        } else if name.starts_with('/') || name.contains("__") {
            Self::Skill
        } else {
            Self::Builtin
        }
    }
}

/// Lifecycle status of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    /// Invocation seen, no result yet.
    Running,
    /// Result arrived without an error flag.
    Completed,
    /// Result arrived flagged as an error.
    Failed,
}

/// One tool invocation and, once matched, its result.
#[derive(Debug, Clone)]
pub struct ToolUseRecord {
    /// Invocation id, unique within a session.
    pub id: String,
    /// Tool name as written by the agent.
    pub name: String,
    /// Category derived from the name.
    pub category: ToolCategory,
    /// Invocation parameters.
    pub parameters: HashMap<String, Value>,
    /// Current lifecycle status.
    pub status: ToolStatus,
    /// When the invocation was seen.
    pub started_at: DateTime<Local>,
    /// Short display preview derived from the parameters.
    pub preview: String,
    /// Truncated success text, once a result arrives.
    pub result_preview: Option<String>,
    /// Truncated error text, if the result was an error.
    pub error_message: Option<String>,
}

impl ToolUseRecord {
    /// Human-readable display name.
    ///
    /// MCP tools render as `Server: tool`, skills keep a leading slash.
    pub fn display_name(&self) -> String {
        match self.category {
            ToolCategory::Mcp => {
                let parts: Vec<&str> = self.name.split("__").collect();
                if parts.len() >= 3 {
                    return format!("{}: {}", capitalize(parts[1]), parts[2]);
                }
                self.name.clone()
            }
            ToolCategory::Skill if !self.name.starts_with('/') => format!("/{}", self.name),
            _ => self.name.clone(),
        }
    }
}

/// One decoded transcript line.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptEntry {
    /// Entry kind: `summary`, `user`, `assistant`, `system`, ...
    #[serde(rename = "type", default)]
    pub entry_type: String,

    /// ISO-8601 timestamp, optional trailing `Z`.
    #[serde(default)]
    pub timestamp: Option<String>,

    /// Session id embedded in the entry; overrides the filename-derived id.
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,

    /// Human-readable session slug.
    #[serde(default)]
    pub slug: Option<String>,

    /// Git branch at the time of the entry.
    #[serde(rename = "gitBranch", default)]
    pub git_branch: Option<String>,

    /// Working directory declared by the agent.
    #[serde(default)]
    pub cwd: Option<String>,

    /// Summary text for `summary`-type entries.
    #[serde(default)]
    pub summary: Option<String>,

    /// Message body with content blocks.
    #[serde(default)]
    pub message: Option<RawMessage>,
}

/// Message body as written to the transcript.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    /// Either a plain string or an array of content blocks.
    #[serde(default)]
    pub content: Value,
}

impl RawMessage {
    /// Decodes the content field into typed blocks, skipping anything
    /// unrecognized (thinking blocks, future kinds) without failing the
    /// whole entry.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            Value::String(text) => vec![ContentBlock::Text { text: text.clone() }],
            Value::Array(items) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A recognized content block within a message body.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text authored by the user or the model.
    Text {
        #[serde(default)]
        text: String,
    },

    /// A tool invocation authored by the model.
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },

    /// A tool result carried inside a user-authored entry.
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: Value,
    },
}

/// Structured state of one session, accumulated line by line.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Session id (filename stem, overridden by an embedded `sessionId`).
    pub session_id: String,
    /// Working directory declared by the transcript, if any.
    pub cwd: Option<PathBuf>,
    /// Human-readable slug, defaulting to a prefix of the id.
    pub slug: String,
    /// Git branch, captured on first sight.
    pub git_branch: Option<String>,
    /// When the session started (first timestamp, else file mtime).
    pub started_at: DateTime<Local>,
    /// Most recent activity (last timestamp, else file mtime).
    pub last_activity: DateTime<Local>,
    /// Tool invocations in transcript order.
    pub tool_uses: Vec<ToolUseRecord>,
    /// Count of user and assistant messages.
    pub message_count: usize,
    /// Transcript path.
    pub path: PathBuf,
    /// Byte offset just past the last consumed line.
    pub cursor: u64,

    /// Summary from a `summary`-type entry.
    summary: Option<String>,
    /// Fallback summary from the first substantial user text.
    first_user_text: Option<String>,
    /// Invocation ids awaiting a result, by index into `tool_uses`.
    pending: HashMap<String, usize>,
    /// Whether any entry carried a timestamp.
    saw_timestamp: bool,
}

impl SessionSnapshot {
    /// Creates an empty snapshot. `fallback` (normally the file mtime)
    /// seeds both timestamps until a real one is observed.
    pub fn new(session_id: String, path: PathBuf, fallback: DateTime<Local>) -> Self {
        let slug = session_id.chars().take(8).collect();
        Self {
            session_id,
            cwd: None,
            slug,
            git_branch: None,
            started_at: fallback,
            last_activity: fallback,
            tool_uses: Vec::new(),
            message_count: 0,
            path,
            cursor: 0,
            summary: None,
            first_user_text: None,
            pending: HashMap::new(),
            saw_timestamp: false,
        }
    }

    /// The session summary: an explicit summary entry wins, then the first
    /// substantial user text, then a placeholder.
    pub fn summary(&self) -> &str {
        self.summary
            .as_deref()
            .or(self.first_user_text.as_deref())
            .unwrap_or("No summary available")
    }

    /// Folds one transcript entry into the snapshot.
    pub fn apply(&mut self, entry: &TranscriptEntry) {
        let timestamp = entry.timestamp.as_deref().map(parse_timestamp);
        if let Some(ts) = timestamp {
            if !self.saw_timestamp {
                self.started_at = ts;
                self.saw_timestamp = true;
            }
            self.last_activity = ts;
        }

        if let Some(id) = &entry.session_id {
            self.session_id = id.clone();
        }
        if let Some(slug) = &entry.slug {
            if !slug.is_empty() && self.slug == id_prefix(&self.session_id) {
                self.slug = slug.clone();
            }
        }
        if self.git_branch.is_none() {
            if let Some(branch) = entry.git_branch.as_ref().filter(|b| !b.is_empty()) {
                self.git_branch = Some(branch.clone());
            }
        }
        if self.cwd.is_none() {
            if let Some(cwd) = entry.cwd.as_ref().filter(|c| !c.is_empty()) {
                self.cwd = Some(PathBuf::from(cwd));
            }
        }

        match entry.entry_type.as_str() {
            "summary" => {
                if self.summary.is_none() {
                    if let Some(text) = entry.summary.as_ref().filter(|s| !s.is_empty()) {
                        self.summary = Some(text.clone());
                    }
                }
            }
            "assistant" => {
                self.message_count += 1;
                let started_at = timestamp.unwrap_or(self.last_activity);
                for block in entry.message.iter().flat_map(RawMessage::blocks) {
                    if let ContentBlock::ToolUse { id, name, input } = block {
                        self.push_tool_use(id, name, input, started_at);
                    }
                }
            }
            "user" => {
                self.message_count += 1;
                for block in entry.message.iter().flat_map(RawMessage::blocks) {
                    match block {
                        ContentBlock::ToolResult {
                            tool_use_id,
                            is_error,
                            content,
                        } => self.resolve_tool_use(&tool_use_id, is_error, &content),
                        ContentBlock::Text { text } => self.consider_summary_fallback(&text),
                        ContentBlock::ToolUse { .. } => {}
                    }
                }
            }
            _ => {}
        }
    }

    fn push_tool_use(&mut self, id: String, name: String, input: Value, at: DateTime<Local>) {
        let parameters: HashMap<String, Value> = match input {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        let record = ToolUseRecord {
            preview: tool_preview(&name, &parameters),
            category: ToolCategory::classify(&name),
            id: id.clone(),
            name,
            parameters,
            status: ToolStatus::Running,
            started_at: at,
            result_preview: None,
            error_message: None,
        };
        self.pending.insert(id, self.tool_uses.len());
        self.tool_uses.push(record);
    }

    /// Attaches a result to its pending invocation. Results whose id is not
    /// in the current parse window are dropped.
    fn resolve_tool_use(&mut self, tool_use_id: &str, is_error: bool, content: &Value) {
        let Some(index) = self.pending.remove(tool_use_id) else {
            trace!(tool_use_id, "dropping result for unknown invocation");
            return;
        };
        let record = &mut self.tool_uses[index];
        let text = truncate(&result_text(content), RESULT_WIDTH);
        if is_error {
            record.status = ToolStatus::Failed;
            record.error_message = Some(text);
        } else {
            record.status = ToolStatus::Completed;
            record.result_preview = Some(text);
        }
    }

    fn consider_summary_fallback(&mut self, text: &str) {
        if self.first_user_text.is_some() {
            return;
        }
        let trimmed = text.trim();
        if trimmed.chars().count() < MIN_SUMMARY_LEN
            || trimmed.starts_with(CONTINUATION_MARKER)
            || is_context_notice(trimmed)
        {
            return;
        }
        self.first_user_text = Some(truncate(trimmed, RESULT_WIDTH));
    }
}

/// Parses a whole transcript into a snapshot.
///
/// Returns `Ok(None)` with a logged warning when the file does not exist;
/// per the batch contract this never aborts a caller iterating many files.
pub fn parse_full(path: &Path) -> Result<Option<SessionSnapshot>, ParseError> {
    if !path.exists() {
        warn!(path = %path.display(), "transcript not found");
        return Ok(None);
    }

    let fallback = file_mtime(path)?;
    let session_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut snapshot = SessionSnapshot::new(session_id, path.to_path_buf(), fallback);
    let (entries, offset) = parse_incremental(path, 0)?;
    for entry in &entries {
        snapshot.apply(entry);
    }
    snapshot.cursor = offset;

    debug!(
        session = %snapshot.session_id,
        entries = entries.len(),
        tools = snapshot.tool_uses.len(),
        "parsed transcript"
    );
    Ok(Some(snapshot))
}

/// Reads entries appended since `from_offset`.
///
/// Returns the decoded entries and the new cursor, which sits just past the
/// last complete line read. A file shorter than the given offset is treated
/// as truncated and re-read from the start. Mid-read I/O errors stop the
/// scan but keep everything consumed so far.
pub fn parse_incremental(
    path: &Path,
    from_offset: u64,
) -> Result<(Vec<TranscriptEntry>, u64), ParseError> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }

    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let start = if size < from_offset {
        debug!(path = %path.display(), "transcript shrank, rereading from start");
        0
    } else {
        from_offset
    };
    file.seek(SeekFrom::Start(start))?;

    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut offset = start;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(read) => {
                if !line.ends_with('\n') {
                    // Partial trailing line; leave it for the next read.
                    break;
                }
                offset += read as u64;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TranscriptEntry>(trimmed) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => trace!(path = %path.display(), error = %e, "skipping malformed line"),
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "read error mid-transcript");
                break;
            }
        }
    }

    Ok((entries, offset))
}

/// Cheap summary-only scan, for callers that don't need a full parse.
pub fn read_summary(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let line = line.ok()?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<TranscriptEntry>(trimmed) {
            if entry.entry_type == "summary" {
                return entry.summary;
            }
        }
    }
    None
}

/// Parses an ISO-8601 timestamp (optional trailing `Z`) into local time.
/// Unparsable values fall back to now.
fn parse_timestamp(raw: &str) -> DateTime<Local> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Local))
        .unwrap_or_else(|_| Local::now())
}

/// File modification time in local time.
fn file_mtime(path: &Path) -> Result<DateTime<Local>, ParseError> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(DateTime::<Local>::from(modified))
}

/// How a tool's preview is built from its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreviewKind {
    /// Shell-style tools: show the command text.
    Command,
    /// File tools: show the target path.
    FileOp,
    /// Search tools: show the pattern and its scope.
    Search,
    /// Everything else: show the first parameter value.
    Generic,
}

impl PreviewKind {
    fn for_tool(name: &str) -> Self {
        match name {
            "Bash" => Self::Command,
            "Read" | "Write" | "Edit" | "NotebookEdit" => Self::FileOp,
            "Grep" | "Glob" => Self::Search,
            _ => Self::Generic,
        }
    }
}

/// Builds the display preview for a tool invocation.
fn tool_preview(name: &str, parameters: &HashMap<String, Value>) -> String {
    let param_str = |key: &str| {
        parameters
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let text = match PreviewKind::for_tool(name) {
        PreviewKind::Command => param_str("command").unwrap_or_default(),
        PreviewKind::FileOp => param_str("file_path")
            .or_else(|| param_str("notebook_path"))
            .unwrap_or_default(),
        PreviewKind::Search => {
            let pattern = param_str("pattern").unwrap_or_default();
            match param_str("path") {
                Some(scope) if !scope.is_empty() => format!("{pattern} in {scope}"),
                _ => pattern,
            }
        }
        PreviewKind::Generic => parameters
            .iter()
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, v)| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
    };

    truncate(&text, PREVIEW_WIDTH)
}

/// Flattens a tool-result content value into plain text.
fn result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Truncates to `width` characters, keeping a trailing ellipsis when cut.
fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Whether a user text block is a context-window notice rather than content.
fn is_context_notice(text: &str) -> bool {
    text.starts_with("[Request interrupted") || text.contains("context window")
}

fn id_prefix(session_id: &str) -> String {
    session_id.chars().take(8).collect()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
