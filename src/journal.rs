//! Ordered in-memory journal of session activity.
//!
//! The journal is the operator-facing log feed: every observed event that has
//! a human-readable consequence lands here as a [`LogEntry`]. Entries arrive
//! from two directions - the live event channel and poll backfill - and the
//! journal keeps a consumed-line cursor for the latter so the two never
//! duplicate each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity / channel of a journal entry.
///
/// Ordering is by display priority: `Debug` entries are hidden by default,
/// `Error` entries always surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Thinking,
    Info,
    System,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Thinking => "thinking",
            LogLevel::Info => "info",
            LogLevel::System => "system",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured payload carried by specialized journal entries.
///
/// Most entries are plain text; a few event kinds keep machine-readable
/// details alongside the rendered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogPayload {
    /// An agent wrote to its scratchpad.
    ScratchpadWrite { agent: String, content: String },
    /// A model invocation preview (model name plus prompt excerpt).
    LlmThinking { model: String, preview: String },
    /// Per-tier completion counters at the time of the entry.
    TierProgress { tier: u32, done: usize, total: usize },
}

/// A single journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Origin of the line: an agent id, "forge", "console", "poll", ...
    pub source: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<LogPayload>,
}

impl LogEntry {
    pub fn new(source: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            level,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: LogPayload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Append-only view of session activity with a separate backfill cursor.
///
/// The cursor counts how many server-side log lines have been consumed via
/// polling. It is intentionally independent of the visible entries: clearing
/// the view must not cause the next poll response to re-insert lines the
/// operator already saw.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<LogEntry>,
    backfill_cursor: usize,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry produced locally (event channel, command echo, notices).
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Convenience wrapper for plain text entries.
    pub fn log(&mut self, source: &str, level: LogLevel, message: impl Into<String>) {
        self.push(LogEntry::new(source, level, message));
    }

    /// Appends an entry backfilled from a poll response and advances the
    /// consumed-line cursor.
    pub fn push_backfilled(&mut self, entry: LogEntry) {
        self.entries.push(entry);
        self.backfill_cursor += 1;
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of server-side log lines already consumed by backfill.
    pub fn backfill_cursor(&self) -> usize {
        self.backfill_cursor
    }

    /// Drops all visible entries while keeping the backfill cursor.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
