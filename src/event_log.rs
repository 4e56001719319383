//! Structured JSONL log of everything the console observed and did.
//!
//! One line per record, with monotonic sequence numbers so a session can be
//! reconstructed after the fact: which events arrived on which channel, what
//! the reducer did with them, which commands the operator sent and how the
//! backend answered. Lives under the session's logs directory.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::events::{ForgeEvent, PollSnapshot};

/// Append-only JSONL sink for one session.
pub struct EventLog {
    session_id: String,
    seq: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

/// A single record in JSONL format.
#[derive(Serialize, serde::Deserialize)]
pub struct EventLogRecord {
    /// Monotonic sequence number (unique within this log file)
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds
    pub ts: String,
    pub session_id: String,
    /// Component that emitted the record
    pub component: String,
    /// Structured record data
    pub event: Value,
}

impl EventLog {
    /// Creates the log for the given session.
    ///
    /// Records are written to `<logs_dir>/events-<run id>.jsonl`. Each attach
    /// gets its own file so two consoles watching the same session never
    /// interleave records or collide on sequence numbers.
    ///
    /// # Errors
    ///
    /// Returns an error if the logs directory cannot be created or the log
    /// file cannot be opened.
    pub fn new(session_id: &str, logs_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let run_id = &uuid::Uuid::new_v4().to_string()[..8];
        let log_path = logs_dir.join(format!("events-{}.jsonl", run_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            session_id: session_id.to_string(),
            seq: AtomicU64::new(0),
            log_file: Mutex::new(file),
            log_path,
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Writes a structured record. Thread-safe; IO failures are swallowed so
    /// logging can never take the intake loop down.
    pub fn log(&self, component: &str, event: impl Serialize) {
        let record = EventLogRecord {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            session_id: self.session_id.clone(),
            component: component.to_string(),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
        };

        if let Ok(mut file) = self.log_file.lock() {
            if let Ok(line) = serde_json::to_string(&record) {
                if let Err(err) = writeln!(file, "{}", line) {
                    tracing::debug!(error = %err, "event log write failed");
                }
                let _ = file.flush();
            }
        }
    }

    /// Records an observed event and what the reducer did with it.
    pub fn log_observed(&self, channel: &str, event: &ForgeEvent, disposition: &str) {
        self.log(
            "reducer",
            serde_json::json!({
                "type": "observed",
                "channel": channel,
                "kind": event.kind(),
                "disposition": disposition,
                "event": event,
            }),
        );
    }

    /// Records a poll snapshot as consumed.
    pub fn log_poll_snapshot(&self, snapshot: &PollSnapshot) {
        self.log(
            "poller",
            serde_json::json!({
                "type": "poll_snapshot",
                "status": snapshot.status,
                "completed_units": snapshot.completed_units,
                "log_lines": snapshot.logs.len(),
            }),
        );
    }

    /// Records the forced-completion assumption after repeated 404s.
    pub fn log_poll_vanished(&self, checks: u32) {
        self.log(
            "poller",
            serde_json::json!({
                "type": "poll_vanished",
                "consecutive_not_found": checks,
            }),
        );
    }

    /// Records live-channel connectivity changes.
    pub fn log_channel(&self, state: &str, detail: &str) {
        self.log(
            "push",
            serde_json::json!({
                "type": "channel",
                "state": state,
                "detail": detail,
            }),
        );
    }

    /// Records an operator command leaving the console.
    pub fn log_command_sent(&self, verb: &str) {
        self.log(
            "dispatcher",
            serde_json::json!({
                "type": "command_sent",
                "verb": verb,
            }),
        );
    }

    /// Records the backend's answer (or transport failure) for a command.
    pub fn log_dispatch_outcome(&self, verb: &str, outcome: &str, detail: Option<&str>) {
        self.log(
            "dispatcher",
            serde_json::json!({
                "type": "command_outcome",
                "verb": verb,
                "outcome": outcome,
                "detail": detail,
            }),
        );
    }

    /// Returns the path to the log file.
    pub fn path(&self) -> &Path {
        &self.log_path
    }
}
