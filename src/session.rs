//! The reconciled view of one remote build session.
//!
//! [`Session`] is the single aggregate every observed event folds into. It is
//! owned and mutated in exactly one place (the reducer); everything else sees
//! it through snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error_index::ErrorIndex;
use crate::journal::Journal;
use crate::tiers::TierTracker;

/// Lifecycle status of a remote session.
///
/// ```text
/// preparing -> ready -> running <-> paused
///                          |           |
///                          v           v
///                     awaiting_input (answer returns to running)
///                          |
///        running/paused -> stopping -> stopped
///                          |
///                          +-> completed | error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Preparing,
    Ready,
    Running,
    Paused,
    AwaitingInput,
    Stopping,
    Stopped,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Preparing => "preparing",
            SessionStatus::Ready => "ready",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::AwaitingInput => "awaiting_input",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }

    /// Terminal states absorb: no further transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Stopped | SessionStatus::Error
        )
    }

    /// States in which the backend is actively building and the sync poller
    /// should run.
    pub fn is_pollable(&self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Paused)
    }

    /// States in which corrective commands (fix, regenerate) may target an
    /// error. Never while actively running: a correction would race the live
    /// process.
    pub fn allows_error_actions(&self) -> bool {
        matches!(
            self,
            SessionStatus::Paused
                | SessionStatus::Error
                | SessionStatus::Completed
                | SessionStatus::Stopped
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// The table is deliberately tolerant of forward jumps: the channel drops
    /// events, so a `running` report may be the first sign of a session we
    /// still believed to be `preparing`. Regressions are rejected - a stale
    /// out-of-order report must not walk the view backwards.
    pub fn accepts(self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if self.is_terminal() || self == next {
            return false;
        }
        match (self, next) {
            // Every live state can learn it just ended; dropped intermediate
            // events must not wedge the view short of its outcome.
            (_, Completed | Error | Stopped) => true,
            (Stopping, _) => false,
            (_, Stopping) => true,
            (Preparing, Ready | Running | Paused | AwaitingInput) => true,
            (Ready, Running | Paused | AwaitingInput) => true,
            (Running, Paused | AwaitingInput) => true,
            (Paused, Running | AwaitingInput) => true,
            (AwaitingInput, Running) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of attempting a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Applied { from: SessionStatus },
    /// Same status again; redelivery is expected and silent.
    NoOp,
    /// Illegal transition (regression or from a terminal state).
    Rejected,
}

/// Token counters for one worker tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounters {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenCounters {
    pub fn accumulate(&mut self, other: TokenCounters) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.total = self.total.saturating_add(other.total);
    }

    /// Per-field maximum, used when merging counters of unknown freshness.
    pub fn merge_max(&mut self, other: TokenCounters) {
        self.input = self.input.max(other.input);
        self.output = self.output.max(other.output);
        self.total = self.total.max(other.total);
    }
}

/// Status of one unit of work (a phase or task from the build plan).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Done,
    Skipped,
    Error,
}

/// One unit of work from the build overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub name: String,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_tier: Option<String>,
}

/// A question from the backend that blocks further progress until answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub question_id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// The full reconciled session aggregate.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub total_units: u64,
    pub completed_units: u64,
    pub units: Vec<Unit>,
    /// Per-tier token counters, keyed by the server-assigned tier name.
    pub token_usage: BTreeMap<String, TokenCounters>,
    pub cost_estimate: f64,
    pub errors: ErrorIndex,
    pub tiers: TierTracker,
    pub journal: Journal,
    pub pending_clarification: Option<ClarificationRequest>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Preparing,
            total_units: 0,
            completed_units: 0,
            units: Vec::new(),
            token_usage: BTreeMap::new(),
            cost_estimate: 0.0,
            errors: ErrorIndex::new(),
            tiers: TierTracker::new(),
            journal: Journal::new(),
            pending_clarification: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Attempts a status transition, consulting the legality table.
    pub fn transition(&mut self, next: SessionStatus) -> StatusChange {
        if self.status == next {
            return StatusChange::NoOp;
        }
        if !self.status.accepts(next) {
            return StatusChange::Rejected;
        }
        let from = self.status;
        self.status = next;
        StatusChange::Applied { from }
    }

    pub fn set_updated_at(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn unit_mut(&mut self, id: &str) -> Option<&mut Unit> {
        self.units.iter_mut().find(|u| u.id == id)
    }

    /// Sum of token counters across all tiers.
    pub fn tokens_total(&self) -> TokenCounters {
        let mut total = TokenCounters::default();
        for counters in self.token_usage.values() {
            total.accumulate(*counters);
        }
        total
    }

    /// Count of units currently marked done.
    pub fn units_done(&self) -> u64 {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Done)
            .count() as u64
    }
}
