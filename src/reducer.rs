//! The single place session state changes.
//!
//! Every observation - live events, poll snapshots, command acknowledgements,
//! channel health - funnels into [`SessionReducer`], which owns the
//! [`Session`] aggregate, folds each observation in exactly once, and
//! broadcasts a fresh [`SessionSnapshot`] on a watch channel afterwards.
//! Nothing else in the process mutates session state.
//!
//! Reduction never fails: an observation that cannot be applied (stale
//! status, unknown target, duplicate delivery) is journaled or dropped with
//! its disposition recorded in the event log, and the loop moves on.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::commands::{ConsoleCommand, DispatchOutcome, DispatchResult};
use crate::error_index::{ErrorSeverity, ResolutionMethod};
use crate::event_log::EventLog;
use crate::events::{ForgeEvent, PollSnapshot, TierPlan, UnitManifest};
use crate::journal::{LogEntry, LogLevel, LogPayload};
use crate::session::{
    ClarificationRequest, Session, SessionStatus, StatusChange, TokenCounters, Unit, UnitStatus,
};

/// Cheap copy of the headline view, broadcast after every mutation.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub total_units: u64,
    pub completed_units: u64,
    pub cost_estimate: f64,
    pub tokens_total: TokenCounters,
    pub open_errors: usize,
    pub journal_len: usize,
    pub has_tier_structure: bool,
    pub pending_clarification: Option<ClarificationRequest>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            total_units: session.total_units,
            completed_units: session.completed_units,
            cost_estimate: session.cost_estimate,
            tokens_total: session.tokens_total(),
            open_errors: session.errors.open_count(),
            journal_len: session.journal.len(),
            has_tier_structure: session.tiers.has_structure(),
            pending_clarification: session.pending_clarification.clone(),
            updated_at: session.updated_at,
        }
    }
}

/// Single-writer reducer for one session.
pub struct SessionReducer {
    session: Session,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    event_log: Arc<EventLog>,
    journal_tx: Option<mpsc::UnboundedSender<LogEntry>>,
}

impl SessionReducer {
    /// Creates the reducer around an initial session.
    ///
    /// Returns the reducer and a watch receiver for snapshots; the poller and
    /// the renderer observe through the receiver.
    pub fn new(
        session: Session,
        event_log: Arc<EventLog>,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let snapshot = SessionSnapshot::from(&session);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot);

        let reducer = Self {
            session,
            snapshot_tx,
            event_log,
            journal_tx: None,
        };

        (reducer, snapshot_rx)
    }

    /// Streams newly appended journal entries to `tx` (used by the renderer).
    pub fn with_journal_feed(mut self, tx: mpsc::UnboundedSender<LogEntry>) -> Self {
        self.journal_tx = Some(tx);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Releases the aggregate once reduction is over (for the final summary).
    pub fn into_session(self) -> Session {
        self.session
    }

    /// Applies one event from the live channel (or a replayed source).
    pub fn apply(&mut self, channel: &str, event: ForgeEvent) {
        let journal_before = self.session.journal.len();
        let disposition = self.apply_event(&event);
        self.event_log.log_observed(channel, &event, disposition);
        self.finish(journal_before);
    }

    /// Reconciles a poll snapshot into the session.
    pub fn apply_poll(&mut self, snapshot: PollSnapshot) {
        let journal_before = self.session.journal.len();

        let message = format!("session {} (via poll)", snapshot.status);
        self.observe_status(
            "poll_status",
            snapshot.status,
            Some((message, LogLevel::System)),
        );

        if self.session.completed_units < snapshot.completed_units {
            self.session.completed_units = snapshot.completed_units;
        }
        if let Some(total) = snapshot.total_units {
            self.session.total_units = self.session.total_units.max(total);
        }
        // Poll counters have no ordering relation to push counters, so merge
        // by maximum instead of overwriting; counters are cumulative and must
        // not regress on a stale response.
        for (tier, counters) in &snapshot.tokens {
            self.session
                .token_usage
                .entry(tier.clone())
                .or_default()
                .merge_max(*counters);
        }
        if let Some(cost) = snapshot.cost_estimate {
            if cost > self.session.cost_estimate {
                self.session.cost_estimate = cost;
            }
        }

        // Backfill: append only the suffix of server log lines we have not
        // consumed yet. The cursor survives journal clears.
        let consumed = self.session.journal.backfill_cursor();
        if snapshot.logs.len() > consumed {
            for line in &snapshot.logs[consumed..] {
                let mut entry = line.to_entry();
                if entry.level == LogLevel::Error {
                    let fingerprint = self.record_error(&entry.source, &entry.message);
                    entry.message = format!("{} [{}]", entry.message, fingerprint);
                }
                self.session.journal.push_backfilled(entry);
            }
        }

        self.event_log.log_poll_snapshot(&snapshot);
        self.finish(journal_before);
    }

    /// Applies the forced-completion assumption after the poller saw the
    /// session vanish repeatedly.
    pub fn poll_vanished(&mut self, checks: u32) {
        let journal_before = self.session.journal.len();
        if !self.session.status.is_terminal() {
            let message = format!(
                "session not found on server after {} checks; assuming the build completed",
                checks
            );
            self.observe_status(
                "poll_vanished",
                SessionStatus::Completed,
                Some((message, LogLevel::Warn)),
            );
            self.event_log.log_poll_vanished(checks);
        }
        self.finish(journal_before);
    }

    /// Journals a failed poll at debug level; outages are routine.
    pub fn poll_failed(&mut self, status: Option<u16>, detail: &str) {
        let journal_before = self.session.journal.len();
        let message = match status {
            Some(code) => format!("poll failed (HTTP {})", code),
            None => format!("poll failed ({})", detail),
        };
        self.session.journal.log("poll", LogLevel::Debug, message);
        self.finish(journal_before);
    }

    /// Records live channel connectivity changes.
    pub fn channel_status(&mut self, connected: bool, detail: &str) {
        let journal_before = self.session.journal.len();
        if connected {
            self.session
                .journal
                .log("console", LogLevel::System, "event stream connected");
            self.event_log.log_channel("connected", detail);
        } else {
            let message = if detail.is_empty() {
                "event stream disconnected; polling continues".to_string()
            } else {
                format!("event stream disconnected ({}); polling continues", detail)
            };
            self.session.journal.log("console", LogLevel::System, message);
            self.event_log.log_channel("disconnected", detail);
        }
        self.finish(journal_before);
    }

    /// Echoes an operator command and applies its immediate local effects.
    pub fn command_echoed(&mut self, command: &ConsoleCommand) {
        let journal_before = self.session.journal.len();
        self.session.journal.log(
            "console",
            LogLevel::Info,
            format!("> {}", command.describe()),
        );
        if let ConsoleCommand::Dismiss { fingerprint } = command {
            // Dismissal is a view action first; the backend is only notified.
            if self
                .session
                .errors
                .resolve(fingerprint, ResolutionMethod::Dismissed, Utc::now())
            {
                self.session.journal.log(
                    "console",
                    LogLevel::Info,
                    format!("error {} dismissed", fingerprint),
                );
            }
        }
        self.finish(journal_before);
    }

    /// Journals a command the console refused to send.
    pub fn command_refused(&mut self, command: &ConsoleCommand, reason: &str) {
        let journal_before = self.session.journal.len();
        self.session.journal.log(
            "console",
            LogLevel::Error,
            format!("{} refused: {}", command.verb(), reason),
        );
        self.finish(journal_before);
    }

    /// Clears the visible journal, keeping the backfill cursor.
    pub fn clear_journal(&mut self) {
        self.session.journal.clear();
        self.session
            .journal
            .log("console", LogLevel::System, "view cleared");
        self.finish(0);
    }

    /// Folds a backend acknowledgement (or failure) back into the view.
    pub fn dispatch_outcome(&mut self, outcome: DispatchOutcome) {
        let journal_before = self.session.journal.len();
        let verb = outcome.command.verb();
        match outcome.result {
            DispatchResult::Accepted { detail } => {
                self.on_command_accepted(&outcome.command, detail.as_deref())
            }
            DispatchResult::AlreadyRunning => {
                self.session
                    .journal
                    .log("console", LogLevel::Info, "build already running");
            }
            DispatchResult::Rejected { status, detail } => {
                self.session.journal.log(
                    "console",
                    LogLevel::Error,
                    format!("{} rejected (HTTP {}): {}", verb, status, detail),
                );
            }
            DispatchResult::TransportFailed { detail } => {
                self.session.journal.log(
                    "console",
                    LogLevel::Error,
                    format!("{} failed to send: {}", verb, detail),
                );
            }
        }
        self.finish(journal_before);
    }

    fn on_command_accepted(&mut self, command: &ConsoleCommand, detail: Option<&str>) {
        let verb = command.verb();
        match command {
            // Optimistic transitions: the backend accepted the request, so
            // reflect the expected state now and let the authoritative event
            // confirm it (the confirmations arrive as NoOp re-deliveries).
            ConsoleCommand::Stop | ConsoleCommand::Nuke { .. } => {
                let change = self.session.transition(SessionStatus::Stopping);
                self.session.journal.log(
                    "console",
                    LogLevel::Info,
                    format!("{} acknowledged; waiting for the build to wind down", verb),
                );
                if let StatusChange::Applied { .. } = change {
                    self.abandon_pending_clarification();
                }
            }
            ConsoleCommand::Pause => {
                let _ = self.session.transition(SessionStatus::Paused);
                self.session
                    .journal
                    .log("console", LogLevel::Info, "pause acknowledged");
            }
            ConsoleCommand::Resume => {
                let _ = self.session.transition(SessionStatus::Running);
                self.session
                    .journal
                    .log("console", LogLevel::Info, "resume acknowledged");
            }
            ConsoleCommand::Answer { .. } => {
                if let Some(request) = self.session.pending_clarification.take() {
                    self.session.journal.log(
                        "console",
                        LogLevel::Info,
                        format!(
                            "answer sent for {} (awaiting confirmation)",
                            request.question_id
                        ),
                    );
                }
                let _ = self.session.transition(SessionStatus::Running);
            }
            ConsoleCommand::Status => {
                let summary = detail.unwrap_or("no status detail returned");
                self.session
                    .journal
                    .log("console", LogLevel::Info, format!("status: {}", summary));
            }
            _ => {
                let message = match detail {
                    Some(detail) => format!("{} accepted: {}", verb, detail),
                    None => format!("{} accepted", verb),
                };
                self.session.journal.log("console", LogLevel::Info, message);
            }
        }
    }

    /// Timestamp, journal feed, snapshot broadcast. Runs after every fold.
    fn finish(&mut self, journal_before: usize) {
        self.session.set_updated_at();
        if let Some(tx) = &self.journal_tx {
            let entries = self.session.journal.entries();
            if entries.len() > journal_before {
                for entry in &entries[journal_before..] {
                    let _ = tx.send(entry.clone());
                }
            }
        }
        let _ = self.snapshot_tx.send(SessionSnapshot::from(&self.session));
    }

    fn apply_event(&mut self, event: &ForgeEvent) -> &'static str {
        match event {
            ForgeEvent::BuildStarted { objective } => self.on_build_started(objective.as_deref()),
            ForgeEvent::BuildOverview { units } => self.on_build_overview(units),
            ForgeEvent::ForgeIdeReady => self.observe_status(
                "forge_ide_ready",
                SessionStatus::Ready,
                Some(("forge IDE ready".to_string(), LogLevel::System)),
            ),
            ForgeEvent::BuildCommenced => self.observe_status(
                "build_commenced",
                SessionStatus::Running,
                Some(("build commenced".to_string(), LogLevel::System)),
            ),
            ForgeEvent::BuildPaused => self.observe_status(
                "build_paused",
                SessionStatus::Paused,
                Some(("build paused".to_string(), LogLevel::System)),
            ),
            ForgeEvent::BuildResumed => self.observe_status(
                "build_resumed",
                SessionStatus::Running,
                Some(("build resumed".to_string(), LogLevel::System)),
            ),
            ForgeEvent::BuildComplete => self.observe_status(
                "build_complete",
                SessionStatus::Completed,
                Some(("build complete".to_string(), LogLevel::System)),
            ),
            ForgeEvent::BuildError { message } => self.on_build_error(message),
            ForgeEvent::BuildCancelled => self.observe_status(
                "build_cancelled",
                SessionStatus::Stopped,
                Some(("build cancelled".to_string(), LogLevel::System)),
            ),
            ForgeEvent::BuildNuked => self.observe_status(
                "build_nuked",
                SessionStatus::Stopped,
                Some(("session nuked".to_string(), LogLevel::System)),
            ),
            ForgeEvent::PhaseComplete { unit_id, name } => {
                self.on_phase_complete(unit_id, name.as_deref())
            }
            ForgeEvent::PhaseTransition { unit_id, name } => {
                self.on_phase_transition(unit_id, name.as_deref())
            }
            ForgeEvent::FileManifest { files } => {
                self.session.journal.log(
                    "forge",
                    LogLevel::System,
                    format!("file manifest: {} files", files.len()),
                );
                "applied"
            }
            ForgeEvent::FileGenerating { path, agent_id } => {
                self.on_file_progress(path, agent_id.as_deref(), false)
            }
            ForgeEvent::FileGenerated { path, agent_id } => {
                self.on_file_progress(path, agent_id.as_deref(), true)
            }
            ForgeEvent::FileAudited { path, verdict } => {
                let message = match verdict {
                    Some(verdict) => format!("audited {}: {}", path, verdict),
                    None => format!("audited {}", path),
                };
                self.session.journal.log("forge", LogLevel::Info, message);
                "applied"
            }
            ForgeEvent::FileCreated { path } => {
                self.session
                    .journal
                    .log("forge", LogLevel::Debug, format!("created {}", path));
                "applied"
            }
            ForgeEvent::ToolUse {
                tool,
                detail,
                agent_id,
            } => {
                let source = agent_id.as_deref().unwrap_or("forge");
                let message = match detail {
                    Some(detail) => format!("tool {}: {}", tool, detail),
                    None => format!("tool {}", tool),
                };
                self.session.journal.log(source, LogLevel::Debug, message);
                "applied"
            }
            ForgeEvent::VerificationResult { passed, summary } => {
                let (level, headline) = if *passed {
                    (LogLevel::Info, "verification passed")
                } else {
                    (LogLevel::Warn, "verification failed")
                };
                let message = match summary {
                    Some(summary) => format!("{}: {}", headline, summary),
                    None => headline.to_string(),
                };
                self.session.journal.log("forge", level, message);
                "applied"
            }
            ForgeEvent::GovernancePass { check } => {
                let message = match check {
                    Some(check) => format!("governance check '{}' passed", check),
                    None => "governance check passed".to_string(),
                };
                self.session.journal.log("forge", LogLevel::Info, message);
                "applied"
            }
            ForgeEvent::GovernanceFail { check, detail } => {
                let mut message = match check {
                    Some(check) => format!("governance check '{}' failed", check),
                    None => "governance check failed".to_string(),
                };
                if let Some(detail) = detail {
                    message = format!("{}: {}", message, detail);
                }
                self.session.journal.log("forge", LogLevel::Warn, message);
                "applied"
            }
            ForgeEvent::AuditPass { detail } => {
                let message = match detail {
                    Some(detail) => format!("audit passed: {}", detail),
                    None => "audit passed".to_string(),
                };
                self.session.journal.log("forge", LogLevel::Info, message);
                "applied"
            }
            ForgeEvent::AuditFail { detail } => {
                let message = match detail {
                    Some(detail) => format!("audit failed: {}", detail),
                    None => "audit failed".to_string(),
                };
                self.session.journal.log("forge", LogLevel::Warn, message);
                "applied"
            }
            ForgeEvent::TiersComputed { tiers } => self.on_tiers_computed(tiers),
            ForgeEvent::TierStart { tier } => {
                if self.session.tiers.tier_started(*tier) {
                    self.session
                        .journal
                        .log("forge", LogLevel::Info, format!("tier {} started", tier));
                    "applied"
                } else {
                    "duplicate"
                }
            }
            ForgeEvent::TierComplete { tier } => self.on_tier_complete(*tier),
            ForgeEvent::AgentStart {
                agent_id,
                tier,
                files,
            } => {
                if self.session.tiers.agent_started(agent_id, *tier, files) {
                    self.session.journal.log(
                        agent_id,
                        LogLevel::Info,
                        format!("started (tier {}, {} files)", tier, files.len()),
                    );
                    "applied"
                } else {
                    "duplicate"
                }
            }
            ForgeEvent::AgentFileDone { agent_id, path } => {
                if self.session.tiers.file_done(Some(agent_id), path) {
                    self.session
                        .journal
                        .log(agent_id, LogLevel::Debug, format!("{} done", path));
                    "applied"
                } else {
                    "duplicate"
                }
            }
            ForgeEvent::AgentDone { agent_id } => self.on_agent_done(agent_id),
            ForgeEvent::SubagentStart {
                agent_id,
                parent,
                task,
            } => {
                let mut message = match parent {
                    Some(parent) => format!("subagent started under {}", parent),
                    None => "subagent started".to_string(),
                };
                if let Some(task) = task {
                    message = format!("{}: {}", message, task);
                }
                self.session.journal.log(agent_id, LogLevel::Debug, message);
                "applied"
            }
            ForgeEvent::SubagentDone { agent_id } => {
                self.session
                    .journal
                    .log(agent_id, LogLevel::Debug, "subagent done");
                "applied"
            }
            ForgeEvent::TokenUpdate { tiers, cumulative } => {
                for (tier, counters) in tiers {
                    if *cumulative {
                        self.session
                            .token_usage
                            .entry(tier.clone())
                            .or_default()
                            .accumulate(*counters);
                    } else {
                        self.session.token_usage.insert(tier.clone(), *counters);
                    }
                }
                "applied"
            }
            ForgeEvent::CostTicker { cost } => {
                self.session.cost_estimate = *cost;
                "applied"
            }
            ForgeEvent::BuildLog {
                source,
                level,
                message,
            } => self.on_build_log(source, *level, message),
            ForgeEvent::LlmThinking { model, preview } => {
                let source = if model.is_empty() { "llm" } else { model.as_str() };
                let entry = LogEntry::new(source, LogLevel::Thinking, preview.clone())
                    .with_payload(LogPayload::LlmThinking {
                        model: model.clone(),
                        preview: preview.clone(),
                    });
                self.session.journal.push(entry);
                "applied"
            }
            ForgeEvent::ScratchpadWrite { agent, content } => {
                let entry = LogEntry::new(agent.as_str(), LogLevel::Debug, "scratchpad updated")
                    .with_payload(LogPayload::ScratchpadWrite {
                        agent: agent.clone(),
                        content: content.clone(),
                    });
                self.session.journal.push(entry);
                "applied"
            }
            ForgeEvent::SonnetReview { verdict, notes } => {
                let mut message = match verdict {
                    Some(verdict) => format!("review verdict: {}", verdict),
                    None => "review pass finished".to_string(),
                };
                if let Some(notes) = notes {
                    message = format!("{} ({})", message, notes);
                }
                self.session.journal.log("review", LogLevel::Info, message);
                "applied"
            }
            ForgeEvent::ContextReset { agent, reason } => {
                let source = agent.as_deref().unwrap_or("forge");
                let message = match reason {
                    Some(reason) => format!("context reset: {}", reason),
                    None => "context reset".to_string(),
                };
                self.session.journal.log(source, LogLevel::System, message);
                "applied"
            }
            ForgeEvent::BuildErrorResolved {
                fingerprint,
                resolution,
                summary,
            } => self.on_error_resolved(fingerprint, *resolution, summary.as_deref()),
            ForgeEvent::BuildClarificationRequest {
                question_id,
                question,
                context,
                options,
            } => self.on_clarification_request(question_id, question, context, options),
            ForgeEvent::BuildClarificationResolved {
                question_id,
                answer,
            } => self.on_clarification_resolved(question_id, answer.as_deref()),
        }
    }

    fn on_build_started(&mut self, objective: Option<&str>) -> &'static str {
        let message = match objective {
            Some(objective) => format!("build accepted: {}", objective),
            None => "build accepted".to_string(),
        };
        self.session.journal.log("forge", LogLevel::System, message);
        "applied"
    }

    fn on_build_overview(&mut self, manifest: &[UnitManifest]) -> &'static str {
        self.session.units = manifest
            .iter()
            .map(|unit| Unit {
                id: unit.id.clone(),
                name: if unit.name.is_empty() {
                    unit.id.clone()
                } else {
                    unit.name.clone()
                },
                status: UnitStatus::Pending,
                worker_tier: unit.worker_tier.clone(),
            })
            .collect();
        self.session.total_units = manifest.len() as u64;
        self.session.journal.log(
            "forge",
            LogLevel::System,
            format!("build plan: {} units", manifest.len()),
        );
        "applied"
    }

    fn on_build_error(&mut self, message: &str) -> &'static str {
        if self.session.status.is_terminal() {
            self.session.journal.log(
                "forge",
                LogLevel::Debug,
                format!("ignoring build_error while {}", self.session.status),
            );
            return "illegal_status";
        }
        let fingerprint = self
            .session
            .errors
            .record("forge", ErrorSeverity::Fatal, message, Utc::now())
            .fingerprint
            .clone();
        self.observe_status(
            "build_error",
            SessionStatus::Error,
            Some((
                format!("build failed: {} [{}]", message, fingerprint),
                LogLevel::Error,
            )),
        )
    }

    fn on_phase_complete(&mut self, unit_id: &str, name: Option<&str>) -> &'static str {
        // While awaiting input no forward progress is shown; the poll catches
        // the view up after the clarification resolves.
        if self.session.status == SessionStatus::AwaitingInput {
            self.session.journal.log(
                "forge",
                LogLevel::Info,
                format!("holding completion of unit {} until clarification resolves", unit_id),
            );
            return "held_awaiting_input";
        }

        if self.session.unit(unit_id).is_none() {
            // Manifest never arrived for this unit; learn it now.
            self.session.units.push(Unit {
                id: unit_id.to_string(),
                name: name.unwrap_or(unit_id).to_string(),
                status: UnitStatus::Pending,
                worker_tier: None,
            });
            self.session.total_units = self.session.total_units.max(self.session.units.len() as u64);
        }

        let Some(unit) = self.session.unit_mut(unit_id) else {
            return "unknown_target";
        };
        if unit.status == UnitStatus::Done {
            return "duplicate";
        }
        unit.status = UnitStatus::Done;
        let label = unit.name.clone();
        self.session.completed_units += 1;
        let message = format!(
            "unit '{}' complete ({}/{})",
            label, self.session.completed_units, self.session.total_units
        );
        self.session.journal.log("forge", LogLevel::Info, message);
        "applied"
    }

    fn on_phase_transition(&mut self, unit_id: &str, name: Option<&str>) -> &'static str {
        if self.session.unit(unit_id).is_none() {
            self.session.units.push(Unit {
                id: unit_id.to_string(),
                name: name.unwrap_or(unit_id).to_string(),
                status: UnitStatus::Pending,
                worker_tier: None,
            });
            self.session.total_units = self.session.total_units.max(self.session.units.len() as u64);
        }
        let Some(unit) = self.session.unit_mut(unit_id) else {
            return "unknown_target";
        };
        if unit.status == UnitStatus::Pending {
            unit.status = UnitStatus::Running;
        }
        let label = unit.name.clone();
        self.session
            .journal
            .log("forge", LogLevel::Info, format!("working on '{}'", label));
        "applied"
    }

    fn on_file_progress(&mut self, path: &str, agent_id: Option<&str>, done: bool) -> &'static str {
        let tracked = agent_id.is_some() || self.session.tiers.has_structure();
        let changed = if done {
            self.session.tiers.file_done(agent_id, path)
        } else {
            self.session.tiers.file_building(agent_id, path)
        };
        if changed || !tracked {
            if done {
                self.session
                    .journal
                    .log("forge", LogLevel::Info, format!("generated {}", path));
            } else {
                self.session
                    .journal
                    .log("forge", LogLevel::Debug, format!("generating {}", path));
            }
            "applied"
        } else {
            "duplicate"
        }
    }

    fn on_tiers_computed(&mut self, tiers: &[TierPlan]) -> &'static str {
        self.session.tiers.reset(
            tiers
                .iter()
                .map(|plan| (plan.tier, plan.files.clone())),
        );
        self.session.journal.log(
            "forge",
            LogLevel::System,
            format!("execution plan: {} tiers", tiers.len()),
        );
        "applied"
    }

    fn on_tier_complete(&mut self, tier: u32) -> &'static str {
        let already = self.session.tiers.is_tier_complete(tier);
        let swept = self.session.tiers.tier_completed(tier);
        if already && swept == 0 {
            return "duplicate";
        }
        let (done, total) = self.session.tiers.tier_progress(tier);
        let entry = LogEntry::new("forge", LogLevel::Info, format!("tier {} complete", tier))
            .with_payload(LogPayload::TierProgress { tier, done, total });
        self.session.journal.push(entry);
        "applied"
    }

    fn on_agent_done(&mut self, agent_id: &str) -> &'static str {
        let was_done = self
            .session
            .tiers
            .agent(agent_id)
            .map(|agent| agent.status == crate::tiers::AgentStatus::Done)
            .unwrap_or(false);
        let swept = self.session.tiers.agent_done(agent_id);
        if was_done && swept == 0 {
            return "duplicate";
        }
        let files_done = self
            .session
            .tiers
            .agent(agent_id)
            .map(|agent| agent.files_done())
            .unwrap_or(0);
        self.session.journal.log(
            agent_id,
            LogLevel::Info,
            format!("done ({} files)", files_done),
        );
        "applied"
    }

    fn on_build_log(&mut self, source: &str, level: LogLevel, message: &str) -> &'static str {
        if level == LogLevel::Error {
            let fingerprint = self.record_error(source, message);
            self.session.journal.log(
                source,
                LogLevel::Error,
                format!("{} [{}]", message, fingerprint),
            );
        } else {
            self.session.journal.log(source, level, message);
        }
        "applied"
    }

    /// Indexes a domain error and returns its fingerprint.
    fn record_error(&mut self, source: &str, message: &str) -> String {
        self.session
            .errors
            .record(source, ErrorSeverity::Error, message, Utc::now())
            .fingerprint
            .clone()
    }

    fn on_error_resolved(
        &mut self,
        fingerprint: &str,
        resolution: Option<ResolutionMethod>,
        summary: Option<&str>,
    ) -> &'static str {
        let method = resolution.unwrap_or(ResolutionMethod::AutoFix);
        if self.session.errors.resolve(fingerprint, method, Utc::now()) {
            let mut message = format!("error {} resolved ({})", fingerprint, method.as_str());
            if let Some(summary) = summary {
                message = format!("{}: {}", message, summary);
            }
            self.session.journal.log("forge", LogLevel::Info, message);
            "applied"
        } else {
            self.session.journal.log(
                "forge",
                LogLevel::Debug,
                format!("resolution for unknown error {}", fingerprint),
            );
            "unknown_target"
        }
    }

    fn on_clarification_request(
        &mut self,
        question_id: &str,
        question: &str,
        context: &Option<String>,
        options: &[String],
    ) -> &'static str {
        // A question is only held while the session can actually sit in
        // awaiting_input; a stopping or finished build never delivers a
        // resolution for it.
        let change = self.session.transition(SessionStatus::AwaitingInput);
        if matches!(change, StatusChange::Rejected) {
            self.session.journal.log(
                "forge",
                LogLevel::Debug,
                format!("ignoring clarification request while {}", self.session.status),
            );
            return "illegal_status";
        }

        let duplicate = self
            .session
            .pending_clarification
            .as_ref()
            .map(|previous| previous.question_id == question_id)
            .unwrap_or(false);
        if let Some(previous) = &self.session.pending_clarification {
            if previous.question_id != question_id {
                self.session.journal.log(
                    "forge",
                    LogLevel::Warn,
                    format!("replacing unanswered clarification {}", previous.question_id),
                );
            }
        }
        self.session.pending_clarification = Some(ClarificationRequest {
            question_id: question_id.to_string(),
            question: question.to_string(),
            context: context.clone(),
            options: options.to_vec(),
        });

        if !duplicate {
            let mut message = format!("clarification needed: {}", question);
            if !options.is_empty() {
                message = format!("{} (options: {})", message, options.join(" | "));
            }
            self.session.journal.log("forge", LogLevel::Warn, message);
        }
        if matches!(change, StatusChange::Applied { .. }) {
            self.after_status_applied();
        }
        if duplicate {
            "duplicate"
        } else {
            "applied"
        }
    }

    fn on_clarification_resolved(
        &mut self,
        question_id: &str,
        answer: Option<&str>,
    ) -> &'static str {
        if self.session.status.is_terminal() {
            self.session.journal.log(
                "forge",
                LogLevel::Debug,
                format!(
                    "ignoring resolution for {} while {}",
                    question_id, self.session.status
                ),
            );
            return "illegal_status";
        }

        let matches_pending = self
            .session
            .pending_clarification
            .as_ref()
            .map(|pending| pending.question_id == question_id)
            .unwrap_or(true);
        if !matches_pending {
            self.session.journal.log(
                "forge",
                LogLevel::Debug,
                format!(
                    "resolution for {} ignored; a newer clarification is pending",
                    question_id
                ),
            );
            return "unknown_target";
        }

        self.session.pending_clarification = None;
        let message = match answer {
            Some(answer) => format!("clarification {} answered: {}", question_id, answer),
            None => format!("clarification {} answered", question_id),
        };
        self.session.journal.log("forge", LogLevel::Info, message);
        let _ = self.session.transition(SessionStatus::Running);
        self.after_status_applied();
        "applied"
    }

    /// Attempts a status transition and handles the shared bookkeeping.
    fn observe_status(
        &mut self,
        kind: &'static str,
        next: SessionStatus,
        announce: Option<(String, LogLevel)>,
    ) -> &'static str {
        match self.session.transition(next) {
            StatusChange::Applied { .. } => {
                if let Some((message, level)) = announce {
                    self.session.journal.log("forge", level, message);
                }
                self.after_status_applied();
                "applied"
            }
            StatusChange::NoOp => "duplicate",
            StatusChange::Rejected => {
                self.session.journal.log(
                    "forge",
                    LogLevel::Debug,
                    format!("ignoring {} while {}", kind, self.session.status),
                );
                "illegal_status"
            }
        }
    }

    /// Bookkeeping tied to the status just entered.
    fn after_status_applied(&mut self) {
        match self.session.status {
            SessionStatus::Completed => {
                // Per-unit completions may have been dropped; completion of
                // the whole build supersedes them.
                for unit in &mut self.session.units {
                    if matches!(unit.status, UnitStatus::Pending | UnitStatus::Running) {
                        unit.status = UnitStatus::Done;
                    }
                }
                let observed_done = if self.session.units.is_empty() {
                    self.session.total_units
                } else {
                    self.session.units_done()
                };
                self.session.completed_units = self.session.completed_units.max(observed_done);
                self.abandon_pending_clarification();
            }
            SessionStatus::Stopped | SessionStatus::Error => {
                self.abandon_pending_clarification();
            }
            SessionStatus::AwaitingInput => {
                if self.session.pending_clarification.is_none() {
                    self.session.journal.log(
                        "forge",
                        LogLevel::Warn,
                        "session awaits input, but no clarification question was observed",
                    );
                }
            }
            _ => {}
        }
    }

    /// A session that is winding down or finished can never deliver a
    /// resolution; drop the pending question instead of leaving the view
    /// wedged.
    fn abandon_pending_clarification(&mut self) {
        if let Some(request) = self.session.pending_clarification.take() {
            self.session.journal.log(
                "forge",
                LogLevel::Warn,
                format!(
                    "clarification {} abandoned (session {})",
                    request.question_id, self.session.status
                ),
            );
        }
    }
}

#[cfg(test)]
#[path = "reducer_tests.rs"]
mod tests;
