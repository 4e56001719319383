//! Inbound wire model: the event vocabulary of a forge build session.
//!
//! Events arrive as JSON objects discriminated by a `type` field, either as
//! SSE payloads on the live channel or embedded in poll responses. Parsing is
//! lenient by contract: the channel carries more kinds than any one console
//! build cares about, and an unknown or malformed line must be skipped, never
//! surfaced as a failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error_index::ResolutionMethod;
use crate::journal::{LogEntry, LogLevel};
use crate::session::{SessionStatus, TokenCounters};

/// One unit of work as announced by the build overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitManifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_tier: Option<String>,
}

/// One tier as announced by the tier plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPlan {
    pub tier: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

/// A log line as carried by the wire (poll backfill or `build_log` events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireLogLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default = "default_wire_source")]
    pub source: String,
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    pub message: String,
}

fn default_wire_source() -> String {
    "forge".to_string()
}

impl WireLogLine {
    pub fn to_entry(&self) -> LogEntry {
        LogEntry {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            source: self.source.clone(),
            level: self.level,
            message: self.message.clone(),
            payload: None,
        }
    }
}

/// Response payload of the sync poll endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSnapshot {
    pub status: SessionStatus,
    #[serde(default)]
    pub completed_units: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_units: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tokens: BTreeMap<String, TokenCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<WireLogLine>,
}

/// Every event kind a forge backend emits about a build session.
///
/// Variant names map 1:1 onto the wire `type` tag. Payload fields the backend
/// may omit carry `#[serde(default)]` so a sparse emitter still parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForgeEvent {
    // --- Lifecycle ---
    /// The backend accepted the build and began preparing.
    BuildStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        objective: Option<String>,
    },
    /// The plan manifest: which units of work this build consists of.
    BuildOverview { units: Vec<UnitManifest> },
    /// The workspace/IDE side is provisioned and ready.
    ForgeIdeReady,
    /// Generation actually began.
    BuildCommenced,
    BuildPaused,
    BuildResumed,
    /// The build finished successfully.
    BuildComplete,
    /// The backend declared the whole session failed.
    #[serde(alias = "build_failed")]
    BuildError { message: String },
    /// A stop request completed; the session is cancelled.
    BuildCancelled,
    /// The session was destroyed outright.
    BuildNuked,

    // --- Flat progress ---
    /// A unit of work finished.
    PhaseComplete {
        unit_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// The build moved on to another unit.
    PhaseTransition {
        unit_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Flat list of files the build plans to touch.
    FileManifest { files: Vec<String> },
    FileGenerating {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    FileGenerated {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    FileAudited {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verdict: Option<String>,
    },
    FileCreated { path: String },
    ToolUse {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    VerificationResult {
        passed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    GovernancePass {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        check: Option<String>,
    },
    GovernanceFail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        check: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    AuditPass {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    AuditFail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    // --- Tiered hierarchy ---
    /// The backend computed a tiered execution plan.
    TiersComputed { tiers: Vec<TierPlan> },
    TierStart { tier: u32 },
    TierComplete { tier: u32 },
    AgentStart {
        agent_id: String,
        tier: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<String>,
    },
    AgentFileDone { agent_id: String, path: String },
    AgentDone { agent_id: String },
    SubagentStart {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
    },
    SubagentDone { agent_id: String },

    // --- Telemetry ---
    /// Fresh per-tier token counters. Absolute values unless `cumulative`,
    /// in which case they are deltas to add onto the running totals.
    TokenUpdate {
        tiers: BTreeMap<String, TokenCounters>,
        #[serde(default)]
        cumulative: bool,
    },
    /// Updated cost estimate for the whole session, in dollars.
    CostTicker { cost: f64 },
    /// A log line routed through the event channel.
    BuildLog {
        source: String,
        #[serde(default = "default_log_level")]
        level: LogLevel,
        message: String,
    },
    /// Model invocation preview.
    LlmThinking {
        #[serde(default)]
        model: String,
        preview: String,
    },
    /// An agent wrote to its scratchpad.
    ScratchpadWrite { agent: String, content: String },
    /// Outcome of the cross-model review pass.
    SonnetReview {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verdict: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
    },
    /// An agent's context window was reset.
    ContextReset {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // --- Errors ---
    /// A previously reported error is no longer outstanding.
    BuildErrorResolved {
        fingerprint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolution: Option<ResolutionMethod>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    // --- Operator interaction ---
    /// The backend needs an answer before it can continue.
    BuildClarificationRequest {
        question_id: String,
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
    },
    /// A pending clarification was answered (by us or another console).
    BuildClarificationResolved {
        question_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<String>,
    },
}

impl ForgeEvent {
    /// Parses one event line leniently.
    ///
    /// Returns `None` for blank lines, malformed JSON and unknown event
    /// kinds. A bad line must never take the intake loop down.
    pub fn from_json_line(line: &str) -> Option<ForgeEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::debug!(error = %err, "ignoring unparseable event line");
                None
            }
        }
    }

    /// The wire `type` tag for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            ForgeEvent::BuildStarted { .. } => "build_started",
            ForgeEvent::BuildOverview { .. } => "build_overview",
            ForgeEvent::ForgeIdeReady => "forge_ide_ready",
            ForgeEvent::BuildCommenced => "build_commenced",
            ForgeEvent::BuildPaused => "build_paused",
            ForgeEvent::BuildResumed => "build_resumed",
            ForgeEvent::BuildComplete => "build_complete",
            ForgeEvent::BuildError { .. } => "build_error",
            ForgeEvent::BuildCancelled => "build_cancelled",
            ForgeEvent::BuildNuked => "build_nuked",
            ForgeEvent::PhaseComplete { .. } => "phase_complete",
            ForgeEvent::PhaseTransition { .. } => "phase_transition",
            ForgeEvent::FileManifest { .. } => "file_manifest",
            ForgeEvent::FileGenerating { .. } => "file_generating",
            ForgeEvent::FileGenerated { .. } => "file_generated",
            ForgeEvent::FileAudited { .. } => "file_audited",
            ForgeEvent::FileCreated { .. } => "file_created",
            ForgeEvent::ToolUse { .. } => "tool_use",
            ForgeEvent::VerificationResult { .. } => "verification_result",
            ForgeEvent::GovernancePass { .. } => "governance_pass",
            ForgeEvent::GovernanceFail { .. } => "governance_fail",
            ForgeEvent::AuditPass { .. } => "audit_pass",
            ForgeEvent::AuditFail { .. } => "audit_fail",
            ForgeEvent::TiersComputed { .. } => "tiers_computed",
            ForgeEvent::TierStart { .. } => "tier_start",
            ForgeEvent::TierComplete { .. } => "tier_complete",
            ForgeEvent::AgentStart { .. } => "agent_start",
            ForgeEvent::AgentFileDone { .. } => "agent_file_done",
            ForgeEvent::AgentDone { .. } => "agent_done",
            ForgeEvent::SubagentStart { .. } => "subagent_start",
            ForgeEvent::SubagentDone { .. } => "subagent_done",
            ForgeEvent::TokenUpdate { .. } => "token_update",
            ForgeEvent::CostTicker { .. } => "cost_ticker",
            ForgeEvent::BuildLog { .. } => "build_log",
            ForgeEvent::LlmThinking { .. } => "llm_thinking",
            ForgeEvent::ScratchpadWrite { .. } => "scratchpad_write",
            ForgeEvent::SonnetReview { .. } => "sonnet_review",
            ForgeEvent::ContextReset { .. } => "context_reset",
            ForgeEvent::BuildErrorResolved { .. } => "build_error_resolved",
            ForgeEvent::BuildClarificationRequest { .. } => "build_clarification_request",
            ForgeEvent::BuildClarificationResolved { .. } => "build_clarification_resolved",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_struct_variant() {
        let event =
            ForgeEvent::from_json_line(r#"{"type":"build_log","source":"rustc","message":"ok"}"#)
                .unwrap();
        assert_eq!(
            event,
            ForgeEvent::BuildLog {
                source: "rustc".to_string(),
                level: LogLevel::Info,
                message: "ok".to_string(),
            }
        );
    }

    #[test]
    fn parses_unit_variant() {
        let event = ForgeEvent::from_json_line(r#"{"type":"forge_ide_ready"}"#).unwrap();
        assert_eq!(event, ForgeEvent::ForgeIdeReady);
    }

    #[test]
    fn build_failed_is_an_alias_for_build_error() {
        let event =
            ForgeEvent::from_json_line(r#"{"type":"build_failed","message":"boom"}"#).unwrap();
        assert_eq!(
            event,
            ForgeEvent::BuildError {
                message: "boom".to_string()
            }
        );
        assert_eq!(event.kind(), "build_error");
    }

    #[test]
    fn unknown_kind_is_skipped() {
        assert!(ForgeEvent::from_json_line(r#"{"type":"quantum_flux","level":11}"#).is_none());
    }

    #[test]
    fn malformed_and_blank_lines_are_skipped() {
        assert!(ForgeEvent::from_json_line("{not json").is_none());
        assert!(ForgeEvent::from_json_line("").is_none());
        assert!(ForgeEvent::from_json_line("   ").is_none());
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let event = ForgeEvent::from_json_line(
            r#"{"type":"build_commenced","emitted_by":"scheduler","seq":991}"#,
        )
        .unwrap();
        assert_eq!(event, ForgeEvent::BuildCommenced);
    }

    #[test]
    fn token_update_defaults_to_absolute() {
        let event = ForgeEvent::from_json_line(
            r#"{"type":"token_update","tiers":{"opus":{"input":10,"output":2,"total":12}}}"#,
        )
        .unwrap();
        match event {
            ForgeEvent::TokenUpdate { tiers, cumulative } => {
                assert!(!cumulative);
                assert_eq!(tiers["opus"].total, 12);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn clarification_request_tolerates_sparse_payload() {
        let event = ForgeEvent::from_json_line(
            r#"{"type":"build_clarification_request","question_id":"q1","question":"Which db?"}"#,
        )
        .unwrap();
        match event {
            ForgeEvent::BuildClarificationRequest {
                question_id,
                question,
                context,
                options,
            } => {
                assert_eq!(question_id, "q1");
                assert_eq!(question, "Which db?");
                assert!(context.is_none());
                assert!(options.is_empty());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let events = vec![
            ForgeEvent::BuildComplete,
            ForgeEvent::PhaseComplete {
                unit_id: "1".to_string(),
                name: None,
            },
            ForgeEvent::TierStart { tier: 2 },
            ForgeEvent::CostTicker { cost: 1.25 },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn poll_snapshot_parses_minimal_payload() {
        let snapshot: PollSnapshot = serde_json::from_str(r#"{"status":"running"}"#).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Running);
        assert_eq!(snapshot.completed_units, 0);
        assert!(snapshot.tokens.is_empty());
        assert!(snapshot.logs.is_empty());
    }

    #[test]
    fn poll_snapshot_parses_full_payload() {
        let snapshot: PollSnapshot = serde_json::from_str(
            r#"{
                "status": "paused",
                "completed_units": 3,
                "total_units": 9,
                "tokens": {"sonnet": {"input": 100, "output": 40, "total": 140}},
                "cost_estimate": 2.5,
                "logs": [{"source": "forge", "level": "warn", "message": "slow tier"}]
            }"#,
        )
        .unwrap();
        assert_eq!(snapshot.status, SessionStatus::Paused);
        assert_eq!(snapshot.completed_units, 3);
        assert_eq!(snapshot.total_units, Some(9));
        assert_eq!(snapshot.tokens["sonnet"].output, 40);
        assert_eq!(snapshot.logs.len(), 1);
        assert_eq!(snapshot.logs[0].level, LogLevel::Warn);
    }

    #[test]
    fn wire_log_line_fills_missing_fields() {
        let line: WireLogLine = serde_json::from_str(r#"{"message":"hello"}"#).unwrap();
        assert_eq!(line.source, "forge");
        assert_eq!(line.level, LogLevel::Info);
        let entry = line.to_entry();
        assert_eq!(entry.message, "hello");
    }
}
