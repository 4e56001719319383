//! Deduplicated index of build errors keyed by stable fingerprints.
//!
//! Error reports repeat: the same compile failure surfaces on every retry,
//! often with volatile details (line numbers, addresses, request ids) shifted.
//! The index normalizes messages before hashing so recurrences collapse into
//! one entry with an occurrence count instead of flooding the operator.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Severity of an indexed error.
///
/// `Fatal` errors accompany a terminal session failure; `Error` entries are
/// domain errors the build may recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Error,
    Fatal,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Error => "error",
            ErrorSeverity::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an indexed error left the open set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// The backend reported it fixed the error itself.
    AutoFix,
    /// The owning unit completed, implying the error no longer applies.
    PhaseComplete,
    /// The operator dismissed it.
    Dismissed,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::AutoFix => "auto_fix",
            ResolutionMethod::PhaseComplete => "phase_complete",
            ResolutionMethod::Dismissed => "dismissed",
        }
    }
}

/// Which corrective commands apply to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Targeted fix request makes sense (compiler/test style failures).
    Fixable,
    /// The producing agent or tier can be re-run.
    Regeneratable,
    /// Nothing to retry; the operator can only acknowledge it.
    DismissOnly,
}

impl ErrorCategory {
    /// Classifies an error by its origin and severity.
    ///
    /// Fatal errors ride along with a dead session, so no corrective command
    /// can target them. Errors sourced from a worker agent or tier can be
    /// regenerated; everything else is treated as a fixable build failure.
    pub fn classify(source: &str, severity: ErrorSeverity) -> Self {
        if severity == ErrorSeverity::Fatal {
            return ErrorCategory::DismissOnly;
        }
        let source = source.to_ascii_lowercase();
        if source.contains("agent") || source.contains("tier") {
            ErrorCategory::Regeneratable
        } else {
            ErrorCategory::Fixable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Fixable => "fixable",
            ErrorCategory::Regeneratable => "regeneratable",
            ErrorCategory::DismissOnly => "dismiss_only",
        }
    }
}

/// A deduplicated build error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildError {
    /// Stable identity: 16 hex chars derived from source, severity and the
    /// normalized message.
    pub fingerprint: String,
    pub source: String,
    /// The raw message of the first occurrence.
    pub message: String,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub occurrence_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

struct NormalizePatterns {
    line_number: Regex,
    hex_address: Regex,
    uuid: Regex,
}

fn patterns() -> &'static NormalizePatterns {
    static PATTERNS: OnceLock<NormalizePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| NormalizePatterns {
        line_number: Regex::new(r"(?i)\bline[ :]+\d+")
            .expect("regex to match line number references"),
        hex_address: Regex::new(r"\b0x[0-9a-fA-F]+\b").expect("regex to match hex addresses"),
        uuid: Regex::new(
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        )
        .expect("regex to match UUIDs"),
    })
}

/// Strips volatile details from an error message so recurrences hash alike.
///
/// Line numbers become `line N`, hex addresses become `0xADDR`, UUIDs become
/// `UUID`, and whitespace is collapsed.
pub fn normalize_message(message: &str) -> String {
    let patterns = patterns();
    let normalized = patterns.line_number.replace_all(message, "line N");
    let normalized = patterns.hex_address.replace_all(&normalized, "0xADDR");
    let normalized = patterns.uuid.replace_all(&normalized, "UUID");
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Computes the stable fingerprint for an error report.
///
/// The fingerprint is the first 8 bytes of a SHA-256 over
/// `source:severity:normalized-message`, rendered as 16 lowercase hex chars.
pub fn fingerprint(source: &str, severity: ErrorSeverity, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(severity.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(normalize_message(message).as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// The session's error ledger.
///
/// Entries are append-ordered. At most one entry per fingerprint is open at a
/// time; recording a matching report while it is open bumps its occurrence
/// count instead of inserting a duplicate. A recurrence after resolution opens
/// a fresh entry so resolution history is never overwritten.
#[derive(Debug, Default)]
pub struct ErrorIndex {
    entries: Vec<BuildError>,
    open: HashMap<String, usize>,
}

impl ErrorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error report, deduplicating against the open entry with the
    /// same fingerprint. Returns the affected entry.
    pub fn record(
        &mut self,
        source: &str,
        severity: ErrorSeverity,
        message: &str,
        at: DateTime<Utc>,
    ) -> &BuildError {
        let fingerprint = fingerprint(source, severity, message);
        if let Some(&idx) = self.open.get(&fingerprint) {
            let entry = &mut self.entries[idx];
            entry.occurrence_count += 1;
            entry.last_seen = at;
            return &self.entries[idx];
        }

        self.entries.push(BuildError {
            fingerprint: fingerprint.clone(),
            source: source.to_string(),
            message: message.to_string(),
            severity,
            category: ErrorCategory::classify(source, severity),
            occurrence_count: 1,
            first_seen: at,
            last_seen: at,
            resolved: false,
            resolution: None,
            resolved_at: None,
        });
        let idx = self.entries.len() - 1;
        self.open.insert(fingerprint, idx);
        &self.entries[idx]
    }

    /// Marks the open entry for `fingerprint` resolved.
    ///
    /// Returns false when no open entry matches (already resolved or never
    /// seen), which callers treat as a stale reference rather than an error.
    pub fn resolve(&mut self, fingerprint: &str, method: ResolutionMethod, at: DateTime<Utc>) -> bool {
        match self.open.remove(fingerprint) {
            Some(idx) => {
                let entry = &mut self.entries[idx];
                entry.resolved = true;
                entry.resolution = Some(method);
                entry.resolved_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// Looks up an entry by fingerprint, preferring the open one.
    pub fn get(&self, fingerprint: &str) -> Option<&BuildError> {
        if let Some(&idx) = self.open.get(fingerprint) {
            return Some(&self.entries[idx]);
        }
        self.entries.iter().rev().find(|e| e.fingerprint == fingerprint)
    }

    pub fn is_open(&self, fingerprint: &str) -> bool {
        self.open.contains_key(fingerprint)
    }

    /// All entries in the order first recorded, resolved ones included.
    pub fn entries(&self) -> &[BuildError] {
        &self.entries
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn open_entries(&self) -> impl Iterator<Item = &BuildError> {
        self.entries.iter().filter(|e| !e.resolved)
    }
}
