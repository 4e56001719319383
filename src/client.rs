//! HTTP surface of the forge orchestrator.
//!
//! Two narrow traits split the surface by concern: [`ControlApi`] carries
//! operator commands, [`SyncApi`] carries the poll. The dispatcher and the
//! poller depend on the traits so tests can script a backend; the real
//! implementation is [`ForgeClient`], which also opens the SSE event stream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::events::PollSnapshot;

/// Wire body for `POST {base}/api/session/{id}/command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Wire body for `POST {base}/api/session/{id}/clarification`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationAnswer {
    pub question_id: String,
    pub answer: String,
}

/// Status and optional human-readable detail of a control response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub detail: Option<String>,
}

/// Result of one poll round-trip.
///
/// `Err` from [`SyncApi::poll`] means the request never completed; a refusal
/// that did complete is reported here with its HTTP status so the poller can
/// tell a 404 from other failures.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResponse {
    Snapshot(PollSnapshot),
    Status(u16),
}

/// Command-side surface: operator actions sent to the backend.
#[async_trait]
pub trait ControlApi: Send + Sync {
    async fn send_command(&self, session_id: &str, request: &CommandRequest)
        -> Result<ApiResponse>;
    async fn send_clarification(
        &self,
        session_id: &str,
        answer: &ClarificationAnswer,
    ) -> Result<ApiResponse>;
}

/// Sync-side surface: the fallback snapshot poll.
#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn poll(&self, session_id: &str) -> Result<PollResponse>;
}

/// reqwest-backed client for a forge orchestrator.
///
/// The inner client carries only a connect timeout; request deadlines are set
/// per call so the long-lived SSE stream is not cut down by a blanket
/// timeout.
#[derive(Clone)]
pub struct ForgeClient {
    base_url: String,
    client: reqwest::Client,
}

/// Deadline for control and poll round-trips.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl ForgeClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, session_id: &str, leaf: &str) -> String {
        format!("{}/api/session/{}/{}", self.base_url, session_id, leaf)
    }

    async fn post_control(&self, url: String, body: &impl Serialize) -> Result<ApiResponse> {
        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        let status = response.status().as_u16();
        let detail = response
            .text()
            .await
            .ok()
            .and_then(|body| detail_from_body(&body));
        Ok(ApiResponse { status, detail })
    }

    /// Opens the live SSE event stream: `GET {base}/api/session/{id}/events`.
    ///
    /// Returns the raw response; the caller consumes `bytes_stream()`.
    pub async fn open_event_stream(&self, session_id: &str) -> Result<reqwest::Response> {
        let url = self.session_url(session_id, "events");
        let response = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .with_context(|| format!("Failed to open event stream at {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Event stream refused with HTTP {}",
                response.status().as_u16()
            );
        }
        Ok(response)
    }
}

#[async_trait]
impl ControlApi for ForgeClient {
    async fn send_command(
        &self,
        session_id: &str,
        request: &CommandRequest,
    ) -> Result<ApiResponse> {
        self.post_control(self.session_url(session_id, "command"), request)
            .await
    }

    async fn send_clarification(
        &self,
        session_id: &str,
        answer: &ClarificationAnswer,
    ) -> Result<ApiResponse> {
        self.post_control(self.session_url(session_id, "clarification"), answer)
            .await
    }
}

#[async_trait]
impl SyncApi for ForgeClient {
    async fn poll(&self, session_id: &str) -> Result<PollResponse> {
        let url = self.session_url(session_id, "poll");
        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        let status = response.status();
        if !status.is_success() {
            return Ok(PollResponse::Status(status.as_u16()));
        }
        let snapshot = response
            .json::<PollSnapshot>()
            .await
            .context("Failed to decode poll snapshot")?;
        Ok(PollResponse::Snapshot(snapshot))
    }
}

/// Extracts a human-readable detail string from a response body.
///
/// Accepts `{"detail": ...}` / `{"message": ...}` JSON shapes; anything else
/// is passed through truncated so backend stack traces don't flood the
/// journal.
fn detail_from_body(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "message"] {
            if let Some(detail) = value.get(key).and_then(|d| d.as_str()) {
                return Some(detail.to_string());
            }
        }
    }
    let mut detail: String = body.chars().take(200).collect();
    if detail.len() < body.len() {
        detail.push_str("...");
    }
    Some(detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_request_omits_empty_fields() {
        let request = CommandRequest {
            command: "pause".to_string(),
            text: None,
            fingerprint: None,
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"command":"pause"}"#
        );
    }

    #[test]
    fn command_request_carries_fingerprint() {
        let request = CommandRequest {
            command: "fix".to_string(),
            text: None,
            fingerprint: Some("deadbeefdeadbeef".to_string()),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""fingerprint":"deadbeefdeadbeef""#));
    }

    #[test]
    fn detail_prefers_structured_fields() {
        assert_eq!(
            detail_from_body(r#"{"detail":"session is paused"}"#),
            Some("session is paused".to_string())
        );
        assert_eq!(
            detail_from_body(r#"{"message":"bad request"}"#),
            Some("bad request".to_string())
        );
    }

    #[test]
    fn detail_truncates_raw_bodies() {
        assert_eq!(detail_from_body("   "), None);
        assert_eq!(detail_from_body("plain refusal"), Some("plain refusal".to_string()));

        let long = "x".repeat(500);
        let detail = detail_from_body(&long).unwrap();
        assert!(detail.ends_with("..."));
        assert_eq!(detail.chars().count(), 203);
    }

    #[test]
    fn client_normalizes_base_url() {
        let client = ForgeClient::new("http://localhost:8787/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8787");
        assert_eq!(
            client.session_url("s1", "poll"),
            "http://localhost:8787/api/session/s1/poll"
        );
    }
}
