//! Operator command vocabulary and dispatch.
//!
//! Commands are echoed into the journal before anything touches the network,
//! planned against the current session state (some are local-only, some are
//! refused outright), and then fired at the backend from a spawned task so
//! the intake loop never blocks on HTTP. The backend's answer comes back as
//! a [`DispatchOutcome`] through the same intake channel as every other
//! observation.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::client::{ClarificationAnswer, CommandRequest, ControlApi};
use crate::event_log::EventLog;
use crate::monitor::MonitorEvent;
use crate::session::Session;

/// Everything an operator can ask the console to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Kick off the build (idempotent; an already-running build answers 409).
    Start,
    Pause,
    Resume,
    /// Graceful stop; the backend confirms with `build_cancelled`.
    Stop,
    /// Destroy the session. Refused locally unless confirmed.
    Nuke { confirmed: bool },
    /// Push the generated code out of the forge workspace.
    Push,
    /// Ask the backend for a point-in-time status summary.
    Status,
    /// Clear the local journal view. Never leaves the console.
    Clear,
    /// Re-run whatever failed.
    Retry,
    /// Free-form guidance for the build.
    Say { text: String },
    /// Answer the pending clarification.
    Answer { answer: String },
    /// Ask the backend to fix an indexed error.
    Fix { fingerprint: String },
    /// Ask the backend to regenerate the producer of an indexed error.
    Regenerate { fingerprint: String },
    /// Dismiss an indexed error from the view (backend notified best-effort).
    Dismiss { fingerprint: String },
}

impl ConsoleCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            ConsoleCommand::Start => "start",
            ConsoleCommand::Pause => "pause",
            ConsoleCommand::Resume => "resume",
            ConsoleCommand::Stop => "stop",
            ConsoleCommand::Nuke { .. } => "nuke",
            ConsoleCommand::Push => "push",
            ConsoleCommand::Status => "status",
            ConsoleCommand::Clear => "clear",
            ConsoleCommand::Retry => "retry",
            ConsoleCommand::Say { .. } => "say",
            ConsoleCommand::Answer { .. } => "answer",
            ConsoleCommand::Fix { .. } => "fix",
            ConsoleCommand::Regenerate { .. } => "regenerate",
            ConsoleCommand::Dismiss { .. } => "dismiss",
        }
    }

    /// One-line rendering for the journal echo.
    pub fn describe(&self) -> String {
        match self {
            ConsoleCommand::Nuke { confirmed: true } => "nuke (confirmed)".to_string(),
            ConsoleCommand::Say { text } => format!("say \"{}\"", text),
            ConsoleCommand::Answer { answer } => format!("answer \"{}\"", answer),
            ConsoleCommand::Fix { fingerprint } => format!("fix {}", fingerprint),
            ConsoleCommand::Regenerate { fingerprint } => format!("regenerate {}", fingerprint),
            ConsoleCommand::Dismiss { fingerprint } => format!("dismiss {}", fingerprint),
            other => other.verb().to_string(),
        }
    }

    /// Wire request for the generic command endpoint.
    pub fn to_request(&self) -> CommandRequest {
        let mut request = CommandRequest {
            command: self.verb().to_string(),
            text: None,
            fingerprint: None,
        };
        match self {
            ConsoleCommand::Say { text } => request.text = Some(text.clone()),
            ConsoleCommand::Answer { answer } => request.text = Some(answer.clone()),
            ConsoleCommand::Fix { fingerprint }
            | ConsoleCommand::Regenerate { fingerprint }
            | ConsoleCommand::Dismiss { fingerprint } => {
                request.fingerprint = Some(fingerprint.clone())
            }
            _ => {}
        }
        request
    }

    /// Parses an operator input line.
    ///
    /// The verb is case-insensitive; arguments are taken verbatim.
    pub fn parse(input: &str) -> Result<ConsoleCommand, String> {
        let input = input.trim();
        let (verb, rest) = match input.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (input, ""),
        };
        let verb = verb.to_ascii_lowercase();

        let bare = |command: ConsoleCommand| {
            if rest.is_empty() {
                Ok(command)
            } else {
                Err(format!("'{}' takes no argument", verb))
            }
        };

        match verb.as_str() {
            "" => Err("empty command".to_string()),
            "start" => bare(ConsoleCommand::Start),
            "pause" => bare(ConsoleCommand::Pause),
            "resume" => bare(ConsoleCommand::Resume),
            "stop" => bare(ConsoleCommand::Stop),
            "push" => bare(ConsoleCommand::Push),
            "status" => bare(ConsoleCommand::Status),
            "clear" => bare(ConsoleCommand::Clear),
            "retry" => bare(ConsoleCommand::Retry),
            "nuke" => match rest {
                "" => Ok(ConsoleCommand::Nuke { confirmed: false }),
                "confirm" => Ok(ConsoleCommand::Nuke { confirmed: true }),
                other => Err(format!("unexpected argument for nuke: '{}'", other)),
            },
            "say" => {
                if rest.is_empty() {
                    Err("usage: say <message>".to_string())
                } else {
                    Ok(ConsoleCommand::Say {
                        text: rest.to_string(),
                    })
                }
            }
            "answer" => {
                if rest.is_empty() {
                    Err("usage: answer <text>".to_string())
                } else {
                    Ok(ConsoleCommand::Answer {
                        answer: rest.to_string(),
                    })
                }
            }
            "fix" => fingerprint_arg(rest, "fix").map(|fingerprint| ConsoleCommand::Fix { fingerprint }),
            "regenerate" | "regen" => fingerprint_arg(rest, "regenerate")
                .map(|fingerprint| ConsoleCommand::Regenerate { fingerprint }),
            "dismiss" => fingerprint_arg(rest, "dismiss")
                .map(|fingerprint| ConsoleCommand::Dismiss { fingerprint }),
            other => Err(format!("unknown command: '{}'", other)),
        }
    }
}

fn fingerprint_arg(rest: &str, verb: &str) -> Result<String, String> {
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        Err(format!("usage: {} <fingerprint>", verb))
    } else {
        Ok(rest.to_string())
    }
}

/// What to do with a command, decided before anything leaves the console.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchPlan {
    /// Fire at the backend.
    Send,
    /// Handled entirely client-side.
    Local(LocalAction),
    /// Refused without touching the network.
    Refuse { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAction {
    ClearJournal,
}

/// Plans a command against the current session state.
///
/// Refusals cover the cases where sending would be meaningless or dangerous:
/// an unconfirmed nuke, corrective commands without a live build or a known
/// open error, an answer with nothing pending.
pub fn plan(command: &ConsoleCommand, session: &Session) -> DispatchPlan {
    match command {
        ConsoleCommand::Clear => DispatchPlan::Local(LocalAction::ClearJournal),
        ConsoleCommand::Nuke { confirmed: false } => DispatchPlan::Refuse {
            reason: "nuke destroys the session; run 'nuke confirm' to proceed".to_string(),
        },
        ConsoleCommand::Answer { .. } => {
            if session.pending_clarification.is_some() {
                DispatchPlan::Send
            } else {
                DispatchPlan::Refuse {
                    reason: "no pending clarification to answer".to_string(),
                }
            }
        }
        ConsoleCommand::Fix { fingerprint } | ConsoleCommand::Regenerate { fingerprint } => {
            if !session.status.allows_error_actions() {
                return DispatchPlan::Refuse {
                    reason: format!(
                        "corrections race a live build; pause first (session is {})",
                        session.status
                    ),
                };
            }
            if !session.errors.is_open(fingerprint) {
                return DispatchPlan::Refuse {
                    reason: format!("no open error with fingerprint {}", fingerprint),
                };
            }
            DispatchPlan::Send
        }
        ConsoleCommand::Dismiss { fingerprint } => {
            if session.errors.is_open(fingerprint) {
                DispatchPlan::Send
            } else if session.errors.get(fingerprint).is_some() {
                DispatchPlan::Refuse {
                    reason: format!("error {} is already resolved", fingerprint),
                }
            } else {
                DispatchPlan::Refuse {
                    reason: format!("no error with fingerprint {}", fingerprint),
                }
            }
        }
        _ => DispatchPlan::Send,
    }
}

/// The backend's answer to a dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub command: ConsoleCommand,
    pub result: DispatchResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    Accepted { detail: Option<String> },
    /// 409 on `start`: a build is already running. Treated as success.
    AlreadyRunning,
    Rejected { status: u16, detail: String },
    TransportFailed { detail: String },
}

impl DispatchResult {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchResult::Accepted { .. } => "accepted",
            DispatchResult::AlreadyRunning => "already_running",
            DispatchResult::Rejected { .. } => "rejected",
            DispatchResult::TransportFailed { .. } => "transport_failed",
        }
    }
}

/// Fire-and-forget sender for planned commands.
///
/// Each send spawns a task; the outcome re-enters the intake channel so the
/// reducer applies acknowledgements in event order with everything else.
pub struct CommandDispatcher {
    api: Arc<dyn ControlApi>,
    session_id: String,
    intake: mpsc::UnboundedSender<MonitorEvent>,
    event_log: Arc<EventLog>,
}

impl CommandDispatcher {
    pub fn new(
        api: Arc<dyn ControlApi>,
        session_id: String,
        intake: mpsc::UnboundedSender<MonitorEvent>,
        event_log: Arc<EventLog>,
    ) -> Self {
        Self {
            api,
            session_id,
            intake,
            event_log,
        }
    }

    /// Sends a command to the backend without blocking the caller.
    ///
    /// `question_id` routes an answer to the clarification endpoint; it is
    /// ignored for every other command.
    pub fn send(&self, command: ConsoleCommand, question_id: Option<String>) {
        let api = Arc::clone(&self.api);
        let session_id = self.session_id.clone();
        let intake = self.intake.clone();
        let event_log = Arc::clone(&self.event_log);
        self.event_log.log_command_sent(command.verb());

        tokio::spawn(async move {
            let result = execute(api.as_ref(), &session_id, &command, question_id).await;
            let detail = match &result {
                DispatchResult::Accepted { detail } => detail.as_deref(),
                DispatchResult::AlreadyRunning => None,
                DispatchResult::Rejected { detail, .. } => Some(detail.as_str()),
                DispatchResult::TransportFailed { detail } => Some(detail.as_str()),
            };
            event_log.log_dispatch_outcome(command.verb(), result.label(), detail);
            // The monitor may already be gone during shutdown.
            let _ = intake.send(MonitorEvent::Dispatch(DispatchOutcome { command, result }));
        });
    }
}

async fn execute(
    api: &dyn ControlApi,
    session_id: &str,
    command: &ConsoleCommand,
    question_id: Option<String>,
) -> DispatchResult {
    let response = match command {
        ConsoleCommand::Answer { answer } => {
            let answer = ClarificationAnswer {
                question_id: question_id.unwrap_or_default(),
                answer: answer.clone(),
            };
            api.send_clarification(session_id, &answer).await
        }
        other => api.send_command(session_id, &other.to_request()).await,
    };

    match response {
        Ok(response) if (200..300).contains(&response.status) => DispatchResult::Accepted {
            detail: response.detail,
        },
        Ok(response)
            if response.status == 409 && matches!(command, ConsoleCommand::Start) =>
        {
            DispatchResult::AlreadyRunning
        }
        Ok(response) => DispatchResult::Rejected {
            status: response.status,
            detail: response
                .detail
                .unwrap_or_else(|| "request rejected".to_string()),
        },
        Err(err) => DispatchResult::TransportFailed {
            detail: format!("{:#}", err),
        },
    }
}

#[cfg(test)]
#[path = "commands_tests.rs"]
mod tests;
