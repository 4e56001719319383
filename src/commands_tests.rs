use super::*;
use crate::client::{ApiResponse, ClarificationAnswer, CommandRequest, ControlApi};
use crate::error_index::ErrorSeverity;
use crate::event_log::EventLog;
use crate::monitor::MonitorEvent;
use crate::session::{ClarificationRequest, Session, SessionStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;
use tempfile::TempDir;

fn test_event_log() -> (Arc<EventLog>, TempDir) {
    let dir = TempDir::new().unwrap();
    let log = EventLog::new("test-session", dir.path()).unwrap();
    (Arc::new(log), dir)
}

/// Backend double that answers every request with a fixed status.
struct ScriptedApi {
    status: u16,
    detail: Option<String>,
    fail_transport: bool,
    seen_commands: Mutex<Vec<CommandRequest>>,
    seen_answers: Mutex<Vec<ClarificationAnswer>>,
}

impl ScriptedApi {
    fn answering(status: u16) -> Self {
        Self {
            status,
            detail: None,
            fail_transport: false,
            seen_commands: Mutex::new(Vec::new()),
            seen_answers: Mutex::new(Vec::new()),
        }
    }

    fn unreachable_backend() -> Self {
        let mut api = Self::answering(0);
        api.fail_transport = true;
        api
    }
}

#[async_trait]
impl ControlApi for ScriptedApi {
    async fn send_command(
        &self,
        _session_id: &str,
        request: &CommandRequest,
    ) -> Result<ApiResponse> {
        self.seen_commands.lock().unwrap().push(request.clone());
        if self.fail_transport {
            anyhow::bail!("connection refused");
        }
        Ok(ApiResponse {
            status: self.status,
            detail: self.detail.clone(),
        })
    }

    async fn send_clarification(
        &self,
        _session_id: &str,
        answer: &ClarificationAnswer,
    ) -> Result<ApiResponse> {
        self.seen_answers.lock().unwrap().push(answer.clone());
        if self.fail_transport {
            anyhow::bail!("connection refused");
        }
        Ok(ApiResponse {
            status: self.status,
            detail: self.detail.clone(),
        })
    }
}

mod parsing {
    use super::*;

    #[test]
    fn bare_verbs_parse() {
        assert_eq!(ConsoleCommand::parse("start"), Ok(ConsoleCommand::Start));
        assert_eq!(ConsoleCommand::parse("  pause "), Ok(ConsoleCommand::Pause));
        assert_eq!(ConsoleCommand::parse("RESUME"), Ok(ConsoleCommand::Resume));
        assert_eq!(ConsoleCommand::parse("clear"), Ok(ConsoleCommand::Clear));
    }

    #[test]
    fn bare_verbs_reject_arguments() {
        assert!(ConsoleCommand::parse("pause now").is_err());
        assert!(ConsoleCommand::parse("status verbose").is_err());
    }

    #[test]
    fn nuke_requires_explicit_confirmation_token() {
        assert_eq!(
            ConsoleCommand::parse("nuke"),
            Ok(ConsoleCommand::Nuke { confirmed: false })
        );
        assert_eq!(
            ConsoleCommand::parse("nuke confirm"),
            Ok(ConsoleCommand::Nuke { confirmed: true })
        );
        assert!(ConsoleCommand::parse("nuke yes").is_err());
    }

    #[test]
    fn say_and_answer_keep_text_verbatim() {
        assert_eq!(
            ConsoleCommand::parse("say use Postgres, not SQLite"),
            Ok(ConsoleCommand::Say {
                text: "use Postgres, not SQLite".to_string()
            })
        );
        assert_eq!(
            ConsoleCommand::parse("answer the second option"),
            Ok(ConsoleCommand::Answer {
                answer: "the second option".to_string()
            })
        );
        assert!(ConsoleCommand::parse("say").is_err());
        assert!(ConsoleCommand::parse("answer").is_err());
    }

    #[test]
    fn corrective_commands_take_one_fingerprint() {
        assert_eq!(
            ConsoleCommand::parse("fix deadbeefdeadbeef"),
            Ok(ConsoleCommand::Fix {
                fingerprint: "deadbeefdeadbeef".to_string()
            })
        );
        assert_eq!(
            ConsoleCommand::parse("regen abc123"),
            Ok(ConsoleCommand::Regenerate {
                fingerprint: "abc123".to_string()
            })
        );
        assert!(ConsoleCommand::parse("fix").is_err());
        assert!(ConsoleCommand::parse("dismiss one two").is_err());
    }

    #[test]
    fn unknown_and_empty_inputs_are_errors() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("launch").is_err());
    }
}

mod wire {
    use super::*;

    #[test]
    fn to_request_maps_payload_fields() {
        let request = ConsoleCommand::Say {
            text: "hi".to_string(),
        }
        .to_request();
        assert_eq!(request.command, "say");
        assert_eq!(request.text.as_deref(), Some("hi"));

        let request = ConsoleCommand::Fix {
            fingerprint: "f00d".to_string(),
        }
        .to_request();
        assert_eq!(request.command, "fix");
        assert_eq!(request.fingerprint.as_deref(), Some("f00d"));

        let request = ConsoleCommand::Stop.to_request();
        assert_eq!(request.command, "stop");
        assert!(request.text.is_none());
        assert!(request.fingerprint.is_none());
    }

    #[test]
    fn describe_renders_arguments() {
        assert_eq!(ConsoleCommand::Pause.describe(), "pause");
        assert_eq!(
            ConsoleCommand::Nuke { confirmed: true }.describe(),
            "nuke (confirmed)"
        );
        assert_eq!(
            ConsoleCommand::Say {
                text: "go".to_string()
            }
            .describe(),
            "say \"go\""
        );
    }
}

mod planning {
    use super::*;

    fn running_session() -> Session {
        let mut session = Session::new("s1");
        session.status = SessionStatus::Running;
        session
    }

    #[test]
    fn clear_never_leaves_the_console() {
        assert_eq!(
            plan(&ConsoleCommand::Clear, &running_session()),
            DispatchPlan::Local(LocalAction::ClearJournal)
        );
    }

    #[test]
    fn unconfirmed_nuke_is_refused() {
        let plan = plan(&ConsoleCommand::Nuke { confirmed: false }, &running_session());
        assert!(matches!(plan, DispatchPlan::Refuse { .. }));
    }

    #[test]
    fn confirmed_nuke_is_sent() {
        assert_eq!(
            plan(&ConsoleCommand::Nuke { confirmed: true }, &running_session()),
            DispatchPlan::Send
        );
    }

    #[test]
    fn corrective_commands_never_race_a_running_build() {
        let mut session = running_session();
        let fingerprint = session
            .errors
            .record("rustc", ErrorSeverity::Error, "boom", Utc::now())
            .fingerprint
            .clone();

        let fix = ConsoleCommand::Fix {
            fingerprint: fingerprint.clone(),
        };
        assert!(matches!(plan(&fix, &session), DispatchPlan::Refuse { .. }));

        session.status = SessionStatus::Paused;
        assert_eq!(plan(&fix, &session), DispatchPlan::Send);

        session.status = SessionStatus::Error;
        let regenerate = ConsoleCommand::Regenerate { fingerprint };
        assert_eq!(plan(&regenerate, &session), DispatchPlan::Send);
    }

    #[test]
    fn corrective_commands_require_an_open_error() {
        let mut session = running_session();
        session.status = SessionStatus::Paused;
        let fix = ConsoleCommand::Fix {
            fingerprint: "0000000000000000".to_string(),
        };
        match plan(&fix, &session) {
            DispatchPlan::Refuse { reason } => assert!(reason.contains("no open error")),
            other => panic!("unexpected plan: {:?}", other),
        }
    }

    #[test]
    fn dismiss_distinguishes_resolved_from_unknown() {
        let mut session = running_session();
        let fingerprint = session
            .errors
            .record("rustc", ErrorSeverity::Error, "boom", Utc::now())
            .fingerprint
            .clone();

        let dismiss = ConsoleCommand::Dismiss {
            fingerprint: fingerprint.clone(),
        };
        assert_eq!(plan(&dismiss, &session), DispatchPlan::Send);

        session.errors.resolve(
            &fingerprint,
            crate::error_index::ResolutionMethod::Dismissed,
            Utc::now(),
        );
        match plan(&dismiss, &session) {
            DispatchPlan::Refuse { reason } => assert!(reason.contains("already resolved")),
            other => panic!("unexpected plan: {:?}", other),
        }
    }

    #[test]
    fn answer_requires_a_pending_clarification() {
        let mut session = running_session();
        let answer = ConsoleCommand::Answer {
            answer: "yes".to_string(),
        };
        assert!(matches!(plan(&answer, &session), DispatchPlan::Refuse { .. }));

        session.pending_clarification = Some(ClarificationRequest {
            question_id: "q1".to_string(),
            question: "Which db?".to_string(),
            context: None,
            options: vec![],
        });
        assert_eq!(plan(&answer, &session), DispatchPlan::Send);
    }

    #[test]
    fn plain_lifecycle_commands_are_sent() {
        let session = running_session();
        for command in [
            ConsoleCommand::Start,
            ConsoleCommand::Pause,
            ConsoleCommand::Stop,
            ConsoleCommand::Push,
            ConsoleCommand::Status,
            ConsoleCommand::Retry,
        ] {
            assert_eq!(plan(&command, &session), DispatchPlan::Send);
        }
    }
}

mod dispatching {
    use super::*;

    async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> DispatchOutcome {
        match rx.recv().await.expect("intake closed") {
            MonitorEvent::Dispatch(outcome) => outcome,
            other => panic!("unexpected intake event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn accepted_outcome_reenters_the_intake() {
        let api = Arc::new(ScriptedApi::answering(200));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (event_log, _dir) = test_event_log();
        let dispatcher = CommandDispatcher::new(api.clone(), "s1".to_string(), tx, event_log);

        dispatcher.send(ConsoleCommand::Pause, None);

        let outcome = next_outcome(&mut rx).await;
        assert_eq!(outcome.command, ConsoleCommand::Pause);
        assert!(matches!(outcome.result, DispatchResult::Accepted { .. }));
        assert_eq!(api.seen_commands.lock().unwrap()[0].command, "pause");
    }

    #[tokio::test]
    async fn conflict_on_start_reads_as_already_running() {
        let api = Arc::new(ScriptedApi::answering(409));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (event_log, _dir) = test_event_log();
        let dispatcher = CommandDispatcher::new(api, "s1".to_string(), tx, event_log);

        dispatcher.send(ConsoleCommand::Start, None);
        let outcome = next_outcome(&mut rx).await;
        assert_eq!(outcome.result, DispatchResult::AlreadyRunning);
    }

    #[tokio::test]
    async fn conflict_on_other_commands_stays_a_rejection() {
        let api = Arc::new(ScriptedApi::answering(409));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (event_log, _dir) = test_event_log();
        let dispatcher = CommandDispatcher::new(api, "s1".to_string(), tx, event_log);

        dispatcher.send(ConsoleCommand::Pause, None);
        let outcome = next_outcome(&mut rx).await;
        assert!(matches!(
            outcome.result,
            DispatchResult::Rejected { status: 409, .. }
        ));
    }

    #[tokio::test]
    async fn transport_failure_is_reported_not_dropped() {
        let api = Arc::new(ScriptedApi::unreachable_backend());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (event_log, _dir) = test_event_log();
        let dispatcher = CommandDispatcher::new(api, "s1".to_string(), tx, event_log);

        dispatcher.send(ConsoleCommand::Stop, None);
        let outcome = next_outcome(&mut rx).await;
        match outcome.result {
            DispatchResult::TransportFailed { detail } => {
                assert!(detail.contains("connection refused"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn answers_route_to_the_clarification_endpoint() {
        let api = Arc::new(ScriptedApi::answering(200));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (event_log, _dir) = test_event_log();
        let dispatcher = CommandDispatcher::new(api.clone(), "s1".to_string(), tx, event_log);

        dispatcher.send(
            ConsoleCommand::Answer {
                answer: "use Postgres".to_string(),
            },
            Some("q7".to_string()),
        );

        let outcome = next_outcome(&mut rx).await;
        assert!(matches!(outcome.result, DispatchResult::Accepted { .. }));
        let answers = api.seen_answers.lock().unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].question_id, "q7");
        assert_eq!(answers[0].answer, "use Postgres");
        assert!(api.seen_commands.lock().unwrap().is_empty());
    }
}
