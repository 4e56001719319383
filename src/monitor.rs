//! The monitor loop: sole consumer of observations, sole driver of the
//! reducer.
//!
//! Every producer - the push channel, the poller, dispatched-command
//! acknowledgements, the operator's input task - sends [`MonitorEvent`]s into
//! one unbounded channel. The loop folds them into the reducer in arrival
//! order. Because nothing else touches the reducer, two observations can
//! never interleave mid-update.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::client::{ControlApi, ForgeClient, SyncApi};
use crate::commands::{
    self, CommandDispatcher, ConsoleCommand, DispatchOutcome, DispatchPlan, LocalAction,
};
use crate::config::ConsoleConfig;
use crate::event_log::EventLog;
use crate::events::{ForgeEvent, PollSnapshot};
use crate::journal::LogEntry;
use crate::poller::Poller;
use crate::push::PushChannel;
use crate::reducer::{SessionReducer, SessionSnapshot};
use crate::session::Session;

/// Everything that can arrive at the intake channel.
#[derive(Debug)]
pub enum MonitorEvent {
    /// A typed event from the live channel.
    Forge(ForgeEvent),
    /// A successful poll round-trip.
    Poll(PollSnapshot),
    /// A poll that did not produce a snapshot.
    PollFailed { status: Option<u16>, detail: String },
    /// The vanished-session policy fired after consecutive 404s.
    PollVanished { checks: u32 },
    /// A dispatched command came back from the backend.
    Dispatch(DispatchOutcome),
    /// The operator typed a command.
    Operator(ConsoleCommand),
    /// The live event stream (re)connected.
    ChannelUp,
    /// The live event stream dropped.
    ChannelDown { detail: String },
    /// Drain and stop.
    Shutdown,
}

/// Owns the reducer and the background producers for one session.
pub struct SessionMonitor {
    reducer: SessionReducer,
    intake_rx: mpsc::UnboundedReceiver<MonitorEvent>,
    dispatcher: CommandDispatcher,
    push: Option<PushChannel>,
    poller: Option<Poller>,
}

impl SessionMonitor {
    /// Wires the full producer set around a fresh session.
    ///
    /// Returns the monitor, the intake sender (for the operator input task)
    /// and the snapshot feed.
    pub fn start(
        session_id: &str,
        client: Arc<ForgeClient>,
        config: &ConsoleConfig,
        event_log: Arc<EventLog>,
        journal_tx: mpsc::UnboundedSender<LogEntry>,
    ) -> (
        Self,
        mpsc::UnboundedSender<MonitorEvent>,
        watch::Receiver<SessionSnapshot>,
    ) {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (reducer, snapshot_rx) =
            SessionReducer::new(Session::new(session_id), Arc::clone(&event_log));
        let reducer = reducer.with_journal_feed(journal_tx);

        let control: Arc<dyn ControlApi> = client.clone();
        let dispatcher = CommandDispatcher::new(
            control,
            session_id.to_string(),
            intake_tx.clone(),
            event_log,
        );

        let push = PushChannel::spawn(
            Arc::clone(&client),
            session_id.to_string(),
            config.reconnect_delay(),
            intake_tx.clone(),
        );
        let sync: Arc<dyn SyncApi> = client;
        let poller = Poller::spawn(
            sync,
            session_id.to_string(),
            config.poll_interval(),
            config.poll_vanish_threshold,
            intake_tx.clone(),
            snapshot_rx.clone(),
        );

        let monitor = Self {
            reducer,
            intake_rx,
            dispatcher,
            push: Some(push),
            poller: Some(poller),
        };
        (monitor, intake_tx, snapshot_rx)
    }

    #[cfg(test)]
    fn bare(
        reducer: SessionReducer,
        intake_rx: mpsc::UnboundedReceiver<MonitorEvent>,
        dispatcher: CommandDispatcher,
    ) -> Self {
        Self {
            reducer,
            intake_rx,
            dispatcher,
            push: None,
            poller: None,
        }
    }

    /// Consumes intake events until shutdown, then returns the final session.
    pub async fn run(mut self) -> Session {
        while let Some(event) = self.intake_rx.recv().await {
            if matches!(event, MonitorEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }
        self.shutdown()
    }

    fn handle(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::Forge(event) => self.reducer.apply("push", event),
            MonitorEvent::Poll(snapshot) => self.reducer.apply_poll(snapshot),
            MonitorEvent::PollFailed { status, detail } => {
                self.reducer.poll_failed(status, &detail)
            }
            MonitorEvent::PollVanished { checks } => self.reducer.poll_vanished(checks),
            MonitorEvent::Dispatch(outcome) => self.reducer.dispatch_outcome(outcome),
            MonitorEvent::Operator(command) => self.on_operator(command),
            MonitorEvent::ChannelUp => self.reducer.channel_status(true, ""),
            MonitorEvent::ChannelDown { detail } => self.reducer.channel_status(false, &detail),
            MonitorEvent::Shutdown => {}
        }
    }

    /// Echo, plan, act. The plan is decided against pre-echo state because
    /// the echo itself may apply a local effect (dismiss).
    fn on_operator(&mut self, command: ConsoleCommand) {
        let plan = commands::plan(&command, self.reducer.session());
        self.reducer.command_echoed(&command);
        match plan {
            DispatchPlan::Send => {
                let question_id = self
                    .reducer
                    .session()
                    .pending_clarification
                    .as_ref()
                    .map(|request| request.question_id.clone());
                self.dispatcher.send(command, question_id);
            }
            DispatchPlan::Local(LocalAction::ClearJournal) => self.reducer.clear_journal(),
            DispatchPlan::Refuse { reason } => self.reducer.command_refused(&command, &reason),
        }
    }

    fn shutdown(self) -> Session {
        if let Some(push) = &self.push {
            push.abort();
        }
        if let Some(poller) = &self.poller {
            poller.abort();
        }
        // Dropping the intake receiver closes the channel; any in-flight
        // producer send fails harmlessly.
        self.reducer.into_session()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiResponse, ClarificationAnswer, CommandRequest};
    use crate::session::SessionStatus;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Control backend that accepts everything and counts what it saw.
    #[derive(Default)]
    struct AcceptAll {
        commands: AtomicU32,
        answers: Mutex<Vec<ClarificationAnswer>>,
    }

    #[async_trait]
    impl ControlApi for AcceptAll {
        async fn send_command(
            &self,
            _session_id: &str,
            _request: &CommandRequest,
        ) -> Result<ApiResponse> {
            self.commands.fetch_add(1, Ordering::SeqCst);
            Ok(ApiResponse {
                status: 200,
                detail: None,
            })
        }

        async fn send_clarification(
            &self,
            _session_id: &str,
            answer: &ClarificationAnswer,
        ) -> Result<ApiResponse> {
            self.answers.lock().unwrap().push(answer.clone());
            Ok(ApiResponse {
                status: 200,
                detail: None,
            })
        }
    }

    struct Loop {
        intake_tx: mpsc::UnboundedSender<MonitorEvent>,
        snapshot_rx: watch::Receiver<SessionSnapshot>,
        api: Arc<AcceptAll>,
        handle: tokio::task::JoinHandle<Session>,
        _dir: TempDir,
    }

    fn spawn_loop() -> Loop {
        let dir = TempDir::new().unwrap();
        let event_log = Arc::new(EventLog::new("s1", dir.path()).unwrap());
        let api = Arc::new(AcceptAll::default());
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (reducer, snapshot_rx) =
            SessionReducer::new(Session::new("s1"), Arc::clone(&event_log));
        let dispatcher = CommandDispatcher::new(
            api.clone() as Arc<dyn ControlApi>,
            "s1".to_string(),
            intake_tx.clone(),
            event_log,
        );
        let monitor = SessionMonitor::bare(reducer, intake_rx, dispatcher);
        let handle = tokio::spawn(monitor.run());
        Loop {
            intake_tx,
            snapshot_rx,
            api,
            handle,
            _dir: dir,
        }
    }

    async fn wait_for_status(rx: &mut watch::Receiver<SessionSnapshot>, wanted: SessionStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().status == wanted {
                    return;
                }
                rx.changed().await.expect("snapshot sender dropped");
            }
        })
        .await
        .expect("status never reached");
    }

    #[tokio::test]
    async fn folds_forge_events_in_arrival_order() {
        let mut harness = spawn_loop();
        harness
            .intake_tx
            .send(MonitorEvent::Forge(ForgeEvent::BuildCommenced))
            .unwrap();
        harness
            .intake_tx
            .send(MonitorEvent::Forge(ForgeEvent::BuildComplete))
            .unwrap();
        wait_for_status(&mut harness.snapshot_rx, SessionStatus::Completed).await;

        harness.intake_tx.send(MonitorEvent::Shutdown).unwrap();
        let session = harness.handle.await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn dispatched_acknowledgement_reenters_the_loop() {
        let mut harness = spawn_loop();
        harness
            .intake_tx
            .send(MonitorEvent::Forge(ForgeEvent::BuildCommenced))
            .unwrap();
        harness
            .intake_tx
            .send(MonitorEvent::Operator(ConsoleCommand::Pause))
            .unwrap();

        // Optimistic transition applied when the acknowledgement re-enters.
        wait_for_status(&mut harness.snapshot_rx, SessionStatus::Paused).await;
        assert_eq!(harness.api.commands.load(Ordering::SeqCst), 1);

        harness.intake_tx.send(MonitorEvent::Shutdown).unwrap();
        let session = harness.handle.await.unwrap();
        let messages: Vec<_> = session
            .journal
            .entries()
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert!(messages.contains(&"> pause"));
        assert!(messages.contains(&"pause acknowledged"));
    }

    #[tokio::test]
    async fn clear_is_local_and_never_reaches_the_backend() {
        let mut harness = spawn_loop();
        harness
            .intake_tx
            .send(MonitorEvent::Forge(ForgeEvent::BuildCommenced))
            .unwrap();
        wait_for_status(&mut harness.snapshot_rx, SessionStatus::Running).await;

        harness
            .intake_tx
            .send(MonitorEvent::Operator(ConsoleCommand::Clear))
            .unwrap();
        harness.intake_tx.send(MonitorEvent::Shutdown).unwrap();

        let session = harness.handle.await.unwrap();
        assert_eq!(session.journal.len(), 1);
        assert_eq!(session.journal.entries()[0].message, "view cleared");
        assert_eq!(harness.api.commands.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refused_commands_never_reach_the_backend() {
        let harness = spawn_loop();
        harness
            .intake_tx
            .send(MonitorEvent::Operator(ConsoleCommand::Nuke {
                confirmed: false,
            }))
            .unwrap();
        harness.intake_tx.send(MonitorEvent::Shutdown).unwrap();

        let session = harness.handle.await.unwrap();
        assert_eq!(harness.api.commands.load(Ordering::SeqCst), 0);
        assert!(session
            .journal
            .entries()
            .iter()
            .any(|e| e.message.starts_with("nuke refused:")));
    }

    #[tokio::test]
    async fn answers_carry_the_pending_question_id() {
        let mut harness = spawn_loop();
        harness
            .intake_tx
            .send(MonitorEvent::Forge(ForgeEvent::BuildCommenced))
            .unwrap();
        harness
            .intake_tx
            .send(MonitorEvent::Forge(ForgeEvent::BuildClarificationRequest {
                question_id: "q9".to_string(),
                question: "Which runtime?".to_string(),
                context: None,
                options: vec![],
            }))
            .unwrap();
        wait_for_status(&mut harness.snapshot_rx, SessionStatus::AwaitingInput).await;

        harness
            .intake_tx
            .send(MonitorEvent::Operator(ConsoleCommand::Answer {
                answer: "tokio".to_string(),
            }))
            .unwrap();
        wait_for_status(&mut harness.snapshot_rx, SessionStatus::Running).await;

        let answers = harness.api.answers.lock().unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].question_id, "q9");
        assert_eq!(answers[0].answer, "tokio");
    }

    #[tokio::test]
    async fn channel_health_changes_are_journaled() {
        let harness = spawn_loop();
        harness
            .intake_tx
            .send(MonitorEvent::ChannelDown {
                detail: "connection reset".to_string(),
            })
            .unwrap();
        harness.intake_tx.send(MonitorEvent::ChannelUp).unwrap();
        harness.intake_tx.send(MonitorEvent::Shutdown).unwrap();

        let session = harness.handle.await.unwrap();
        let messages: Vec<_> = session
            .journal
            .entries()
            .iter()
            .map(|e| e.message.clone())
            .collect();
        assert!(messages
            .iter()
            .any(|m| m.contains("disconnected (connection reset)")));
        assert!(messages.iter().any(|m| m == "event stream connected"));
    }
}
