//! Pull-based fallback sync.
//!
//! The poller guarantees forward progress when the push channel is down,
//! never connects, or silently drops events. It runs only while the session
//! is actively building (gated on the snapshot watch channel), forwards every
//! snapshot into the intake, and implements the vanished-session policy: a
//! session that answers 404 three polls in a row is assumed to have finished
//! and been cleaned up server-side.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::client::{PollResponse, SyncApi};
use crate::monitor::MonitorEvent;
use crate::reducer::SessionSnapshot;

/// Handle to the background poll task.
pub struct Poller {
    handle: JoinHandle<()>,
}

impl Poller {
    pub fn spawn(
        api: Arc<dyn SyncApi>,
        session_id: String,
        interval: Duration,
        vanish_threshold: u32,
        intake: mpsc::UnboundedSender<MonitorEvent>,
        snapshot_rx: watch::Receiver<SessionSnapshot>,
    ) -> Self {
        let handle = tokio::spawn(run_poller(
            api,
            session_id,
            interval,
            vanish_threshold,
            intake,
            snapshot_rx,
        ));
        Self { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run_poller(
    api: Arc<dyn SyncApi>,
    session_id: String,
    interval: Duration,
    vanish_threshold: u32,
    intake: mpsc::UnboundedSender<MonitorEvent>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Counts consecutive 404 answers only; any other outcome breaks the run.
    let mut not_found_streak: u32 = 0;

    loop {
        ticker.tick().await;

        let status = snapshot_rx.borrow().status;
        if status.is_terminal() {
            return;
        }
        if !status.is_pollable() {
            not_found_streak = 0;
            continue;
        }

        match api.poll(&session_id).await {
            Ok(PollResponse::Snapshot(snapshot)) => {
                not_found_streak = 0;
                if intake.send(MonitorEvent::Poll(snapshot)).is_err() {
                    return;
                }
            }
            Ok(PollResponse::Status(404)) => {
                not_found_streak += 1;
                if not_found_streak >= vanish_threshold {
                    let _ = intake.send(MonitorEvent::PollVanished {
                        checks: not_found_streak,
                    });
                    return;
                }
                if intake
                    .send(MonitorEvent::PollFailed {
                        status: Some(404),
                        detail: "session not found".to_string(),
                    })
                    .is_err()
                {
                    return;
                }
            }
            Ok(PollResponse::Status(code)) => {
                not_found_streak = 0;
                if intake
                    .send(MonitorEvent::PollFailed {
                        status: Some(code),
                        detail: format!("HTTP {}", code),
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                not_found_streak = 0;
                if intake
                    .send(MonitorEvent::PollFailed {
                        status: None,
                        detail: format!("{:#}", err),
                    })
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}
