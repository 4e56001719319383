//! Live event channel: the SSE stream feeding the intake loop.
//!
//! The channel is best-effort by contract. The background task connects,
//! forwards every parseable event into the intake channel, and on any kind of
//! disconnect reports [`MonitorEvent::ChannelDown`] and retries after a fixed
//! delay. Missed events are the poller's problem, not ours, so there is no
//! replay or cursor here.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::ForgeClient;
use crate::events::ForgeEvent;
use crate::monitor::MonitorEvent;

/// Incremental decoder for an SSE byte stream.
///
/// Chunks arrive split at arbitrary byte boundaries; the buffer reassembles
/// whole lines before decoding them, so a multi-byte UTF-8 sequence cut in
/// half by the transport survives intact. It collects `data:` fields and
/// emits one payload per blank-line event terminator. `event:`, `id:`,
/// `retry:` and comment lines are ignored - the payload itself carries the
/// event kind. An event left unterminated at disconnect is dropped, matching
/// the SSE contract.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk, returning every event payload it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut complete = Vec::new();
        self.pending.extend_from_slice(chunk);
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            self.consume_line(&line, &mut complete);
        }
        complete
    }

    fn consume_line(&mut self, line: &str, complete: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                complete.push(self.data.join("\n"));
                self.data.clear();
            }
            return;
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
    }
}

/// Handle to the background SSE task.
pub struct PushChannel {
    handle: JoinHandle<()>,
}

impl PushChannel {
    /// Spawns the connect-consume-reconnect loop.
    pub fn spawn(
        client: Arc<ForgeClient>,
        session_id: String,
        reconnect_delay: Duration,
        intake: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        let handle = tokio::spawn(run_channel(client, session_id, reconnect_delay, intake));
        Self { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run_channel(
    client: Arc<ForgeClient>,
    session_id: String,
    reconnect_delay: Duration,
    intake: mpsc::UnboundedSender<MonitorEvent>,
) {
    loop {
        match client.open_event_stream(&session_id).await {
            Ok(response) => {
                if intake.send(MonitorEvent::ChannelUp).is_err() {
                    return;
                }
                let detail = consume_stream(response, &intake).await;
                if intake
                    .send(MonitorEvent::ChannelDown { detail })
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                if intake
                    .send(MonitorEvent::ChannelDown {
                        detail: format!("{:#}", err),
                    })
                    .is_err()
                {
                    return;
                }
            }
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

/// Consumes one connected stream until it ends. Returns the disconnect detail.
async fn consume_stream(
    response: reqwest::Response,
    intake: &mpsc::UnboundedSender<MonitorEvent>,
) -> String {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for payload in buffer.feed(&bytes) {
                    if let Some(event) = ForgeEvent::from_json_line(&payload) {
                        if intake.send(MonitorEvent::Forge(event)).is_err() {
                            return "console shutting down".to_string();
                        }
                    }
                }
            }
            Err(err) => return err.to_string(),
        }
    }
    "stream ended".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(buffer: &mut SseLineBuffer, chunk: &str) -> Vec<String> {
        buffer.feed(chunk.as_bytes())
    }

    #[test]
    fn whole_event_in_one_chunk() {
        let mut buffer = SseLineBuffer::new();
        let events = feed_str(&mut buffer, "data: {\"type\":\"build_commenced\"}\n\n");
        assert_eq!(events, vec![r#"{"type":"build_commenced"}"#]);
    }

    #[test]
    fn event_split_across_chunks() {
        let mut buffer = SseLineBuffer::new();
        assert!(feed_str(&mut buffer, "data: {\"type\":\"bu").is_empty());
        assert!(feed_str(&mut buffer, "ild_commenced\"}\n").is_empty());
        let events = feed_str(&mut buffer, "\n");
        assert_eq!(events, vec![r#"{"type":"build_commenced"}"#]);
    }

    #[test]
    fn multibyte_character_split_across_chunks_survives() {
        let mut buffer = SseLineBuffer::new();
        let bytes = "data: café\n\n".as_bytes();
        // index 10 lands between the two bytes of the 'é'
        assert!(buffer.feed(&bytes[..10]).is_empty());
        assert_eq!(buffer.feed(&bytes[10..]), vec!["café"]);
    }

    #[test]
    fn several_events_in_one_chunk() {
        let mut buffer = SseLineBuffer::new();
        let events = feed_str(
            &mut buffer,
            "data: one\n\ndata: two\n\ndata: thr",
        );
        assert_eq!(events, vec!["one", "two"]);
        let events = feed_str(&mut buffer, "ee\n\n");
        assert_eq!(events, vec!["three"]);
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let mut buffer = SseLineBuffer::new();
        let events = feed_str(&mut buffer, "data: hello\r\n\r\n");
        assert_eq!(events, vec!["hello"]);
    }

    #[test]
    fn non_data_fields_and_comments_are_ignored() {
        let mut buffer = SseLineBuffer::new();
        let events = feed_str(
            &mut buffer,
            ": keepalive\nevent: message\nid: 42\nretry: 500\ndata: payload\n\n",
        );
        assert_eq!(events, vec!["payload"]);
    }

    #[test]
    fn multi_line_data_is_joined_with_newlines() {
        let mut buffer = SseLineBuffer::new();
        let events = feed_str(&mut buffer, "data: first\ndata: second\n\n");
        assert_eq!(events, vec!["first\nsecond"]);
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        let mut buffer = SseLineBuffer::new();
        assert!(feed_str(&mut buffer, "\n\n\n").is_empty());
        assert!(feed_str(&mut buffer, ": ping\n\n").is_empty());
    }

    #[test]
    fn data_without_space_after_colon_is_accepted() {
        let mut buffer = SseLineBuffer::new();
        let events = feed_str(&mut buffer, "data:tight\n\n");
        assert_eq!(events, vec!["tight"]);
    }
}
