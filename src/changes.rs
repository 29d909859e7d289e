//! Bridges the server's push feed into sync signals.
//!
//! `GET /changes` is a server-sent-event stream; every `changed` event
//! carries the cursor after some mutation. Most of these are ignored here,
//! because the resumption poll will observe them on its own. The two cases
//! that matter:
//!
//! - the event's cursor moved backwards relative to ours: the remote tree
//!   was rebuilt, so the sync task must start over;
//! - the event's cursor exactly equals ours: an interior mutation (e.g.
//!   lazy recomputation) invisible to the cursor, which only a fresh
//!   catch-up poll can surface.
//!
//! Dropped connections reconnect after the same fixed retry delay the
//! pollers use.

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::ACCEPT;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::debug;

use crate::config::Config;
use crate::position::PositionTracker;
use crate::protocol::ChangeEvent;
use crate::sync::{CursorView, SyncSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Cursor regressed; full resynchronization required.
    Backward,
    /// No visible cursor movement; only a catch-up poll can see the change.
    Interior,
    /// Normal forward movement; the resumption poll will pick it up.
    Advance,
}

pub fn classify(cursor: CursorView, event: ChangeEvent) -> Classification {
    let held = PositionTracker::from_parts(cursor.position, cursor.forgotten);
    if held.would_reset(event.position, event.forgotten) {
        Classification::Backward
    } else if held.same_view(event.position, event.forgotten) {
        Classification::Interior
    } else {
        Classification::Advance
    }
}

pub struct ChangeBridge {
    http: Client,
    config: Config,
    cursor_rx: watch::Receiver<CursorView>,
    signals: mpsc::Sender<SyncSignal>,
}

impl ChangeBridge {
    pub fn new(
        http: Client,
        config: Config,
        cursor_rx: watch::Receiver<CursorView>,
        signals: mpsc::Sender<SyncSignal>,
    ) -> Self {
        Self {
            http,
            config,
            cursor_rx,
            signals,
        }
    }

    pub async fn run(mut self) {
        let url = self.config.endpoint("changes");
        loop {
            match self
                .http
                .get(url.clone())
                .header(ACCEPT, "text/event-stream")
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    debug!("change feed connected");
                    let mut parser = SseParser::default();
                    let mut stream = response.bytes_stream();
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(bytes) => match self.handle_chunk(&mut parser, bytes).await {
                                ChunkOutcome::Continue => {}
                                ChunkOutcome::Disconnect => break,
                                ChunkOutcome::Shutdown => return,
                            },
                            Err(err) => {
                                debug!(%err, "change feed interrupted");
                                break;
                            }
                        }
                    }
                }
                Ok(response) => {
                    debug!(status = %response.status(), "change feed rejected")
                }
                Err(err) => debug!(%err, "change feed connection failed"),
            }
            sleep(self.config.retry_delay).await;
        }
    }

    async fn handle_chunk(&mut self, parser: &mut SseParser, bytes: Bytes) -> ChunkOutcome {
        let events = match parser.push(&bytes) {
            Ok(events) => events,
            Err(err) => {
                debug!(%err, "dropping change feed connection");
                return ChunkOutcome::Disconnect;
            }
        };
        for event in events {
            if event.name != "changed" {
                continue;
            }
            let change = match serde_json::from_str::<ChangeEvent>(&event.data) {
                Ok(change) => change,
                Err(err) => {
                    debug!(%err, data = %event.data, "ignoring malformed change event");
                    continue;
                }
            };
            let cursor = *self.cursor_rx.borrow();
            let signal = match classify(cursor, change) {
                Classification::Backward => SyncSignal::Reset,
                Classification::Interior => SyncSignal::CatchUp,
                Classification::Advance => continue,
            };
            if self.signals.send(signal).await.is_err() {
                return ChunkOutcome::Shutdown;
            }
        }
        ChunkOutcome::Continue
    }
}

/// What to do with the current connection after a chunk is processed.
enum ChunkOutcome {
    Continue,
    /// The server is misbehaving; reconnect after the retry delay.
    Disconnect,
    /// The sync task is gone and the bridge should stop.
    Shutdown,
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: String,
    pub data: String,
}

/// Longest partial line the parser will hold. Change events are tiny, so
/// anything past this is a misbehaving server, not a slow chunk boundary.
pub const MAX_PENDING_LINE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
#[error("event stream exceeded {MAX_PENDING_LINE} buffered bytes without a newline")]
pub struct LineOverflow;

/// Incremental server-sent-event parser.
///
/// Events may arrive split across arbitrary transport chunks, so bytes are
/// buffered until a full line is available. Only the `event` and `data`
/// fields are interpreted; comments, `id`, and `retry` are skipped. A
/// newline-free stream errors out once the buffer passes
/// [`MAX_PENDING_LINE`] so the connection can be dropped instead of
/// growing without bound.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data: String,
}

impl SseParser {
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, LineOverflow> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.push_line(&line) {
                events.push(event);
            }
        }
        if self.buffer.len() > MAX_PENDING_LINE {
            return Err(LineOverflow);
        }
        Ok(events)
    }

    fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            _ => {}
        }
        None
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event_name.is_none() {
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        let name = self
            .event_name
            .take()
            .unwrap_or_else(|| "message".to_string());
        Some(SseEvent { name, data })
    }
}
