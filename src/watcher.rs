//! Log state watcher: turns a recorder's output into status transitions.
//!
//! The recorder prints fixed phrases as it moves through the meeting lobby.
//! [`LogWatcher::events`] frames the raw output into lines and classifies
//! them; [`LogWatcher::follow`] feeds the progress events to the status
//! synchronizer for one attempt.

use std::collections::VecDeque;

use futures::StreamExt;
use futures::stream::BoxStream;

use crate::container::LogStream;
use crate::recording::RecordingStatus;
use crate::status::StatusSync;

const ASKING_PHRASES: &[&str] = &["asking to join", "asking to be let in"];
const JOINED_PHRASES: &[&str] = &["admitted to the meeting", "successfully joined"];
const TIMED_OUT_PHRASES: &[&str] = &["timed out waiting to join", "timeout waiting to join"];

/// A classified log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    AskingToJoin,
    Joined,
    TimedOut,
    /// The stream ended; nothing follows.
    Finished(EndReason),
}

/// Why the log stream ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EndReason {
    #[default]
    Closed,
    Error(String),
}

/// Classify one output line. Unrecognized lines yield `None`.
pub fn classify_line(line: &str) -> Option<LogEvent> {
    let lower = line.to_lowercase();
    let matches = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));

    // Timeout lines can quote the lobby message; they win.
    if matches(TIMED_OUT_PHRASES) {
        Some(LogEvent::TimedOut)
    } else if matches(JOINED_PHRASES) {
        Some(LogEvent::Joined)
    } else if matches(ASKING_PHRASES) {
        Some(LogEvent::AskingToJoin)
    } else {
        None
    }
}

/// Longest partial line kept while waiting for a newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Reassembles lines from arbitrarily chunked output.
///
/// Output that runs past [`MAX_LINE_BYTES`] without a newline is emitted in
/// pieces of that size so the buffer stays bounded.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        while self.buf.len() >= MAX_LINE_BYTES {
            let piece: Vec<u8> = self.buf.drain(..MAX_LINE_BYTES).collect();
            lines.push(decode_line(&piece));
        }
        lines
    }

    /// The trailing partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// What one attempt's log stream showed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub timed_out: bool,
    pub joined: bool,
    pub end: EndReason,
}

struct EventState {
    source: Option<LogStream>,
    splitter: LineSplitter,
    pending: VecDeque<LogEvent>,
}

impl EventState {
    fn queue_lines(&mut self, lines: impl IntoIterator<Item = String>) {
        self.pending
            .extend(lines.into_iter().filter_map(|line| classify_line(&line)));
    }

    /// Drop the source and queue whatever the buffer still holds.
    fn close(&mut self, reason: EndReason) {
        self.source = None;
        let tail = self.splitter.finish();
        self.queue_lines(tail);
        self.pending.push_back(LogEvent::Finished(reason));
    }
}

pub struct LogWatcher;

impl LogWatcher {
    /// Classified events from a container's output.
    ///
    /// Ends with exactly one [`LogEvent::Finished`]. The underlying stream is
    /// dropped as soon as it ends or fails, or when the returned stream is
    /// dropped.
    pub fn events(logs: LogStream) -> BoxStream<'static, LogEvent> {
        let state = EventState {
            source: Some(logs),
            splitter: LineSplitter::new(),
            pending: VecDeque::new(),
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                let next = match state.source.as_mut() {
                    Some(source) => source.next().await,
                    None => return None,
                };
                match next {
                    Some(Ok(chunk)) => {
                        let lines = state.splitter.push(&chunk);
                        state.queue_lines(lines);
                    }
                    Some(Err(e)) => state.close(EndReason::Error(e.to_string())),
                    None => state.close(EndReason::Closed),
                }
            }
        })
        .boxed()
    }

    /// Drive `logs` to the end, writing progress statuses tagged with
    /// `attempt`.
    pub async fn follow(
        logs: LogStream,
        status: &StatusSync,
        recording_id: &str,
        attempt: u32,
    ) -> WatchSummary {
        let mut events = Self::events(logs);
        let mut summary = WatchSummary::default();
        let mut last_written = None;

        while let Some(event) = events.next().await {
            let next_status = match event {
                LogEvent::AskingToJoin => RecordingStatus::AskingToJoin,
                LogEvent::Joined => {
                    summary.joined = true;
                    RecordingStatus::Joined
                }
                LogEvent::TimedOut => {
                    tracing::info!(recording_id, attempt, "Recorder timed out waiting to join");
                    summary.timed_out = true;
                    continue;
                }
                LogEvent::Finished(reason) => {
                    if let EndReason::Error(e) = &reason {
                        tracing::warn!(recording_id, attempt, "Log stream ended with error: {}", e);
                    }
                    summary.end = reason;
                    break;
                }
            };

            // The recorder repeats lobby messages while it waits.
            if last_written == Some(next_status) {
                continue;
            }
            if status
                .apply_status(recording_id, next_status, None, Some(attempt))
                .await
            {
                last_written = Some(next_status);
            }
        }

        summary
    }
}
