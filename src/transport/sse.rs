//! # SSE line-based decoder
//!
//! A stream-local state machine that accumulates `event:`/`data:`/`id:`/
//! `retry:` fields line by line and dispatches complete events on a blank
//! line. One reader task performs all blocking reads and feeds a 1-slot
//! channel; the consumer races "next line" against a stall timer, so a
//! stalled peer never leaves a blocking read stranded (spec.md §4.5, §5,
//! §9).

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    Event(SseEvent),
    Stall { duration_ms: u64 },
}

/// Accumulates field lines for one in-progress event. A blank line (or
/// EOF with pending data) dispatches it.
#[derive(Default)]
struct PendingEvent {
    event: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
    retry_ms: Option<u64>,
}

impl PendingEvent {
    fn has_data(&self) -> bool {
        self.event.is_some() || !self.data_lines.is_empty() || self.id.is_some()
    }

    fn dispatch(self) -> SseEvent {
        SseEvent {
            event: self.event,
            data: self.data_lines.join("\n"),
            id: self.id,
            retry_ms: self.retry_ms,
        }
    }
}

fn apply_field(pending: &mut PendingEvent, line: &str) {
    if let Some(rest) = line.strip_prefix(':') {
        let _ = rest; // comment line, ignored
        return;
    }
    let (field, value) = match line.split_once(':') {
        Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
        None => (line, ""),
    };
    match field {
        "event" => pending.event = Some(value.to_string()),
        "data" => pending.data_lines.push(value.to_string()),
        "id" => {
            if !value.contains('\0') {
                pending.id = Some(value.to_string());
            }
        }
        "retry" => pending.retry_ms = value.parse::<u64>().ok(),
        _ => {}
    }
}

/// Validates that an event ID is eligible to update the connection's
/// last-event-id (resumable streams). Non-matching IDs are silently
/// discarded rather than erroring — see DESIGN.md for the open-question
/// resolution this implements.
pub fn is_resumable_event_id(id: &str) -> bool {
    !id.is_empty()
        && id.starts_with("evt_")
        && id[4..].chars().all(|c| c.is_ascii_digit() || matches!(c, 'a'..='f'))
        && id.len() > 4
}

/// Spawn the reader task: reads `source` line by line, dispatches complete
/// events into the returned receiver. The task exits when the source hits
/// EOF or the receiver is dropped (which happens on `Close`).
pub fn spawn_reader<R>(source: R) -> mpsc::Receiver<SseEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut reader = BufReader::new(source);
        let mut pending = PendingEvent::default();
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    if pending.has_data() {
                        let _ = tx.send(pending.dispatch()).await;
                    }
                    break;
                }
                Ok(_) => {
                    let trimmed = line.strip_suffix('\n').unwrap_or(&line);
                    let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
                    if trimmed.is_empty() {
                        if pending.has_data() {
                            let event = std::mem::take(&mut pending).dispatch();
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    } else {
                        apply_field(&mut pending, trimmed);
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

/// Race "next event" against `stall_timeout`. Returns `None` when the
/// stream has ended (sender dropped) with no stall pending.
pub async fn next_with_stall(
    rx: &mut mpsc::Receiver<SseEvent>,
    stall_timeout: Duration,
) -> Option<SseItem> {
    tokio::select! {
        biased;
        event = rx.recv() => event.map(SseItem::Event),
        _ = tokio::time::sleep(stall_timeout) => Some(SseItem::Stall {
            duration_ms: stall_timeout.as_millis() as u64,
        }),
    }
}
