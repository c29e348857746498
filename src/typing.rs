//! Character-by-character replay of finalized assistant replies.
//!
//! Purely presentational: the scheduler listens to manager events and
//! produces frames for the front-end. It never writes back into the chat
//! state or the store.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::manager::ChatEvent;

const FRAME_BUFFER: usize = 256;

/// Pacing of the replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypingTimings {
    /// Pause before the first character, shown as "thinking".
    pub thinking_delay: Duration,
    pub per_char: Duration,
}

impl TypingTimings {
    pub const STANDARD: TypingTimings = TypingTimings {
        thinking_delay: Duration::from_millis(1200),
        per_char: Duration::from_millis(25),
    };

    pub const BRISK: TypingTimings = TypingTimings {
        thinking_delay: Duration::from_millis(800),
        per_char: Duration::from_millis(30),
    };
}

impl Default for TypingTimings {
    fn default() -> Self {
        Self::STANDARD
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevealFrame {
    Thinking { message_id: Uuid },
    /// `visible` is the prefix revealed so far.
    Reveal { message_id: Uuid, visible: String },
    Done { message_id: Uuid },
}

/// The first `chars` characters of `text`.
pub fn reveal_prefix(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

struct Replay {
    message_id: Uuid,
    text: String,
    total: usize,
    shown: usize,
    next_at: Instant,
}

pub struct TypingScheduler;

impl TypingScheduler {
    /// Starts the replay task. It ends when the event channel closes or the
    /// frame receiver is dropped.
    pub fn spawn(
        events: broadcast::Receiver<ChatEvent>,
        timings: TypingTimings,
    ) -> (JoinHandle<()>, mpsc::Receiver<RevealFrame>) {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let handle = tokio::spawn(run(events, frames_tx, timings));
        (handle, frames_rx)
    }
}

async fn run(
    mut events: broadcast::Receiver<ChatEvent>,
    frames: mpsc::Sender<RevealFrame>,
    timings: TypingTimings,
) {
    let mut current: Option<Replay> = None;

    loop {
        let deadline = current.as_ref().map(|r| r.next_at);

        tokio::select! {
            event = events.recv() => match event {
                Ok(ChatEvent::AssistantMessageFinalized { message_id, text, visible, .. }) => {
                    if !visible || text.is_empty() {
                        continue;
                    }
                    log::debug!("Replaying message {} ({} chars)", message_id, text.chars().count());
                    current = Some(Replay {
                        message_id,
                        total: text.chars().count(),
                        text,
                        shown: 0,
                        next_at: Instant::now() + timings.thinking_delay + timings.per_char,
                    });
                    if frames.send(RevealFrame::Thinking { message_id }).await.is_err() {
                        break;
                    }
                }
                Ok(ChatEvent::ActiveChatChanged { .. }) => {
                    if let Some(replay) = current.take() {
                        log::debug!("Abandoning replay of {} after chat switch", replay.message_id);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Typing scheduler skipped {} chat events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let Some(replay) = current.as_mut() else { continue };
                replay.shown += 1;
                replay.next_at += timings.per_char;
                let frame = RevealFrame::Reveal {
                    message_id: replay.message_id,
                    visible: reveal_prefix(&replay.text, replay.shown).to_string(),
                };
                if frames.send(frame).await.is_err() {
                    break;
                }
                if replay.shown >= replay.total {
                    let message_id = replay.message_id;
                    current = None;
                    if frames.send(RevealFrame::Done { message_id }).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    log::debug!("Typing scheduler stopped");
}
