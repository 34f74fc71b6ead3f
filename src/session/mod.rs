pub mod orchestrator;
pub mod segmenter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConversationConfig;
use crate::protocol::frame::AudioFormat;

/// Pipeline phase of the session. Owned by the dispatcher task; the
/// orchestrator reports transitions over the turn-event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Receiving,
    Transcribing,
    Generating,
    Synthesizing,
    Aborted,
    Closed,
}

/// A frame queued for the writer task. Turn-scoped frames carry their turn
/// id; the writer drops any whose turn is no longer active.
#[derive(Debug)]
pub struct Outbound {
    pub turn: Option<u64>,
    pub message: Message,
}

impl Outbound {
    pub fn for_turn(turn: u64, message: Message) -> Self {
        Self {
            turn: Some(turn),
            message,
        }
    }

    pub fn untagged(message: Message) -> Self {
        Self {
            turn: None,
            message,
        }
    }
}

/// Progress reports from the orchestrator task back to the dispatcher.
#[derive(Debug)]
pub enum TurnEvent {
    Phase { turn_id: u64, phase: Phase },
    Finished { turn_id: u64 },
    Failed { turn_id: u64 },
    Cancelled { turn_id: u64 },
}

/// What a spawned orchestrator task needs to identify its turn and notice
/// that it was aborted.
#[derive(Clone)]
pub struct TurnHandle {
    pub turn_id: u64,
    pub cancel: CancellationToken,
}

/// Per-connection state. Created on WebSocket open, destroyed on close.
/// Mutated only by the session's dispatcher task.
pub struct Session {
    pub id: String,
    pub config: ConversationConfig,
    pub phase: Phase,
    audio: Vec<u8>,
    audio_format: AudioFormat,
    turn_counter: u64,
    active_turn: Arc<AtomicU64>,
    session_cancel: CancellationToken,
    turn_cancel: CancellationToken,
}

impl Session {
    pub fn new(id: String, config: ConversationConfig) -> Self {
        let session_cancel = CancellationToken::new();
        Self {
            id,
            config,
            phase: Phase::Idle,
            audio: Vec::new(),
            audio_format: AudioFormat::Unknown,
            turn_counter: 0,
            active_turn: Arc::new(AtomicU64::new(0)),
            turn_cancel: session_cancel.child_token(),
            session_cancel,
        }
    }

    /// Shared counter the writer task compares turn-tagged frames against.
    pub fn active_turn_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.active_turn)
    }

    /// First chunk of a new utterance. The declared format of the first
    /// frame wins for the whole capture.
    pub fn begin_audio(&mut self, format: AudioFormat) {
        self.audio.clear();
        self.audio_format = format;
        if self.phase == Phase::Idle {
            self.phase = Phase::Receiving;
        }
    }

    pub fn append_audio(&mut self, bytes: &[u8]) {
        self.audio.extend_from_slice(bytes);
    }

    pub fn capturing(&self) -> bool {
        !self.audio.is_empty()
    }

    /// Takes the finished capture, leaving the buffer empty for the next
    /// utterance.
    pub fn finish_audio(&mut self) -> (Vec<u8>, AudioFormat) {
        let format = std::mem::take(&mut self.audio_format);
        (std::mem::take(&mut self.audio), format)
    }

    /// Cancels the running turn and bumps the turn id so in-flight frames
    /// for it are dropped at the writer. Idempotent; returns the id of the
    /// turn that was cancelled.
    pub fn abort(&mut self) -> u64 {
        let prior = self.turn_counter;
        self.turn_cancel.cancel();
        self.turn_counter += 1;
        self.active_turn.store(self.turn_counter, Ordering::Release);
        if !matches!(self.phase, Phase::Idle | Phase::Closed) {
            self.phase = Phase::Aborted;
        }
        debug!(session = %self.id, turn = prior, "Turn aborted");
        prior
    }

    /// Allocates the next turn. The previous turn's token is left alone:
    /// callers abort explicitly before starting over.
    pub fn begin_turn(&mut self) -> TurnHandle {
        self.turn_counter += 1;
        self.active_turn.store(self.turn_counter, Ordering::Release);
        self.turn_cancel = self.session_cancel.child_token();
        TurnHandle {
            turn_id: self.turn_counter,
            cancel: self.turn_cancel.clone(),
        }
    }

    pub fn current_turn(&self) -> u64 {
        self.turn_counter
    }

    /// Applies an orchestrator progress report. Stale reports are ignored.
    pub fn apply_event(&mut self, event: TurnEvent) {
        if self.phase == Phase::Closed {
            return;
        }
        match event {
            TurnEvent::Phase { turn_id, phase } if turn_id == self.turn_counter => {
                self.phase = phase;
            }
            TurnEvent::Finished { turn_id }
            | TurnEvent::Failed { turn_id }
            | TurnEvent::Cancelled { turn_id }
                if turn_id == self.turn_counter =>
            {
                self.phase = Phase::Idle;
            }
            TurnEvent::Cancelled { .. } if self.phase == Phase::Aborted => {
                // The aborted task unwound; resources are released.
                self.phase = Phase::Idle;
            }
            _ => {}
        }
    }

    /// Terminal. Raises the session-level cancel so every in-flight
    /// provider call observes it.
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.session_cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConversationConfig;

    fn session() -> Session {
        Session::new("test".into(), ConversationConfig::default())
    }

    #[test]
    fn audio_capture_lifecycle() {
        let mut s = session();
        assert!(!s.capturing());
        s.begin_audio(AudioFormat::Webm);
        assert_eq!(s.phase, Phase::Receiving);
        s.append_audio(&[1, 2]);
        s.append_audio(&[3]);
        assert!(s.capturing());
        let (bytes, format) = s.finish_audio();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(format, AudioFormat::Webm);
        assert!(!s.capturing());
    }

    #[test]
    fn turn_ids_increase_and_abort_cancels() {
        let mut s = session();
        let t1 = s.begin_turn();
        assert_eq!(t1.turn_id, 1);
        assert!(!t1.cancel.is_cancelled());

        let prior = s.abort();
        assert_eq!(prior, 1);
        assert!(t1.cancel.is_cancelled());

        let t2 = s.begin_turn();
        assert!(t2.turn_id > t1.turn_id);
        assert!(!t2.cancel.is_cancelled());
    }

    #[test]
    fn stale_events_are_ignored() {
        let mut s = session();
        let t1 = s.begin_turn();
        s.apply_event(TurnEvent::Phase {
            turn_id: t1.turn_id,
            phase: Phase::Generating,
        });
        assert_eq!(s.phase, Phase::Generating);

        s.abort();
        let t2 = s.begin_turn();
        // An event from the aborted turn must not disturb the new one.
        s.apply_event(TurnEvent::Finished { turn_id: t1.turn_id });
        assert_eq!(s.phase, Phase::Aborted);
        s.apply_event(TurnEvent::Phase {
            turn_id: t2.turn_id,
            phase: Phase::Generating,
        });
        assert_eq!(s.phase, Phase::Generating);
    }

    #[test]
    fn aborted_returns_to_idle_once_cancellation_observed() {
        let mut s = session();
        let t1 = s.begin_turn();
        s.apply_event(TurnEvent::Phase {
            turn_id: t1.turn_id,
            phase: Phase::Synthesizing,
        });
        s.abort();
        assert_eq!(s.phase, Phase::Aborted);
        s.apply_event(TurnEvent::Cancelled { turn_id: t1.turn_id });
        assert_eq!(s.phase, Phase::Idle);
    }

    #[test]
    fn close_cancels_running_turn() {
        let mut s = session();
        let t1 = s.begin_turn();
        s.close();
        assert!(s.is_closed());
        assert!(t1.cancel.is_cancelled());
        // Events after close are no-ops.
        s.apply_event(TurnEvent::Finished { turn_id: t1.turn_id });
        assert!(s.is_closed());
    }
}
