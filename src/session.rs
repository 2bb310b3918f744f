//! Session state shared by the coordinator and the response pipeline
//!
//! The busy state is a single [`Phase`], so at most one of listening,
//! generating, synthesizing or playing can hold at any time. Moves between
//! phases go through [`SessionState::transition`], which enforces this table:
//!
//! | from           | allowed targets                       |
//! |----------------|---------------------------------------|
//! | `Idle`         | `Listening`, `Generating`, `Playing`  |
//! | `Listening`    | `Idle`                                |
//! | `Generating`   | `Synthesizing`, `Idle`                |
//! | `Synthesizing` | `Idle`                                |
//! | `Playing`      | `Idle`                                |
//!
//! Staying in the current phase is always allowed.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::Persona;
use crate::transcript::{ConversationTurn, DisplayMessage, Transcript};

/// What the assistant is currently busy with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing in progress
    #[default]
    Idle,
    /// Recognition session active
    Listening,
    /// Waiting on the generation service
    Generating,
    /// Waiting on the speech synthesis service
    Synthesizing,
    /// Reply audio playing
    Playing,
}

impl Phase {
    /// Whether a new operation must not start
    #[must_use]
    pub const fn is_busy(self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Status line shown while in this phase
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Idle => "Ready to listen...",
            Self::Listening => "Listening...",
            Self::Generating => "Thinking of something helpful...",
            Self::Synthesizing => "Preparing my voice...",
            Self::Playing => "Speaking to you...",
        }
    }

    const fn can_enter(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Listening | Self::Generating | Self::Playing)
                | (Self::Listening | Self::Synthesizing | Self::Playing, Self::Idle)
                | (Self::Generating, Self::Synthesizing | Self::Idle)
        )
    }
}

/// Rejected phase change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal phase transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

/// Process-wide mutable state of the assistant
#[derive(Debug)]
pub struct SessionState {
    transcript: Transcript,
    phase: Phase,
    auto_mode: bool,
    current_audio_ref: Option<String>,
    live_transcript: String,
    epoch: u64,
}

impl SessionState {
    /// Create a fresh state for the persona
    #[must_use]
    pub fn new(persona: &Persona) -> Self {
        Self {
            transcript: Transcript::new(persona),
            phase: Phase::Idle,
            auto_mode: false,
            current_audio_ref: None,
            live_transcript: String::new(),
            epoch: 0,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to another phase
    ///
    /// # Errors
    ///
    /// Returns error if the transition table forbids the move
    pub fn transition(&mut self, to: Phase) -> Result<Phase, TransitionError> {
        let from = self.phase;
        if from == to {
            return Ok(from);
        }
        if !from.can_enter(to) {
            return Err(TransitionError { from, to });
        }
        tracing::debug!(from = ?from, to = ?to, "phase transition");
        self.phase = to;
        Ok(from)
    }

    /// Leave `phase` for `Idle`; no-op when in any other phase
    pub fn release(&mut self, phase: Phase) -> bool {
        if self.phase == phase && phase != Phase::Idle {
            tracing::debug!(from = ?phase, "phase released");
            self.phase = Phase::Idle;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub const fn auto_mode(&self) -> bool {
        self.auto_mode
    }

    pub const fn set_auto_mode(&mut self, enabled: bool) {
        self.auto_mode = enabled;
    }

    #[must_use]
    pub const fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub const fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    /// Reset the conversation; in-flight turns keep running
    ///
    /// Returns the new epoch.
    pub fn reset_conversation(&mut self) -> u64 {
        self.transcript.reset();
        self.epoch += 1;
        self.epoch
    }

    /// Incremented by every conversation reset
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn current_audio_ref(&self) -> Option<&str> {
        self.current_audio_ref.as_deref()
    }

    pub fn set_current_audio_ref(&mut self, audio_ref: &str) {
        self.current_audio_ref = Some(audio_ref.to_string());
    }

    /// Interim recognition text of the active pass
    #[must_use]
    pub fn live_transcript(&self) -> &str {
        &self.live_transcript
    }

    pub fn set_live_transcript(&mut self, text: &str) {
        text.clone_into(&mut self.live_transcript);
    }

    pub fn clear_live_transcript(&mut self) {
        self.live_transcript.clear();
    }

    /// Owned copy of everything an observer needs
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            auto_mode: self.auto_mode,
            live_transcript: self.live_transcript.clone(),
            current_audio_ref: self.current_audio_ref.clone(),
            turns: self.transcript.turns().to_vec(),
            messages: self.transcript.messages().to_vec(),
            epoch: self.epoch,
        }
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub phase: Phase,
    pub auto_mode: bool,
    pub live_transcript: String,
    pub current_audio_ref: Option<String>,
    pub turns: Vec<ConversationTurn>,
    pub messages: Vec<DisplayMessage>,
    pub epoch: u64,
}

impl Snapshot {
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.phase == Phase::Listening
    }

    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.phase == Phase::Generating
    }

    #[must_use]
    pub fn is_synthesizing(&self) -> bool {
        self.phase == Phase::Synthesizing
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.phase == Phase::Playing
    }

    /// Number of busy flags set (never more than one)
    #[must_use]
    pub fn busy_flags(&self) -> usize {
        [
            self.is_listening(),
            self.is_generating(),
            self.is_synthesizing(),
            self.is_playing(),
        ]
        .into_iter()
        .filter(|flag| *flag)
        .count()
    }

    /// Status line including the live transcript
    #[must_use]
    pub fn status_line(&self) -> String {
        if self.live_transcript.is_empty() {
            self.phase.description().to_string()
        } else {
            format!("{} - \"{}\"", self.phase.description(), self.live_transcript)
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    updates: watch::Sender<Snapshot>,
}

/// Shared handle to the session state
///
/// Every mutation through [`Session::update`] publishes a fresh [`Snapshot`].
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    #[must_use]
    pub fn new(persona: &Persona) -> Self {
        let state = SessionState::new(persona);
        let (updates, _) = watch::channel(state.snapshot());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                updates,
            }),
        }
    }

    /// Mutate the state and publish the result
    pub fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let (result, snapshot) = {
            let mut state = self.shared.state.lock();
            let result = f(&mut state);
            (result, state.snapshot())
        };
        self.shared.updates.send_replace(snapshot);
        result
    }

    /// Read the state without publishing
    pub fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.shared.state.lock())
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.read(SessionState::snapshot)
    }

    /// Receive a snapshot after every mutation
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.updates.subscribe()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new(&Persona::default())
    }

    #[test]
    fn test_transition_table() {
        let mut s = state();
        assert!(s.transition(Phase::Listening).is_ok());
        assert_eq!(
            s.transition(Phase::Generating),
            Err(TransitionError {
                from: Phase::Listening,
                to: Phase::Generating
            })
        );
        assert!(s.transition(Phase::Idle).is_ok());
        assert!(s.transition(Phase::Generating).is_ok());
        assert!(s.transition(Phase::Playing).is_err());
        assert!(s.transition(Phase::Synthesizing).is_ok());
        assert!(s.transition(Phase::Listening).is_err());
        assert!(s.transition(Phase::Idle).is_ok());
        assert!(s.transition(Phase::Playing).is_ok());
        assert!(s.transition(Phase::Playing).is_ok());
        assert!(s.transition(Phase::Listening).is_err());
    }

    #[test]
    fn test_release_only_matching_phase() {
        let mut s = state();
        s.transition(Phase::Playing).unwrap();
        assert!(!s.release(Phase::Listening));
        assert_eq!(s.phase(), Phase::Playing);
        assert!(s.release(Phase::Playing));
        assert_eq!(s.phase(), Phase::Idle);
    }

    #[test]
    fn test_reset_bumps_epoch() {
        let mut s = state();
        s.transcript_mut().push_user("hi");
        assert_eq!(s.reset_conversation(), 1);
        assert_eq!(s.transcript().turns().len(), 2);
        assert_eq!(s.epoch(), 1);
    }

    #[test]
    fn test_status_line_includes_interim() {
        let mut s = state();
        s.transition(Phase::Listening).unwrap();
        s.set_live_transcript("I'm stre");
        assert_eq!(s.snapshot().status_line(), "Listening... - \"I'm stre\"");
        s.clear_live_transcript();
        assert_eq!(s.snapshot().status_line(), "Listening...");
    }

    #[tokio::test]
    async fn test_update_publishes_snapshot() {
        let session = Session::new(&Persona::default());
        let mut rx = session.subscribe();

        session.update(|s| s.set_auto_mode(true));
        rx.changed().await.unwrap();
        assert!(rx.borrow().auto_mode);
        assert_eq!(rx.borrow().busy_flags(), 0);
    }
}
