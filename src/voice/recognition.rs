//! Speech recognition controller
//!
//! Wraps a single-utterance [`Recognizer`] facility. The facility reports
//! its lifecycle through [`RecognitionEvent`]s on a channel handed to it at
//! construction; [`RecognitionController::handle`] turns each event into a
//! [`Directive`] for the coordinator. Restarts are never performed here, only
//! requested, so that the coordinator owns the single restart timer.

use std::time::Duration;

use thiserror::Error;

use crate::config::Timings;
use crate::session::{Phase, SessionState};

/// Error codes reported by the recognition facility
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// Session was aborted on purpose
    Aborted,
    /// Nothing was said before the facility gave up
    NoSpeech,
    /// Microphone permission refused
    NotAllowed,
    /// Audio input could not be captured
    AudioCapture,
    /// Recognition backend unreachable
    Network,
    /// Anything else
    Other(String),
}

impl RecognitionErrorKind {
    /// Classify a platform error code
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "aborted" => Self::Aborted,
            "no-speech" => Self::NoSpeech,
            "not-allowed" | "service-not-allowed" => Self::NotAllowed,
            "audio-capture" => Self::AudioCapture,
            "network" => Self::Network,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One recognition hypothesis in a result batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub is_final: bool,
}

impl Segment {
    #[must_use]
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    #[must_use]
    pub fn finalized(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Lifecycle events emitted by a recognition facility
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Capture actually began
    Started,
    /// New hypotheses for the current pass
    Result(Vec<Segment>),
    /// Session failed
    Error(RecognitionErrorKind),
    /// Session is over (always sent, also after errors and `stop`)
    Ended,
}

/// Failure to begin a recognition session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    /// A session is already running at the platform level
    #[error("recognition already active")]
    AlreadyActive,

    /// No recognition facility on this system
    #[error("recognition unavailable")]
    Unavailable,

    /// Facility refused to start
    #[error("recognition failed to start: {0}")]
    Failed(String),
}

/// Platform speech recognition facility
///
/// Sessions end by themselves after one utterance. Events go to the sender
/// the implementation was constructed with.
pub trait Recognizer: Send {
    /// Whether recognition is possible at all on this system
    fn is_available(&self) -> bool;

    /// Begin a session
    ///
    /// # Errors
    ///
    /// Returns [`StartError::AlreadyActive`] if a session is still running
    fn start(&mut self) -> Result<(), StartError>;

    /// End the current session, if any
    fn stop(&mut self);
}

/// Stand-in for systems without speech recognition
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

impl Recognizer for Unsupported {
    fn is_available(&self) -> bool {
        false
    }

    fn start(&mut self) -> Result<(), StartError> {
        Err(StartError::Unavailable)
    }

    fn stop(&mut self) {}
}

/// Why a start request was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyListening,
    AutoModeDisabled,
    Unavailable,
    Busy(Phase),
}

/// Result of [`RecognitionController::start`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Facility asked to start; `Started` will follow
    Requested,
    /// Facility was already running; swallowed
    AlreadyActive,
    /// Guard refused the request
    Skipped(SkipReason),
    /// Facility threw something other than "already active"
    Failed(String),
}

/// What the coordinator should do after an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Nothing,
    /// A finalized, non-empty utterance to answer
    Utterance(String),
    /// Try listening again after the delay
    Restart(Duration),
    /// Microphone refused; auto mode must end
    PermissionDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Stopped,
    Starting,
    Active,
}

/// Start/stop lifecycle and event classification for a [`Recognizer`]
pub struct RecognitionController {
    recognizer: Box<dyn Recognizer>,
    available: bool,
    status: Status,
    timings: Timings,
}

impl RecognitionController {
    #[must_use]
    pub fn new(recognizer: Box<dyn Recognizer>, timings: Timings) -> Self {
        let available = recognizer.is_available();
        Self {
            recognizer,
            available,
            status: Status::Stopped,
            timings,
        }
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.available
    }

    /// No session running or requested
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.status == Status::Stopped
    }

    /// Begin listening if auto mode is on and nothing else is in progress
    pub fn start(&mut self, state: &SessionState) -> StartOutcome {
        let skip = if !self.available {
            Some(SkipReason::Unavailable)
        } else if self.status != Status::Stopped || state.phase() == Phase::Listening {
            Some(SkipReason::AlreadyListening)
        } else if !state.auto_mode() {
            Some(SkipReason::AutoModeDisabled)
        } else if state.phase().is_busy() {
            Some(SkipReason::Busy(state.phase()))
        } else {
            None
        };

        if let Some(reason) = skip {
            tracing::debug!(
                ?reason,
                phase = ?state.phase(),
                auto_mode = state.auto_mode(),
                "start listening skipped"
            );
            return StartOutcome::Skipped(reason);
        }

        match self.recognizer.start() {
            Ok(()) => {
                tracing::debug!("recognition start requested");
                self.status = Status::Starting;
                StartOutcome::Requested
            }
            Err(StartError::AlreadyActive) => {
                tracing::debug!("recognition already active");
                self.status = Status::Starting;
                StartOutcome::AlreadyActive
            }
            Err(StartError::Unavailable) => {
                self.available = false;
                StartOutcome::Skipped(SkipReason::Unavailable)
            }
            Err(StartError::Failed(reason)) => {
                tracing::warn!(%reason, "recognition failed to start");
                StartOutcome::Failed(reason)
            }
        }
    }

    /// Stop the current session and leave the listening phase
    pub fn stop(&mut self, state: &mut SessionState) {
        if self.status != Status::Stopped {
            self.recognizer.stop();
            self.status = Status::Stopped;
            tracing::debug!("recognition stopped");
        }
        state.release(Phase::Listening);
        state.clear_live_transcript();
    }

    /// Classify a facility event
    pub fn handle(&mut self, event: RecognitionEvent, state: &mut SessionState) -> Directive {
        match event {
            RecognitionEvent::Started => self.on_started(state),
            RecognitionEvent::Result(segments) => self.on_result(&segments, state),
            RecognitionEvent::Error(kind) => self.on_error(kind, state),
            RecognitionEvent::Ended => self.on_ended(state),
        }
    }

    fn on_started(&mut self, state: &mut SessionState) -> Directive {
        match self.status {
            Status::Starting => {
                if let Err(e) = state.transition(Phase::Listening) {
                    tracing::warn!(error = %e, "recognition started while busy, stopping it");
                    self.recognizer.stop();
                    self.status = Status::Stopped;
                } else {
                    self.status = Status::Active;
                    tracing::info!("listening");
                }
            }
            Status::Stopped => {
                tracing::debug!("recognition started after stop, stopping it");
                self.recognizer.stop();
            }
            Status::Active => {}
        }
        Directive::Nothing
    }

    fn on_result(&mut self, segments: &[Segment], state: &mut SessionState) -> Directive {
        if self.status == Status::Stopped {
            tracing::debug!("ignoring result from stopped session");
            return Directive::Nothing;
        }

        let mut finalized = String::new();
        let mut interim = String::new();
        for segment in segments {
            if segment.is_final {
                finalized.push_str(&segment.text);
            } else {
                interim.push_str(&segment.text);
            }
        }

        state.set_live_transcript(&interim);

        let utterance = finalized.trim();
        if utterance.is_empty() || !state.auto_mode() {
            return Directive::Nothing;
        }

        tracing::info!(utterance, "final transcript");
        state.clear_live_transcript();
        Directive::Utterance(utterance.to_string())
    }

    fn on_error(&mut self, kind: RecognitionErrorKind, state: &mut SessionState) -> Directive {
        match kind {
            RecognitionErrorKind::Aborted => {
                tracing::debug!("recognition aborted");
                Directive::Nothing
            }
            RecognitionErrorKind::NoSpeech => {
                tracing::debug!("no speech detected");
                if state.auto_mode() {
                    Directive::Restart(self.timings.no_speech_restart)
                } else {
                    Directive::Nothing
                }
            }
            RecognitionErrorKind::NotAllowed => {
                tracing::warn!("microphone permission denied");
                self.stop(state);
                Directive::PermissionDenied
            }
            other => {
                tracing::warn!(error = ?other, "recognition error");
                self.status = Status::Stopped;
                state.release(Phase::Listening);
                state.clear_live_transcript();
                if state.auto_mode() {
                    Directive::Restart(self.timings.error_restart)
                } else {
                    Directive::Nothing
                }
            }
        }
    }

    fn on_ended(&mut self, state: &mut SessionState) -> Directive {
        tracing::debug!("recognition session ended");
        self.status = Status::Stopped;
        state.release(Phase::Listening);
        state.clear_live_transcript();

        if state.auto_mode() && !state.phase().is_busy() {
            Directive::Restart(self.timings.session_end_restart)
        } else {
            Directive::Nothing
        }
    }
}
