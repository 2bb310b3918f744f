//! Playback controller
//!
//! Plays synthesized reply audio through an [`AudioSink`]. A clip only starts
//! once the sink reports it can play through; until then the request is held
//! as pending and a later [`PlaybackEvent::Ready`] completes it.

use tokio::sync::mpsc::UnboundedSender;

use crate::Result;
use crate::session::{Phase, SessionState};

/// Events emitted by an audio sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The named clip is decoded and can play through
    Ready { source: String },
    /// Output started or resumed
    Played,
    /// Output paused
    Paused,
    /// The named clip played to the end
    Ended { source: String },
    /// Loading or output failed
    Failed(String),
}

/// Platform audio output facility
///
/// Holds at most one loaded clip. Events go to the sender the implementation
/// was constructed with.
pub trait AudioSink: Send {
    /// Locator of the loaded clip
    fn source(&self) -> Option<&str>;

    /// Whether the loaded clip is ready to play through
    fn is_ready(&self) -> bool;

    /// Replace the loaded clip; `Ready` follows once decoded
    fn load(&mut self, locator: &str);

    /// Start or resume output
    ///
    /// # Errors
    ///
    /// Returns error if the output device refuses to play
    fn play(&mut self) -> Result<()>;

    fn pause(&mut self);

    /// Move back to the start of the clip
    fn rewind(&mut self);
}

/// Sink for text-only mode: clips are ready at once and end as soon as played
#[derive(Debug)]
pub struct Silent {
    events: UnboundedSender<PlaybackEvent>,
    source: Option<String>,
}

impl Silent {
    #[must_use]
    pub const fn new(events: UnboundedSender<PlaybackEvent>) -> Self {
        Self {
            events,
            source: None,
        }
    }

    fn emit(&self, event: PlaybackEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("playback event receiver dropped");
        }
    }
}

impl AudioSink for Silent {
    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn is_ready(&self) -> bool {
        self.source.is_some()
    }

    fn load(&mut self, locator: &str) {
        self.source = Some(locator.to_string());
        self.emit(PlaybackEvent::Ready {
            source: locator.to_string(),
        });
    }

    fn play(&mut self) -> Result<()> {
        if let Some(source) = self.source.clone() {
            self.emit(PlaybackEvent::Ended { source });
        }
        Ok(())
    }

    fn pause(&mut self) {}

    fn rewind(&mut self) {}
}

/// Result of [`PlaybackController::play`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    /// Output began
    Started,
    /// Waiting for the clip to become ready
    Loading,
    /// No audio was given and none was synthesized yet
    NoAudio,
    /// Another phase holds the session
    Busy(Phase),
    /// The sink refused to play; logged and swallowed
    Failed,
}

/// Whether a handled event finished the current clip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackDirective {
    Nothing,
    /// The clip ended naturally; listening may resume
    Finished,
    /// The clip could not be played; listening may resume
    Interrupted,
}

/// Plays reply audio and tracks the playing phase
pub struct PlaybackController {
    sink: Box<dyn AudioSink>,
    pending: bool,
}

impl PlaybackController {
    #[must_use]
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            sink,
            pending: false,
        }
    }

    /// Whether a play request is waiting for its clip to load
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending
    }

    /// Play `audio_ref`, or the last synthesized audio when `None`
    pub fn play(&mut self, state: &mut SessionState, audio_ref: Option<&str>) -> PlayOutcome {
        let Some(locator) = audio_ref
            .map(str::to_string)
            .or_else(|| state.current_audio_ref().map(str::to_string))
        else {
            tracing::debug!("no audio to play");
            return PlayOutcome::NoAudio;
        };

        let phase = state.phase();
        if !matches!(phase, Phase::Idle | Phase::Playing) {
            tracing::debug!(phase = ?phase, "play request refused while busy");
            return PlayOutcome::Busy(phase);
        }

        if phase == Phase::Playing {
            self.sink.pause();
            state.release(Phase::Playing);
        }
        self.sink.rewind();

        if self.sink.source() == Some(locator.as_str()) {
            if self.sink.is_ready() {
                return self.begin(state);
            }
        } else {
            tracing::debug!(audio_ref = %locator, "loading audio");
            self.sink.load(&locator);
        }

        self.pending = true;
        PlayOutcome::Loading
    }

    /// Stop output and return to idle
    pub fn pause(&mut self, state: &mut SessionState) {
        self.pending = false;
        if state.phase() == Phase::Playing {
            self.sink.pause();
            state.release(Phase::Playing);
            tracing::debug!("playback paused");
        }
    }

    /// Apply a sink event
    pub fn handle(&mut self, event: PlaybackEvent, state: &mut SessionState) -> PlaybackDirective {
        match event {
            PlaybackEvent::Ready { source } => {
                if !self.pending || self.sink.source() != Some(source.as_str()) {
                    tracing::trace!(%source, "clip ready, nothing pending");
                    return PlaybackDirective::Nothing;
                }
                if !matches!(state.phase(), Phase::Idle | Phase::Playing) {
                    tracing::debug!(phase = ?state.phase(), "clip ready while busy, dropping play request");
                    self.pending = false;
                    return PlaybackDirective::Nothing;
                }
                match self.begin(state) {
                    PlayOutcome::Failed => PlaybackDirective::Interrupted,
                    _ => PlaybackDirective::Nothing,
                }
            }
            PlaybackEvent::Played => {
                tracing::trace!("sink playing");
                PlaybackDirective::Nothing
            }
            PlaybackEvent::Paused => {
                tracing::trace!("sink paused");
                PlaybackDirective::Nothing
            }
            PlaybackEvent::Ended { source } => {
                if self.sink.source() != Some(source.as_str()) {
                    tracing::trace!(%source, "ignoring end of replaced clip");
                    return PlaybackDirective::Nothing;
                }
                if state.release(Phase::Playing) {
                    tracing::info!("playback finished");
                    PlaybackDirective::Finished
                } else {
                    PlaybackDirective::Nothing
                }
            }
            PlaybackEvent::Failed(reason) => {
                tracing::warn!(%reason, "audio playback failed");
                self.pending = false;
                state.release(Phase::Playing);
                PlaybackDirective::Interrupted
            }
        }
    }

    fn begin(&mut self, state: &mut SessionState) -> PlayOutcome {
        self.pending = false;
        match self.sink.play() {
            Ok(()) => {
                if let Err(e) = state.transition(Phase::Playing) {
                    tracing::warn!(error = %e, "cannot enter playing phase");
                    self.sink.pause();
                    return PlayOutcome::Busy(e.from);
                }
                tracing::info!("playing reply audio");
                PlayOutcome::Started
            }
            Err(e) => {
                tracing::warn!(error = %e, "audio play interrupted");
                PlayOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{Error, Persona};

    #[derive(Default)]
    struct SinkLog {
        ready: bool,
        loads: Vec<String>,
        plays: usize,
        pauses: usize,
        rewinds: usize,
        refuse: bool,
    }

    #[derive(Clone, Default)]
    struct Recording {
        source: Option<String>,
        log: Arc<Mutex<SinkLog>>,
    }

    impl AudioSink for Recording {
        fn source(&self) -> Option<&str> {
            self.source.as_deref()
        }

        fn is_ready(&self) -> bool {
            self.log.lock().ready
        }

        fn load(&mut self, locator: &str) {
            self.source = Some(locator.to_string());
            let mut log = self.log.lock();
            log.ready = false;
            log.loads.push(locator.to_string());
        }

        fn play(&mut self) -> Result<()> {
            let mut log = self.log.lock();
            if log.refuse {
                return Err(Error::Playback("autoplay blocked".to_string()));
            }
            log.plays += 1;
            Ok(())
        }

        fn pause(&mut self) {
            self.log.lock().pauses += 1;
        }

        fn rewind(&mut self) {
            self.log.lock().rewinds += 1;
        }
    }

    fn setup() -> (PlaybackController, Recording, SessionState) {
        let sink = Recording::default();
        let controller = PlaybackController::new(Box::new(sink.clone()));
        (controller, sink, SessionState::new(&Persona::default()))
    }

    fn ready(source: &str) -> PlaybackEvent {
        PlaybackEvent::Ready {
            source: source.to_string(),
        }
    }

    #[test]
    fn test_no_audio() {
        let (mut controller, sink, mut state) = setup();
        assert_eq!(controller.play(&mut state, None), PlayOutcome::NoAudio);
        assert!(sink.log.lock().loads.is_empty());
    }

    #[test]
    fn test_waits_for_ready() {
        let (mut controller, sink, mut state) = setup();
        state.set_current_audio_ref("blob://a");

        assert_eq!(controller.play(&mut state, None), PlayOutcome::Loading);
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(sink.log.lock().plays, 0);

        sink.log.lock().ready = true;
        controller.handle(ready("blob://a"), &mut state);
        assert_eq!(state.phase(), Phase::Playing);
        assert_eq!(sink.log.lock().plays, 1);
    }

    #[test]
    fn test_replay_loaded_clip_starts_immediately() {
        let (mut controller, sink, mut state) = setup();
        controller.play(&mut state, Some("blob://a"));
        sink.log.lock().ready = true;
        controller.handle(ready("blob://a"), &mut state);

        assert_eq!(controller.play(&mut state, Some("blob://a")), PlayOutcome::Started);
        let log = sink.log.lock();
        assert_eq!(log.loads.len(), 1);
        assert_eq!(log.pauses, 1);
        assert_eq!(log.rewinds, 2);
    }

    #[test]
    fn test_busy_refuses() {
        let (mut controller, _, mut state) = setup();
        state.transition(Phase::Generating).unwrap();
        assert_eq!(
            controller.play(&mut state, Some("blob://a")),
            PlayOutcome::Busy(Phase::Generating)
        );
    }

    #[test]
    fn test_refused_play_is_swallowed() {
        let (mut controller, sink, mut state) = setup();
        sink.log.lock().refuse = true;
        controller.play(&mut state, Some("blob://a"));
        sink.log.lock().ready = true;
        assert_eq!(
            controller.handle(ready("blob://a"), &mut state),
            PlaybackDirective::Interrupted
        );

        assert_eq!(state.phase(), Phase::Idle);
        assert!(!controller.is_pending());
    }

    #[test]
    fn test_end_of_replaced_clip_ignored() {
        let (mut controller, sink, mut state) = setup();
        controller.play(&mut state, Some("blob://a"));
        sink.log.lock().ready = true;
        controller.handle(ready("blob://a"), &mut state);

        controller.play(&mut state, Some("blob://b"));
        sink.log.lock().ready = true;
        controller.handle(ready("blob://b"), &mut state);

        let stale = PlaybackEvent::Ended {
            source: "blob://a".to_string(),
        };
        assert_eq!(controller.handle(stale, &mut state), PlaybackDirective::Nothing);
        assert_eq!(state.phase(), Phase::Playing);

        let ended = PlaybackEvent::Ended {
            source: "blob://b".to_string(),
        };
        assert_eq!(controller.handle(ended, &mut state), PlaybackDirective::Finished);
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[test]
    fn test_pause_returns_to_idle() {
        let (mut controller, sink, mut state) = setup();
        controller.play(&mut state, Some("blob://a"));
        sink.log.lock().ready = true;
        controller.handle(ready("blob://a"), &mut state);

        controller.pause(&mut state);
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(sink.log.lock().pauses, 1);
    }

    #[test]
    fn test_silent_sink_finishes_immediately() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut controller = PlaybackController::new(Box::new(Silent::new(tx)));
        let mut state = SessionState::new(&Persona::default());

        assert_eq!(controller.play(&mut state, Some("blob://s")), PlayOutcome::Loading);
        let event = rx.try_recv().unwrap();
        controller.handle(event, &mut state);
        assert_eq!(state.phase(), Phase::Playing);

        let event = rx.try_recv().unwrap();
        assert_eq!(controller.handle(event, &mut state), PlaybackDirective::Finished);
        assert_eq!(state.phase(), Phase::Idle);
    }
}
