//! Mode/state coordinator
//!
//! A single task owns both facility controllers and serialises every input
//! (user commands, facility events, timer expiries, pipeline completions)
//! through one `select!` loop. It closes the hands-free loop:
//! listen, recognize, answer, speak, listen again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Timings;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::pipeline::{PendingTurn, PipelineError, ResponsePipeline, TurnReply};
use crate::session::{Phase, Session, Snapshot};
use crate::voice::{
    AudioSink, Directive, PlayOutcome, PlaybackController, PlaybackDirective, PlaybackEvent,
    RecognitionController, RecognitionEvent, Recognizer, SkipReason, StartOutcome,
};

/// Requests from the user interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetAutoMode(bool),
    ToggleAutoMode,
    /// Typed message (manual mode only)
    Submit(String),
    /// Replay the given audio, or the last reply
    Play(Option<String>),
    Pause,
    Reset,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnOrigin {
    Voice,
    Typed,
}

#[derive(Debug)]
enum Internal {
    RestartDue { ticket: u64 },
    ForceStart { retry: bool },
    TurnFinished {
        origin: TurnOrigin,
        result: Result<TurnReply, PipelineError>,
    },
    DelayedPlay { audio_ref: String },
}

/// Single cancellable slot for the next listening restart
///
/// Every schedule or cancel moves to a new ticket, so an expiry that was
/// already queued when its timer was superseded is recognised and ignored.
#[derive(Debug, Default)]
struct RestartTimer {
    ticket: u64,
    task: Option<JoinHandle<()>>,
    counted: bool,
}

impl RestartTimer {
    fn schedule(&mut self, delay: Duration, counted: bool, tx: &mpsc::UnboundedSender<Internal>) {
        self.cancel();
        let ticket = self.ticket;
        let tx = tx.clone();
        self.counted = counted;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::RestartDue { ticket });
        }));
        tracing::debug!(delay_ms = delay.as_millis(), ticket, counted, "restart scheduled");
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.ticket += 1;
    }

    /// Claim a fired ticket
    ///
    /// Returns whether the restart counts towards the ceiling, or `None` if
    /// the ticket was superseded.
    fn accept(&mut self, ticket: u64) -> Option<bool> {
        if ticket == self.ticket && self.task.is_some() {
            self.task = None;
            Some(self.counted)
        } else {
            None
        }
    }
}

/// Facilities the coordinator drives, with the event streams they publish to
pub struct Facilities {
    pub recognizer: Box<dyn Recognizer>,
    pub recognition_events: mpsc::UnboundedReceiver<RecognitionEvent>,
    pub sink: Box<dyn AudioSink>,
    pub playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
}

/// Cloneable handle for sending commands and observing state
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    session: Session,
}

impl CoordinatorHandle {
    /// Queue a command; false once the coordinator has stopped
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn set_auto_mode(&self, enabled: bool) -> bool {
        self.send(Command::SetAutoMode(enabled))
    }

    pub fn toggle_auto_mode(&self) -> bool {
        self.send(Command::ToggleAutoMode)
    }

    pub fn submit(&self, text: impl Into<String>) -> bool {
        self.send(Command::Submit(text.into()))
    }

    pub fn play(&self, audio_ref: Option<String>) -> bool {
        self.send(Command::Play(audio_ref))
    }

    pub fn pause(&self) -> bool {
        self.send(Command::Pause)
    }

    pub fn reset(&self) -> bool {
        self.send(Command::Reset)
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.session.subscribe()
    }
}

/// Drives the auto loop and manual interactions
pub struct Coordinator {
    session: Session,
    recognition: RecognitionController,
    playback: PlaybackController,
    pipeline: ResponsePipeline,
    notifier: Arc<dyn Notifier>,
    timings: Timings,
    commands: mpsc::UnboundedReceiver<Command>,
    recognition_events: mpsc::UnboundedReceiver<RecognitionEvent>,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    restart: RestartTimer,
    delayed_play: Option<JoinHandle<()>>,
    turn_in_flight: bool,
    consecutive_restarts: u32,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        session: Session,
        pipeline: ResponsePipeline,
        facilities: Facilities,
        notifier: Arc<dyn Notifier>,
        timings: Timings,
    ) -> (Self, CoordinatorHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let handle = CoordinatorHandle {
            commands: command_tx,
            session: session.clone(),
        };

        let coordinator = Self {
            session,
            recognition: RecognitionController::new(facilities.recognizer, timings),
            playback: PlaybackController::new(facilities.sink),
            pipeline,
            notifier,
            timings,
            commands,
            recognition_events: facilities.recognition_events,
            playback_events: facilities.playback_events,
            internal_tx,
            internal_rx,
            restart: RestartTimer::default(),
            delayed_play: None,
            turn_in_flight: false,
            consecutive_restarts: 0,
        };

        (coordinator, handle)
    }

    /// Run on a new task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process inputs until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        if !self.recognition.is_available() {
            self.notify(NotificationKind::RecognitionUnsupported);
        }
        tracing::debug!("coordinator running");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(event) = self.recognition_events.recv() => self.on_recognition(event),
                Some(event) = self.playback_events.recv() => self.on_playback(event),
                Some(event) = self.internal_rx.recv() => self.on_internal(event),
            }
        }

        self.shutdown();
    }

    fn on_command(&mut self, command: Command) {
        tracing::debug!(?command, "command");
        match command {
            Command::SetAutoMode(enabled) => self.set_auto_mode(enabled),
            Command::ToggleAutoMode => {
                let enabled = self.session.read(|s| s.auto_mode());
                self.set_auto_mode(!enabled);
            }
            Command::Submit(text) => self.submit(&text),
            Command::Play(audio_ref) => self.play(audio_ref.as_deref()),
            Command::Pause => self.session.update(|s| self.playback.pause(s)),
            Command::Reset => {
                let epoch = self.session.update(|s| s.reset_conversation());
                tracing::info!(epoch, "conversation reset");
                self.notify(NotificationKind::ConversationReset);
            }
            Command::Shutdown => {}
        }
    }

    fn set_auto_mode(&mut self, enabled: bool) {
        if self.session.read(|s| s.auto_mode()) == enabled {
            return;
        }

        if enabled {
            if !self.recognition.is_available() {
                tracing::debug!("recognition unavailable, auto mode stays off");
                return;
            }
            self.session.update(|s| s.set_auto_mode(true));
            self.consecutive_restarts = 0;
            tracing::info!("auto mode enabled");
            self.notify(NotificationKind::AutoModeEnabled);
            self.after(self.timings.auto_start, Internal::ForceStart { retry: true });
        } else {
            self.session.update(|s| {
                s.set_auto_mode(false);
                self.recognition.stop(s);
            });
            self.restart.cancel();
            tracing::info!("auto mode disabled");
            self.notify(NotificationKind::AutoModeDisabled);
        }
    }

    fn submit(&mut self, text: &str) {
        if text.trim().is_empty() {
            self.notify(NotificationKind::EmptyMessage);
            return;
        }
        if self.session.read(|s| s.auto_mode()) {
            tracing::debug!("typed message ignored in auto mode");
            self.notify(NotificationKind::TypingInAutoMode);
            return;
        }
        if self.turn_in_flight {
            tracing::debug!("typed message ignored while a reply is pending");
            return;
        }

        self.cancel_delayed_play();
        let begun = self.session.update(|s| {
            self.playback.pause(s);
            self.pipeline.begin(s, text)
        });

        match begun {
            Ok(turn) => self.spawn_turn(turn, TurnOrigin::Typed),
            Err(PipelineError::EmptyInput) => self.notify(NotificationKind::EmptyMessage),
            Err(e) => tracing::debug!(error = %e, "typed message refused"),
        }
    }

    fn play(&mut self, audio_ref: Option<&str>) {
        self.restart.cancel();
        let outcome = self.session.update(|s| {
            if !self.recognition.is_stopped() || s.phase() == Phase::Listening {
                self.recognition.stop(s);
            }
            self.playback.play(s, audio_ref)
        });
        tracing::debug!(?outcome, "play requested");

        if outcome == PlayOutcome::Failed {
            self.schedule_restart(self.timings.playback_end_restart, false);
        }
    }

    fn on_recognition(&mut self, event: RecognitionEvent) {
        let directive = self
            .session
            .update(|s| self.recognition.handle(event, s));

        match directive {
            Directive::Nothing => {}
            Directive::Utterance(text) => self.on_utterance(&text),
            Directive::Restart(delay) => self.schedule_restart(delay, true),
            Directive::PermissionDenied => {
                self.session.update(|s| s.set_auto_mode(false));
                self.restart.cancel();
                self.notify(NotificationKind::MicrophoneDenied);
            }
        }
    }

    fn on_utterance(&mut self, text: &str) {
        self.restart.cancel();
        self.consecutive_restarts = 0;

        let begun = self.session.update(|s| {
            self.recognition.stop(s);
            self.pipeline.begin(s, text)
        });

        match begun {
            Ok(turn) => self.spawn_turn(turn, TurnOrigin::Voice),
            Err(e) => {
                tracing::warn!(error = %e, "cannot answer utterance");
                self.schedule_restart(self.timings.error_restart, false);
            }
        }
    }

    fn on_playback(&mut self, event: PlaybackEvent) {
        let directive = self.session.update(|s| self.playback.handle(event, s));

        if directive != PlaybackDirective::Nothing {
            self.schedule_restart(self.timings.playback_end_restart, false);
        }
    }

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::RestartDue { ticket } => match self.restart.accept(ticket) {
                Some(counted) => self.restart_listening(counted),
                None => tracing::trace!(ticket, "superseded restart ignored"),
            },
            Internal::ForceStart { retry } => {
                let outcome = self.start_listening();
                if retry && matches!(outcome, StartOutcome::Failed(_)) {
                    self.after(self.timings.start_retry, Internal::ForceStart { retry: false });
                }
            }
            Internal::TurnFinished { origin, result } => self.on_turn_finished(origin, result),
            Internal::DelayedPlay { audio_ref } => {
                self.delayed_play = None;
                self.play(Some(&audio_ref));
            }
        }
    }

    fn on_turn_finished(&mut self, origin: TurnOrigin, result: Result<TurnReply, PipelineError>) {
        self.turn_in_flight = false;

        match result {
            Ok(reply) => match origin {
                TurnOrigin::Voice => self.play(Some(&reply.audio_ref)),
                TurnOrigin::Typed => {
                    self.cancel_delayed_play();
                    self.delayed_play = Some(self.after(
                        self.timings.manual_play,
                        Internal::DelayedPlay {
                            audio_ref: reply.audio_ref,
                        },
                    ));
                }
            },
            Err(e) => {
                if e.is_service_failure() {
                    tracing::warn!(error = %e, "turn failed");
                    self.notify(NotificationKind::ResponseFailed);
                } else {
                    tracing::debug!(error = %e, "turn dropped");
                }
                self.schedule_restart(self.timings.pipeline_failure_restart, false);
            }
        }
    }

    fn spawn_turn(&mut self, turn: PendingTurn, origin: TurnOrigin) {
        self.turn_in_flight = true;
        let pipeline = self.pipeline.clone();
        let session = self.session.clone();
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = pipeline.complete(&session, turn).await;
            let _ = tx.send(Internal::TurnFinished { origin, result });
        });
    }

    fn start_listening(&mut self) -> StartOutcome {
        self.restart.cancel();
        if self.playback.is_pending() {
            tracing::debug!("reply audio loading, not listening");
            return StartOutcome::Skipped(SkipReason::Busy(Phase::Playing));
        }

        let outcome = self.session.read(|s| self.recognition.start(s));
        tracing::debug!(?outcome, "start listening");
        outcome
    }

    /// Re-arm listening after `delay` if auto mode is still on
    ///
    /// `counted` restarts are the ones that happen without a finalized
    /// utterance; they are subject to the restart ceiling.
    fn schedule_restart(&mut self, delay: Duration, counted: bool) {
        if !self.session.read(|s| s.auto_mode()) {
            return;
        }
        self.restart.schedule(delay, counted, &self.internal_tx);
    }

    fn restart_listening(&mut self, counted: bool) {
        if counted {
            if let Some(max) = self.timings.max_consecutive_restarts
                && self.consecutive_restarts >= max
            {
                self.pause_listening();
                return;
            }
            self.consecutive_restarts += 1;
        }
        if let StartOutcome::Failed(reason) = self.start_listening() {
            tracing::debug!(%reason, "restart failed, trying again");
            self.schedule_restart(self.timings.start_retry, true);
        }
    }

    fn pause_listening(&mut self) {
        tracing::info!(
            restarts = self.consecutive_restarts,
            "restart ceiling reached, leaving auto mode"
        );
        self.session.update(|s| {
            s.set_auto_mode(false);
            self.recognition.stop(s);
        });
        self.restart.cancel();
        self.notify(NotificationKind::ListeningPaused);
    }

    fn after(&self, delay: Duration, event: Internal) -> JoinHandle<()> {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        })
    }

    fn cancel_delayed_play(&mut self) {
        if let Some(task) = self.delayed_play.take() {
            task.abort();
        }
    }

    fn notify(&self, kind: NotificationKind) {
        self.notifier.notify(Notification::of(kind));
    }

    fn shutdown(&mut self) {
        self.restart.cancel();
        self.cancel_delayed_play();
        self.session.update(|s| {
            self.recognition.stop(s);
            self.playback.pause(s);
        });
        tracing::debug!("coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_restart_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RestartTimer::default();

        timer.schedule(Duration::from_millis(100), true, &tx);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let Some(Internal::RestartDue { ticket }) = rx.recv().await else {
            panic!("expected restart");
        };
        assert_eq!(timer.accept(ticket), Some(true));
        assert_eq!(timer.accept(ticket), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_ticket_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RestartTimer::default();

        timer.schedule(Duration::from_millis(100), true, &tx);
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Expiry is queued, then a new restart supersedes it
        timer.schedule(Duration::from_millis(100), true, &tx);

        let Some(Internal::RestartDue { ticket }) = rx.recv().await else {
            panic!("expected restart");
        };
        assert_eq!(timer.accept(ticket), None);

        let Some(Internal::RestartDue { ticket }) = rx.recv().await else {
            panic!("expected restart");
        };
        assert_eq!(timer.accept(ticket), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RestartTimer::default();

        timer.schedule(Duration::from_millis(100), true, &tx);
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(tx);

        assert!(rx.recv().await.is_none());
    }
}
