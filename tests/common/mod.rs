//! Shared test utilities
//!
//! Fake facilities that record what the coordinator asks of them, and a
//! harness that wires them to a running coordinator.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use stress_buddy::llm::ServiceMessage;
use stress_buddy::notify::{ChannelNotifier, Notification, NotificationKind};
use stress_buddy::voice::{
    AudioSink, PlaybackEvent, RecognitionErrorKind, RecognitionEvent, Recognizer, Segment,
    StartError, Synthesizer,
};
use stress_buddy::{
    Coordinator, CoordinatorHandle, Error, Facilities, Generator, Persona, ResponsePipeline,
    Session, Snapshot, Timings,
};

/// Which facilities are busy right now, as seen by the fakes themselves
#[derive(Debug, Default)]
pub struct World {
    pub recognizing: bool,
    pub generating: bool,
    pub synthesizing: bool,
    pub playing: bool,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Activity {
    Generating,
    Synthesizing,
}

impl World {
    fn check(&mut self, what: &str) {
        let busy = [
            self.recognizing,
            self.generating,
            self.synthesizing,
            self.playing,
        ]
        .into_iter()
        .filter(|b| *b)
        .count();
        if busy > 1 {
            let violation = format!(
                "{what}: recognizing={} generating={} synthesizing={} playing={}",
                self.recognizing, self.generating, self.synthesizing, self.playing
            );
            self.violations.push(violation);
        }
    }

    fn flag(&mut self, activity: Activity) -> &mut bool {
        match activity {
            Activity::Generating => &mut self.generating,
            Activity::Synthesizing => &mut self.synthesizing,
        }
    }
}

/// Marks a service call busy until dropped (also when a timeout drops it)
struct Busy {
    world: Arc<Mutex<World>>,
    activity: Activity,
}

impl Busy {
    fn enter(world: &Arc<Mutex<World>>, activity: Activity) -> Self {
        {
            let mut w = world.lock();
            *w.flag(activity) = true;
            w.check(&format!("{activity:?} started"));
        }
        Self {
            world: Arc::clone(world),
            activity,
        }
    }
}

impl Drop for Busy {
    fn drop(&mut self) {
        *self.world.lock().flag(self.activity) = false;
    }
}

#[derive(Debug, Default)]
pub struct RecognizerLog {
    pub starts: usize,
    pub stops: usize,
    pub active: bool,
    pub unavailable: bool,
    /// Number of upcoming starts that fail
    pub fail_starts: usize,
}

/// Recognizer that starts instantly and is driven by the test
pub struct FakeRecognizer {
    log: Arc<Mutex<RecognizerLog>>,
    world: Arc<Mutex<World>>,
    events: mpsc::UnboundedSender<RecognitionEvent>,
}

impl Recognizer for FakeRecognizer {
    fn is_available(&self) -> bool {
        !self.log.lock().unavailable
    }

    fn start(&mut self) -> Result<(), StartError> {
        let mut log = self.log.lock();
        if log.unavailable {
            return Err(StartError::Unavailable);
        }
        if log.fail_starts > 0 {
            log.fail_starts -= 1;
            return Err(StartError::Failed("device busy".to_string()));
        }
        if log.active {
            return Err(StartError::AlreadyActive);
        }

        log.active = true;
        log.starts += 1;
        {
            let mut world = self.world.lock();
            world.recognizing = true;
            world.check("recognition started");
        }
        let _ = self.events.send(RecognitionEvent::Started);
        Ok(())
    }

    fn stop(&mut self) {
        let mut log = self.log.lock();
        if log.active {
            log.active = false;
            log.stops += 1;
            self.world.lock().recognizing = false;
            let _ = self.events.send(RecognitionEvent::Ended);
        }
    }
}

/// Test-side view of the fake recognizer
#[derive(Clone)]
pub struct RecognizerProbe {
    pub log: Arc<Mutex<RecognizerLog>>,
    world: Arc<Mutex<World>>,
    events: mpsc::UnboundedSender<RecognitionEvent>,
}

impl RecognizerProbe {
    pub fn starts(&self) -> usize {
        self.log.lock().starts
    }

    pub fn is_active(&self) -> bool {
        self.log.lock().active
    }

    /// Speak into an active session: an interim hypothesis, then the final one
    pub fn say(&self, text: &str) -> bool {
        if !self.is_active() {
            return false;
        }
        let first_word = text.split_whitespace().next().unwrap_or_default();
        let _ = self
            .events
            .send(RecognitionEvent::Result(vec![Segment::interim(first_word)]));
        let _ = self
            .events
            .send(RecognitionEvent::Result(vec![Segment::finalized(text)]));
        true
    }

    /// The session gives up without hearing anything
    pub fn silence(&self) -> bool {
        self.fail(RecognitionErrorKind::NoSpeech)
    }

    /// The session fails with `kind` and ends
    pub fn fail(&self, kind: RecognitionErrorKind) -> bool {
        let mut log = self.log.lock();
        if !log.active {
            return false;
        }
        log.active = false;
        self.world.lock().recognizing = false;
        let _ = self.events.send(RecognitionEvent::Error(kind));
        let _ = self.events.send(RecognitionEvent::Ended);
        true
    }

    /// The user refuses microphone access
    pub fn deny(&self) {
        let _ = self
            .events
            .send(RecognitionEvent::Error(RecognitionErrorKind::NotAllowed));
    }
}

#[derive(Debug, Default)]
pub struct SinkLog {
    pub loads: Vec<String>,
    pub plays: usize,
    pub pauses: usize,
    pub playing: bool,
    /// Refuse every play call
    pub refuse: bool,
    current: Option<String>,
}

/// Sink whose clips are ready at once and end when the test says so
pub struct FakeSink {
    log: Arc<Mutex<SinkLog>>,
    world: Arc<Mutex<World>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    source: Option<String>,
}

impl AudioSink for FakeSink {
    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn is_ready(&self) -> bool {
        self.source.is_some()
    }

    fn load(&mut self, locator: &str) {
        self.pause();
        self.source = Some(locator.to_string());
        {
            let mut log = self.log.lock();
            log.loads.push(locator.to_string());
            log.current = Some(locator.to_string());
        }
        let _ = self.events.send(PlaybackEvent::Ready {
            source: locator.to_string(),
        });
    }

    fn play(&mut self) -> stress_buddy::Result<()> {
        let mut log = self.log.lock();
        if log.refuse {
            return Err(Error::Playback("autoplay blocked".to_string()));
        }
        log.plays += 1;
        log.playing = true;
        {
            let mut world = self.world.lock();
            world.playing = true;
            world.check("playback started");
        }
        let _ = self.events.send(PlaybackEvent::Played);
        Ok(())
    }

    fn pause(&mut self) {
        let mut log = self.log.lock();
        if log.playing {
            log.playing = false;
            log.pauses += 1;
            self.world.lock().playing = false;
            let _ = self.events.send(PlaybackEvent::Paused);
        }
    }

    fn rewind(&mut self) {}
}

/// Test-side view of the fake sink
#[derive(Clone)]
pub struct SinkProbe {
    pub log: Arc<Mutex<SinkLog>>,
    world: Arc<Mutex<World>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl SinkProbe {
    pub fn is_playing(&self) -> bool {
        self.log.lock().playing
    }

    pub fn plays(&self) -> usize {
        self.log.lock().plays
    }

    pub fn loads(&self) -> Vec<String> {
        self.log.lock().loads.clone()
    }

    /// The playing clip reaches its end
    pub fn finish(&self) -> bool {
        let mut log = self.log.lock();
        if !log.playing {
            return false;
        }
        log.playing = false;
        self.world.lock().playing = false;
        let source = log.current.clone().unwrap_or_default();
        let _ = self.events.send(PlaybackEvent::Ended { source });
        true
    }
}

/// Scripted answer of a fake service
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail,
}

/// Generation service answering from a script
pub struct FakeGenerator {
    replies: Mutex<VecDeque<Reply>>,
    pub delay: Mutex<Duration>,
    pub histories: Mutex<Vec<Vec<ServiceMessage>>>,
    world: Arc<Mutex<World>>,
}

impl FakeGenerator {
    pub fn new(world: Arc<Mutex<World>>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::from_millis(100)),
            histories: Mutex::new(Vec::new()),
            world,
        }
    }

    pub fn script(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    pub fn reply(&self, text: &str) {
        self.script(Reply::Text(text.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.histories.lock().len()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, history: &[ServiceMessage]) -> stress_buddy::Result<String> {
        let call = {
            let mut histories = self.histories.lock();
            histories.push(history.to_vec());
            histories.len()
        };
        let _busy = Busy::enter(&self.world, Activity::Generating);
        let delay = *self.delay.lock();
        tokio::time::sleep(delay).await;

        match self.replies.lock().pop_front() {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail) => Err(Error::Generation("service unavailable".to_string())),
            None => Ok(format!("reply {call}")),
        }
    }
}

/// Synthesis service returning `blob://1`, `blob://2`, ...
pub struct FakeSynthesizer {
    failures: Mutex<usize>,
    pub delay: Mutex<Duration>,
    pub calls: Mutex<Vec<(String, String)>>,
    world: Arc<Mutex<World>>,
}

impl FakeSynthesizer {
    pub fn new(world: Arc<Mutex<World>>) -> Self {
        Self {
            failures: Mutex::new(0),
            delay: Mutex::new(Duration::from_millis(100)),
            calls: Mutex::new(Vec::new()),
            world,
        }
    }

    pub fn fail_next(&self) {
        *self.failures.lock() += 1;
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> stress_buddy::Result<String> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push((text.to_string(), voice.to_string()));
            calls.len()
        };
        let _busy = Busy::enter(&self.world, Activity::Synthesizing);
        let delay = *self.delay.lock();
        tokio::time::sleep(delay).await;

        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(Error::Tts("synthesis unavailable".to_string()));
        }
        Ok(format!("blob://{call}"))
    }
}

/// Harness configuration
pub struct Options {
    pub timings: Timings,
    pub discard_stale: bool,
    pub timeout: Option<Duration>,
    pub recognition_available: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            discard_stale: true,
            timeout: None,
            recognition_available: true,
        }
    }
}

/// A running coordinator wired to fakes
pub struct Harness {
    pub handle: CoordinatorHandle,
    pub recognizer: RecognizerProbe,
    pub sink: SinkProbe,
    pub generator: Arc<FakeGenerator>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub world: Arc<Mutex<World>>,
    notifications: mpsc::UnboundedReceiver<Notification>,
    updates: watch::Receiver<Snapshot>,
    task: JoinHandle<()>,
}

impl Harness {
    /// Start with default options; call from within a tokio runtime
    pub fn start() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        let world = Arc::new(Mutex::new(World::default()));
        let (recognition_tx, recognition_events) = mpsc::unbounded_channel();
        let (playback_tx, playback_events) = mpsc::unbounded_channel();

        let recognizer_log = Arc::new(Mutex::new(RecognizerLog {
            unavailable: !options.recognition_available,
            ..RecognizerLog::default()
        }));
        let sink_log = Arc::new(Mutex::new(SinkLog::default()));

        let recognizer = FakeRecognizer {
            log: Arc::clone(&recognizer_log),
            world: Arc::clone(&world),
            events: recognition_tx.clone(),
        };
        let sink = FakeSink {
            log: Arc::clone(&sink_log),
            world: Arc::clone(&world),
            events: playback_tx.clone(),
            source: None,
        };

        let generator = Arc::new(FakeGenerator::new(Arc::clone(&world)));
        let synthesizer = Arc::new(FakeSynthesizer::new(Arc::clone(&world)));

        let pipeline = ResponsePipeline::new(
            Arc::clone(&generator) as Arc<dyn Generator>,
            Arc::clone(&synthesizer) as Arc<dyn Synthesizer>,
            "en-US-terrell",
        )
        .with_timeout(options.timeout)
        .discard_stale_results(options.discard_stale);

        let (notifier, notifications) = ChannelNotifier::new();
        let session = Session::new(&Persona::default());
        let (coordinator, handle) = Coordinator::new(
            session,
            pipeline,
            Facilities {
                recognizer: Box::new(recognizer),
                recognition_events,
                sink: Box::new(sink),
                playback_events,
            },
            Arc::new(notifier),
            options.timings,
        );
        let updates = handle.subscribe();
        let task = coordinator.spawn();

        Self {
            handle,
            recognizer: RecognizerProbe {
                log: recognizer_log,
                world: Arc::clone(&world),
                events: recognition_tx,
            },
            sink: SinkProbe {
                log: sink_log,
                world: Arc::clone(&world),
                events: playback_tx,
            },
            generator,
            synthesizer,
            world,
            notifications,
            updates,
            task,
        }
    }

    /// Wait (in virtual time) until the session satisfies `pred`
    pub async fn wait_for(&mut self, what: &str, pred: impl FnMut(&Snapshot) -> bool) -> Snapshot {
        tokio::time::timeout(Duration::from_secs(600), self.updates.wait_for(pred))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .expect("coordinator stopped")
            .clone()
    }

    /// Let virtual time pass so queued events and due timers run
    pub async fn advance(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    pub fn snapshot(&self) -> Snapshot {
        self.handle.session().snapshot()
    }

    /// Notifications emitted since the last call
    pub fn notifications(&mut self) -> Vec<NotificationKind> {
        let mut kinds = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            kinds.push(notification.kind);
        }
        kinds
    }

    pub fn violations(&self) -> Vec<String> {
        self.world.lock().violations.clone()
    }

    /// Enable auto mode and wait for the first listening session
    pub async fn listen(&mut self) {
        self.handle.set_auto_mode(true);
        self.wait_for("listening", |s| s.is_listening()).await;
    }

    pub async fn stop(self) {
        self.handle.shutdown();
        self.task.await.expect("coordinator panicked");
    }
}
