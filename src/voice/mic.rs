//! Microphone-backed recognition facility
//!
//! Each session runs on its own thread: capture until the detector closes an
//! utterance, transcribe it, report one final result and end. Sessions that
//! hear nothing within the no-speech window end with `no-speech`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;

use super::capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
use super::detector::{DetectorState, UtteranceDetector};
use super::recognition::{RecognitionErrorKind, RecognitionEvent, Recognizer, Segment, StartError};
use super::stt::Transcriber;

/// How long a session waits for speech before giving up
pub const NO_SPEECH_WINDOW: Duration = Duration::from_secs(8);

/// Longest utterance captured in one session
pub const MAX_UTTERANCE: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ActiveSession {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Recognizer built on the default input device and a [`Transcriber`]
pub struct MicRecognizer {
    transcriber: Arc<dyn Transcriber>,
    events: UnboundedSender<RecognitionEvent>,
    runtime: Handle,
    available: bool,
    session: Option<ActiveSession>,
}

impl MicRecognizer {
    /// Must be called from within a tokio runtime
    #[must_use]
    pub fn new(transcriber: Arc<dyn Transcriber>, events: UnboundedSender<RecognitionEvent>) -> Self {
        let available = AudioCapture::open().is_ok();
        if !available {
            tracing::warn!("no usable microphone, recognition unavailable");
        }

        Self {
            transcriber,
            events,
            runtime: Handle::current(),
            available,
            session: None,
        }
    }
}

impl Recognizer for MicRecognizer {
    fn is_available(&self) -> bool {
        self.available
    }

    fn start(&mut self) -> Result<(), StartError> {
        if !self.available {
            return Err(StartError::Unavailable);
        }
        if self
            .session
            .as_ref()
            .is_some_and(|s| !s.thread.is_finished())
        {
            return Err(StartError::AlreadyActive);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let worker = SessionWorker {
            stop: Arc::clone(&stop),
            events: self.events.clone(),
            transcriber: Arc::clone(&self.transcriber),
            runtime: self.runtime.clone(),
        };

        let thread = std::thread::Builder::new()
            .name("mic-session".to_string())
            .spawn(move || worker.run())
            .map_err(|e| StartError::Failed(e.to_string()))?;

        self.session = Some(ActiveSession { stop, thread });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(session) = &self.session {
            session.stop.store(true, Ordering::SeqCst);
        }
    }
}

struct SessionWorker {
    stop: Arc<AtomicBool>,
    events: UnboundedSender<RecognitionEvent>,
    transcriber: Arc<dyn Transcriber>,
    runtime: Handle,
}

impl SessionWorker {
    fn run(self) {
        if let Some(event) = self.listen() {
            self.emit(event);
        }
        self.emit(RecognitionEvent::Ended);
    }

    fn emit(&self, event: RecognitionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("recognition event receiver dropped");
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run one session; returns the final event before `Ended`
    fn listen(&self) -> Option<RecognitionEvent> {
        let capture = match AudioCapture::open() {
            Ok(capture) => capture,
            Err(e) => {
                tracing::warn!(error = %e, "cannot open microphone");
                return Some(RecognitionEvent::Error(RecognitionErrorKind::AudioCapture));
            }
        };

        let (tx, rx) = mpsc::channel();
        let stream = match capture.start(tx) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "cannot start microphone");
                return Some(RecognitionEvent::Error(RecognitionErrorKind::AudioCapture));
            }
        };

        self.emit(RecognitionEvent::Started);

        let mut detector = UtteranceDetector::default();
        let began = Instant::now();
        loop {
            if self.stopped() {
                return None;
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => {
                    if detector.process(&chunk) == DetectorState::Complete {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Some(RecognitionEvent::Error(RecognitionErrorKind::AudioCapture));
                }
            }

            let elapsed = began.elapsed();
            if !detector.heard_speech() && elapsed > NO_SPEECH_WINDOW {
                return Some(RecognitionEvent::Error(RecognitionErrorKind::NoSpeech));
            }
            if elapsed > MAX_UTTERANCE {
                tracing::debug!("utterance too long, cutting off");
                break;
            }
        }
        drop(stream);

        let samples = detector.take_utterance();
        let wav = match samples_to_wav(&samples, SAMPLE_RATE) {
            Ok(wav) => wav,
            Err(e) => {
                return Some(RecognitionEvent::Error(RecognitionErrorKind::Other(
                    e.to_string(),
                )));
            }
        };

        let transcript = self.runtime.block_on(self.transcriber.transcribe(&wav));
        if self.stopped() {
            return None;
        }

        match transcript {
            Ok(text) if text.trim().is_empty() => {
                Some(RecognitionEvent::Error(RecognitionErrorKind::NoSpeech))
            }
            Ok(text) => Some(RecognitionEvent::Result(vec![Segment::finalized(text)])),
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed");
                Some(RecognitionEvent::Error(RecognitionErrorKind::Network))
            }
        }
    }
}
