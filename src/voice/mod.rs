//! Voice processing module
//!
//! The recognition and playback controllers drive abstract facilities
//! ([`Recognizer`], [`AudioSink`]); `mic` and `speaker` implement them on
//! top of cpal, with STT and TTS over HTTP.

mod capture;
mod detector;
mod mic;
pub mod playback;
pub mod recognition;
mod speaker;
mod stt;
mod tts;

pub use capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
pub use detector::{DetectorState, UtteranceDetector, calculate_energy};
pub use mic::{MAX_UTTERANCE, MicRecognizer, NO_SPEECH_WINDOW};
pub use playback::{
    AudioSink, PlayOutcome, PlaybackController, PlaybackDirective, PlaybackEvent, Silent,
};
pub use recognition::{
    Directive, RecognitionController, RecognitionErrorKind, RecognitionEvent, Recognizer, Segment,
    SkipReason, StartError, StartOutcome, Unsupported,
};
pub use speaker::{Clip, Speaker, decode, resample};
pub use stt::{SpeechToText, SttProvider, Transcriber};
pub use tts::{Synthesizer, TextToSpeech, TtsProvider};
