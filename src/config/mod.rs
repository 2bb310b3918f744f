//! Configuration management for the assistant
//!
//! Priority: environment > TOML file > defaults.

pub mod file;

use std::path::Path;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::llm::GeminiClient;
use crate::llm::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::persona::DEFAULT_VOICE;
use crate::voice::{SpeechToText, SttProvider, TextToSpeech, TtsProvider};
use crate::{Error, Persona, Result};

use file::ConfigFile;

/// Default per-call service timeout
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default voice for OpenAI speech
const OPENAI_DEFAULT_VOICE: &str = "alloy";

/// Assistant configuration
#[derive(Debug)]
pub struct Config {
    /// Active persona (voice already resolved)
    pub persona: Persona,

    /// Generation service configuration
    pub llm: LlmConfig,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Restart and playback delays
    pub timings: Timings,

    /// Drop pipeline results that resolve after a conversation reset
    pub discard_stale_results: bool,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    /// `None` waits forever
    pub timeout: Option<Duration>,
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Use the microphone and speaker
    pub enabled: bool,
    pub tts_provider: TtsProvider,
    pub tts_model: String,
    pub stt_provider: SttProvider,
    pub stt_model: String,
    /// Recognition locale
    pub language: String,
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    pub gemini: Option<SecretString>,
    pub murf: Option<SecretString>,
    pub openai: Option<SecretString>,
    pub deepgram: Option<SecretString>,
}

/// Delays between automatic steps of the conversation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// After a `no-speech` recognition error
    pub no_speech_restart: Duration,
    /// After any other recognition error
    pub error_restart: Duration,
    /// After a recognition session ends
    pub session_end_restart: Duration,
    /// After reply audio finishes
    pub playback_end_restart: Duration,
    /// After a failed turn
    pub pipeline_failure_restart: Duration,
    /// Retry after enabling auto mode, if listening did not begin
    pub start_retry: Duration,
    /// First start after enabling auto mode
    pub auto_start: Duration,
    /// Before playing a reply in manual mode
    pub manual_play: Duration,
    /// Disable auto mode after this many restarts without an utterance
    pub max_consecutive_restarts: Option<u32>,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            no_speech_restart: Duration::from_millis(1000),
            error_restart: Duration::from_millis(2000),
            session_end_restart: Duration::from_millis(1000),
            playback_end_restart: Duration::from_millis(1500),
            pipeline_failure_restart: Duration::from_millis(2000),
            start_retry: Duration::from_millis(1000),
            auto_start: Duration::from_millis(200),
            manual_play: Duration::from_millis(500),
            max_consecutive_restarts: None,
        }
    }
}

impl Timings {
    fn overlay(file: &file::TimingFileConfig) -> Self {
        let d = Self::default();
        let ms = |value: Option<u64>, fallback: Duration| value.map_or(fallback, Duration::from_millis);

        Self {
            no_speech_restart: ms(file.no_speech_restart_ms, d.no_speech_restart),
            error_restart: ms(file.error_restart_ms, d.error_restart),
            session_end_restart: ms(file.session_end_restart_ms, d.session_end_restart),
            playback_end_restart: ms(file.playback_end_restart_ms, d.playback_end_restart),
            pipeline_failure_restart: ms(
                file.pipeline_failure_restart_ms,
                d.pipeline_failure_restart,
            ),
            start_retry: ms(file.start_retry_ms, d.start_retry),
            auto_start: ms(file.auto_start_ms, d.auto_start),
            manual_play: ms(file.manual_play_ms, d.manual_play),
            max_consecutive_restarts: file.max_consecutive_restarts.filter(|n| *n > 0),
        }
    }
}

impl Config {
    /// Load configuration from environment and config file
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is unknown
    pub fn load(path: Option<&Path>, disable_voice: bool) -> Result<Self> {
        let fc = file::load_config_file(path);
        Self::from_sources(fc, |key| std::env::var(key).ok(), disable_voice)
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is unknown
    pub fn from_sources(
        fc: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
        disable_voice: bool,
    ) -> Result<Self> {
        let secret = |var: &str, file_value: Option<String>| {
            env(var)
                .or(file_value)
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from)
        };

        let api_keys = ApiKeys {
            gemini: secret("GEMINI_API_KEY", fc.api_keys.gemini),
            murf: secret("MURF_API_KEY", fc.api_keys.murf),
            openai: secret("OPENAI_API_KEY", fc.api_keys.openai),
            deepgram: secret("DEEPGRAM_API_KEY", fc.api_keys.deepgram),
        };

        let timeout_secs = fc.llm.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let llm = LlmConfig {
            model: env("BUDDY_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: fc
                .llm
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        };

        let tts_provider = env("BUDDY_TTS_PROVIDER")
            .or(fc.voice.tts_provider)
            .map_or(Ok(TtsProvider::Murf), |p| p.parse())?;
        let stt_provider = fc
            .voice
            .stt_provider
            .map_or(Ok(SttProvider::Whisper), |p| p.parse())?;

        let env_disabled = env("BUDDY_DISABLE_VOICE")
            .is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"));
        let voice_enabled = !disable_voice && !env_disabled && fc.voice.enabled.unwrap_or(true);
        if !voice_enabled {
            tracing::info!("voice disabled, running text-only");
        }

        let voice = VoiceConfig {
            enabled: voice_enabled,
            tts_provider,
            tts_model: fc.voice.tts_model.unwrap_or_else(|| "tts-1".to_string()),
            stt_provider,
            stt_model: env("BUDDY_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| match stt_provider {
                    SttProvider::Whisper => "whisper-1".to_string(),
                    SttProvider::Deepgram => "nova-2".to_string(),
                }),
            language: fc.voice.language.unwrap_or_else(|| "en-US".to_string()),
        };

        let default_voice = match tts_provider {
            TtsProvider::Murf => DEFAULT_VOICE,
            TtsProvider::OpenAI => OPENAI_DEFAULT_VOICE,
        };
        let tts_voice = env("BUDDY_TTS_VOICE")
            .or(fc.voice.tts_voice)
            .or(fc.persona.voice)
            .unwrap_or_else(|| default_voice.to_string());
        let persona = Persona::new(
            fc.persona.name,
            fc.persona.system_prompt,
            fc.persona.opener,
            Some(tts_voice),
        );

        Ok(Self {
            persona,
            llm,
            voice,
            api_keys,
            timings: Timings::overlay(&fc.timing),
            discard_stale_results: fc.conversation.discard_stale_results.unwrap_or(true),
        })
    }

    /// Gemini client for the configured model
    ///
    /// # Errors
    ///
    /// Returns error if no Gemini key is configured
    pub fn generator(&self) -> Result<GeminiClient> {
        let key = require(self.api_keys.gemini.as_ref(), "GEMINI_API_KEY")?;
        GeminiClient::with_base_url(key, self.llm.model.clone(), self.llm.base_url.clone())
    }

    /// Speech synthesis for the configured provider
    ///
    /// # Errors
    ///
    /// Returns error if the provider's key is missing
    pub fn synthesizer(&self) -> Result<TextToSpeech> {
        match self.voice.tts_provider {
            TtsProvider::Murf => {
                TextToSpeech::new_murf(require(self.api_keys.murf.as_ref(), "MURF_API_KEY")?)
            }
            TtsProvider::OpenAI => TextToSpeech::new_openai(
                require(self.api_keys.openai.as_ref(), "OPENAI_API_KEY")?,
                self.voice.tts_model.clone(),
            ),
        }
    }

    /// Transcription for the microphone recognizer
    ///
    /// # Errors
    ///
    /// Returns error if the provider's key is missing
    pub fn transcriber(&self) -> Result<SpeechToText> {
        let key = match self.voice.stt_provider {
            SttProvider::Whisper => require(self.api_keys.openai.as_ref(), "OPENAI_API_KEY")?,
            SttProvider::Deepgram => require(self.api_keys.deepgram.as_ref(), "DEEPGRAM_API_KEY")?,
        };
        SpeechToText::new(
            self.voice.stt_provider,
            key,
            self.voice.stt_model.clone(),
            self.voice.language.clone(),
        )
    }
}

fn require(key: Option<&SecretString>, var: &str) -> Result<SecretString> {
    key.map(|k| SecretString::from(k.expose_secret().to_owned()))
        .ok_or_else(|| Error::Config(format!("{var} not set")))
}
