//! TOML configuration file loading
//!
//! Supports `<config dir>/stress-buddy/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Assistant persona overrides
    #[serde(default)]
    pub persona: PersonaFileConfig,

    /// Generation service configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Voice/audio configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Restart and playback delays
    #[serde(default)]
    pub timing: TimingFileConfig,

    /// Conversation behaviour
    #[serde(default)]
    pub conversation: ConversationFileConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PersonaFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opener: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Generation service configuration
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LlmFileConfig {
    /// Model identifier (e.g. "gemini-2.0-flash-exp")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// API base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Per-call timeout in seconds; 0 disables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct VoiceFileConfig {
    /// Enable microphone and speaker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// "murf" or "openai"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_provider: Option<String>,

    /// TTS voice identifier (e.g. "en-US-terrell")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_voice: Option<String>,

    /// TTS model (OpenAI only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_model: Option<String>,

    /// "whisper" or "deepgram"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt_model: Option<String>,

    /// Recognition locale
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ApiKeysFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gemini: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub murf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deepgram: Option<String>,
}

/// Delays in milliseconds
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TimingFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_speech_restart_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_restart_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_end_restart_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_end_restart_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_failure_restart_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_retry_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_start_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_play_ms: Option<u64>,

    /// Give up auto mode after this many restarts without an utterance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_consecutive_restarts: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConversationFileConfig {
    /// Drop replies that resolve after a reset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discard_stale_results: Option<bool>,
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed
pub fn parse(content: &str) -> Result<ConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from `path`, or the standard path
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> ConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return ConfigFile::default();
    };

    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

/// Write a config file, creating parent directories
///
/// # Errors
///
/// Returns error if serialization or writing fails
pub fn save_config_file(config: &ConfigFile, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("cannot serialize config: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Return the config file path: `~/.config/stress-buddy/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("stress-buddy").join("config.toml"))
}
