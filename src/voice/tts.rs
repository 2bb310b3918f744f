//! Text-to-speech (TTS) processing

use std::path::PathBuf;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;
use uuid::Uuid;

use crate::{Error, Result};

/// Murf speech generation endpoint
const MURF_URL: &str = "https://api.murf.ai/v1/speech/generate";

/// OpenAI speech endpoint
const OPENAI_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Turns reply text into a playable audio locator
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` in `voice`
    ///
    /// Returns a locator the playback facility can load (URL or file path).
    ///
    /// # Errors
    ///
    /// Returns error if the service call fails or yields no audio
    async fn synthesize(&self, text: &str, voice: &str) -> Result<String>;
}

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    /// Murf hosted voices; returns a URL to the generated file
    Murf,
    /// OpenAI speech; audio is kept in a temporary directory
    OpenAI,
}

impl std::str::FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "murf" => Ok(Self::Murf),
            "openai" => Ok(Self::OpenAI),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct MurfResponse {
    audio_file: Option<String>,
}

/// Synthesizes speech from text
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: TtsProvider,
    audio_dir: Option<TempDir>,
}

impl TextToSpeech {
    /// Create a new TTS instance using Murf
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_murf(api_key: SecretString) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("Murf API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: String::new(),
            provider: TtsProvider::Murf,
            audio_dir: None,
        })
    }

    /// Create a new TTS instance using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing or the audio directory cannot be created
    pub fn new_openai(api_key: SecretString, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        let audio_dir = tempfile::Builder::new().prefix("stress-buddy-").tempdir()?;
        tracing::debug!(dir = %audio_dir.path().display(), "reply audio directory");

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            provider: TtsProvider::OpenAI,
            audio_dir: Some(audio_dir),
        })
    }

    #[must_use]
    pub const fn provider(&self) -> TtsProvider {
        self.provider
    }

    /// Synthesize using Murf
    async fn synthesize_murf(&self, text: &str, voice: &str) -> Result<String> {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct MurfRequest<'a> {
            text: &'a str,
            voice_id: &'a str,
        }

        let response = self
            .client
            .post(MURF_URL)
            .header("api-key", self.api_key.expose_secret())
            .json(&MurfRequest {
                text,
                voice_id: voice,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Murf API error");
            return Err(Error::Tts(format!("Murf TTS error {status}: {body}")));
        }

        let result: MurfResponse = response.json().await?;
        result
            .audio_file
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::Tts("Murf returned no audio file".to_string()))
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(&self, text: &str, voice: &str) -> Result<String> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice,
        };

        let response = self
            .client
            .post(OPENAI_URL)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "OpenAI TTS error");
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(Error::Tts("OpenAI returned empty audio".to_string()));
        }

        let path = self.audio_path()?;
        tokio::fs::write(&path, &audio).await?;

        let locator = url::Url::from_file_path(&path)
            .map_err(|()| Error::Tts(format!("invalid audio path {}", path.display())))?;
        Ok(locator.to_string())
    }

    fn audio_path(&self) -> Result<PathBuf> {
        let dir = self
            .audio_dir
            .as_ref()
            .ok_or_else(|| Error::Tts("no audio directory".to_string()))?;
        Ok(dir.path().join(format!("{}.mp3", Uuid::new_v4())))
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<String> {
        tracing::debug!(provider = ?self.provider, voice, chars = text.len(), "synthesizing");
        let locator = match self.provider {
            TtsProvider::Murf => self.synthesize_murf(text, voice).await,
            TtsProvider::OpenAI => self.synthesize_openai(text, voice).await,
        }?;
        tracing::debug!(audio_ref = %locator, "speech ready");
        Ok(locator)
    }
}
