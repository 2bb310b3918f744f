//! Interactive first-run setup wizard (`buddy setup`)

use std::path::{Path, PathBuf};

use dialoguer::{Confirm, Input, Select};

use crate::config::file::{
    ConfigFile, LlmFileConfig, VoiceFileConfig, config_file_path, load_config_file,
    save_config_file,
};
use crate::llm::gemini::DEFAULT_MODEL;
use crate::persona::DEFAULT_VOICE;

/// Run the interactive setup wizard
///
/// Writes to `path`, or the standard config location.
///
/// # Errors
///
/// Returns error if user input fails or config cannot be written
pub fn run_setup(path: Option<&Path>) -> anyhow::Result<()> {
    println!("Stress-Buster Buddy Setup\n");

    let config_path = path
        .map(Path::to_path_buf)
        .or_else(config_file_path)
        .unwrap_or_else(|| PathBuf::from("stress-buddy.toml"));
    let existing = load_config_file(Some(&config_path));

    if config_path.exists() {
        println!("Existing config found at {}\n", config_path.display());
    }

    let mut config = ConfigFile {
        persona: existing.persona,
        timing: existing.timing,
        conversation: existing.conversation,
        api_keys: existing.api_keys,
        ..ConfigFile::default()
    };

    // 1. Generation service
    config.api_keys.gemini = prompt_key(
        "Gemini",
        "GEMINI_API_KEY",
        config.api_keys.gemini.take(),
    )?;

    let model: String = Input::new()
        .with_prompt("Gemini model")
        .default(existing.llm.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()))
        .interact_text()?;
    config.llm = LlmFileConfig {
        model: Some(model),
        ..existing.llm
    };

    // 2. Voice (optional)
    let enable_voice = Confirm::new()
        .with_prompt("Enable voice (microphone and speaker)?")
        .default(existing.voice.enabled.unwrap_or(true))
        .interact()?;

    // Replies are synthesized even in text-only mode
    let tts_providers = ["Murf", "OpenAI"];
    let default_tts = existing
        .voice
        .tts_provider
        .as_deref()
        .and_then(|p| tts_providers.iter().position(|l| l.eq_ignore_ascii_case(p)))
        .unwrap_or(0);
    let tts_idx = Select::new()
        .with_prompt("Select a speech synthesis provider")
        .items(&tts_providers)
        .default(default_tts)
        .interact()?;

    let tts_voice = if tts_idx == 0 {
        config.api_keys.murf = prompt_key("Murf", "MURF_API_KEY", config.api_keys.murf.take())?;
        existing
            .voice
            .tts_voice
            .clone()
            .unwrap_or_else(|| DEFAULT_VOICE.to_string())
    } else {
        config.api_keys.openai =
            prompt_key("OpenAI", "OPENAI_API_KEY", config.api_keys.openai.take())?;
        existing
            .voice
            .tts_voice
            .clone()
            .filter(|v| v != DEFAULT_VOICE)
            .unwrap_or_else(|| "alloy".to_string())
    };
    let tts_voice: String = Input::new()
        .with_prompt("Voice")
        .default(tts_voice)
        .interact_text()?;

    let mut voice = VoiceFileConfig {
        enabled: Some(enable_voice),
        tts_provider: Some(tts_providers[tts_idx].to_lowercase()),
        tts_voice: Some(tts_voice),
        tts_model: existing.voice.tts_model,
        language: existing.voice.language,
        ..VoiceFileConfig::default()
    };

    if enable_voice {
        let stt_providers = ["Whisper", "Deepgram"];
        let default_stt = existing
            .voice
            .stt_provider
            .as_deref()
            .and_then(|p| stt_providers.iter().position(|l| l.eq_ignore_ascii_case(p)))
            .unwrap_or(0);
        let stt_idx = Select::new()
            .with_prompt("Select a speech recognition provider")
            .items(&stt_providers)
            .default(default_stt)
            .interact()?;

        if stt_idx == 0 {
            if config.api_keys.openai.is_none() {
                config.api_keys.openai =
                    prompt_key("OpenAI", "OPENAI_API_KEY", None)?;
            }
        } else {
            config.api_keys.deepgram = prompt_key(
                "Deepgram",
                "DEEPGRAM_API_KEY",
                config.api_keys.deepgram.take(),
            )?;
        }

        voice.stt_provider = Some(stt_providers[stt_idx].to_lowercase());
        voice.stt_model = existing.voice.stt_model;
    }
    config.voice = voice;

    // 3. Write
    save_config_file(&config, &config_path)?;
    println!("\nConfig written to {}", config_path.display());
    println!("\nSetup complete! Run `buddy --auto` to start talking.");

    Ok(())
}

/// Ask for an API key, keeping the current one on blank input
fn prompt_key(
    label: &str,
    env_hint: &str,
    existing: Option<String>,
) -> anyhow::Result<Option<String>> {
    let prompt = match existing.as_deref() {
        Some(key) => format!("{label} API key (current: {}, leave blank to keep)", mask(key)),
        None => format!("{label} API key ({env_hint})"),
    };

    let input: String = Input::new()
        .with_prompt(&prompt)
        .allow_empty(true)
        .interact_text()?;

    let input = input.trim();
    Ok(if input.is_empty() {
        existing
    } else {
        Some(input.to_string())
    })
}

/// Show only the ends of a key
fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask() {
        assert_eq!(mask("abcdefghijklmnop"), "abcd...mnop");
        assert_eq!(mask("short"), "****");
    }
}
