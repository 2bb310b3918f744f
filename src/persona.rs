//! Persona: the fixed conversation role configuration
//!
//! A persona is the system prompt the model receives as the first turn, the
//! opener the assistant greets with, and the synthesis voice it speaks in.
//! Exactly one persona is active per process.

use serde::{Deserialize, Serialize};

/// Default display name
const DEFAULT_NAME: &str = "Stress-Buster Buddy";

/// Default system prompt
const DEFAULT_SYSTEM_PROMPT: &str = "You are a talkative, empathetic assistant bot. \
Your main job is to help people reduce stress by chatting with them, giving them calming \
advice, jokes, or friendly motivation. You talk in a relaxed, human tone, like a good friend \
who really listens. Keep your responses conversational and not too long (2-3 sentences max).";

/// Default assistant opener
const DEFAULT_OPENER: &str =
    "Hey there \u{1f60a} I'm your little stress-buster buddy! What's on your mind today?";

/// Default synthesis voice (Murf identifier)
pub const DEFAULT_VOICE: &str = "en-US-terrell";

/// Identity and voice of the assistant
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Display name
    pub name: String,

    /// Instructions sent as the leading SYSTEM turn
    pub system_prompt: String,

    /// First MODEL turn, shown and kept in history after every reset
    pub opener: String,

    /// Voice identifier passed to the synthesis service
    pub voice: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            opener: DEFAULT_OPENER.to_string(),
            voice: DEFAULT_VOICE.to_string(),
        }
    }
}

impl Persona {
    /// Build a persona, falling back to defaults for blank fields
    #[must_use]
    pub fn new(
        name: Option<String>,
        system_prompt: Option<String>,
        opener: Option<String>,
        voice: Option<String>,
    ) -> Self {
        let defaults = Self::default();
        let pick = |value: Option<String>, fallback: String| {
            value.filter(|v| !v.trim().is_empty()).unwrap_or(fallback)
        };

        Self {
            name: pick(name, defaults.name),
            system_prompt: pick(system_prompt, defaults.system_prompt),
            opener: pick(opener, defaults.opener),
            voice: pick(voice, defaults.voice),
        }
    }
}
