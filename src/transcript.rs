//! Transcript store
//!
//! Two parallel logs: the role-tagged turns sent to the generation service on
//! every call, and the display messages shown to the user. Both always begin
//! with the persona's opener pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::Persona;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Persona instructions
    System,
    /// The human
    User,
    /// The assistant
    Model,
}

/// One role-tagged utterance in the conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    role: Role,
    text: String,
}

impl ConversationTurn {
    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// UI-facing message, optionally carrying synthesized audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMessage {
    /// Unique message ID
    pub id: String,
    /// Message text
    pub text: String,
    /// Whether the user authored it
    pub is_user: bool,
    audio_ref: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl DisplayMessage {
    fn new(text: impl Into<String>, is_user: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            is_user,
            audio_ref: None,
            created_at: Utc::now(),
        }
    }

    /// Locator of the synthesized audio, once attached
    #[must_use]
    pub fn audio_ref(&self) -> Option<&str> {
        self.audio_ref.as_deref()
    }
}

/// Failure to attach audio to a display message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptError {
    /// No message with this ID exists (e.g. removed by a reset)
    #[error("no display message with id {0}")]
    UnknownMessage(String),

    /// Audio may only be attached once
    #[error("display message {0} already has audio attached")]
    AudioAlreadyAttached(String),
}

/// Ordered conversation log plus its display counterpart
#[derive(Debug, Clone)]
pub struct Transcript {
    system_prompt: String,
    opener: String,
    turns: Vec<ConversationTurn>,
    messages: Vec<DisplayMessage>,
}

impl Transcript {
    /// Create a transcript seeded with the persona's opener pair
    #[must_use]
    pub fn new(persona: &Persona) -> Self {
        let mut transcript = Self {
            system_prompt: persona.system_prompt.clone(),
            opener: persona.opener.clone(),
            turns: Vec::new(),
            messages: Vec::new(),
        };
        transcript.reset();
        transcript
    }

    /// Discard all turns and messages, reinstating the opener pair
    pub fn reset(&mut self) {
        self.turns = vec![
            ConversationTurn::new(Role::System, self.system_prompt.clone()),
            ConversationTurn::new(Role::Model, self.opener.clone()),
        ];
        self.messages = vec![DisplayMessage::new(self.opener.clone(), false)];
    }

    /// Append a USER turn and its display message
    pub fn push_user(&mut self, text: &str) -> DisplayMessage {
        self.push(Role::User, text)
    }

    /// Append a MODEL turn and its display message (no audio yet)
    pub fn push_model(&mut self, text: &str) -> DisplayMessage {
        self.push(Role::Model, text)
    }

    fn push(&mut self, role: Role, text: &str) -> DisplayMessage {
        self.turns.push(ConversationTurn::new(role, text));
        let message = DisplayMessage::new(text, role == Role::User);
        self.messages.push(message.clone());
        message
    }

    /// Attach synthesized audio to a display message, looked up by ID
    ///
    /// # Errors
    ///
    /// Returns error if the message is unknown or already has audio
    pub fn attach_audio(
        &mut self,
        message_id: &str,
        audio_ref: &str,
    ) -> Result<DisplayMessage, TranscriptError> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| TranscriptError::UnknownMessage(message_id.to_string()))?;

        if message.audio_ref.is_some() {
            return Err(TranscriptError::AudioAlreadyAttached(message_id.to_string()));
        }

        message.audio_ref = Some(audio_ref.to_string());
        Ok(message.clone())
    }

    /// All turns, opener first
    #[must_use]
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// All display messages, opener first
    #[must_use]
    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    /// Look up a display message
    #[must_use]
    pub fn message(&self, id: &str) -> Option<&DisplayMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Number of turns exchanged after the opener pair
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        self.turns.len().saturating_sub(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> Transcript {
        Transcript::new(&Persona::default())
    }

    #[test]
    fn test_opener_pair() {
        let t = transcript();
        let persona = Persona::default();

        assert_eq!(t.turns().len(), 2);
        assert_eq!(t.turns()[0].role(), Role::System);
        assert_eq!(t.turns()[0].text(), persona.system_prompt);
        assert_eq!(t.turns()[1].role(), Role::Model);
        assert_eq!(t.turns()[1].text(), persona.opener);

        assert_eq!(t.messages().len(), 1);
        assert!(!t.messages()[0].is_user);
        assert_eq!(t.messages()[0].text, persona.opener);
        assert_eq!(t.exchange_count(), 0);
    }

    #[test]
    fn test_reset_restores_opener() {
        let mut t = transcript();
        let opener_id = t.messages()[0].id.clone();
        t.push_user("hello");
        t.push_model("hi");
        assert_eq!(t.exchange_count(), 2);

        t.reset();
        assert_eq!(t.turns().len(), 2);
        assert_eq!(t.messages().len(), 1);
        assert_ne!(t.messages()[0].id, opener_id);
    }

    #[test]
    fn test_push_marks_authorship() {
        let mut t = transcript();
        let user = t.push_user("I'm stressed");
        let model = t.push_model("Let's breathe together.");

        assert!(user.is_user);
        assert!(!model.is_user);
        assert_eq!(t.turns()[2].role(), Role::User);
        assert_eq!(t.turns()[3].role(), Role::Model);
        assert_ne!(user.id, model.id);
    }

    #[test]
    fn test_attach_audio_once() {
        let mut t = transcript();
        let reply = t.push_model("Sure thing");

        let updated = t.attach_audio(&reply.id, "blob://1").unwrap();
        assert_eq!(updated.audio_ref(), Some("blob://1"));
        assert_eq!(t.message(&reply.id).unwrap().audio_ref(), Some("blob://1"));

        let err = t.attach_audio(&reply.id, "blob://2").unwrap_err();
        assert_eq!(err, TranscriptError::AudioAlreadyAttached(reply.id.clone()));
        assert_eq!(t.message(&reply.id).unwrap().audio_ref(), Some("blob://1"));
    }

    #[test]
    fn test_attach_audio_unknown_after_reset() {
        let mut t = transcript();
        let reply = t.push_model("Sure thing");
        t.reset();

        assert!(matches!(
            t.attach_audio(&reply.id, "blob://1"),
            Err(TranscriptError::UnknownMessage(_))
        ));
    }
}
