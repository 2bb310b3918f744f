//! Text generation service
//!
//! The generation service accepts only two roles, so the internal SYSTEM
//! turn is sent in the `user` slot ahead of the opener.

pub mod gemini;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::transcript::{ConversationTurn, Role};

pub use gemini::GeminiClient;

/// Role as understood by the generation service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    User,
    Model,
}

impl From<Role> for ServiceRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System | Role::User => Self::User,
            Role::Model => Self::Model,
        }
    }
}

/// One entry of the history payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMessage {
    pub role: ServiceRole,
    pub text: String,
}

/// Translate the full turn sequence into the service payload
#[must_use]
pub fn service_history(turns: &[ConversationTurn]) -> Vec<ServiceMessage> {
    turns
        .iter()
        .map(|turn| ServiceMessage {
            role: turn.role().into(),
            text: turn.text().to_string(),
        })
        .collect()
}

/// Produces a reply for a conversation history
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate the next MODEL reply
    ///
    /// # Errors
    ///
    /// Returns error if the service call fails or yields no text
    async fn generate(&self, history: &[ServiceMessage]) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Persona;
    use crate::transcript::Transcript;

    #[test]
    fn test_system_folded_into_user() {
        let mut transcript = Transcript::new(&Persona::default());
        transcript.push_user("hello");

        let history = service_history(transcript.turns());
        let roles: Vec<ServiceRole> = history.iter().map(|m| m.role).collect();

        assert_eq!(
            roles,
            [ServiceRole::User, ServiceRole::Model, ServiceRole::User]
        );
        assert_eq!(history[0].text, Persona::default().system_prompt);
        assert_eq!(history[2].text, "hello");
    }
}
