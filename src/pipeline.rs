//! Response pipeline
//!
//! One conversational turn: record the user's words, ask the generation
//! service for a reply over the whole history, record the reply, synthesize
//! it and attach the audio. A turn is split in two so the synchronous part
//! ([`ResponsePipeline::begin`]) can run under the coordinator's state lock
//! while the service calls ([`ResponsePipeline::complete`]) run in a task.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::llm::{Generator, ServiceMessage, service_history};
use crate::session::{Phase, Session, SessionState};
use crate::transcript::DisplayMessage;
use crate::voice::Synthesizer;

/// Which service call a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Generation,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generation => f.write_str("generation"),
            Self::Synthesis => f.write_str("synthesis"),
        }
    }
}

/// Why a turn did not produce a reply
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Input was blank after trimming
    #[error("message is empty")]
    EmptyInput,

    /// Another operation holds the session
    #[error("cannot start a turn while {0:?}")]
    Busy(Phase),

    /// The generation service failed
    #[error("generation failed: {0}")]
    Generation(#[source] crate::Error),

    /// The synthesis service failed
    #[error("synthesis failed: {0}")]
    Synthesis(#[source] crate::Error),

    /// A service call exceeded the configured timeout
    #[error("{stage} timed out after {after:?}")]
    TimedOut { stage: Stage, after: Duration },

    /// The conversation was reset while the turn was in flight
    #[error("conversation was reset during the turn")]
    Stale,
}

impl PipelineError {
    /// Failures the user should be told about
    #[must_use]
    pub const fn is_service_failure(&self) -> bool {
        matches!(
            self,
            Self::Generation(_) | Self::Synthesis(_) | Self::TimedOut { .. }
        )
    }
}

/// A turn whose user message is recorded and whose reply is pending
#[derive(Debug, Clone)]
pub struct PendingTurn {
    /// Display message of the user's words
    pub user_message: DisplayMessage,
    history: Vec<ServiceMessage>,
    epoch: u64,
}

/// A finished turn
#[derive(Debug, Clone)]
pub struct TurnReply {
    /// The MODEL display message, with audio attached when still present
    pub message: DisplayMessage,
    /// Locator of the synthesized reply
    pub audio_ref: String,
}

/// Runs conversational turns against the generation and synthesis services
#[derive(Clone)]
pub struct ResponsePipeline {
    generator: Arc<dyn Generator>,
    synthesizer: Arc<dyn Synthesizer>,
    voice: String,
    timeout: Option<Duration>,
    discard_stale: bool,
}

impl ResponsePipeline {
    #[must_use]
    pub fn new(
        generator: Arc<dyn Generator>,
        synthesizer: Arc<dyn Synthesizer>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            generator,
            synthesizer,
            voice: voice.into(),
            timeout: None,
            discard_stale: true,
        }
    }

    /// Bound each service call
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether results arriving after a reset are dropped
    #[must_use]
    pub const fn discard_stale_results(mut self, discard: bool) -> Self {
        self.discard_stale = discard;
        self
    }

    /// Record the user's words and enter the generating phase
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyInput`] for blank input (state is left
    /// untouched) and [`PipelineError::Busy`] when not idle.
    pub fn begin(&self, state: &mut SessionState, input: &str) -> Result<PendingTurn, PipelineError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(PipelineError::EmptyInput);
        }

        state
            .transition(Phase::Generating)
            .map_err(|e| PipelineError::Busy(e.from))?;

        let user_message = state.transcript_mut().push_user(text);
        let history = service_history(state.transcript().turns());
        tracing::debug!(turns = history.len(), "turn started");

        Ok(PendingTurn {
            user_message,
            history,
            epoch: state.epoch(),
        })
    }

    /// Generate, record and synthesize the reply for a started turn
    ///
    /// Always leaves the session idle.
    ///
    /// # Errors
    ///
    /// Returns error if a service call fails or times out, or if the turn
    /// went stale and stale results are discarded.
    pub async fn complete(&self, session: &Session, turn: PendingTurn) -> Result<TurnReply, PipelineError> {
        let generated = self
            .bounded(Stage::Generation, self.generator.generate(&turn.history))
            .await;
        let reply_text = match generated {
            Ok(text) => text,
            Err(e) => {
                session.update(|s| s.release(Phase::Generating));
                return Err(e);
            }
        };

        let message = session.update(|s| {
            if self.is_stale(s, &turn) {
                s.release(Phase::Generating);
                return Err(PipelineError::Stale);
            }
            s.transition(Phase::Synthesizing)
                .map_err(|e| PipelineError::Busy(e.from))?;
            Ok(s.transcript_mut().push_model(&reply_text))
        });
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "dropping reply");
                return Err(e);
            }
        };

        let synthesized = self
            .bounded(
                Stage::Synthesis,
                self.synthesizer.synthesize(&reply_text, &self.voice),
            )
            .await;

        session.update(|s| {
            s.release(Phase::Synthesizing);
            let audio_ref = synthesized?;

            if self.is_stale(s, &turn) {
                tracing::debug!("dropping reply audio after reset");
                return Err(PipelineError::Stale);
            }

            let message = match s.transcript_mut().attach_audio(&message.id, &audio_ref) {
                Ok(updated) => updated,
                Err(e) => {
                    tracing::debug!(error = %e, "reply no longer in transcript");
                    message
                }
            };
            s.set_current_audio_ref(&audio_ref);
            tracing::info!(message_id = %message.id, "reply ready");
            Ok(TurnReply { message, audio_ref })
        })
    }

    /// [`begin`](Self::begin) and [`complete`](Self::complete) in one call
    ///
    /// # Errors
    ///
    /// See both halves.
    pub async fn run(&self, session: &Session, input: &str) -> Result<TurnReply, PipelineError> {
        let turn = session.update(|s| self.begin(s, input))?;
        self.complete(session, turn).await
    }

    fn is_stale(&self, state: &SessionState, turn: &PendingTurn) -> bool {
        self.discard_stale && state.epoch() != turn.epoch
    }

    async fn bounded<T>(
        &self,
        stage: Stage,
        call: impl Future<Output = crate::Result<T>>,
    ) -> Result<T, PipelineError> {
        let result = match self.timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| PipelineError::TimedOut { stage, after })?,
            None => call.await,
        };

        result.map_err(|e| {
            tracing::warn!(%stage, error = %e, "service call failed");
            match stage {
                Stage::Generation => PipelineError::Generation(e),
                Stage::Synthesis => PipelineError::Synthesis(e),
            }
        })
    }
}

impl fmt::Debug for ResponsePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponsePipeline")
            .field("voice", &self.voice)
            .field("timeout", &self.timeout)
            .field("discard_stale", &self.discard_stale)
            .finish_non_exhaustive()
    }
}
