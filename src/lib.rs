//! Stress-Buster Buddy - hands-free conversational voice assistant
//!
//! This library provides the core of the assistant:
//! - Conversation transcript and session state
//! - Speech recognition and playback controllers over pluggable facilities
//! - The response pipeline (generation, then synthesis)
//! - A coordinator that runs the listen, answer, speak loop
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Console front-end                    │
//! │   stdin commands  │  status line  │  notifications  │
//! └────────────────────┬────────────────────────────────┘
//!                      │ Command / Snapshot
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Coordinator                        │
//! │   Recognition  │  Pipeline  │  Playback  │ Timers   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Facilities                          │
//! │   Mic + STT  │  Gemini  │  Murf/OpenAI TTS │ Speaker │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod llm;
pub mod notify;
pub mod persona;
pub mod pipeline;
pub mod session;
pub mod setup;
pub mod transcript;
pub mod voice;

pub use config::{Config, Timings};
pub use coordinator::{Command, Coordinator, CoordinatorHandle, Facilities};
pub use error::{Error, Result};
pub use llm::{Generator, GeminiClient};
pub use notify::{Notification, NotificationKind, Notifier};
pub use persona::Persona;
pub use pipeline::{PipelineError, ResponsePipeline, TurnReply};
pub use session::{Phase, Session, SessionState, Snapshot};
pub use transcript::{DisplayMessage, Transcript};
