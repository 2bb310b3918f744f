//! User-facing notifications
//!
//! Every failure that the user should hear about is turned into exactly one
//! [`Notification`]; raw errors never reach the display layer.

use serde::Serialize;
use tokio::sync::mpsc;

/// Styling of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Error,
}

/// Which situation a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    MicrophoneDenied,
    RecognitionUnsupported,
    ResponseFailed,
    EmptyMessage,
    AutoModeEnabled,
    AutoModeDisabled,
    ConversationReset,
    ListeningPaused,
    TypingInAutoMode,
}

/// Transient toast shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: &'static str,
    pub description: &'static str,
    pub severity: Severity,
}

impl Notification {
    /// Build the catalog entry for a kind
    #[must_use]
    pub const fn of(kind: NotificationKind) -> Self {
        let (title, description, severity) = match kind {
            NotificationKind::MicrophoneDenied => (
                "Microphone Access Denied",
                "Please allow microphone access to use voice features.",
                Severity::Error,
            ),
            NotificationKind::RecognitionUnsupported => (
                "Speech Recognition Not Supported",
                "No speech recognition is available on this system.",
                Severity::Error,
            ),
            NotificationKind::ResponseFailed => (
                "Error",
                "Failed to generate response. Please try again.",
                Severity::Error,
            ),
            NotificationKind::EmptyMessage => (
                "Empty message",
                "Please enter a message to send.",
                Severity::Error,
            ),
            NotificationKind::AutoModeEnabled => (
                "Auto Mode Enabled",
                "Speak to start a conversation. The AI will respond automatically.",
                Severity::Info,
            ),
            NotificationKind::AutoModeDisabled => (
                "Auto Mode Disabled",
                "Switched back to manual mode.",
                Severity::Info,
            ),
            NotificationKind::ConversationReset => (
                "Conversation Reset",
                "Started a fresh conversation with your stress-buster buddy!",
                Severity::Info,
            ),
            NotificationKind::ListeningPaused => (
                "Listening Paused",
                "I couldn't hear anything for a while. Start auto mode again when you're ready.",
                Severity::Info,
            ),
            NotificationKind::TypingInAutoMode => (
                "Auto Mode Is On",
                "Just speak, or turn auto mode off with /auto to type.",
                Severity::Info,
            ),
        };

        Self {
            kind,
            title,
            description,
            severity,
        }
    }
}

/// Display-layer sink for notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Prints notifications to stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notification: Notification) {
        tracing::debug!(kind = ?notification.kind, "notification");
        let marker = match notification.severity {
            Severity::Info => "*",
            Severity::Error => "!",
        };
        eprintln!(
            "[{marker}] {}: {}",
            notification.title, notification.description
        );
    }
}

/// Forwards notifications into a channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!("notification receiver dropped");
        }
    }
}
