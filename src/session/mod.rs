/// The capture-to-delivery state machine
pub mod controller;

pub use controller::{ProviderFactory, SessionController};

use std::time::{Duration, Instant};

use crate::audio::capture::TARGET_SAMPLE_RATE;
use crate::config::RetrySettings;
use crate::error::EngineError;
use crate::provider::TranscriptionResult;

/// Lifecycle states of one session.
///
/// `Error` absorbs faults from any non-idle state and always falls back to
/// `Idle`; the engine never parks in a non-idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session active.
    Idle,
    /// Microphone open, accumulating samples.
    Recording,
    /// Capture closing, raw buffer being collected.
    Stopping,
    /// Preprocessing and provider call in flight.
    Transcribing,
    /// Result being handed to the delivery sink.
    Delivering,
    /// Fault reported; transitions straight back to `Idle`.
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Stopping => "stopping",
            Self::Transcribing => "transcribing",
            Self::Delivering => "delivering",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// One capture-to-delivery cycle, owned exclusively by the controller.
#[derive(Debug)]
pub struct RecordingSession {
    /// Opaque session token.
    pub id: u64,
    /// Current lifecycle state; the controller is the only writer.
    pub state: SessionState,
    /// When the capture opened.
    pub started_at: Instant,
    /// Hard cap on the capture.
    pub max_duration: Duration,
    /// Fixed downstream sample rate.
    pub sample_rate: u32,
    /// Result once transcription succeeded.
    pub result: Option<TranscriptionResult>,
    /// Classified cause once the session failed.
    pub error: Option<String>,
}

impl RecordingSession {
    /// Opens a new session record in `Idle`.
    #[must_use]
    pub fn new(id: u64, max_duration: Duration) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            started_at: Instant::now(),
            max_duration,
            sample_rate: TARGET_SAMPLE_RATE,
            result: None,
            error: None,
        }
    }
}

/// User-visible feedback kinds; one per state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    /// Capture opened.
    Started,
    /// Capture closed on user request.
    Stopped,
    /// Capture force-stopped at the duration cap.
    Truncated,
    /// Transcription began.
    Transcribing,
    /// Transcription succeeded; message carries a text preview.
    Completed,
    /// The session failed; message carries the classified cause.
    Failed,
    /// A start request was rejected because a session is busy.
    Busy,
    /// Delivery to the foreground application failed (reported once, not
    /// retried).
    DeliveryFailed,
}

/// One notification payload.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// What happened.
    pub kind: SessionEventKind,
    /// Human-readable description, no stack traces.
    pub message: String,
}

impl SessionEvent {
    /// Builds an event.
    #[must_use]
    pub fn new(kind: SessionEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// External consumer of finished text (foreground-app insertion lives
/// outside the engine).
#[cfg_attr(test, mockall::automock)]
pub trait DeliverySink: Send + Sync {
    /// Hands the final text over.
    ///
    /// # Errors
    /// A failure is reported through the notification sink, never retried.
    fn deliver(&self, text: &str) -> Result<(), EngineError>;
}

/// External consumer of session feedback (desktop notifications live outside
/// the engine). Fire-and-forget.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    /// Receives one event per state transition.
    fn notify(&self, event: &SessionEvent);
}

/// Bounded retry with exponential backoff for retryable provider faults.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt after that.
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before the attempt following `completed_attempts`.
    #[must_use]
    pub fn backoff_for(&self, completed_attempts: u32) -> Duration {
        let exponent = completed_attempts.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1_u32 << exponent)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
        }
    }
}

/// Shortens transcribed text for a notification preview.
#[must_use]
pub fn text_preview(text: &str) -> String {
    const PREVIEW_CHARS: usize = 60;
    let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}
