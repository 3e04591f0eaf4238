use std::path::PathBuf;
use thiserror::Error;

/// Classified engine faults.
///
/// Every fault that can reach the session controller is one of these
/// variants; the controller decides retry/surface behavior from
/// [`EngineError::is_retryable`] and [`EngineError::is_fatal`] rather than
/// inspecting sources.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No input device is accessible, or the audio stream could not be built.
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A capture was requested while another capture holds the device.
    #[error("a recording session is already active")]
    SessionAlreadyActive,

    /// Transport-level failure talking to a remote transcription service.
    #[error("network error: {0}")]
    Network(String),

    /// The remote service throttled the request.
    #[error("rate limited by transcription service: {0}")]
    RateLimited(String),

    /// The remote service rejected the configured credential.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The configured local inference executable could not be found.
    #[error("inference executable not found: {0}")]
    ExecutableMissing(PathBuf),

    /// A model artifact download failed before verification.
    #[error("model download failed for '{model}': {reason}")]
    ModelDownload {
        /// Catalog name of the model.
        model: String,
        /// Human-readable cause.
        reason: String,
    },

    /// A downloaded artifact failed its checksum or size verification.
    #[error("model integrity check failed for '{model}': expected {expected}, got {actual}")]
    ModelIntegrity {
        /// Catalog name of the model.
        model: String,
        /// Expected checksum or size.
        expected: String,
        /// Observed checksum or size.
        actual: String,
    },

    /// A local provider was invoked before its model artifact became ready.
    #[error("model '{0}' is not ready")]
    ModelNotReady(String),

    /// Inference itself failed (local engine error, subprocess failure,
    /// or an unusable remote response).
    #[error("inference failed: {0}")]
    Inference(String),

    /// Provider selection parameters failed validation.
    #[error("invalid provider configuration: {0}")]
    InvalidProviderConfig(String),

    /// The external delivery sink reported failure. Reported, never retried.
    #[error("text delivery failed: {0}")]
    Delivery(String),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether the controller may retry the failed operation with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited(_) | Self::ModelDownload { .. }
        )
    }

    /// Whether the fault must surface immediately, without retry.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Auth(_)
                | Self::ExecutableMissing(_)
                | Self::ModelIntegrity { .. }
                | Self::InvalidProviderConfig(_)
        )
    }

    /// Short, classified cause for user-facing notifications.
    ///
    /// Never includes backtraces or nested source chains.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::DeviceUnavailable(_) => "microphone unavailable".to_owned(),
            Self::SessionAlreadyActive => "a recording is already in progress".to_owned(),
            Self::Network(_) => "network error reaching the transcription service".to_owned(),
            Self::RateLimited(_) => "transcription service is rate limiting".to_owned(),
            Self::Auth(_) => "transcription service rejected the credential".to_owned(),
            Self::ExecutableMissing(path) => {
                format!("inference executable missing: {}", path.display())
            }
            Self::ModelDownload { model, .. } => format!("could not download model '{model}'"),
            Self::ModelIntegrity { model, .. } => {
                format!("model '{model}' is corrupt; re-download required")
            }
            Self::ModelNotReady(model) => format!("model '{model}' is still downloading"),
            Self::Inference(_) => "transcription failed".to_owned(),
            Self::InvalidProviderConfig(reason) => format!("provider misconfigured: {reason}"),
            Self::Delivery(_) => "could not deliver text to the active application".to_owned(),
            Self::Cancelled => "cancelled".to_owned(),
        }
    }
}
