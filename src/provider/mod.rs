//! Transcription backends.
//!
//! A closed family of three interchangeable providers behind one trait,
//! built by [`build`] from a validated [`ProviderConfig`]. The session
//! controller holds a provider only through the trait and never learns which
//! variant it drives.

/// External inference executable
pub mod compiled;
/// In-process whisper engine
pub mod local;
/// Remote transcription API
pub mod remote;
/// Active-provider context
pub mod selector;

pub use selector::ProviderSelector;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::cancel::CancelToken;
use crate::config::ProviderSettings;
use crate::error::EngineError;
use crate::model::ModelManager;

/// The closed set of backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Hosted speech API over HTTP.
    RemoteApi,
    /// Local high-performance inference executable.
    CompiledLocal,
    /// In-process model inference.
    InProcessLocal,
}

impl FromStr for ProviderKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote_api" => Ok(Self::RemoteApi),
            "compiled_local" => Ok(Self::CompiledLocal),
            "inprocess_local" => Ok(Self::InProcessLocal),
            other => Err(EngineError::InvalidProviderConfig(format!(
                "unknown provider kind '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RemoteApi => "remote_api",
            Self::CompiledLocal => "compiled_local",
            Self::InProcessLocal => "inprocess_local",
        };
        f.write_str(name)
    }
}

/// Which backend a session uses and with what parameters.
///
/// Captured (cloned) by a session at start; read-only from then on, so a
/// selector swap never affects a session already in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Backend variant.
    pub kind: ProviderKind,
    /// Model name: catalog entry for local kinds, service model id for the
    /// remote kind.
    pub model_name: String,
    /// Language hint forwarded to the backend.
    pub language_hint: String,
    /// Environment variable naming the remote credential.
    pub credential_ref: String,
    /// Remote endpoint URL.
    pub endpoint: String,
    /// Local inference executable (name on PATH or absolute path).
    pub executable: String,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Inference threads for local kinds.
    pub threads: usize,
    /// Beam width for local kinds (1 = greedy).
    pub beam_size: usize,
}

impl ProviderConfig {
    /// Builds a provider config from the `[provider]` settings table.
    ///
    /// # Errors
    /// `InvalidProviderConfig` when the kind string is unknown.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, EngineError> {
        Ok(Self {
            kind: settings.kind.parse()?,
            model_name: settings.model.clone(),
            language_hint: settings.language.clone(),
            credential_ref: settings.credential.clone(),
            endpoint: settings.endpoint.clone(),
            executable: settings.executable.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            threads: settings.threads,
            beam_size: settings.beam_size,
        })
    }
}

/// Output of one provider call.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    /// Transcribed text; empty for silence, never absent on success.
    pub text: String,
    /// Which variant produced it.
    pub provider_kind: ProviderKind,
    /// Wall-clock inference latency.
    pub latency: Duration,
    /// When the result was produced.
    pub produced_at: SystemTime,
}

impl TranscriptionResult {
    /// Stamps a result with the current time.
    #[must_use]
    pub fn new(text: String, provider_kind: ProviderKind, latency: Duration) -> Self {
        Self {
            text,
            provider_kind,
            latency,
            produced_at: SystemTime::now(),
        }
    }
}

/// One transcription backend.
///
/// Implementations are `Send + Sync`: calls run on blocking worker threads
/// while the controller keeps servicing its event channel. Internal shared
/// state must be serialized by the implementation.
#[cfg_attr(test, mockall::automock)]
pub trait TranscriptionProvider: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> ProviderKind;

    /// Converts a preprocessed 16 kHz mono buffer into text.
    ///
    /// # Errors
    /// Classified per variant; see the module docs of each implementation.
    fn transcribe(
        &self,
        samples: &[f32],
        cancel: &CancelToken,
    ) -> Result<TranscriptionResult, EngineError>;
}

/// Builds the provider variant named by `config`.
///
/// # Errors
/// Construction-time validation failures surface here: unresolvable
/// executables (`ExecutableMissing`), missing credentials or unknown models
/// (`InvalidProviderConfig`).
pub fn build(
    config: &ProviderConfig,
    models: &Arc<ModelManager>,
) -> Result<Arc<dyn TranscriptionProvider>, EngineError> {
    match config.kind {
        ProviderKind::RemoteApi => Ok(Arc::new(remote::RemoteApiProvider::new(config)?)),
        ProviderKind::CompiledLocal => Ok(Arc::new(compiled::CompiledLocalProvider::new(
            config,
            Arc::clone(models),
        )?)),
        ProviderKind::InProcessLocal => Ok(Arc::new(local::InProcessLocalProvider::new(
            config,
            Arc::clone(models),
        )?)),
    }
}

/// Resolves an executable name or path, searching `PATH` for bare names.
#[must_use]
pub(crate) fn resolve_executable(executable: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(executable);
    if direct.components().count() > 1 {
        return direct.is_file().then_some(direct);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(executable))
        .find(|candidate| candidate.is_file())
}
