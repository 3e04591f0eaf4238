use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration, loaded from `~/.termina.toml`.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Active transcription provider and its parameters.
    pub provider: ProviderSettings,
    /// Recording limits.
    #[serde(default)]
    pub recording: RecordingSettings,
    /// Global hotkey binding.
    pub hotkey: HotkeySettings,
    /// Audio preprocessing stages.
    #[serde(default)]
    pub preprocess: PreprocessSettings,
    /// Retry bounds for retryable provider faults.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Model artifact cache location.
    #[serde(default)]
    pub models: ModelCacheSettings,
    /// Logging destination.
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

/// Which backend transcribes, and how.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSettings {
    /// One of `remote_api`, `compiled_local`, `inprocess_local`.
    pub kind: String,
    /// Model name; a catalog entry for local kinds, the service model id for
    /// the remote kind.
    pub model: String,
    /// Language hint forwarded to the backend.
    #[serde(default = "default_language")]
    pub language: String,
    /// Name of the environment variable holding the remote API credential.
    #[serde(default = "default_credential")]
    pub credential: String,
    /// Remote transcription endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Local inference executable (name on PATH or absolute path).
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Per-call transcription timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Inference threads for local kinds.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Beam width for local kinds (1 = greedy).
    #[serde(default = "default_beam_size")]
    pub beam_size: usize,
}

/// Recording limits.
#[derive(Debug, Deserialize, Clone)]
pub struct RecordingSettings {
    /// Hard cap on one capture; reaching it force-stops with a truncation
    /// notice.
    pub max_duration_secs: u64,
}

/// Hotkey combo; parsed and registered by the trigger source.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HotkeySettings {
    /// Modifier names: `Control`, `Option`/`Alt`, `Command`/`Super`, `Shift`.
    pub modifiers: Vec<String>,
    /// Single key name, e.g. `Z`.
    pub key: String,
}

/// Preprocessing stages applied between capture and transcription.
#[derive(Debug, Deserialize, Clone)]
pub struct PreprocessSettings {
    /// Run the external noise-reduction chain (requires ffmpeg).
    #[serde(default)]
    pub denoise: bool,
    /// Peak-normalize the buffer in memory.
    #[serde(default = "default_true")]
    pub normalize: bool,
    /// Additional ffmpeg `-af` stages, applied in order.
    #[serde(default)]
    pub filter_chain: Vec<String>,
}

/// Bounds for retrying retryable provider faults.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    /// Total attempts (first try included).
    pub max_attempts: u32,
    /// First backoff delay; doubles per subsequent attempt.
    pub base_backoff_ms: u64,
}

/// Where downloaded model artifacts live.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelCacheSettings {
    /// Cache directory; `~` expands to the home directory.
    pub dir: String,
}

/// Logging destination.
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    /// Log to a file instead of stdout.
    pub enabled: bool,
    /// File path when enabled.
    pub log_path: String,
}

const fn default_true() -> bool {
    true
}

fn default_language() -> String {
    // Japanese dictation is the primary deployment target.
    "ja".to_owned()
}

fn default_credential() -> String {
    "OPENAI_API_KEY".to_owned()
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/audio/transcriptions".to_owned()
}

fn default_executable() -> String {
    "whisper-cli".to_owned()
}

const fn default_timeout_secs() -> u64 {
    300
}

const fn default_threads() -> usize {
    4
}

const fn default_beam_size() -> usize {
    5
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            max_duration_secs: 600,
        }
    }
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            denoise: false,
            normalize: true,
            filter_chain: Vec::new(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
        }
    }
}

impl Default for ModelCacheSettings {
    fn default() -> Self {
        Self {
            dir: "~/.termina/models".to_owned(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: "~/.termina/termina.log".to_owned(),
        }
    }
}

impl Config {
    /// Loads config from `~/.termina.toml`, writing a default file on first
    /// run.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, fails to parse, or fails
    /// validation — misconfiguration surfaces here, not at first use.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default(&config_path).context("failed to create default config")?;
        }

        Self::load_from(&config_path)
    }

    /// Loads and validates a config file at an explicit path.
    ///
    /// # Errors
    /// Same failure modes as [`Config::load`].
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path).context("failed to read config file")?;

        let config: Self = toml::from_str(&contents).context("failed to parse config TOML")?;

        config.validate()?;
        Ok(config)
    }

    /// Validates enumerated fields and numeric bounds.
    ///
    /// # Errors
    /// Returns a descriptive error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        match self.provider.kind.as_str() {
            "remote_api" | "compiled_local" | "inprocess_local" => {}
            other => bail!(
                "provider.kind must be one of remote_api, compiled_local, inprocess_local (got '{other}')"
            ),
        }
        if self.provider.model.trim().is_empty() {
            bail!("provider.model must not be empty");
        }
        if self.provider.timeout_secs == 0 {
            bail!("provider.timeout_secs must be > 0");
        }
        if self.provider.threads == 0 {
            bail!("provider.threads must be > 0");
        }
        if self.provider.beam_size == 0 {
            bail!("provider.beam_size must be > 0");
        }
        if self.recording.max_duration_secs == 0 {
            bail!("recording.max_duration_secs must be > 0");
        }
        if self.hotkey.key.trim().is_empty() {
            bail!("hotkey.key must not be empty");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be >= 1");
        }
        Ok(())
    }

    /// The configured per-call transcription timeout.
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.timeout_secs)
    }

    /// The configured recording cap.
    #[must_use]
    pub const fn max_duration(&self) -> Duration {
        Duration::from_secs(self.recording.max_duration_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".termina.toml"))
    }

    fn create_default(path: &PathBuf) -> Result<()> {
        let default_config = r#"[provider]
# remote_api | compiled_local | inprocess_local
kind = "inprocess_local"
model = "base"
language = "ja"
credential = "OPENAI_API_KEY"
endpoint = "https://api.openai.com/v1/audio/transcriptions"
executable = "whisper-cli"
timeout_secs = 300
threads = 4
beam_size = 5

[recording]
max_duration_secs = 600

[hotkey]
modifiers = ["Control", "Option"]
key = "Z"

[preprocess]
denoise = false
normalize = true
filter_chain = []

[retry]
max_attempts = 3
base_backoff_ms = 500

[models]
dir = "~/.termina/models"

[telemetry]
enabled = false
log_path = "~/.termina/termina.log"
"#;
        fs::write(path, default_config).context("failed to write default config")?;
        Ok(())
    }

    /// Expand `~` in paths to the home directory.
    ///
    /// # Errors
    /// Returns an error if `HOME` is unset.
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}
