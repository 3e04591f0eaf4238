//! Local inference through an external whisper-cli style executable.
//!
//! The capture is written to a scoped temp WAV and handed to the executable;
//! UTF-8 text comes back on stdout, a non-zero exit signals failure with
//! stderr captured for diagnostics. A missing executable is a setup error
//! (`ExecutableMissing`, fatal); the child is killed when the configured
//! timeout elapses or cancellation is requested.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::audio::wav;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::exec::{run_captured, ExecError};
use crate::model::{ModelManager, ModelStatus};
use crate::provider::{
    resolve_executable, ProviderConfig, ProviderKind, TranscriptionProvider, TranscriptionResult,
};

/// Backend that shells out to a compiled inference binary.
pub struct CompiledLocalProvider {
    executable: PathBuf,
    models: Arc<ModelManager>,
    model_name: String,
    language: String,
    threads: usize,
    beam_size: usize,
    timeout: Duration,
}

impl std::fmt::Debug for CompiledLocalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledLocalProvider")
            .field("executable", &self.executable)
            .field("model_name", &self.model_name)
            .field("language", &self.language)
            .field("threads", &self.threads)
            .field("beam_size", &self.beam_size)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CompiledLocalProvider {
    /// Resolves the executable and validates the model name.
    ///
    /// # Errors
    /// `ExecutableMissing` when the binary cannot be found;
    /// `InvalidProviderConfig` when the model is not in the catalog.
    pub fn new(config: &ProviderConfig, models: Arc<ModelManager>) -> Result<Self, EngineError> {
        let executable = resolve_executable(&config.executable)
            .ok_or_else(|| EngineError::ExecutableMissing(PathBuf::from(&config.executable)))?;

        if !models.knows(&config.model_name) {
            return Err(EngineError::InvalidProviderConfig(format!(
                "model '{}' is not in the catalog",
                config.model_name
            )));
        }

        Ok(Self {
            executable,
            models,
            model_name: config.model_name.clone(),
            language: config.language_hint.clone(),
            threads: config.threads,
            beam_size: config.beam_size,
            timeout: config.timeout,
        })
    }
}

impl TranscriptionProvider for CompiledLocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CompiledLocal
    }

    fn transcribe(
        &self,
        samples: &[f32],
        cancel: &CancelToken,
    ) -> Result<TranscriptionResult, EngineError> {
        let descriptor = self
            .models
            .descriptor(&self.model_name)
            .ok_or_else(|| EngineError::ModelNotReady(self.model_name.clone()))?;
        if descriptor.status != ModelStatus::Ready {
            return Err(EngineError::ModelNotReady(self.model_name.clone()));
        }

        let start = Instant::now();

        let input = tempfile::Builder::new()
            .prefix("termina-infer-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| EngineError::Inference(format!("temp file: {e}")))?;
        wav::write_file(input.path(), samples)
            .map_err(|e| EngineError::Inference(format!("wav write: {e}")))?;

        let mut cmd = Command::new(&self.executable);
        cmd.arg("-m")
            .arg(&descriptor.local_path)
            .arg("-f")
            .arg(input.path())
            .args(["--language", &self.language])
            .args(["--threads", &self.threads.to_string()])
            .args(["--no-prints", "--no-timestamps"])
            .args(["--temperature", "0.0"])
            .args(["--beam-size", &self.beam_size.to_string()])
            .args(["--best-of", &self.beam_size.to_string()]);

        debug!(
            executable = %self.executable.display(),
            model = %self.model_name,
            samples = samples.len(),
            "invoking compiled inference"
        );

        let output = match run_captured(&mut cmd, self.timeout, Some(cancel)) {
            Ok(output) => output,
            Err(ExecError::Missing(_)) => {
                return Err(EngineError::ExecutableMissing(self.executable.clone()));
            }
            Err(ExecError::NonZero { code, stderr }) => {
                return Err(EngineError::Inference(format!(
                    "exited with {code:?}: {}",
                    stderr.lines().last().unwrap_or("")
                )));
            }
            Err(ExecError::TimedOut) => {
                return Err(EngineError::Inference(format!(
                    "timed out after {:?}",
                    self.timeout
                )));
            }
            Err(ExecError::Cancelled) => return Err(EngineError::Cancelled),
            Err(ExecError::Io(e)) => return Err(EngineError::Inference(e)),
        };
        // input temp WAV removed on drop, on every path above

        let text = clean_transcript(&output.stdout);
        let latency = start.elapsed();
        info!(
            text_len = text.len(),
            latency_ms = latency.as_millis(),
            "compiled inference completed"
        );

        Ok(TranscriptionResult::new(
            text,
            ProviderKind::CompiledLocal,
            latency,
        ))
    }
}

/// Strips timestamp brackets and parenthetical artifact markers, then
/// normalizes whitespace.
fn clean_transcript(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    let mut skip_until: Option<char> = None;
    for ch in raw.chars() {
        match skip_until {
            Some(close) => {
                if ch == close {
                    skip_until = None;
                }
            }
            None => match ch {
                '[' => skip_until = Some(']'),
                '(' => skip_until = Some(')'),
                '（' => skip_until = Some('）'),
                _ => cleaned.push(ch),
            },
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}
