//! Remote speech API backend.
//!
//! Uploads the capture as an in-memory WAV to an OpenAI-compatible
//! `audio/transcriptions` endpoint. Fault classification: transport problems
//! are `Network` (retryable), HTTP 429 is `RateLimited` (retryable with
//! backoff), 401/403 are `Auth` (fatal until the credential is fixed).

use reqwest::blocking::multipart;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::audio::wav;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::provider::{ProviderConfig, ProviderKind, TranscriptionProvider, TranscriptionResult};

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Hosted transcription over HTTP.
#[derive(Debug)]
pub struct RemoteApiProvider {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    language: String,
}

impl RemoteApiProvider {
    /// Resolves the credential and builds a client bounded by the configured
    /// timeout.
    ///
    /// # Errors
    /// `InvalidProviderConfig` when the credential environment variable is
    /// unset or empty, or the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, EngineError> {
        let api_key = resolve_credential(&config.credential_ref).ok_or_else(|| {
            EngineError::InvalidProviderConfig(format!(
                "credential variable '{}' is unset or empty",
                config.credential_ref
            ))
        })?;

        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::InvalidProviderConfig(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model_name.clone(),
            language: config.language_hint.clone(),
        })
    }
}

impl TranscriptionProvider for RemoteApiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::RemoteApi
    }

    fn transcribe(
        &self,
        samples: &[f32],
        _cancel: &CancelToken,
    ) -> Result<TranscriptionResult, EngineError> {
        let start = Instant::now();

        let wav_bytes = wav::encode(samples)
            .map_err(|e| EngineError::Inference(format!("wav encode: {e}")))?;
        debug!(bytes = wav_bytes.len(), "uploading capture");

        let part = multipart::Part::bytes(wav_bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| EngineError::Inference(format!("multipart: {e}")))?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone());

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| EngineError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .map_err(|e| EngineError::Inference(format!("unreadable response: {e}")))?;

        let text = parsed.text.trim().to_owned();
        let latency = start.elapsed();
        info!(
            text_len = text.len(),
            latency_ms = latency.as_millis(),
            "remote transcription completed"
        );

        Ok(TranscriptionResult::new(
            text,
            ProviderKind::RemoteApi,
            latency,
        ))
    }
}

/// Maps a non-success HTTP status onto the error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> EngineError {
    let summary = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EngineError::Auth(summary),
        StatusCode::TOO_MANY_REQUESTS => EngineError::RateLimited(summary),
        s if s.is_server_error() => EngineError::Network(summary),
        _ => EngineError::Inference(summary),
    }
}

fn resolve_credential(var_name: &str) -> Option<String> {
    std::env::var(var_name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
