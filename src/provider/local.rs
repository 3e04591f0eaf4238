//! In-process whisper inference.
//!
//! The model artifact is loaded lazily on the first call, gated on the
//! artifact being `Ready` in the model manager — a session started before the
//! download completes fails with `ModelNotReady` rather than blocking.

use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::model::{ModelManager, ModelStatus};
use crate::provider::{ProviderConfig, ProviderKind, TranscriptionProvider, TranscriptionResult};

/// Backend running whisper inference inside the process.
pub struct InProcessLocalProvider {
    models: Arc<ModelManager>,
    model_name: String,
    /// `None` = auto-detect.
    language: Option<String>,
    threads: i32,
    beam_size: i32,
    /// Loaded lazily on first use; exclusive access serializes inference.
    ctx: Mutex<Option<WhisperContext>>,
}

impl std::fmt::Debug for InProcessLocalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessLocalProvider")
            .field("model_name", &self.model_name)
            .field("language", &self.language)
            .field("threads", &self.threads)
            .field("beam_size", &self.beam_size)
            .finish_non_exhaustive()
    }
}

impl InProcessLocalProvider {
    /// Validates parameters; the model itself loads on first transcribe.
    ///
    /// # Errors
    /// `InvalidProviderConfig` when the model is unknown or thread/beam
    /// parameters are out of range.
    pub fn new(config: &ProviderConfig, models: Arc<ModelManager>) -> Result<Self, EngineError> {
        if !models.knows(&config.model_name) {
            return Err(EngineError::InvalidProviderConfig(format!(
                "model '{}' is not in the catalog",
                config.model_name
            )));
        }

        let threads = i32::try_from(config.threads).map_err(|_| {
            EngineError::InvalidProviderConfig(format!("threads too large (max {})", i32::MAX))
        })?;
        let beam_size = i32::try_from(config.beam_size).map_err(|_| {
            EngineError::InvalidProviderConfig(format!("beam_size too large (max {})", i32::MAX))
        })?;
        if threads == 0 {
            return Err(EngineError::InvalidProviderConfig(
                "threads must be > 0".to_owned(),
            ));
        }
        if beam_size == 0 {
            return Err(EngineError::InvalidProviderConfig(
                "beam_size must be > 0".to_owned(),
            ));
        }

        let language = match config.language_hint.as_str() {
            "auto" | "" => None,
            hint => Some(hint.to_owned()),
        };

        Ok(Self {
            models,
            model_name: config.model_name.clone(),
            language,
            threads,
            beam_size,
            ctx: Mutex::new(None),
        })
    }

    /// Beam search above width 1, greedy otherwise.
    const fn sampling_strategy(beam_size: i32) -> SamplingStrategy {
        if beam_size > 1 {
            SamplingStrategy::BeamSearch {
                beam_size,
                patience: -1.0,
            }
        } else {
            SamplingStrategy::Greedy { best_of: 1 }
        }
    }

    fn load_context(&self) -> Result<WhisperContext, EngineError> {
        let descriptor = self
            .models
            .descriptor(&self.model_name)
            .ok_or_else(|| EngineError::ModelNotReady(self.model_name.clone()))?;
        if descriptor.status != ModelStatus::Ready {
            return Err(EngineError::ModelNotReady(self.model_name.clone()));
        }

        let path_str = descriptor.local_path.to_str().ok_or_else(|| {
            EngineError::Inference("model path contains invalid UTF-8".to_owned())
        })?;

        info!(model = %self.model_name, path = %path_str, "loading whisper model");
        let params = WhisperContextParameters::default();
        let ctx = WhisperContext::new_with_params(path_str, params)
            .map_err(|e| EngineError::Inference(format!("failed to load model: {e:?}")))?;
        info!("whisper model loaded");
        Ok(ctx)
    }
}

impl TranscriptionProvider for InProcessLocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::InProcessLocal
    }

    fn transcribe(
        &self,
        samples: &[f32],
        _cancel: &CancelToken,
    ) -> Result<TranscriptionResult, EngineError> {
        let start = Instant::now();

        let mut guard = self
            .ctx
            .lock()
            .map_err(|e| EngineError::Inference(format!("mutex poisoned: {e}")))?;
        if guard.is_none() {
            *guard = Some(self.load_context()?);
        }
        let ctx = guard
            .as_ref()
            .ok_or_else(|| EngineError::Inference("context missing after load".to_owned()))?;

        debug!(samples = samples.len(), "starting in-process inference");
        let mut state = ctx
            .create_state()
            .map_err(|e| EngineError::Inference(format!("failed to create state: {e:?}")))?;

        let mut params = FullParams::new(Self::sampling_strategy(self.beam_size));
        params.set_n_threads(self.threads);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_language(self.language.as_deref());
        params.set_translate(false);

        state
            .full(params, samples)
            .map_err(|e| EngineError::Inference(format!("whisper inference failed: {e:?}")))?;

        let mut text = String::new();
        for segment in state.as_iter() {
            text.push_str(&segment.to_string());
        }
        let text = text.trim().to_owned();

        let latency = start.elapsed();
        info!(
            segments = state.full_n_segments(),
            text_len = text.len(),
            latency_ms = latency.as_millis(),
            "in-process inference completed"
        );

        Ok(TranscriptionResult::new(
            text,
            ProviderKind::InProcessLocal,
            latency,
        ))
    }
}

// SAFETY: the WhisperContext lives behind a Mutex, all access acquires the
// lock, and no other shared mutable state exists. whisper-rs documents the
// context as safe to use across threads when externally synchronized.
#[allow(unsafe_code)]
unsafe impl Send for InProcessLocalProvider {}
#[allow(unsafe_code)]
unsafe impl Sync for InProcessLocalProvider {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelSpec;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    struct NullFetcher;
    impl crate::model::ModelFetcher for NullFetcher {
        fn fetch(
            &self,
            _url: &str,
            _dest: &std::path::Path,
            _progress: &dyn Fn(u64, Option<u64>),
            _cancel: &CancelToken,
        ) -> Result<(), crate::model::FetchError> {
            Err(crate::model::FetchError::Failed("offline".to_owned()))
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("termina-local-tests")
            .join(format!("{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: &std::path::Path) -> Arc<ModelManager> {
        let spec = ModelSpec {
            name: "test-model".to_owned(),
            expected_size: 0,
            sha256: None,
            url: "https://example.invalid/m.bin".to_owned(),
        };
        Arc::new(ModelManager::with_catalog(
            dir.to_path_buf(),
            Arc::new(NullFetcher),
            vec![spec],
        ))
    }

    fn test_config() -> ProviderConfig {
        ProviderConfig {
            kind: ProviderKind::InProcessLocal,
            model_name: "test-model".to_owned(),
            language_hint: "ja".to_owned(),
            credential_ref: String::new(),
            endpoint: String::new(),
            executable: String::new(),
            timeout: Duration::from_secs(300),
            threads: 4,
            beam_size: 5,
        }
    }

    #[test]
    fn unknown_model_rejected_at_construction() {
        let dir = test_dir("unknown");
        let mut config = test_config();
        config.model_name = "mystery".to_owned();
        let err = InProcessLocalProvider::new(&config, manager(&dir)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProviderConfig(_)));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_threads_rejected() {
        let dir = test_dir("threads");
        let mut config = test_config();
        config.threads = 0;
        let err = InProcessLocalProvider::new(&config, manager(&dir)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProviderConfig(_)));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_beam_size_rejected() {
        let dir = test_dir("beam");
        let mut config = test_config();
        config.beam_size = 0;
        let err = InProcessLocalProvider::new(&config, manager(&dir)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProviderConfig(_)));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn auto_language_becomes_none() {
        let dir = test_dir("lang");
        let mut config = test_config();
        config.language_hint = "auto".to_owned();
        let provider = InProcessLocalProvider::new(&config, manager(&dir)).unwrap();
        assert!(provider.language.is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn transcribe_before_ensure_is_model_not_ready() {
        let dir = test_dir("not-ready");
        let provider = InProcessLocalProvider::new(&test_config(), manager(&dir)).unwrap();
        let err = provider
            .transcribe(&[0.0; 16_000], &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelNotReady(_)));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn greedy_strategy_below_beam_two() {
        let strategy = InProcessLocalProvider::sampling_strategy(1);
        assert!(matches!(strategy, SamplingStrategy::Greedy { best_of: 1 }));
    }

    #[test]
    fn beam_search_strategy_above_one() {
        let strategy = InProcessLocalProvider::sampling_strategy(5);
        assert!(matches!(
            strategy,
            SamplingStrategy::BeamSearch {
                beam_size: 5,
                patience
            } if patience == -1.0
        ));
    }

    #[test]
    fn strategy_boundary() {
        assert!(matches!(
            InProcessLocalProvider::sampling_strategy(1),
            SamplingStrategy::Greedy { .. }
        ));
        assert!(matches!(
            InProcessLocalProvider::sampling_strategy(2),
            SamplingStrategy::BeamSearch { .. }
        ));
    }

    #[test]
    fn provider_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<InProcessLocalProvider>();
        assert_sync::<InProcessLocalProvider>();
    }

    #[test]
    #[ignore = "requires a real whisper model artifact"]
    fn transcribe_silence_with_real_model() {
        // Place a real ggml artifact at the path below to run this test.
        let home = std::env::var("HOME").unwrap();
        let cache = PathBuf::from(home).join(".termina/models");
        if !cache.join("ggml-tiny.bin").exists() {
            eprintln!("skipping: no model at ~/.termina/models/ggml-tiny.bin");
            return;
        }
        let spec = ModelSpec {
            name: "tiny".to_owned(),
            expected_size: 0,
            sha256: None,
            url: String::new(),
        };
        let models = Arc::new(ModelManager::with_catalog(
            cache,
            Arc::new(NullFetcher),
            vec![spec],
        ));
        let mut config = test_config();
        config.model_name = "tiny".to_owned();
        let provider = InProcessLocalProvider::new(&config, models).unwrap();

        let silence = vec![0.0_f32; 16_000];
        let result = provider.transcribe(&silence, &CancelToken::new()).unwrap();
        assert!(result.text.is_empty() || result.text.len() < 50);
    }
}
