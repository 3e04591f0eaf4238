//! Active-provider context.
//!
//! Explicit shared state passed to the session controller at construction;
//! the only mutation path is [`ProviderSelector::select`]. A session clones
//! the config at start, so a swap only takes effect for the next session.

use std::sync::{Arc, RwLock};
use tracing::info;

use crate::error::EngineError;
use crate::model::ModelManager;
use crate::provider::{resolve_executable, ProviderConfig, ProviderKind};

/// Holds the provider configuration sessions snapshot from.
pub struct ProviderSelector {
    models: Arc<ModelManager>,
    active: RwLock<ProviderConfig>,
}

impl std::fmt::Debug for ProviderSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSelector")
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl ProviderSelector {
    /// Validates and installs the initial configuration.
    ///
    /// # Errors
    /// `InvalidProviderConfig` describing the first failed requirement.
    pub fn new(initial: ProviderConfig, models: Arc<ModelManager>) -> Result<Self, EngineError> {
        Self::validate(&initial, &models)?;
        Ok(Self {
            models,
            active: RwLock::new(initial),
        })
    }

    /// Snapshot of the active configuration.
    #[must_use]
    pub fn current(&self) -> ProviderConfig {
        self.active
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Validates and swaps the active configuration. Takes effect for the
    /// next session only; in-flight sessions keep their snapshot.
    ///
    /// # Errors
    /// `InvalidProviderConfig` when the variant's requirements are not met;
    /// the previous configuration stays active.
    pub fn select(&self, config: ProviderConfig) -> Result<(), EngineError> {
        Self::validate(&config, &self.models)?;
        let mut active = self
            .active
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        info!(
            from = %active.kind,
            to = %config.kind,
            model = %config.model_name,
            "provider selection changed"
        );
        *active = config;
        Ok(())
    }

    fn validate(config: &ProviderConfig, models: &ModelManager) -> Result<(), EngineError> {
        if config.timeout.is_zero() {
            return Err(EngineError::InvalidProviderConfig(
                "timeout must be > 0".to_owned(),
            ));
        }
        if config.model_name.trim().is_empty() {
            return Err(EngineError::InvalidProviderConfig(
                "model name must not be empty".to_owned(),
            ));
        }

        match config.kind {
            ProviderKind::RemoteApi => {
                if !config.endpoint.starts_with("http") {
                    return Err(EngineError::InvalidProviderConfig(format!(
                        "endpoint '{}' is not an http(s) URL",
                        config.endpoint
                    )));
                }
                if credential_is_unset(&config.credential_ref) {
                    return Err(EngineError::InvalidProviderConfig(format!(
                        "credential variable '{}' is unset or empty",
                        config.credential_ref
                    )));
                }
            }
            ProviderKind::CompiledLocal => {
                if resolve_executable(&config.executable).is_none() {
                    return Err(EngineError::InvalidProviderConfig(format!(
                        "executable '{}' not found",
                        config.executable
                    )));
                }
                if !models.knows(&config.model_name) {
                    return Err(EngineError::InvalidProviderConfig(format!(
                        "model '{}' is not in the catalog",
                        config.model_name
                    )));
                }
            }
            ProviderKind::InProcessLocal => {
                if !models.knows(&config.model_name) {
                    return Err(EngineError::InvalidProviderConfig(format!(
                        "model '{}' is not in the catalog",
                        config.model_name
                    )));
                }
            }
        }

        Ok(())
    }
}

fn credential_is_unset(var_name: &str) -> bool {
    std::env::var(var_name)
        .map(|v| v.trim().is_empty())
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::model::{FetchError, ModelFetcher, ModelSpec};
    use std::path::Path;
    use std::time::Duration;

    struct NullFetcher;
    impl ModelFetcher for NullFetcher {
        fn fetch(
            &self,
            _url: &str,
            _dest: &Path,
            _progress: &dyn Fn(u64, Option<u64>),
            _cancel: &CancelToken,
        ) -> Result<(), FetchError> {
            Err(FetchError::Failed("offline".to_owned()))
        }
    }

    fn models() -> Arc<ModelManager> {
        let spec = ModelSpec {
            name: "base".to_owned(),
            expected_size: 0,
            sha256: None,
            url: "https://example.invalid/m.bin".to_owned(),
        };
        Arc::new(ModelManager::with_catalog(
            std::env::temp_dir().join("termina-selector-tests"),
            Arc::new(NullFetcher),
            vec![spec],
        ))
    }

    fn inprocess_config() -> ProviderConfig {
        ProviderConfig {
            kind: ProviderKind::InProcessLocal,
            model_name: "base".to_owned(),
            language_hint: "ja".to_owned(),
            credential_ref: "OPENAI_API_KEY".to_owned(),
            endpoint: "https://api.openai.com/v1/audio/transcriptions".to_owned(),
            executable: "whisper-cli".to_owned(),
            timeout: Duration::from_secs(300),
            threads: 4,
            beam_size: 5,
        }
    }

    #[test]
    fn valid_initial_config_is_accepted() {
        let selector = ProviderSelector::new(inprocess_config(), models()).unwrap();
        assert_eq!(selector.current().kind, ProviderKind::InProcessLocal);
    }

    #[test]
    fn unknown_model_rejected_for_local_kinds() {
        let mut config = inprocess_config();
        config.model_name = "mystery".to_owned();
        let err = ProviderSelector::new(config, models()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProviderConfig(_)));
    }

    #[test]
    fn compiled_local_requires_resolved_executable() {
        let selector = ProviderSelector::new(inprocess_config(), models()).unwrap();
        let mut config = inprocess_config();
        config.kind = ProviderKind::CompiledLocal;
        config.executable = "termina-no-such-cli".to_owned();
        let err = selector.select(config).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProviderConfig(_)));
        // Previous selection stays active.
        assert_eq!(selector.current().kind, ProviderKind::InProcessLocal);
    }

    #[test]
    fn compiled_local_with_real_executable_is_accepted() {
        let selector = ProviderSelector::new(inprocess_config(), models()).unwrap();
        let mut config = inprocess_config();
        config.kind = ProviderKind::CompiledLocal;
        config.executable = "sh".to_owned();
        selector.select(config).unwrap();
        assert_eq!(selector.current().kind, ProviderKind::CompiledLocal);
    }

    #[test]
    fn remote_requires_credential() {
        std::env::remove_var("TERMINA_SELECTOR_TEST_CRED");
        let selector = ProviderSelector::new(inprocess_config(), models()).unwrap();
        let mut config = inprocess_config();
        config.kind = ProviderKind::RemoteApi;
        config.credential_ref = "TERMINA_SELECTOR_TEST_CRED".to_owned();
        let err = selector.select(config).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProviderConfig(_)));
    }

    #[test]
    fn remote_with_credential_and_endpoint_is_accepted() {
        std::env::set_var("TERMINA_SELECTOR_TEST_CRED_OK", "sk-test");
        let selector = ProviderSelector::new(inprocess_config(), models()).unwrap();
        let mut config = inprocess_config();
        config.kind = ProviderKind::RemoteApi;
        config.credential_ref = "TERMINA_SELECTOR_TEST_CRED_OK".to_owned();
        selector.select(config).unwrap();
        assert_eq!(selector.current().kind, ProviderKind::RemoteApi);
        std::env::remove_var("TERMINA_SELECTOR_TEST_CRED_OK");
    }

    #[test]
    fn remote_requires_http_endpoint() {
        std::env::set_var("TERMINA_SELECTOR_TEST_CRED_EP", "sk-test");
        let selector = ProviderSelector::new(inprocess_config(), models()).unwrap();
        let mut config = inprocess_config();
        config.kind = ProviderKind::RemoteApi;
        config.credential_ref = "TERMINA_SELECTOR_TEST_CRED_EP".to_owned();
        config.endpoint = "ftp://example.com".to_owned();
        assert!(selector.select(config).is_err());
        std::env::remove_var("TERMINA_SELECTOR_TEST_CRED_EP");
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut config = inprocess_config();
        config.timeout = Duration::ZERO;
        assert!(ProviderSelector::new(config, models()).is_err());
    }

    #[test]
    fn current_returns_a_snapshot() {
        let selector = ProviderSelector::new(inprocess_config(), models()).unwrap();
        let mut snapshot = selector.current();
        snapshot.model_name = "mutated".to_owned();
        assert_eq!(selector.current().model_name, "base");
    }
}
