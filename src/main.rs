//! Termina binary: wires config, logging, the model manager, the selected
//! provider, and the global hotkey into the session controller.

use anyhow::{Context, Result};
use global_hotkey::GlobalHotKeyEvent;
use std::sync::Arc;
use std::time::Duration;

use termina::audio::{MicCapture, PreprocessOptions, Preprocessor};
use termina::config::Config;
use termina::error::EngineError;
use termina::model::{DownloadProgress, HttpFetcher, ModelManager, Prefetcher};
use termina::provider::{ProviderConfig, ProviderKind, ProviderSelector};
use termina::session::controller::ControllerOptions;
use termina::session::{
    DeliverySink, NotificationSink, RetryPolicy, SessionController, SessionEvent,
};
use termina::telemetry;
use termina::trigger::{self, HotkeyTrigger};

/// Stand-in delivery sink: prints the transcript. The real foreground-app
/// insertion is platform glue wired in by the shell, not the engine.
struct StdoutDelivery;

impl DeliverySink for StdoutDelivery {
    fn deliver(&self, text: &str) -> Result<(), EngineError> {
        #[allow(clippy::print_stdout)]
        {
            println!("{text}");
        }
        Ok(())
    }
}

/// Stand-in notification sink: logs session feedback.
struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, event: &SessionEvent) {
        tracing::info!(kind = ?event.kind, "{}", event.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    telemetry::init(config.telemetry.enabled, &config.telemetry.log_path)?;
    tracing::info!("termina starting");

    let cache_dir = Config::expand_path(&config.models.dir)?;
    let fetcher = Arc::new(HttpFetcher::new().context("failed to build model fetcher")?);
    let models = Arc::new(ModelManager::new(cache_dir, fetcher));
    let purged = models.purge_corrupt();
    if purged > 0 {
        tracing::warn!(purged, "removed corrupt cached model artifacts");
    }

    let provider_config = ProviderConfig::from_settings(&config.provider)?;
    let selector = Arc::new(
        ProviderSelector::new(provider_config.clone(), Arc::clone(&models))
            .context("provider configuration rejected")?,
    );

    // Local backends need the artifact; start fetching before the first
    // session asks for it.
    let prefetcher = Prefetcher::new(Arc::clone(&models));
    if provider_config.kind != ProviderKind::RemoteApi {
        prefetcher.prefetch(
            &provider_config.model_name,
            Arc::new(|p: DownloadProgress| {
                tracing::debug!(
                    model = %p.model,
                    downloaded = p.downloaded,
                    total = ?p.total,
                    "model download progress"
                );
            }),
        );
    }

    let capture = MicCapture::new(config.max_duration()).context("audio capture unavailable")?;
    let preprocessor = Preprocessor::new(PreprocessOptions::from(&config.preprocess));

    let (trigger_tx, trigger_rx) = trigger::channel();
    let hotkey =
        HotkeyTrigger::new(&config.hotkey, trigger_tx).context("hotkey registration failed")?;
    tracing::info!(
        "hotkey ready: {:?} + {} (toggle to record)",
        config.hotkey.modifiers,
        config.hotkey.key
    );

    let controller = SessionController::new(
        Box::new(capture),
        Arc::clone(&selector),
        SessionController::default_factory(Arc::clone(&models)),
        Arc::new(StdoutDelivery),
        Arc::new(LogNotifier),
        ControllerOptions {
            preprocessor,
            retry: RetryPolicy::from(&config.retry),
            max_duration: config.max_duration(),
        },
    );

    // The controller and the hotkey pump share the main task: neither the
    // capture stream nor the hotkey manager may leave this thread.
    let pump = async move {
        let receiver = GlobalHotKeyEvent::receiver();
        loop {
            while let Ok(event) = receiver.try_recv() {
                hotkey.handle_event(&event);
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                    break;
                }
                () = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        prefetcher.cancel();
        drop(hotkey); // closes the trigger channel, controller drains and exits
    };

    tokio::join!(controller.run(trigger_rx), pump);

    tracing::info!("termina stopped");
    Ok(())
}
