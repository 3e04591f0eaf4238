//! The capture-to-delivery state machine.
//!
//! One task owns all session state and is the only writer of it. Trigger
//! events arrive over a single ordered channel; capture start/stop are fast
//! bounded calls, while preprocessing and provider calls run on the blocking
//! pool and hand their result back through a join handle. Events arriving
//! while a session is busy are rejected — start requests with a busy notice,
//! everything else with a logged rationale — never queued.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::audio::capture::CaptureBackend;
use crate::audio::preprocess::Preprocessor;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::model::ModelManager;
use crate::provider::{self, ProviderConfig, TranscriptionProvider, TranscriptionResult};
use crate::provider::ProviderSelector;
use crate::session::{
    text_preview, DeliverySink, NotificationSink, RecordingSession, RetryPolicy, SessionEvent,
    SessionEventKind, SessionState,
};
use crate::trigger::{TriggerEvent, TriggerSignal};

/// Builds a provider from a session's config snapshot. Injected so the state
/// machine can be driven against scripted providers.
pub type ProviderFactory =
    Box<dyn Fn(&ProviderConfig) -> Result<Arc<dyn TranscriptionProvider>, EngineError> + Send>;

/// Tunables the controller is constructed with.
pub struct ControllerOptions {
    /// Preprocessing stages applied between capture and transcription.
    pub preprocessor: Preprocessor,
    /// Retry bounds for retryable provider faults.
    pub retry: RetryPolicy,
    /// Hard cap on one capture.
    pub max_duration: Duration,
}

/// Drives `Idle → Recording → Stopping → Transcribing → Delivering → Idle`,
/// with `Error` absorbing faults from any non-idle state.
pub struct SessionController {
    capture: Box<dyn CaptureBackend>,
    selector: Arc<ProviderSelector>,
    factory: ProviderFactory,
    delivery: Arc<dyn DeliverySink>,
    notifier: Arc<dyn NotificationSink>,
    preprocessor: Arc<Preprocessor>,
    retry: RetryPolicy,
    max_duration: Duration,
    state_tx: watch::Sender<SessionState>,
    /// Provider reused while the config snapshot stays identical.
    cached_provider: Option<(ProviderConfig, Arc<dyn TranscriptionProvider>)>,
    next_session_id: u64,
}

impl SessionController {
    /// Assembles a controller; nothing runs until [`SessionController::run`].
    #[must_use]
    pub fn new(
        capture: Box<dyn CaptureBackend>,
        selector: Arc<ProviderSelector>,
        factory: ProviderFactory,
        delivery: Arc<dyn DeliverySink>,
        notifier: Arc<dyn NotificationSink>,
        options: ControllerOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            capture,
            selector,
            factory,
            delivery,
            notifier,
            preprocessor: Arc::new(options.preprocessor),
            retry: options.retry,
            max_duration: options.max_duration,
            state_tx,
            cached_provider: None,
            next_session_id: 0,
        }
    }

    /// Production provider factory over the closed variant set.
    #[must_use]
    pub fn default_factory(models: Arc<ModelManager>) -> ProviderFactory {
        Box::new(move |config| provider::build(config, &models))
    }

    /// Observer for the current state; the controller is the only writer.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Consumes trigger events until the channel closes. At most one session
    /// is in a non-terminal state at any time.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TriggerEvent>) {
        info!("session controller running");
        while let Some(event) = events.recv().await {
            match event.signal {
                TriggerSignal::Start | TriggerSignal::Toggle => {
                    self.run_session(&mut events).await;
                }
                TriggerSignal::Stop => {
                    debug!(origin = ?event.origin, "stop ignored while idle");
                }
            }
        }
        info!("trigger channel closed, session controller exiting");
    }

    async fn run_session(&mut self, events: &mut mpsc::UnboundedReceiver<TriggerEvent>) {
        let id = self.next_session_id;
        self.next_session_id += 1;
        debug!(session = id, "session opening");

        let config = self.selector.current();
        let mut session = RecordingSession::new(id, self.max_duration);

        // Idle -> Recording
        if let Err(err) = self.capture.begin() {
            self.fail(&mut session, &err);
            return;
        }
        self.set_state(&mut session, SessionState::Recording);
        self.emit(SessionEventKind::Started, "recording started");

        let truncated = self.wait_for_stop(events, session.max_duration).await;

        // Recording -> Stopping
        self.set_state(&mut session, SessionState::Stopping);
        let buffer = match self.capture.stop() {
            Ok(buffer) => buffer,
            Err(err) => {
                self.fail(&mut session, &err);
                return;
            }
        };

        let mut stop_message = if truncated {
            format!(
                "recording stopped at the {}s cap",
                session.max_duration.as_secs()
            )
        } else {
            format!("recording stopped ({:.1}s)", buffer.duration().as_secs_f64())
        };
        if buffer.is_very_quiet() && !buffer.samples.is_empty() {
            stop_message.push_str(" — input was very quiet");
        }
        self.emit(
            if truncated {
                SessionEventKind::Truncated
            } else {
                SessionEventKind::Stopped
            },
            stop_message,
        );

        // Stopping -> Transcribing
        self.set_state(&mut session, SessionState::Transcribing);
        let preprocessor = Arc::clone(&self.preprocessor);
        let raw_samples = buffer.samples;
        let preprocess_handle =
            tokio::task::spawn_blocking(move || preprocessor.process(&raw_samples));
        let outcome = match self.await_blocking(events, preprocess_handle, None).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail(&mut session, &err);
                return;
            }
        };
        let transcribing_message = outcome.degraded.as_ref().map_or_else(
            || "transcribing".to_owned(),
            |note| format!("transcribing ({note})"),
        );
        self.emit(SessionEventKind::Transcribing, transcribing_message);

        let provider = match self.provider_for(&config) {
            Ok(provider) => provider,
            Err(err) => {
                self.fail(&mut session, &err);
                return;
            }
        };

        let samples = Arc::new(outcome.samples);
        match self.transcribe_with_retry(events, provider, samples).await {
            Ok(result) => {
                // Transcribing -> Delivering
                self.set_state(&mut session, SessionState::Delivering);
                let completed_message = if result.text.is_empty() {
                    "no speech detected".to_owned()
                } else {
                    text_preview(&result.text)
                };
                self.emit(SessionEventKind::Completed, completed_message);

                if !result.text.is_empty() {
                    if let Err(err) = self.delivery.deliver(&result.text) {
                        // Reported once; the session still terminates.
                        warn!("delivery failed: {}", err);
                        self.emit(SessionEventKind::DeliveryFailed, err.user_message());
                    }
                }

                session.result = Some(result);
                // Delivering -> Idle
                self.set_state(&mut session, SessionState::Idle);
                info!("session complete");
            }
            Err(err) => self.fail(&mut session, &err),
        }
    }

    /// Waits in Recording until a stop/toggle arrives or the cap elapses.
    /// Returns whether the session was truncated by the cap.
    async fn wait_for_stop(
        &self,
        events: &mut mpsc::UnboundedReceiver<TriggerEvent>,
        max_duration: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + max_duration;
        let mut channel_open = true;
        loop {
            if !channel_open {
                tokio::time::sleep_until(deadline).await;
                return true;
            }
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return true,
                maybe = events.recv() => match maybe {
                    Some(event) => match event.signal {
                        TriggerSignal::Stop | TriggerSignal::Toggle => return false,
                        TriggerSignal::Start => {
                            debug!("start request ignored while recording");
                        }
                    },
                    None => channel_open = false,
                }
            }
        }
    }

    /// Runs the provider on the blocking pool with bounded retry and
    /// exponential backoff for retryable faults. Fatal faults surface
    /// immediately.
    async fn transcribe_with_retry(
        &self,
        events: &mut mpsc::UnboundedReceiver<TriggerEvent>,
        provider: Arc<dyn TranscriptionProvider>,
        samples: Arc<Vec<f32>>,
    ) -> Result<TranscriptionResult, EngineError> {
        let cancel = CancelToken::new();
        let mut attempt = 1_u32;
        loop {
            let worker_provider = Arc::clone(&provider);
            let worker_samples = Arc::clone(&samples);
            let worker_cancel = cancel.clone();
            let handle = tokio::task::spawn_blocking(move || {
                worker_provider.transcribe(&worker_samples, &worker_cancel)
            });

            let result = self
                .await_blocking(events, handle, Some(&cancel))
                .await
                .and_then(|inner| inner);

            match result {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff_for(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        "retryable transcription fault: {err}"
                    );
                    self.sleep_rejecting(events, backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Awaits a blocking-pool handle while rejecting trigger events. When the
    /// channel closes (shutdown), in-flight work is cancelled cooperatively.
    async fn await_blocking<T>(
        &self,
        events: &mut mpsc::UnboundedReceiver<TriggerEvent>,
        mut handle: tokio::task::JoinHandle<T>,
        cancel: Option<&CancelToken>,
    ) -> Result<T, EngineError> {
        loop {
            tokio::select! {
                joined = &mut handle => {
                    return joined.map_err(|e| {
                        EngineError::Inference(format!("worker task failed: {e}"))
                    });
                }
                maybe = events.recv() => match maybe {
                    Some(event) => self.reject_while_busy(&event),
                    None => {
                        if let Some(token) = cancel {
                            token.cancel();
                        }
                        let joined = (&mut handle).await;
                        return joined.map_err(|e| {
                            EngineError::Inference(format!("worker task failed: {e}"))
                        });
                    }
                }
            }
        }
    }

    /// Backoff sleep that keeps draining (and rejecting) trigger events.
    async fn sleep_rejecting(
        &self,
        events: &mut mpsc::UnboundedReceiver<TriggerEvent>,
        duration: Duration,
    ) {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return,
                maybe = events.recv() => match maybe {
                    Some(event) => self.reject_while_busy(&event),
                    None => {
                        (&mut sleep).await;
                        return;
                    }
                }
            }
        }
    }

    /// At-most-one-session policy: start requests get a busy notice, other
    /// signals are dropped with a rationale. Nothing is queued.
    fn reject_while_busy(&self, event: &TriggerEvent) {
        match event.signal {
            TriggerSignal::Start => {
                self.emit(
                    SessionEventKind::Busy,
                    "a session is already being processed",
                );
            }
            TriggerSignal::Stop | TriggerSignal::Toggle => {
                debug!(
                    signal = ?event.signal,
                    origin = ?event.origin,
                    "trigger dropped while session is busy"
                );
            }
        }
    }

    fn provider_for(
        &mut self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn TranscriptionProvider>, EngineError> {
        if let Some((cached_config, cached)) = &self.cached_provider {
            if cached_config == config {
                return Ok(Arc::clone(cached));
            }
        }
        let built = (self.factory)(config)?;
        self.cached_provider = Some((config.clone(), Arc::clone(&built)));
        Ok(built)
    }

    fn fail(&mut self, session: &mut RecordingSession, err: &EngineError) {
        warn!("session failed: {err}");
        session.error = Some(err.user_message());
        self.set_state(session, SessionState::Error);
        self.emit(SessionEventKind::Failed, err.user_message());
        // Error -> Idle, unconditionally.
        self.set_state(session, SessionState::Idle);
    }

    fn set_state(&self, session: &mut RecordingSession, state: SessionState) {
        debug!(from = %session.state, to = %state, "state transition");
        session.state = state;
        let _ = self.state_tx.send_replace(state);
    }

    fn emit(&self, kind: SessionEventKind, message: impl Into<String>) {
        let event = SessionEvent::new(kind, message);
        debug!(kind = ?event.kind, message = %event.message, "notify");
        self.notifier.notify(&event);
    }
}
