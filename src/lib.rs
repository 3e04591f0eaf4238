//! Termina — hotkey-triggered voice transcription engine.
//!
//! The library is the orchestration core: the session state machine, the
//! provider abstraction over remote/compiled/in-process transcription
//! backends, the audio capture and preprocessing pipeline, and the model
//! artifact lifecycle. UI shell, foreground-app text insertion, and desktop
//! notifications live outside, behind the [`session::DeliverySink`] and
//! [`session::NotificationSink`] traits.

/// Audio capture, preprocessing, and WAV helpers
pub mod audio;
/// Cooperative cancellation tokens
pub mod cancel;
/// Configuration loading and validation
pub mod config;
/// Classified engine errors
pub mod error;
mod exec;
/// Model artifact catalog and lifecycle
pub mod model;
/// Transcription backends and selection
pub mod provider;
/// The capture-to-delivery state machine
pub mod session;
/// Logging setup
pub mod telemetry;
/// Hotkey and UI trigger sources
pub mod trigger;
