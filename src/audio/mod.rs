/// Microphone capture and format conversion
pub mod capture;
/// Optional filter chain applied before transcription
pub mod preprocess;
/// Fixed-format WAV helpers
pub mod wav;

pub use capture::{CaptureBackend, CaptureBuffer, MicCapture, TARGET_SAMPLE_RATE};
pub use preprocess::{PreprocessOptions, PreprocessOutcome, Preprocessor};
