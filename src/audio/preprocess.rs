//! Optional filter chain between capture and transcription.
//!
//! The normalize stage is a pure in-memory transform. Noise reduction shells
//! out to ffmpeg with the capture written to a scoped temp WAV; every failure
//! of the external stage (binary missing, non-zero exit, timeout, unreadable
//! output) degrades to pass-through — the session must still complete on the
//! unfiltered audio.

use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audio::wav;
use crate::config::PreprocessSettings;

/// Bound on one ffmpeg invocation.
const FFMPEG_DEADLINE: Duration = Duration::from_secs(30);

/// Peak level the normalize stage scales to.
const NORMALIZE_PEAK: f32 = 0.95;

/// Filters prepended when `denoise` is enabled: rumble removal, hiss removal,
/// and a peak-detection noise gate.
const DENOISE_CHAIN: [&str; 3] = [
    "highpass=f=80",
    "lowpass=f=8000",
    "silenceremove=start_periods=0:start_duration=0.1:start_threshold=-50dB:detection=peak",
];

/// Which stages run, from `[preprocess]` config.
#[derive(Debug, Clone, Default)]
pub struct PreprocessOptions {
    /// Run the external ffmpeg noise-reduction chain.
    pub denoise: bool,
    /// Peak-normalize in memory.
    pub normalize: bool,
    /// Extra ffmpeg `-af` stages, applied after the denoise chain.
    pub filter_chain: Vec<String>,
}

impl From<&PreprocessSettings> for PreprocessOptions {
    fn from(settings: &PreprocessSettings) -> Self {
        Self {
            denoise: settings.denoise,
            normalize: settings.normalize,
            filter_chain: settings.filter_chain.clone(),
        }
    }
}

/// Result of a preprocessing pass. `degraded` carries a note when an optional
/// stage was skipped.
#[derive(Debug)]
pub struct PreprocessOutcome {
    /// Processed (or passed-through) samples.
    pub samples: Vec<f32>,
    /// Human-readable degradation note, if any stage was skipped.
    pub degraded: Option<String>,
}

/// Applies the configured stages to a capture buffer.
pub struct Preprocessor {
    options: PreprocessOptions,
    ffmpeg_bin: String,
}

impl Preprocessor {
    /// Builds a preprocessor using `ffmpeg` from PATH.
    #[must_use]
    pub fn new(options: PreprocessOptions) -> Self {
        Self::with_command(options, "ffmpeg")
    }

    /// Builds a preprocessor with an explicit ffmpeg program name or path.
    #[must_use]
    pub fn with_command(options: PreprocessOptions, program: impl Into<String>) -> Self {
        Self {
            options,
            ffmpeg_bin: program.into(),
        }
    }

    /// Runs the stages in order: external filter chain, then normalize.
    /// Never fails; external-stage problems degrade to pass-through.
    #[must_use]
    pub fn process(&self, samples: &[f32]) -> PreprocessOutcome {
        let mut out = samples.to_vec();
        let mut degraded = None;

        let chain = effective_chain(&self.options);
        if !chain.is_empty() {
            match self.run_ffmpeg(&out, &chain) {
                Ok(filtered) => {
                    debug!(
                        stages = chain.len(),
                        in_samples = out.len(),
                        out_samples = filtered.len(),
                        "filter chain applied"
                    );
                    out = filtered;
                }
                Err(reason) => {
                    warn!("filter chain skipped: {}", reason);
                    degraded = Some(format!("noise filtering skipped ({reason})"));
                }
            }
        }

        if self.options.normalize {
            normalize_peak(&mut out);
        }

        PreprocessOutcome {
            samples: out,
            degraded,
        }
    }

    fn run_ffmpeg(&self, samples: &[f32], chain: &[String]) -> Result<Vec<f32>, String> {
        let input = tempfile::Builder::new()
            .prefix("termina-pre-in-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| format!("temp file: {e}"))?;
        let output = tempfile::Builder::new()
            .prefix("termina-pre-out-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| format!("temp file: {e}"))?;

        wav::write_file(input.path(), samples).map_err(|e| format!("wav write: {e}"))?;

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-i")
            .arg(input.path())
            .arg("-af")
            .arg(chain.join(","))
            .args(["-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le", "-y"])
            .arg(output.path());

        match crate::exec::run_captured(&mut cmd, FFMPEG_DEADLINE, None) {
            Ok(_) => {}
            Err(crate::exec::ExecError::Missing(e)) => return Err(format!("ffmpeg missing: {e}")),
            Err(crate::exec::ExecError::NonZero { code, stderr }) => {
                return Err(format!(
                    "ffmpeg exited with {code:?}: {}",
                    stderr.lines().last().unwrap_or("")
                ));
            }
            Err(crate::exec::ExecError::TimedOut) => return Err("ffmpeg timed out".to_owned()),
            Err(crate::exec::ExecError::Cancelled) => return Err("cancelled".to_owned()),
            Err(crate::exec::ExecError::Io(e)) => return Err(format!("ffmpeg io: {e}")),
        }

        wav::read_file(output.path()).map_err(|e| format!("wav read: {e}"))
        // input/output temp files are removed on drop, on every path above
    }
}

/// Assembles the ffmpeg stage list from the options. Empty means no external
/// invocation at all.
fn effective_chain(options: &PreprocessOptions) -> Vec<String> {
    let mut chain = Vec::new();
    if options.denoise {
        chain.extend(DENOISE_CHAIN.iter().map(|s| (*s).to_owned()));
    }
    chain.extend(options.filter_chain.iter().cloned());
    chain
}

/// Scales samples so the peak sits at [`NORMALIZE_PEAK`]. Near-silent buffers
/// are left alone rather than amplifying noise to full scale.
fn normalize_peak(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()));
    if peak < 1e-4 {
        return;
    }
    let gain = NORMALIZE_PEAK / peak;
    for sample in samples {
        *sample *= gain;
    }
}
