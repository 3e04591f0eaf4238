use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapRb,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Sample rate every downstream transcription backend expects.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Peak amplitude under which a capture is considered near-silent
/// (an int16 amplitude floor of 100).
const QUIET_PEAK: f32 = 100.0 / 32_768.0;

/// One finished capture: 16 kHz mono samples plus amplitude statistics.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    /// Mono samples at [`TARGET_SAMPLE_RATE`].
    pub samples: Vec<f32>,
    /// Peak absolute amplitude.
    pub peak: f32,
    /// Root-mean-square amplitude.
    pub rms: f32,
}

impl CaptureBuffer {
    /// Wraps converted samples, computing amplitude statistics.
    #[must_use]
    pub fn from_samples(samples: Vec<f32>) -> Self {
        let peak = samples.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()));
        let rms = if samples.is_empty() {
            0.0
        } else {
            let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
            // f64 → f32: amplitude statistic, precision sufficient
            #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
            {
                (sum_sq / samples.len() as f64).sqrt() as f32
            }
        };
        Self { samples, peak, rms }
    }

    /// Whether the capture is quiet enough that transcription quality will
    /// likely suffer. A degradation notice, not a failure.
    #[must_use]
    pub fn is_very_quiet(&self) -> bool {
        self.peak < QUIET_PEAK
    }

    /// Duration of the capture at the target rate.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(TARGET_SAMPLE_RATE))
    }
}

/// Microphone ownership seam consumed by the session controller.
///
/// The concrete device lives behind this trait so the state machine can be
/// exercised against scripted captures in tests.
#[cfg_attr(test, mockall::automock)]
pub trait CaptureBackend {
    /// Starts accumulating samples.
    ///
    /// # Errors
    /// `SessionAlreadyActive` if a capture is already running;
    /// `DeviceUnavailable` if the device refuses to start.
    fn begin(&mut self) -> Result<(), EngineError>;

    /// Stops accumulating and returns the converted buffer.
    ///
    /// # Errors
    /// `DeviceUnavailable` if the device refuses to pause.
    fn stop(&mut self) -> Result<CaptureBuffer, EngineError>;
}

/// Stream lifecycle control, separated for testability.
trait StreamControl {
    fn play(&self) -> Result<(), EngineError>;
    fn pause(&self) -> Result<(), EngineError>;
}

struct CpalStreamControl {
    stream: cpal::Stream,
}

impl StreamControl for CpalStreamControl {
    fn play(&self) -> Result<(), EngineError> {
        self.stream
            .play()
            .map_err(|e| EngineError::DeviceUnavailable(format!("failed to resume stream: {e}")))
    }

    fn pause(&self) -> Result<(), EngineError> {
        self.stream
            .pause()
            .map_err(|e| EngineError::DeviceUnavailable(format!("failed to pause stream: {e}")))
    }
}

/// CoreAudio/CPAL microphone capture.
///
/// The device stream is opened once at construction and kept paused while
/// idle; `begin`/`stop` toggle it. The cpal callback pushes raw device-rate
/// frames into a lock-free ring buffer and `stop` drains, downmixes, and
/// resamples to [`TARGET_SAMPLE_RATE`].
pub struct MicCapture {
    /// Kept alive to prevent stream drop.
    stream_control: Option<Box<dyn StreamControl>>,
    ring_buffer_consumer: HeapCons<f32>,
    is_recording: Arc<AtomicBool>,
    /// Session-level device lock; a second `begin` while set is rejected.
    capturing: bool,
    device_sample_rate: u32,
    device_channels: u16,
}

impl MicCapture {
    /// Opens the default input device, sizing the ring buffer for
    /// `max_duration` of device-rate audio.
    ///
    /// # Errors
    /// `DeviceUnavailable` if no input device is accessible or the stream
    /// cannot be built.
    pub fn new(max_duration: Duration) -> Result<Self, EngineError> {
        info!("initializing audio capture");

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| EngineError::DeviceUnavailable("no input device".to_owned()))?;

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_owned());
        info!("using input device: {}", device_name);

        let supported_config = device.default_input_config().map_err(|e| {
            EngineError::DeviceUnavailable(format!("failed to get input config: {e}"))
        })?;

        let device_sample_rate = supported_config.sample_rate();
        let device_channels = supported_config.channels();

        info!(
            "device config: {} Hz, {} channels",
            device_sample_rate, device_channels
        );

        // Sized so a cap-length recording never drops samples.
        let ring_buffer_capacity = (device_sample_rate as usize)
            * (device_channels as usize)
            * (max_duration.as_secs().max(1) as usize);
        let ring_buffer = HeapRb::<f32>::new(ring_buffer_capacity);
        let (ring_buffer_producer, ring_buffer_consumer) = ring_buffer.split();

        let is_recording = Arc::new(AtomicBool::new(false));
        let is_recording_clone = Arc::clone(&is_recording);
        let mut producer = ring_buffer_producer;

        let stream_config = supported_config.into();
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if is_recording_clone.load(Ordering::Relaxed) {
                        let pushed = producer.push_slice(data);
                        if pushed < data.len() {
                            warn!("ring buffer full, dropped {} samples", data.len() - pushed);
                        }
                    }
                },
                move |err| {
                    warn!("audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| {
                EngineError::DeviceUnavailable(format!("failed to build input stream: {e}"))
            })?;

        let stream_control = CpalStreamControl { stream };

        // Start then immediately pause: mic stays inactive until a session
        // begins.
        stream_control.play()?;
        stream_control.pause()?;
        info!("audio stream initialized (paused)");

        Ok(Self {
            stream_control: Some(Box::new(stream_control)),
            ring_buffer_consumer,
            is_recording,
            capturing: false,
            device_sample_rate,
            device_channels,
        })
    }

    fn convert_to_target_rate(&self, samples: &[f32]) -> Vec<f32> {
        let mono = downmix(samples, self.device_channels);
        if self.device_sample_rate == TARGET_SAMPLE_RATE {
            return mono;
        }
        resample_linear(&mono, self.device_sample_rate, TARGET_SAMPLE_RATE)
    }
}

impl CaptureBackend for MicCapture {
    fn begin(&mut self) -> Result<(), EngineError> {
        if self.capturing {
            return Err(EngineError::SessionAlreadyActive);
        }
        debug!("starting capture");

        self.ring_buffer_consumer.clear();

        // Flag set before resume so the first callback frames are kept.
        self.is_recording.store(true, Ordering::Relaxed);

        if let Some(stream_control) = &self.stream_control {
            if let Err(e) = stream_control.play() {
                self.is_recording.store(false, Ordering::Relaxed);
                return Err(e);
            }
        }

        self.capturing = true;
        info!("capture started");
        Ok(())
    }

    fn stop(&mut self) -> Result<CaptureBuffer, EngineError> {
        if !self.capturing {
            warn!("stop without active capture");
            return Ok(CaptureBuffer::from_samples(Vec::new()));
        }
        debug!("stopping capture");

        self.is_recording.store(false, Ordering::Relaxed);
        self.capturing = false;

        if let Some(stream_control) = &self.stream_control {
            stream_control.pause()?;
        }

        let mut samples = Vec::new();
        while let Some(sample) = self.ring_buffer_consumer.try_pop() {
            samples.push(sample);
        }

        let converted = self.convert_to_target_rate(&samples);
        let buffer = CaptureBuffer::from_samples(converted);

        info!(
            raw_samples = samples.len(),
            samples = buffer.samples.len(),
            peak = buffer.peak,
            "capture stopped"
        );

        Ok(buffer)
    }
}

/// Averages interleaved channels into mono.
fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels_f64 = f64::from(channels);
    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: f64 = frame.iter().map(|&s| f64::from(s)).sum();
            // f64 → f32: audio samples are stored as f32, precision sufficient
            #[allow(clippy::cast_possible_truncation)]
            {
                (sum / channels_f64) as f32
            }
        })
        .collect()
}

/// Linear-interpolation resampling.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn resample_linear(mono: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if mono.is_empty() {
        return Vec::new();
    }
    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let output_len = ((mono.len() as f64) / ratio).ceil() as usize;

    let mut out = Vec::with_capacity(output_len);
    for i in 0..output_len {
        let src = (i as f64) * ratio;
        let lo = (src.floor() as usize).min(mono.len() - 1);
        let hi = (lo + 1).min(mono.len() - 1);
        let fract = src - src.floor();
        let s = f64::from(mono[lo]).mul_add(1.0 - fract, f64::from(mono[hi]) * fract);
        out.push(s as f32);
    }
    out
}

#[cfg(test)]
#[allow(clippy::float_cmp)] // Test assertions with known exact values
mod tests {
    use super::*;

    struct FakeStreamControl {
        played: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
    }

    impl StreamControl for FakeStreamControl {
        fn play(&self) -> Result<(), EngineError> {
            self.played.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn pause(&self) -> Result<(), EngineError> {
            self.paused.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    fn capture_with_fake_stream(
        sample_rate: u32,
        channels: u16,
    ) -> (MicCapture, Arc<AtomicBool>, Arc<AtomicBool>) {
        let played = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let control = FakeStreamControl {
            played: Arc::clone(&played),
            paused: Arc::clone(&paused),
        };
        let capture = MicCapture {
            stream_control: Some(Box::new(control)),
            ring_buffer_consumer: HeapRb::<f32>::new(1024).split().1,
            is_recording: Arc::new(AtomicBool::new(false)),
            capturing: false,
            device_sample_rate: sample_rate,
            device_channels: channels,
        };
        (capture, played, paused)
    }

    #[test]
    fn stereo_downmix_averages_channels() {
        let result = downmix(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2);
        assert_eq!(result, vec![1.5, 3.5, 5.5]);
    }

    #[test]
    fn four_channel_downmix() {
        let result = downmix(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], 4);
        assert_eq!(result, vec![2.5, 6.5]);
    }

    #[test]
    fn mono_downmix_passes_through() {
        let samples = vec![1.0, 2.0, 3.0];
        assert_eq!(downmix(&samples, 1), samples);
    }

    #[test]
    fn downsampling_48k_to_16k_thirds_the_count() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let result = resample_linear(&samples, 48_000, TARGET_SAMPLE_RATE);
        assert_eq!(result.len(), 3);
        for &s in &result {
            assert!((1.0..=9.0).contains(&s));
        }
    }

    #[test]
    fn upsampling_8k_to_16k_doubles_the_count() {
        let samples = vec![1.0, 2.0, 3.0, 4.0];
        let result = resample_linear(&samples, 8_000, TARGET_SAMPLE_RATE);
        assert_eq!(result.len(), 8);
        for &s in &result {
            assert!((1.0..=4.0).contains(&s));
        }
    }

    #[test]
    fn resampling_preserves_amplitude_bounds() {
        let samples = vec![-1.0, -0.5, 0.0, 0.5, 1.0];
        let result = resample_linear(&samples, 22_050, TARGET_SAMPLE_RATE);
        for &s in &result {
            assert!((-1.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn resampling_empty_input() {
        assert!(resample_linear(&[], 48_000, TARGET_SAMPLE_RATE).is_empty());
    }

    #[test]
    fn conversion_at_target_rate_is_identity() {
        let (capture, _, _) = capture_with_fake_stream(TARGET_SAMPLE_RATE, 1);
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(capture.convert_to_target_rate(&samples), samples);
    }

    #[test]
    fn buffer_statistics() {
        let buffer = CaptureBuffer::from_samples(vec![0.0, 0.5, -1.0, 0.25]);
        assert_eq!(buffer.peak, 1.0);
        assert!(buffer.rms > 0.0 && buffer.rms < 1.0);
    }

    #[test]
    fn empty_buffer_statistics() {
        let buffer = CaptureBuffer::from_samples(Vec::new());
        assert_eq!(buffer.peak, 0.0);
        assert_eq!(buffer.rms, 0.0);
        assert!(buffer.is_very_quiet());
    }

    #[test]
    fn quiet_detection_threshold() {
        let quiet = CaptureBuffer::from_samples(vec![0.001; 100]);
        assert!(quiet.is_very_quiet());

        let audible = CaptureBuffer::from_samples(vec![0.1; 100]);
        assert!(!audible.is_very_quiet());
    }

    #[test]
    fn buffer_duration_at_target_rate() {
        let buffer = CaptureBuffer::from_samples(vec![0.0; TARGET_SAMPLE_RATE as usize]);
        assert_eq!(buffer.duration(), Duration::from_secs(1));
    }

    #[test]
    fn begin_twice_is_rejected() {
        let (mut capture, _, _) = capture_with_fake_stream(TARGET_SAMPLE_RATE, 1);
        capture.begin().unwrap();
        let err = capture.begin().unwrap_err();
        assert!(matches!(err, EngineError::SessionAlreadyActive));
    }

    #[test]
    fn begin_stop_toggles_stream_and_flag() {
        let (mut capture, played, paused) = capture_with_fake_stream(TARGET_SAMPLE_RATE, 1);

        capture.begin().unwrap();
        assert!(played.load(Ordering::Relaxed));
        assert!(capture.is_recording.load(Ordering::Relaxed));

        let _ = capture.stop().unwrap();
        assert!(paused.load(Ordering::Relaxed));
        assert!(!capture.is_recording.load(Ordering::Relaxed));
    }

    #[test]
    fn stop_without_begin_returns_empty_buffer() {
        let (mut capture, _, _) = capture_with_fake_stream(TARGET_SAMPLE_RATE, 1);
        let buffer = capture.stop().unwrap();
        assert!(buffer.samples.is_empty());
    }

    #[test]
    fn begin_is_allowed_again_after_stop() {
        let (mut capture, _, _) = capture_with_fake_stream(TARGET_SAMPLE_RATE, 1);
        capture.begin().unwrap();
        let _ = capture.stop().unwrap();
        assert!(capture.begin().is_ok());
    }

    // Integration tests (require audio hardware, run with: cargo test -- --ignored)

    #[test]
    #[ignore = "requires audio hardware"]
    fn device_capture_initialization() {
        let result = MicCapture::new(Duration::from_secs(30));
        assert!(result.is_ok(), "capture should initialize: {:?}", result.err());
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn device_capture_cycle() {
        let mut capture = MicCapture::new(Duration::from_secs(30)).unwrap();
        capture.begin().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let buffer = capture.stop().unwrap();
        // Sample count depends on the environment; just verify the cycle.
        let _ = buffer;
    }
}
