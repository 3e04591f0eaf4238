//! WAV encode/decode helpers shared by the preprocessor and providers.
//!
//! Everything here is fixed-format: 16 kHz, mono, 16-bit PCM — the shape the
//! transcription backends expect.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use std::path::Path;

use crate::audio::capture::TARGET_SAMPLE_RATE;

fn spec() -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Encodes samples into an in-memory WAV (for multipart upload).
///
/// # Errors
/// Returns an error if WAV serialization fails.
pub fn encode(samples: &[f32]) -> Result<Vec<u8>, hound::Error> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec())?;
        for &sample in samples {
            writer.write_sample(to_i16(sample))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Writes samples to a WAV file (for subprocess handoff).
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_file(path: &Path, samples: &[f32]) -> Result<(), hound::Error> {
    let mut writer = WavWriter::create(path, spec())?;
    for &sample in samples {
        writer.write_sample(to_i16(sample))?;
    }
    writer.finalize()
}

/// Reads a mono WAV file back into f32 samples, accepting 16-bit int or
/// float encodings (ffmpeg emits the former, debug dumps the latter).
///
/// # Errors
/// Returns an error if the file is missing, truncated, or not a WAV.
pub fn read_file(path: &Path) -> Result<Vec<f32>, hound::Error> {
    let mut reader = WavReader::open(path)?;
    let format = reader.spec().sample_format;
    match format {
        SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|v| f32::from(v) / f32::from(i16::MAX)))
            .collect(),
        SampleFormat::Float => reader.samples::<f32>().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_parseable_wav() {
        let bytes = encode(&[0.0, 0.5, -0.5, 1.0]).unwrap();
        let reader = WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 4);
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let bytes = encode(&[2.0, -2.0]).unwrap();
        let mut reader = WavReader::new(Cursor::new(bytes)).unwrap();
        let decoded: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(decoded, vec![i16::MAX, -i16::MAX]);
    }

    #[test]
    fn file_round_trip_preserves_samples_approximately() {
        let dir = std::env::temp_dir().join("termina-wav-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roundtrip.wav");

        let original = vec![0.0, 0.25, -0.25, 0.9, -0.9];
        write_file(&path, &original).unwrap();
        let restored = read_file(&path).unwrap();

        assert_eq!(restored.len(), original.len());
        for (a, b) in original.iter().zip(&restored) {
            assert!((a - b).abs() < 1.0 / 16_384.0, "{a} vs {b}");
        }

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn read_missing_file_errors() {
        assert!(read_file(Path::new("/tmp/termina-nonexistent.wav")).is_err());
    }

    #[test]
    fn empty_input_encodes_to_valid_header() {
        let bytes = encode(&[]).unwrap();
        let reader = WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.len(), 0);
    }
}
