//! WAV file audio source.

use crate::audio::resample::{downmix_to_mono, f32_to_i16};
use crate::audio::source::AudioSource;
use crate::error::{ClearstreamError, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Samples returned per read: 100ms at 48kHz.
const BLOCK_SIZE: usize = 4800;

/// Audio source that reads from WAV file data.
/// Supports 16-bit integer and 32-bit float files with any channel count,
/// downmixed to mono at the file's own rate.
pub struct WavAudioSource {
    samples: Vec<i16>,
    sample_rate: u32,
    position: usize,
    block_size: usize,
}

impl WavAudioSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ClearstreamError::Device {
            message: format!("Failed to open {}: {}", path.display(), e),
        })?;
        Self::from_reader(BufReader::new(file))
    }

    /// Create from any reader (for testing/flexibility).
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut wav_reader = hound::WavReader::new(reader).map_err(|e| ClearstreamError::Device {
            message: format!("Failed to parse WAV file: {}", e),
        })?;

        let spec = wav_reader.spec();
        if spec.sample_rate == 0 {
            return Err(ClearstreamError::InvalidSampleRate { rate: 0 });
        }

        let read_error = |e: hound::Error| ClearstreamError::Device {
            message: format!("Failed to read WAV samples: {}", e),
        };
        let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => wav_reader
                .samples::<i16>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(read_error)?,
            (hound::SampleFormat::Float, 32) => wav_reader
                .samples::<f32>()
                .map(|s| s.map(f32_to_i16))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(read_error)?,
            (format, bits) => {
                return Err(ClearstreamError::AudioFormatMismatch {
                    expected: "16-bit int or 32-bit float".to_string(),
                    actual: format!("{bits}-bit {format:?}"),
                });
            }
        };

        log::debug!(
            "wav: {} Hz, {} channel(s), {} frames",
            spec.sample_rate,
            spec.channels,
            interleaved.len() / usize::from(spec.channels.max(1))
        );

        Ok(Self {
            samples: downmix_to_mono(&interleaved, spec.channels),
            sample_rate: spec.sample_rate,
            position: 0,
            block_size: BLOCK_SIZE,
        })
    }

    /// Samples per `read_samples` call.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Length in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    /// Consume the source and return all samples as a single buffer.
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

impl AudioSource for WavAudioSource {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.position >= self.samples.len() {
            return Ok(Vec::new());
        }

        let end = std::cmp::min(self.position + self.block_size, self.samples.len());
        let block = self.samples[self.position..end].to_vec();
        self.position = end;

        Ok(block)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_finite(&self) -> bool {
        true
    }
}

/// Write mono 16-bit PCM to a WAV file.
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let to_io = |e: hound::Error| match e {
        hound::Error::IoError(io) => ClearstreamError::Io(io),
        other => ClearstreamError::Other(format!("Failed to write {}: {}", path.display(), other)),
    };
    let mut writer = hound::WavWriter::create(path, spec).map_err(to_io)?;
    for &sample in samples {
        writer.write_sample(sample).map_err(to_io)?;
    }
    writer.finalize().map_err(to_io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_wav_data(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn from_reader_keeps_native_rate() {
        let input_samples = vec![100i16, 200, 300, 400, 500];
        let wav_data = make_wav_data(44_100, 1, &input_samples);

        let source = WavAudioSource::from_reader(Cursor::new(wav_data)).unwrap();

        assert_eq!(source.sample_rate(), 44_100);
        assert!(source.is_finite());
        assert_eq!(source.into_samples(), input_samples);
    }

    #[test]
    fn from_reader_stereo_downmixes_to_mono() {
        // Stereo pairs: (100, 200), (300, 400), (500, 600)
        let stereo_samples = vec![100i16, 200, 300, 400, 500, 600];
        let wav_data = make_wav_data(48_000, 2, &stereo_samples);

        let source = WavAudioSource::from_reader(Cursor::new(wav_data)).unwrap();

        assert_eq!(source.into_samples(), vec![150i16, 350, 550]);
    }

    #[test]
    fn from_reader_float_samples_are_converted() {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for s in [0.0f32, 0.5, -1.0] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let source = WavAudioSource::from_reader(Cursor::new(cursor.into_inner())).unwrap();
        assert_eq!(source.into_samples(), vec![0, 16384, -32768]);
    }

    #[test]
    fn from_reader_rejects_8_bit() {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 8,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        writer.write_sample(3i8).unwrap();
        writer.finalize().unwrap();

        assert!(matches!(
            WavAudioSource::from_reader(Cursor::new(cursor.into_inner())),
            Err(ClearstreamError::AudioFormatMismatch { .. })
        ));
    }

    #[test]
    fn from_reader_invalid_data_fails() {
        assert!(matches!(
            WavAudioSource::from_reader(Cursor::new(b"not a wav".to_vec())),
            Err(ClearstreamError::Device { .. })
        ));
    }

    #[test]
    fn read_samples_returns_blocks_then_empty() {
        let wav_data = make_wav_data(16_000, 1, &[1i16; 5000]);
        let mut source = WavAudioSource::from_reader(Cursor::new(wav_data))
            .unwrap()
            .with_block_size(1600);

        assert_eq!(source.read_samples().unwrap().len(), 1600);
        assert_eq!(source.read_samples().unwrap().len(), 1600);
        assert_eq!(source.read_samples().unwrap().len(), 1600);
        assert_eq!(source.read_samples().unwrap().len(), 200);
        assert!(source.read_samples().unwrap().is_empty());
        assert!(source.read_samples().unwrap().is_empty());
    }

    #[test]
    fn duration_matches_length() {
        let wav_data = make_wav_data(16_000, 1, &[0i16; 8000]);
        let source = WavAudioSource::from_reader(Cursor::new(wav_data)).unwrap();
        assert!((source.duration_secs() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn write_wav_round_trips_through_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.wav");
        write_wav(&path, &[1, -2, 3], 16_000).unwrap();

        let source = WavAudioSource::open(&path).unwrap();
        assert_eq!(source.sample_rate(), 16_000);
        assert_eq!(source.into_samples(), vec![1, -2, 3]);
    }

    #[test]
    fn open_missing_file_is_device_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            WavAudioSource::open(&dir.path().join("missing.wav")),
            Err(ClearstreamError::Device { .. })
        ));
    }
}
