//! Data types flowing through the enhancement pipeline.

use serde::Serialize;
use std::time::Instant;

/// A fixed-size block of normalized samples with timing information.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples normalized to [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Timestamp when this frame was assembled from capture.
    pub timestamp: Instant,
    /// Sequence number for ordering and gap detection.
    pub sequence: u64,
}

impl AudioFrame {
    /// Creates a new audio frame.
    pub fn new(samples: Vec<f32>, timestamp: Instant, sequence: u64) -> Self {
        Self {
            samples,
            timestamp,
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Audio duration of this frame at `sample_rate`.
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(sample_rate)
    }
}

/// A frame after the post-processing chain, as seen by the chunk processor.
#[derive(Debug, Clone, Copy)]
pub struct ProcessedFrame<'a> {
    pub sequence: u64,
    /// Samples this frame covers at the input rate.
    pub input_samples: usize,
    /// RMS before the transform.
    pub input_level: f32,
    /// RMS after the transform, before gain control.
    pub transformed_level: f32,
    /// RMS after gain control.
    pub output_level: f32,
    /// Voice score in [0, 1].
    pub voice_score: f32,
    /// Byte size of the transform output as 16-bit PCM.
    pub original_bytes: usize,
    /// Emitted PCM at the output rate.
    pub output: &'a [i16],
    /// Whether the transform failed on this frame and it passed through.
    pub dropped: bool,
}

/// Voice score of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoiceActivityPoint {
    /// Seconds from the start of the chunk.
    pub time: f64,
    pub score: f32,
}

/// A span of voice activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoiceSegment {
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f32,
}

impl VoiceSegment {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Aggregate quality figures for one chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingMetrics {
    /// Mean RMS of the raw input frames.
    pub input_level: f32,
    /// Mean RMS of the emitted frames.
    pub output_level: f32,
    /// Level reduction by the transform, in percent [0, 100].
    pub noise_reduction_percent: f32,
    pub frame_count: u64,
    pub dropped_frames: u64,
    /// Wall-clock time between chunk start and end, in milliseconds.
    pub processing_latency_ms: f64,
    /// Milliseconds since the UNIX epoch at finalization.
    pub timestamp_ms: u64,
}

/// A finalized, time-bounded piece of processed stream output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// `"{stream}-{index}"`.
    pub id: String,
    pub index: u64,
    pub stream_id: String,
    /// Seconds of stream audio.
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    /// Bytes of transform output before gain control and resampling.
    pub original_size: usize,
    /// Bytes of emitted PCM.
    pub processed_size: usize,
    pub noise_removed: usize,
    pub average_vad: f32,
    pub vad_timeline: Vec<VoiceActivityPoint>,
    pub segments: Vec<VoiceSegment>,
    /// Emitted mono PCM at `sample_rate`.
    #[serde(skip)]
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub metrics: ProcessingMetrics,
    pub is_valid: bool,
    pub error_message: Option<String>,
}

impl Chunk {
    /// Share of the chunk covered by voice segments, in [0, 1].
    pub fn voice_ratio(&self) -> f64 {
        if self.duration <= 0.0 {
            return 0.0;
        }
        let voiced: f64 = self.segments.iter().map(VoiceSegment::duration).sum();
        (voiced / self.duration).clamp(0.0, 1.0)
    }
}

/// Lifecycle notifications from a stream's capture thread.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Started {
        stream_id: String,
    },
    ChunkEmitted {
        stream_id: String,
        index: u64,
    },
    /// The transform became unusable; the stream continues in passthrough.
    TransformFatal {
        stream_id: String,
        message: String,
    },
    /// The capture thread finished. `error` is set when the device was lost.
    Ended {
        stream_id: String,
        error: Option<String>,
    },
}

impl StreamEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            StreamEvent::Started { stream_id }
            | StreamEvent::ChunkEmitted { stream_id, .. }
            | StreamEvent::TransformFatal { stream_id, .. }
            | StreamEvent::Ended { stream_id, .. } => stream_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frame_creation() {
        let now = Instant::now();
        let frame = AudioFrame::new(vec![0.1, 0.2, 0.3], now, 42);
        assert_eq!(frame.len(), 3);
        assert!(!frame.is_empty());
        assert_eq!(frame.timestamp, now);
        assert_eq!(frame.sequence, 42);
    }

    #[test]
    fn test_audio_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 480], Instant::now(), 0);
        assert!((frame.duration_secs(48_000) - 0.01).abs() < 1e-12);
        assert_eq!(frame.duration_secs(0), 0.0);
    }

    #[test]
    fn test_voice_segment_duration() {
        let segment = VoiceSegment {
            start_time: 1.5,
            end_time: 4.0,
            confidence: 0.9,
        };
        assert_eq!(segment.duration(), 2.5);
    }

    #[test]
    fn test_stream_event_id() {
        let event = StreamEvent::Ended {
            stream_id: "mic".to_string(),
            error: None,
        };
        assert_eq!(event.stream_id(), "mic");
    }

    #[test]
    fn test_chunk_json_omits_samples() {
        let chunk = Chunk {
            id: "s-0".to_string(),
            index: 0,
            stream_id: "s".to_string(),
            start_time: 0.0,
            end_time: 1.0,
            duration: 1.0,
            original_size: 96_000,
            processed_size: 32_000,
            noise_removed: 64_000,
            average_vad: 0.5,
            vad_timeline: Vec::new(),
            segments: vec![VoiceSegment {
                start_time: 0.0,
                end_time: 0.25,
                confidence: 0.8,
            }],
            samples: vec![1, 2, 3],
            sample_rate: 16_000,
            metrics: ProcessingMetrics::default(),
            is_valid: true,
            error_message: None,
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert!(json.get("samples").is_none());
        assert_eq!(json["id"], "s-0");
        assert_eq!(json["noise_removed"], 64_000);
        assert!((chunk.voice_ratio() - 0.25).abs() < 1e-12);
    }
}
