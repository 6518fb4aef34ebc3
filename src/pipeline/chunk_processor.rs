//! Chunk assembly: accumulates processed frames and finalizes them into a
//! [`Chunk`] with metrics, VAD timeline and voice segments.
//!
//! The processor does not decide chunk boundaries. Its owner reads
//! [`ChunkProcessor::elapsed_secs`] and calls [`ChunkProcessor::end`] followed
//! by [`ChunkProcessor::start`] when a chunk is long enough.

use crate::audio::segment::{SegmentConfig, SegmentDetector};
use crate::pipeline::clock::Clock;
use crate::pipeline::types::{Chunk, ProcessedFrame, ProcessingMetrics, VoiceActivityPoint};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct ChunkProcessor {
    stream_id: String,
    input_rate: u32,
    output_rate: u32,
    segment_config: SegmentConfig,
    clock: Arc<dyn Clock>,

    index: u64,
    /// Stream position in input samples.
    position: u64,
    chunk_start: u64,
    started_at_ms: Option<f64>,

    frame_count: u64,
    dropped_frames: u64,
    input_level_sum: f64,
    transformed_level_sum: f64,
    output_level_sum: f64,
    vad_sum: f64,
    original_bytes: usize,
    samples: Vec<i16>,
    timeline: Vec<VoiceActivityPoint>,
    error: Option<String>,
}

impl ChunkProcessor {
    pub fn new(
        stream_id: impl Into<String>,
        input_rate: u32,
        output_rate: u32,
        segment_config: SegmentConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            input_rate,
            output_rate,
            segment_config,
            clock,
            index: 0,
            position: 0,
            chunk_start: 0,
            started_at_ms: None,
            frame_count: 0,
            dropped_frames: 0,
            input_level_sum: 0.0,
            transformed_level_sum: 0.0,
            output_level_sum: 0.0,
            vad_sum: 0.0,
            original_bytes: 0,
            samples: Vec::new(),
            timeline: Vec::new(),
            error: None,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Index the next emitted chunk will carry.
    pub fn next_index(&self) -> u64 {
        self.index
    }

    pub fn is_started(&self) -> bool {
        self.started_at_ms.is_some()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Bytes currently held for the open chunk.
    pub fn buffered_bytes(&self) -> usize {
        self.samples.len() * size_of::<i16>()
            + self.timeline.len() * size_of::<VoiceActivityPoint>()
    }

    /// Begin a chunk: samples the clock and resets accumulators.
    pub fn start(&mut self) {
        self.reset_accumulators();
        self.chunk_start = self.position;
        self.started_at_ms = Some(self.clock.now_ms());
    }

    /// Add one frame to the open chunk, starting one if needed.
    pub fn process(&mut self, frame: &ProcessedFrame<'_>) {
        if !self.is_started() {
            log::debug!("[{}] chunk processor started implicitly", self.stream_id);
            self.start();
        }

        let offset = (self.position - self.chunk_start) as f64 / f64::from(self.input_rate);
        let score = frame.voice_score.clamp(0.0, 1.0);
        self.timeline.push(VoiceActivityPoint {
            time: offset,
            score,
        });

        self.frame_count += 1;
        if frame.dropped {
            self.dropped_frames += 1;
        }
        self.input_level_sum += f64::from(frame.input_level);
        self.transformed_level_sum += f64::from(frame.transformed_level);
        self.output_level_sum += f64::from(frame.output_level);
        self.vad_sum += f64::from(score);
        self.original_bytes += frame.original_bytes;
        self.samples.extend_from_slice(frame.output);
        self.position += frame.input_samples as u64;
    }

    /// Append emitted samples that belong to no frame (resampler tail).
    pub fn append_samples(&mut self, samples: &[i16]) {
        self.samples.extend_from_slice(samples);
    }

    /// Mark the open chunk as failed; it is emitted with `is_valid == false`.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// Seconds of stream audio in the open chunk.
    pub fn elapsed_secs(&self) -> f64 {
        (self.position - self.chunk_start) as f64 / f64::from(self.input_rate)
    }

    /// Finalize the open chunk.
    ///
    /// Always returns a chunk. With no frames it is empty and invalid.
    pub fn end(&mut self) -> Chunk {
        let end_ms = self.clock.now_ms();
        let start_ms = self.started_at_ms.take().unwrap_or(end_ms);
        let processing_latency_ms = (end_ms - start_ms).max(0.0);

        let start_time = self.chunk_start as f64 / f64::from(self.input_rate);
        let duration = self.elapsed_secs();
        let end_time = start_time + duration;

        let frames = self.frame_count.max(1) as f64;
        let input_level = (self.input_level_sum / frames) as f32;
        let transformed_level = (self.transformed_level_sum / frames) as f32;
        let output_level = (self.output_level_sum / frames) as f32;
        let average_vad = (self.vad_sum / frames) as f32;

        let noise_reduction_percent = if input_level > 0.0 {
            ((1.0 - transformed_level / input_level) * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        let timeline = std::mem::take(&mut self.timeline);
        let segments = SegmentDetector::new(self.segment_config).detect(&timeline);
        let samples = std::mem::take(&mut self.samples);
        let processed_size = samples.len() * size_of::<i16>();
        let error_message = self.error.take();

        let chunk = Chunk {
            id: format!("{}-{}", self.stream_id, self.index),
            index: self.index,
            stream_id: self.stream_id.clone(),
            start_time,
            end_time,
            duration,
            original_size: self.original_bytes,
            processed_size,
            noise_removed: self.original_bytes.saturating_sub(processed_size),
            average_vad,
            vad_timeline: timeline,
            segments,
            samples,
            sample_rate: self.output_rate,
            metrics: ProcessingMetrics {
                input_level,
                output_level,
                noise_reduction_percent,
                frame_count: self.frame_count,
                dropped_frames: self.dropped_frames,
                processing_latency_ms,
                timestamp_ms: epoch_ms(),
            },
            is_valid: self.frame_count > 0 && error_message.is_none(),
            error_message,
        };

        self.index += 1;
        self.chunk_start = self.position;
        self.reset_accumulators();
        chunk
    }

    fn reset_accumulators(&mut self) {
        self.frame_count = 0;
        self.dropped_frames = 0;
        self.input_level_sum = 0.0;
        self.transformed_level_sum = 0.0;
        self.output_level_sum = 0.0;
        self.vad_sum = 0.0;
        self.original_bytes = 0;
        self.samples.clear();
        self.timeline.clear();
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
