//! Per-stream frame chain: transform, gain control, conversion, resampling,
//! voice scoring and chunk accumulation.
//!
//! Runs synchronously on the stream's capture thread. Only the transform
//! bridge may leave the thread.

use crate::audio::agc::AutomaticGainController;
use crate::audio::level::rms;
use crate::audio::resample::{StreamResampler, f32_to_i16};
use crate::audio::vad::EnergyVad;
use crate::config::{Config, VoiceScoreSource};
use crate::error::{ClearstreamError, Result, TransformError};
use crate::pipeline::chunk_processor::ChunkProcessor;
use crate::pipeline::clock::Clock;
use crate::pipeline::latency::LatencyTracker;
use crate::pipeline::types::{AudioFrame, Chunk, ProcessedFrame, StreamEvent};
use crate::transform::FrameTransformBridge;
use crossbeam_channel::Sender;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters shared between a stream's capture thread and its observers.
#[derive(Debug, Default)]
pub struct StreamStats {
    frames: AtomicU64,
    dropped: AtomicU64,
    chunks: AtomicU64,
    avg_latency_us: AtomicU64,
    buffered_bytes: AtomicUsize,
    passthrough: AtomicBool,
    rate_mismatch: AtomicBool,
    finished: AtomicBool,
}

/// Point-in-time copy of [`StreamStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StreamStatsSnapshot {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub chunks_emitted: u64,
    pub avg_latency_ms: f64,
    pub buffered_bytes: usize,
    /// The stream runs without the transform.
    pub passthrough: bool,
    /// The source rate differs from `engine.sample_rate`, the rate the
    /// transform's frame size was chosen for.
    pub rate_mismatch: bool,
    pub finished: bool,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            frames_processed: self.frames.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            chunks_emitted: self.chunks.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
            buffered_bytes: self.buffered_bytes.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            rate_mismatch: self.rate_mismatch.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Acquire),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

pub struct StreamProcessor {
    stream_id: String,
    bridge: Option<FrameTransformBridge>,
    /// Bridge taken out of service after a fatal error, kept for shutdown.
    retired: Option<FrameTransformBridge>,
    agc: AutomaticGainController,
    resampler: StreamResampler,
    vad: EnergyVad,
    score_source: VoiceScoreSource,
    chunks: ChunkProcessor,
    latency: LatencyTracker,
    stats: Arc<StreamStats>,
    events: Option<Sender<StreamEvent>>,
    scratch: Vec<i16>,
    resampled: Vec<i16>,
}

impl StreamProcessor {
    /// Build the chain for a source producing `input_rate` audio.
    ///
    /// `bridge == None` runs the stream in passthrough.
    pub fn new(
        stream_id: impl Into<String>,
        config: &Config,
        input_rate: u32,
        bridge: Option<FrameTransformBridge>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let stream_id = stream_id.into();
        if input_rate == 0 {
            return Err(ClearstreamError::InvalidSampleRate { rate: input_rate });
        }
        let frame_size = config.engine.frame_size;
        let frame_time = frame_size as f64 / f64::from(input_rate);
        let target_rate = config.engine.target_sample_rate;

        let stats = Arc::new(StreamStats::default());
        stats.passthrough.store(bridge.is_none(), Ordering::Relaxed);
        if input_rate != config.engine.sample_rate {
            log::warn!(
                "[{}] source runs at {} Hz, transform frames are sized for {} Hz",
                stream_id,
                input_rate,
                config.engine.sample_rate
            );
            stats.rate_mismatch.store(true, Ordering::Relaxed);
        }

        Ok(Self {
            chunks: ChunkProcessor::new(
                stream_id.clone(),
                input_rate,
                target_rate,
                config.vad.segment_config(frame_time),
                clock,
            ),
            stream_id,
            bridge,
            retired: None,
            agc: AutomaticGainController::new(config.agc.clone(), input_rate)?,
            resampler: StreamResampler::new(input_rate, target_rate)?,
            vad: EnergyVad::new(),
            score_source: config.vad.score_source,
            latency: LatencyTracker::new(Duration::from_secs_f64(frame_time)),
            stats,
            events: None,
            scratch: Vec::with_capacity(frame_size),
            resampled: Vec::with_capacity(frame_size),
        })
    }

    /// Send lifecycle events (transform failure) to `events`.
    pub fn with_events(mut self, events: Sender<StreamEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_passthrough(&self) -> bool {
        self.bridge.is_none()
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    /// Frames in the open chunk.
    pub fn pending_frames(&self) -> u64 {
        self.chunks.frame_count()
    }

    /// Run one full frame through the chain.
    pub fn process(&mut self, frame: &mut AudioFrame) {
        let len = frame.len();
        self.process_partial(frame, len);
    }

    /// Run a frame of which only the first `valid` samples are real audio.
    ///
    /// The transform sees the whole (padded) frame; everything after it
    /// only the valid part.
    pub fn process_partial(&mut self, frame: &mut AudioFrame, valid: usize) {
        let started = Instant::now();
        let valid = valid.min(frame.len());
        let input_level = rms(&frame.samples[..valid]);

        let (transform_score, dropped) = self.run_transform(frame);

        let block = &mut frame.samples[..valid];
        let transformed_level = rms(block);
        let energy_score = self.vad.score(block);
        let voice_score = match self.score_source {
            VoiceScoreSource::Transform => transform_score.unwrap_or(energy_score),
            VoiceScoreSource::Energy => energy_score,
        };

        self.agc.process_in_place(block);
        let output_level = rms(block);

        self.scratch.clear();
        self.scratch.extend(block.iter().map(|&s| f32_to_i16(s)));
        self.resampled.clear();
        self.resampler.process(&self.scratch, &mut self.resampled);

        self.chunks.process(&ProcessedFrame {
            sequence: frame.sequence,
            input_samples: valid,
            input_level,
            transformed_level,
            output_level,
            voice_score,
            original_bytes: self.scratch.len() * size_of::<i16>(),
            output: &self.resampled,
            dropped,
        });

        self.latency.record(started.elapsed());
        self.publish_stats(dropped);
    }

    fn run_transform(&mut self, frame: &mut AudioFrame) -> (Option<f32>, bool) {
        let Some(bridge) = self.bridge.as_mut() else {
            return (None, false);
        };
        match bridge.submit(frame) {
            Ok(score) => (score, false),
            Err(ClearstreamError::Transform(TransformError::Fatal(message))) => {
                self.degrade(message);
                (None, true)
            }
            Err(e) => {
                log::debug!(
                    "[{}] frame {} passed through: {}",
                    self.stream_id,
                    frame.sequence,
                    e
                );
                (None, true)
            }
        }
    }

    fn degrade(&mut self, message: String) {
        log::warn!(
            "[{}] transform unusable, continuing in passthrough: {}",
            self.stream_id,
            message
        );
        self.retired = self.bridge.take();
        self.stats.passthrough.store(true, Ordering::Relaxed);
        if let Some(events) = &self.events {
            events
                .send(StreamEvent::TransformFatal {
                    stream_id: self.stream_id.clone(),
                    message,
                })
                .ok();
        }
    }

    fn publish_stats(&self, dropped: bool) {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        if dropped {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(latency) = self.latency.stats() {
            self.stats
                .avg_latency_us
                .store(latency.avg.as_micros() as u64, Ordering::Relaxed);
        }
        self.stats
            .buffered_bytes
            .store(self.chunks.buffered_bytes(), Ordering::Relaxed);
    }

    /// Whether the open chunk holds at least `chunk_duration` of audio.
    pub fn should_roll(&self, chunk_duration: Duration) -> bool {
        self.chunks.frame_count() > 0 && self.chunks.elapsed_secs() >= chunk_duration.as_secs_f64()
    }

    /// Close the open chunk and start the next one.
    pub fn roll(&mut self) -> Chunk {
        let chunk = self.chunks.end();
        self.chunks.start();
        self.stats.chunks.fetch_add(1, Ordering::Relaxed);
        self.stats
            .buffered_bytes
            .store(self.chunks.buffered_bytes(), Ordering::Relaxed);
        chunk
    }

    /// Close the last chunk, including the resampler tail.
    ///
    /// `error` marks the chunk invalid with that message.
    pub fn finish(&mut self, error: Option<String>) -> Chunk {
        self.resampled.clear();
        self.resampler.flush(&mut self.resampled);
        self.chunks.append_samples(&self.resampled);
        if let Some(message) = error {
            self.chunks.fail(message);
        }
        let chunk = self.chunks.end();
        self.stats.chunks.fetch_add(1, Ordering::Relaxed);
        self.stats.buffered_bytes.store(0, Ordering::Relaxed);
        chunk
    }

    /// Stop the transform worker, active or retired.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        let mut result = Ok(());
        for bridge in [self.bridge.as_mut(), self.retired.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = bridge.shutdown(timeout) {
                result = Err(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::MockClock;
    use crate::transform::MockTransform;
    use crate::transform::bridge::TransformMode;

    fn config(frame_size: usize, target_rate: u32) -> Config {
        let mut config = Config::default();
        config.engine.frame_size = frame_size;
        config.engine.target_sample_rate = target_rate;
        config
    }

    fn processor(config: &Config, bridge: Option<FrameTransformBridge>) -> StreamProcessor {
        StreamProcessor::new("s", config, 48_000, bridge, Arc::new(MockClock::new(0.0))).unwrap()
    }

    fn frame(value: f32, len: usize, sequence: u64) -> AudioFrame {
        AudioFrame::new(vec![value; len], Instant::now(), sequence)
    }

    #[test]
    fn test_passthrough_resamples_to_target() {
        let config = config(480, 16_000);
        let mut p = processor(&config, None);
        assert!(p.is_passthrough());

        for i in 0..10 {
            p.process(&mut frame(0.1, 480, i));
        }
        let chunk = p.finish(None);

        assert_eq!(chunk.metrics.frame_count, 10);
        assert_eq!(chunk.metrics.dropped_frames, 0);
        assert_eq!(chunk.sample_rate, 16_000);
        // 4800 input samples at 48k → 1600 at 16k
        assert!((chunk.samples.len() as i64 - 1600).abs() <= 2);
        assert_eq!(chunk.original_size, 4800 * 2);
        assert_eq!(chunk.processed_size, chunk.samples.len() * 2);
        assert_eq!(chunk.noise_removed, chunk.original_size - chunk.processed_size);
        assert!((chunk.duration - 0.1).abs() < 1e-9);
        assert!(chunk.is_valid);
    }

    #[test]
    fn test_frame_failure_passes_frame_through() {
        let config = config(4, 48_000);
        let bridge = FrameTransformBridge::inline(Box::new(
            MockTransform::new(4).with_gain(0.0).with_frame_failure_at(1),
        ));
        let mut p = processor(&config, Some(bridge));

        for i in 0..3 {
            p.process(&mut frame(0.25, 4, i));
        }
        let chunk = p.finish(None);

        assert_eq!(chunk.metrics.frame_count, 3);
        assert_eq!(chunk.metrics.dropped_frames, 1);
        assert!(!p.is_passthrough());
        // Only the failed frame carries audio; the others were zeroed.
        let nonzero = chunk.samples.iter().filter(|&&s| s != 0).count();
        assert_eq!(nonzero, 4);
        assert_eq!(&chunk.samples[0..4], &[0, 0, 0, 0]);
        assert!(chunk.samples[4..8].iter().all(|&s| s != 0));
    }

    #[test]
    fn test_source_rate_checked_against_capture_rate() {
        let config = config(480, 16_000);
        assert!(!processor(&config, None).stats().snapshot().rate_mismatch);

        let p = StreamProcessor::new("s", &config, 44_100, None, Arc::new(MockClock::new(0.0)))
            .unwrap();
        assert!(p.stats().snapshot().rate_mismatch);
    }

    #[test]
    fn test_fatal_switches_to_passthrough_and_reports() {
        let config = config(4, 48_000);
        let bridge =
            FrameTransformBridge::inline(Box::new(MockTransform::new(4).with_fatal_from(2)));
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut p = processor(&config, Some(bridge)).with_events(tx);
        let stats = p.stats();

        for i in 0..5 {
            p.process(&mut frame(0.1, 4, i));
        }

        assert!(p.is_passthrough());
        assert!(stats.snapshot().passthrough);
        // Only the frame that hit the fatal error counts as dropped.
        assert_eq!(stats.snapshot().frames_dropped, 1);
        assert_eq!(stats.snapshot().frames_processed, 5);
        assert!(matches!(
            rx.try_recv(),
            Ok(StreamEvent::TransformFatal { .. })
        ));
        assert!(rx.try_recv().is_err());

        let chunk = p.finish(None);
        assert_eq!(chunk.metrics.frame_count, 5);
        assert_eq!(chunk.samples.len(), 20);
        assert!(p.shutdown(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_transform_score_preferred_over_energy() {
        let config = config(4, 48_000);
        let bridge =
            FrameTransformBridge::inline(Box::new(MockTransform::new(4).with_voice_score(0.9)));
        let mut p = processor(&config, Some(bridge));
        p.process(&mut frame(0.0, 4, 0));
        let chunk = p.finish(None);
        assert_eq!(chunk.vad_timeline[0].score, 0.9);
    }

    #[test]
    fn test_energy_score_source_ignores_transform() {
        let mut config = config(4, 48_000);
        config.vad.score_source = VoiceScoreSource::Energy;
        let bridge =
            FrameTransformBridge::inline(Box::new(MockTransform::new(4).with_voice_score(0.9)));
        let mut p = processor(&config, Some(bridge));
        p.process(&mut frame(0.0, 4, 0));
        let chunk = p.finish(None);
        assert_eq!(chunk.vad_timeline[0].score, 0.0);
    }

    #[test]
    fn test_partial_frame_emits_only_valid_samples() {
        let config = config(8, 48_000);
        let mut p = processor(&config, None);
        let mut f = AudioFrame::new(
            vec![0.1, 0.1, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0],
            Instant::now(),
            0,
        );
        p.process_partial(&mut f, 3);
        let chunk = p.finish(None);
        assert_eq!(chunk.samples.len(), 3);
        assert!((chunk.duration - 3.0 / 48_000.0).abs() < 1e-12);
    }

    #[test]
    fn test_roll_produces_contiguous_chunks() {
        let config = config(480, 16_000);
        let mut p = processor(&config, None);
        let chunk_duration = Duration::from_millis(50);
        let mut chunks = Vec::new();

        for i in 0..12 {
            p.process(&mut frame(0.05, 480, i));
            if p.should_roll(chunk_duration) {
                chunks.push(p.roll());
            }
        }
        chunks.push(p.finish(None));

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].metrics.frame_count, 5);
        assert_eq!(chunks[1].metrics.frame_count, 5);
        assert_eq!(chunks[2].metrics.frame_count, 2);
        for pair in chunks.windows(2) {
            assert!((pair[0].end_time - pair[1].start_time).abs() < 1e-9);
            assert_eq!(pair[0].index + 1, pair[1].index);
        }
        assert_eq!(p.stats().snapshot().chunks_emitted, 3);
    }

    #[test]
    fn test_finish_with_error_marks_chunk_invalid() {
        let config = config(4, 48_000);
        let mut p = processor(&config, None);
        p.process(&mut frame(0.1, 4, 0));
        let chunk = p.finish(Some("device lost".to_string()));
        assert!(!chunk.is_valid);
        assert_eq!(chunk.error_message.as_deref(), Some("device lost"));
        assert_eq!(chunk.metrics.frame_count, 1);
    }

    #[test]
    fn test_worker_bridge_shutdown() {
        let config = config(4, 48_000);
        let bridge = FrameTransformBridge::new(
            Box::new(MockTransform::new(4)),
            TransformMode::Worker,
            Duration::from_secs(1),
        )
        .unwrap();
        let mut p = processor(&config, Some(bridge));
        p.process(&mut frame(0.1, 4, 0));
        assert!(p.shutdown(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_zero_input_rate_rejected() {
        let config = config(4, 48_000);
        let result = StreamProcessor::new("s", &config, 0, None, Arc::new(MockClock::new(0.0)));
        assert!(matches!(
            result,
            Err(ClearstreamError::InvalidSampleRate { rate: 0 })
        ));
    }
}
