//! Default configuration constants for clearstream.
//!
//! Shared by the configuration types and the pipeline components so the
//! numbers live in one place.

/// Default capture sample rate in Hz.
///
/// 48kHz is the native rate of most capture devices and of the RNNoise model.
pub const SAMPLE_RATE: u32 = 48_000;

/// Default rate of the emitted PCM in Hz.
///
/// 16kHz mono is what downstream speech consumers expect.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Default frame size in samples (10ms at 48kHz).
pub const FRAME_SIZE: usize = 480;

/// Largest frame size accepted by configuration validation.
pub const MAX_FRAME_SIZE: usize = 16_384;

/// Default chunk duration in seconds of stream audio.
pub const CHUNK_DURATION_SECS: f64 = 10.0;

/// Longest chunk duration accepted by configuration validation.
pub const MAX_CHUNK_DURATION_SECS: f64 = 600.0;

/// Default AGC target RMS level (normalized amplitude).
pub const AGC_TARGET_LEVEL: f32 = 0.25;

/// Default AGC gain ceiling.
pub const AGC_MAX_GAIN: f32 = 4.0;

/// Default AGC attack time constant in seconds (gain moving down).
pub const AGC_ATTACK_SECS: f32 = 0.01;

/// Default AGC release time constant in seconds (gain moving up).
pub const AGC_RELEASE_SECS: f32 = 0.5;

/// Default voice score threshold for segment detection.
pub const VAD_THRESHOLD: f32 = 0.5;

/// Default time a segment is held open after the score drops.
pub const VAD_HANGOVER_SECS: f64 = 0.3;

/// Default gap below which neighbouring segments are merged.
pub const VAD_MERGE_GAP_SECS: f64 = 0.5;

/// Default minimum segment length kept after closing.
pub const VAD_MIN_SEGMENT_SECS: f64 = 0.1;

/// Smoothing factor of the energy VAD noise floor.
pub const NOISE_FLOOR_SMOOTHING: f32 = 0.95;

/// Lower bound of the energy VAD adaptive threshold (mean square).
pub const MIN_ENERGY_THRESHOLD: f32 = 0.01;

/// Energy VAD score at or above which a frame counts as speech.
pub const SPEECH_SCORE: f32 = 0.5;

/// Default wait for one transform response in worker mode.
pub const TRANSFORM_TIMEOUT_MS: u64 = 100;

/// Default bounded wait for a stream's threads on shutdown.
pub const SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

/// Sleep between polls of a live source that had no samples ready.
pub const POLL_INTERVAL_MS: u64 = 5;

/// Consecutive read failures before a source is considered lost.
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

/// Capacity of the request channel feeding a transform worker.
pub const TRANSFORM_QUEUE_CAPACITY: usize = 4;

/// Number of recent frame latencies kept for statistics.
pub const LATENCY_WINDOW: usize = 512;
