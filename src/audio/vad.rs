//! Energy-based voice activity scoring.
//!
//! Fallback scorer used when the transform does not report a voice score.
//! Scores frame energy against an adaptive threshold that tracks the noise
//! floor during non-speech frames.

use crate::audio::level::mean_square;
use crate::defaults;

/// Guards the score division against a zero threshold.
const THRESHOLD_FLOOR: f32 = 1e-9;

/// Per-stream energy VAD.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    noise_floor: f32,
    smoothing: f32,
    min_threshold: f32,
    speech_score: f32,
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

impl EnergyVad {
    pub fn new() -> Self {
        Self {
            noise_floor: 0.0,
            smoothing: defaults::NOISE_FLOOR_SMOOTHING,
            min_threshold: defaults::MIN_ENERGY_THRESHOLD,
            speech_score: defaults::SPEECH_SCORE,
        }
    }

    /// Override the noise floor smoothing factor (clamped to [0, 1]).
    pub fn with_smoothing(mut self, smoothing: f32) -> Self {
        self.smoothing = smoothing.clamp(0.0, 1.0);
        self
    }

    /// Override the lower bound of the adaptive threshold.
    pub fn with_min_threshold(mut self, threshold: f32) -> Self {
        self.min_threshold = threshold.max(0.0);
        self
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    /// Current energy threshold: three times the noise floor, never below the
    /// configured minimum.
    pub fn adaptive_threshold(&self) -> f32 {
        (self.noise_floor * 3.0).max(self.min_threshold)
    }

    /// Score one frame in [0, 1].
    ///
    /// Frames scoring below the speech score feed the noise floor estimate.
    pub fn score(&mut self, frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let energy = mean_square(frame);
        let threshold = self.adaptive_threshold().max(THRESHOLD_FLOOR);
        let score = (energy / threshold).min(1.0);

        if score < self.speech_score {
            self.noise_floor = self.smoothing * self.noise_floor + (1.0 - self.smoothing) * energy;
        }
        score
    }

    pub fn is_speech(&self, score: f32) -> bool {
        score >= self.speech_score
    }

    pub fn reset(&mut self) {
        self.noise_floor = 0.0;
    }
}
