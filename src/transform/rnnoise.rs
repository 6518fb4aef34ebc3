//! RNNoise-backed noise suppression via `nnnoiseless`.

use crate::error::TransformError;
use crate::transform::{FrameTransform, TransformFactory};
use nnnoiseless::DenoiseState;

/// `nnnoiseless` works on i16-range floats.
const SCALE: f32 = 32768.0;

/// RNNoise transform over 480-sample frames at 48kHz.
pub struct RnnoiseTransform {
    state: Box<DenoiseState<'static>>,
    scaled_input: Vec<f32>,
    scaled_output: Vec<f32>,
}

impl RnnoiseTransform {
    pub const FRAME_SIZE: usize = DenoiseState::<'static>::FRAME_SIZE;

    pub fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            scaled_input: vec![0.0; Self::FRAME_SIZE],
            scaled_output: vec![0.0; Self::FRAME_SIZE],
        }
    }
}

impl Default for RnnoiseTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTransform for RnnoiseTransform {
    fn frame_size(&self) -> usize {
        Self::FRAME_SIZE
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<Option<f32>, TransformError> {
        if input.len() != Self::FRAME_SIZE || output.len() != Self::FRAME_SIZE {
            return Err(TransformError::FrameFailed(format!(
                "rnnoise needs {} samples, got {}",
                Self::FRAME_SIZE,
                input.len()
            )));
        }

        for (scaled, &sample) in self.scaled_input.iter_mut().zip(input) {
            *scaled = sample * SCALE;
        }
        let voice_probability = self
            .state
            .process_frame(&mut self.scaled_output, &self.scaled_input);
        for (out, &scaled) in output.iter_mut().zip(&self.scaled_output) {
            *out = scaled / SCALE;
        }

        if !voice_probability.is_finite() {
            return Ok(None);
        }
        Ok(Some(voice_probability.clamp(0.0, 1.0)))
    }

    fn name(&self) -> &str {
        "rnnoise"
    }
}

/// Creates an [`RnnoiseTransform`] per stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct RnnoiseFactory;

impl TransformFactory for RnnoiseFactory {
    fn create(&self, frame_size: usize) -> Result<Box<dyn FrameTransform>, TransformError> {
        if frame_size != RnnoiseTransform::FRAME_SIZE {
            return Err(TransformError::Fatal(format!(
                "rnnoise requires {}-sample frames, configured {}",
                RnnoiseTransform::FRAME_SIZE,
                frame_size
            )));
        }
        Ok(Box::new(RnnoiseTransform::new()))
    }

    fn name(&self) -> &str {
        "rnnoise"
    }
}
