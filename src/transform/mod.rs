//! Boundary to the external noise-suppression transform.
//!
//! A [`FrameTransform`] processes exactly one fixed-size frame per call and may
//! report a voice score for it. The [`bridge`] hosts a transform either inline
//! on the capture thread or on a dedicated worker thread.

pub mod bridge;
#[cfg(feature = "rnnoise")]
pub mod rnnoise;
pub mod worker;

pub use bridge::{BridgeStats, FrameTransformBridge};
#[cfg(feature = "rnnoise")]
pub use rnnoise::{RnnoiseFactory, RnnoiseTransform};

use crate::error::TransformError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// A per-frame audio transform.
pub trait FrameTransform: Send {
    /// Frame length this transform accepts.
    fn frame_size(&self) -> usize;

    /// Transform `input` into `output` (both `frame_size()` long).
    ///
    /// Returns the voice score for the frame when the backend produces one.
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<Option<f32>, TransformError>;

    fn name(&self) -> &str {
        "transform"
    }
}

/// Creates one transform instance per stream.
pub trait TransformFactory: Send + Sync {
    fn create(&self, frame_size: usize) -> Result<Box<dyn FrameTransform>, TransformError>;

    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> TransformFactory for F
where
    F: Fn(usize) -> Result<Box<dyn FrameTransform>, TransformError> + Send + Sync,
{
    fn create(&self, frame_size: usize) -> Result<Box<dyn FrameTransform>, TransformError> {
        self(frame_size)
    }
}

/// Copies input to output and reports no voice score.
#[derive(Debug, Clone)]
pub struct PassthroughTransform {
    frame_size: usize,
}

impl PassthroughTransform {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }
}

impl FrameTransform for PassthroughTransform {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<Option<f32>, TransformError> {
        output.copy_from_slice(input);
        Ok(None)
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Factory for [`PassthroughTransform`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughFactory;

impl TransformFactory for PassthroughFactory {
    fn create(&self, frame_size: usize) -> Result<Box<dyn FrameTransform>, TransformError> {
        Ok(Box::new(PassthroughTransform::new(frame_size)))
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Mock transform for testing.
///
/// Scales samples by a fixed gain. Failures and delays are keyed on the call
/// number (0-based), counted across clones.
#[derive(Debug, Clone)]
pub struct MockTransform {
    frame_size: usize,
    gain: f32,
    voice_score: Option<f32>,
    fail_calls: Vec<u64>,
    fatal_from: Option<u64>,
    delay: Option<(u64, Duration)>,
    calls: Arc<AtomicU64>,
}

impl MockTransform {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            gain: 1.0,
            voice_score: None,
            fail_calls: Vec::new(),
            fatal_from: None,
            delay: None,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Multiply every sample by `gain`.
    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    /// Report this voice score for every frame.
    pub fn with_voice_score(mut self, score: f32) -> Self {
        self.voice_score = Some(score);
        self
    }

    /// Return `FrameFailed` on the given call.
    pub fn with_frame_failure_at(mut self, call: u64) -> Self {
        self.fail_calls.push(call);
        self
    }

    /// Return `Fatal` from the given call onwards.
    pub fn with_fatal_from(mut self, call: u64) -> Self {
        self.fatal_from = Some(call);
        self
    }

    /// Sleep for `delay` on the given call.
    pub fn with_delay_at(mut self, call: u64, delay: Duration) -> Self {
        self.delay = Some((call, delay));
        self
    }

    /// Calls made so far, shared with clones.
    pub fn call_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.calls)
    }
}

impl FrameTransform for MockTransform {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<Option<f32>, TransformError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some((at, delay)) = self.delay
            && at == call
        {
            std::thread::sleep(delay);
        }
        if let Some(from) = self.fatal_from
            && call >= from
        {
            return Err(TransformError::Fatal(format!("mock fatal at call {call}")));
        }
        if self.fail_calls.contains(&call) {
            return Err(TransformError::FrameFailed(format!("mock failure at call {call}")));
        }

        for (out, &sample) in output.iter_mut().zip(input) {
            *out = sample * self.gain;
        }
        Ok(self.voice_score)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Factory handing out clones of a template [`MockTransform`].
#[derive(Debug, Clone)]
pub struct MockTransformFactory {
    template: MockTransform,
    create_error: Option<TransformError>,
    create_delay: Duration,
    created: Arc<AtomicUsize>,
}

impl MockTransformFactory {
    pub fn new(template: MockTransform) -> Self {
        Self {
            template,
            create_error: None,
            create_delay: Duration::ZERO,
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail every `create` call with `error`.
    pub fn with_create_error(mut self, error: TransformError) -> Self {
        self.create_error = Some(error);
        self
    }

    /// Sleep in every `create` call, to widen race windows in tests.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Number of `create` calls so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransformFactory for MockTransformFactory {
    fn create(&self, frame_size: usize) -> Result<Box<dyn FrameTransform>, TransformError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            std::thread::sleep(self.create_delay);
        }
        if let Some(error) = &self.create_error {
            return Err(error.clone());
        }
        let mut transform = self.template.clone();
        transform.frame_size = frame_size;
        Ok(Box::new(transform))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
