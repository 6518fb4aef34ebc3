//! Frame transform bridge.
//!
//! Owns one input and one output buffer sized to the frame. A submitted
//! frame is copied into the input buffer, transformed into the output buffer,
//! and the result is copied back into the frame's own allocation, so the hot
//! path does not allocate.
//!
//! In worker mode both buffers travel to the worker thread inside the request
//! and come back inside the response. Responses are matched by request id;
//! one left over from a timed-out request is discarded and its buffers are
//! kept as spares.

use crate::defaults;
use crate::error::{ClearstreamError, Result, TransformError};
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::station::StationRunner;
use crate::pipeline::types::AudioFrame;
use crate::transform::FrameTransform;
use crate::transform::worker::{TransformRequest, TransformResponse, TransformStation};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bounded wait for the worker when the bridge is dropped without shutdown.
const DROP_JOIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Where the transform runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformMode {
    /// On the capture thread.
    #[default]
    Inline,
    /// On a dedicated worker thread, with a response timeout.
    Worker,
}

impl fmt::Display for TransformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformMode::Inline => write!(f, "inline"),
            TransformMode::Worker => write!(f, "worker"),
        }
    }
}

impl FromStr for TransformMode {
    type Err = ClearstreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(TransformMode::Inline),
            "worker" => Ok(TransformMode::Worker),
            other => Err(ClearstreamError::invalid_config(
                "transform.mode",
                format!("expected 'inline' or 'worker', got '{other}'"),
            )),
        }
    }
}

/// Counters kept by a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub submitted: u64,
    pub completed: u64,
    pub frame_failures: u64,
    pub timeouts: u64,
    pub stale_responses: u64,
    /// Buffers allocated after construction (a request was lost in flight).
    pub buffer_allocations: u64,
}

enum Host {
    Inline(Box<dyn FrameTransform>),
    Worker(WorkerHost),
}

struct WorkerHost {
    request_tx: Option<Sender<TransformRequest>>,
    response_rx: Option<Receiver<TransformResponse>>,
    runner: Option<StationRunner<TransformStation>>,
    timeout: Duration,
    next_id: u64,
}

/// Spare buffers and counters, split from the host so both can be borrowed.
struct Buffers {
    frame_size: usize,
    input: Option<Vec<f32>>,
    output: Option<Vec<f32>>,
    stats: BridgeStats,
}

impl Buffers {
    fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            input: Some(vec![0.0; frame_size]),
            output: Some(vec![0.0; frame_size]),
            stats: BridgeStats::default(),
        }
    }

    fn take(&mut self) -> (Vec<f32>, Vec<f32>) {
        let input = match self.input.take() {
            Some(buffer) => buffer,
            None => self.allocate(),
        };
        let output = match self.output.take() {
            Some(buffer) => buffer,
            None => self.allocate(),
        };
        (input, output)
    }

    fn allocate(&mut self) -> Vec<f32> {
        self.stats.buffer_allocations += 1;
        vec![0.0; self.frame_size]
    }

    fn restore(&mut self, input: Vec<f32>, output: Vec<f32>) {
        self.input = Some(input);
        self.output = Some(output);
    }
}

pub struct FrameTransformBridge {
    name: String,
    frame_size: usize,
    host: Host,
    buffers: Buffers,
    fatal: Option<String>,
}

impl FrameTransformBridge {
    /// Host the transform on the caller's thread.
    pub fn inline(transform: Box<dyn FrameTransform>) -> Self {
        let frame_size = transform.frame_size();
        Self {
            name: transform.name().to_string(),
            frame_size,
            host: Host::Inline(transform),
            buffers: Buffers::new(frame_size),
            fatal: None,
        }
    }

    /// Host the transform on a dedicated worker thread.
    ///
    /// Each submission waits at most `timeout` for its response.
    pub fn worker(
        transform: Box<dyn FrameTransform>,
        timeout: Duration,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let frame_size = transform.frame_size();
        let name = transform.name().to_string();
        let (request_tx, request_rx) = bounded(defaults::TRANSFORM_QUEUE_CAPACITY);
        let (response_tx, response_rx) = bounded(defaults::TRANSFORM_QUEUE_CAPACITY + 1);

        let runner = StationRunner::spawn(
            TransformStation::new(transform, Arc::clone(&error_reporter)),
            request_rx,
            response_tx,
            error_reporter,
        )?;

        Ok(Self {
            name,
            frame_size,
            host: Host::Worker(WorkerHost {
                request_tx: Some(request_tx),
                response_rx: Some(response_rx),
                runner: Some(runner),
                timeout,
                next_id: 0,
            }),
            buffers: Buffers::new(frame_size),
            fatal: None,
        })
    }

    pub fn new(
        transform: Box<dyn FrameTransform>,
        mode: TransformMode,
        timeout: Duration,
    ) -> Result<Self> {
        match mode {
            TransformMode::Inline => Ok(Self::inline(transform)),
            TransformMode::Worker => Self::worker(transform, timeout, Arc::new(LogReporter)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn mode(&self) -> TransformMode {
        match self.host {
            Host::Inline(_) => TransformMode::Inline,
            Host::Worker(_) => TransformMode::Worker,
        }
    }

    pub fn stats(&self) -> BridgeStats {
        self.buffers.stats
    }

    /// Message of the fatal error that disabled this bridge, if any.
    pub fn failure(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    /// Transform one frame in place and return its voice score.
    ///
    /// On error the frame is left untouched.
    ///
    /// # Errors
    /// - `FrameSizeMismatch` when the frame length differs from the transform's.
    /// - `Transform(FrameFailed)` when the transform failed or timed out on
    ///   this frame only.
    /// - `Transform(Fatal)` when the transform is unusable; every later call
    ///   fails the same way.
    pub fn submit(&mut self, frame: &mut AudioFrame) -> Result<Option<f32>> {
        if frame.samples.len() != self.frame_size {
            return Err(ClearstreamError::FrameSizeMismatch {
                expected: self.frame_size,
                actual: frame.samples.len(),
            });
        }
        if let Some(message) = &self.fatal {
            return Err(TransformError::Fatal(message.clone()).into());
        }

        self.buffers.stats.submitted += 1;
        let (mut input, mut output) = self.buffers.take();
        input.copy_from_slice(&frame.samples);

        let result = match &mut self.host {
            Host::Inline(transform) => {
                let result = transform.process(&input, &mut output);
                self.buffers.restore(input, output);
                result
            }
            Host::Worker(worker) => worker.round_trip(input, output, &mut self.buffers),
        };

        match result {
            Ok(score) => {
                let Some(output) = self.buffers.output.as_deref() else {
                    return Err(self.disable("transform output buffer lost".to_string()));
                };
                frame.samples.copy_from_slice(output);
                self.buffers.stats.completed += 1;
                Ok(score.filter(|s| s.is_finite()).map(|s| s.clamp(0.0, 1.0)))
            }
            Err(TransformError::Fatal(message)) => Err(self.disable(message)),
            Err(error) => {
                self.buffers.stats.frame_failures += 1;
                Err(error.into())
            }
        }
    }

    fn disable(&mut self, message: String) -> ClearstreamError {
        log::error!("transform '{}' disabled: {}", self.name, message);
        self.fatal = Some(message.clone());
        TransformError::Fatal(message).into()
    }

    /// Stop the worker: close its channels and wait up to `timeout`.
    ///
    /// A worker that does not exit in time is detached. Inline bridges have
    /// nothing to stop. Safe to call more than once.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        let Host::Worker(worker) = &mut self.host else {
            return Ok(());
        };
        worker.request_tx.take();
        worker.response_rx.take();
        match worker.runner.take() {
            Some(runner) => runner
                .join_within(timeout)
                .map_err(|message| ClearstreamError::ResourceCleanup { message }),
            None => Ok(()),
        }
    }
}

impl WorkerHost {
    fn round_trip(
        &mut self,
        input: Vec<f32>,
        output: Vec<f32>,
        buffers: &mut Buffers,
    ) -> std::result::Result<Option<f32>, TransformError> {
        let (Some(request_tx), Some(response_rx)) = (&self.request_tx, &self.response_rx) else {
            buffers.restore(input, output);
            return Err(TransformError::Fatal("transform worker shut down".to_string()));
        };

        let id = self.next_id;
        self.next_id += 1;
        let deadline = Instant::now() + self.timeout;

        match request_tx.send_deadline(TransformRequest { id, input, output }, deadline) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(request)) => {
                buffers.restore(request.input, request.output);
                buffers.stats.timeouts += 1;
                return Err(TransformError::FrameFailed(
                    "transform worker queue full".to_string(),
                ));
            }
            Err(SendTimeoutError::Disconnected(request)) => {
                buffers.restore(request.input, request.output);
                return Err(TransformError::Fatal(
                    "transform worker disconnected".to_string(),
                ));
            }
        }

        loop {
            match response_rx.recv_deadline(deadline) {
                Ok(response) if response.id == id => {
                    buffers.restore(response.input, response.output);
                    return response.result;
                }
                Ok(stale) => {
                    log::debug!("discarding stale transform response {} (waiting for {})", stale.id, id);
                    buffers.stats.stale_responses += 1;
                    buffers.restore(stale.input, stale.output);
                    // A late fatal result still means the transform is gone.
                    if let Err(TransformError::Fatal(message)) = stale.result {
                        return Err(TransformError::Fatal(message));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    buffers.stats.timeouts += 1;
                    return Err(TransformError::FrameFailed(format!(
                        "transform timed out after {:?}",
                        self.timeout
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransformError::Fatal(
                        "transform worker disconnected".to_string(),
                    ));
                }
            }
        }
    }
}

impl Drop for FrameTransformBridge {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown(DROP_JOIN_TIMEOUT) {
            log::warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::MockTransform;
    use std::sync::atomic::Ordering;

    fn frame(values: &[f32], sequence: u64) -> AudioFrame {
        AudioFrame::new(values.to_vec(), Instant::now(), sequence)
    }

    fn worker_bridge(transform: MockTransform, timeout: Duration) -> FrameTransformBridge {
        FrameTransformBridge::new(Box::new(transform), TransformMode::Worker, timeout).unwrap()
    }

    struct PanickingTransform;

    impl FrameTransform for PanickingTransform {
        fn frame_size(&self) -> usize {
            2
        }

        fn process(&mut self, _: &[f32], _: &mut [f32]) -> std::result::Result<Option<f32>, TransformError> {
            panic!("transform crashed");
        }
    }

    #[test]
    fn test_inline_transforms_in_place() {
        let mut bridge =
            FrameTransformBridge::inline(Box::new(MockTransform::new(3).with_gain(0.5).with_voice_score(0.7)));
        let mut f = frame(&[0.2, 0.4, -0.6], 0);
        let score = bridge.submit(&mut f).unwrap();

        assert_eq!(f.samples, vec![0.1, 0.2, -0.3]);
        assert_eq!(score, Some(0.7));
        assert_eq!(bridge.mode(), TransformMode::Inline);
    }

    #[test]
    fn test_inline_reuses_buffers() {
        let mut bridge = FrameTransformBridge::inline(Box::new(MockTransform::new(480)));
        for i in 0..100 {
            let mut f = frame(&[0.1; 480], i);
            bridge.submit(&mut f).unwrap();
        }
        let stats = bridge.stats();
        assert_eq!(stats.submitted, 100);
        assert_eq!(stats.completed, 100);
        assert_eq!(stats.buffer_allocations, 0);
    }

    #[test]
    fn test_frame_size_mismatch_is_caller_error() {
        let mut bridge = FrameTransformBridge::inline(Box::new(MockTransform::new(480)));
        let mut f = frame(&[0.0; 256], 0);
        match bridge.submit(&mut f) {
            Err(ClearstreamError::FrameSizeMismatch { expected, actual }) => {
                assert_eq!(expected, 480);
                assert_eq!(actual, 256);
            }
            other => panic!("Expected FrameSizeMismatch, got {:?}", other),
        }
        assert!(bridge.failure().is_none());
        assert_eq!(bridge.stats().submitted, 0);
    }

    #[test]
    fn test_frame_failure_leaves_frame_untouched() {
        let mut bridge = FrameTransformBridge::inline(Box::new(
            MockTransform::new(2).with_gain(2.0).with_frame_failure_at(0),
        ));
        let mut f = frame(&[0.1, 0.2], 0);
        assert!(matches!(
            bridge.submit(&mut f),
            Err(ClearstreamError::Transform(TransformError::FrameFailed(_)))
        ));
        assert_eq!(f.samples, vec![0.1, 0.2]);

        let mut g = frame(&[0.1, 0.2], 1);
        bridge.submit(&mut g).unwrap();
        assert_eq!(g.samples, vec![0.2, 0.4]);
        assert_eq!(bridge.stats().frame_failures, 1);
    }

    #[test]
    fn test_fatal_disables_bridge() {
        let transform = MockTransform::new(1).with_fatal_from(1);
        let calls = transform.call_counter();
        let mut bridge = FrameTransformBridge::inline(Box::new(transform));

        bridge.submit(&mut frame(&[0.0], 0)).unwrap();
        assert!(matches!(
            bridge.submit(&mut frame(&[0.0], 1)),
            Err(ClearstreamError::Transform(TransformError::Fatal(_)))
        ));
        assert!(bridge.failure().is_some());

        // Refused without reaching the transform.
        assert!(matches!(
            bridge.submit(&mut frame(&[0.0], 2)),
            Err(ClearstreamError::Transform(TransformError::Fatal(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_voice_score_is_clamped() {
        let mut bridge =
            FrameTransformBridge::inline(Box::new(MockTransform::new(1).with_voice_score(3.0)));
        assert_eq!(bridge.submit(&mut frame(&[0.0], 0)).unwrap(), Some(1.0));

        let mut bridge =
            FrameTransformBridge::inline(Box::new(MockTransform::new(1).with_voice_score(f32::NAN)));
        assert_eq!(bridge.submit(&mut frame(&[0.0], 0)).unwrap(), None);
    }

    #[test]
    fn test_worker_preserves_order() {
        let mut bridge = worker_bridge(MockTransform::new(4).with_gain(2.0), Duration::from_secs(2));
        assert_eq!(bridge.mode(), TransformMode::Worker);

        for i in 0..200u64 {
            let v = i as f32 / 1000.0;
            let mut f = frame(&[v, v, -v, 0.0], i);
            bridge.submit(&mut f).unwrap();
            assert_eq!(f.samples, vec![2.0 * v, 2.0 * v, -2.0 * v, 0.0]);
        }
        let stats = bridge.stats();
        assert_eq!(stats.completed, 200);
        assert_eq!(stats.buffer_allocations, 0);
        assert_eq!(stats.stale_responses, 0);
        bridge.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_worker_timeout_then_stale_response_discarded() {
        let transform = MockTransform::new(2)
            .with_gain(3.0)
            .with_delay_at(0, Duration::from_millis(150));
        let mut bridge = worker_bridge(transform, Duration::from_millis(50));

        let mut slow = frame(&[0.1, 0.1], 0);
        assert!(matches!(
            bridge.submit(&mut slow),
            Err(ClearstreamError::Transform(TransformError::FrameFailed(_)))
        ));
        assert_eq!(slow.samples, vec![0.1, 0.1]);
        assert_eq!(bridge.stats().timeouts, 1);

        // Let the late response land before the next submission.
        std::thread::sleep(Duration::from_millis(250));

        let mut next = frame(&[0.2, -0.2], 1);
        bridge.submit(&mut next).unwrap();
        assert!((next.samples[0] - 0.6).abs() < 1e-6);
        assert!((next.samples[1] + 0.6).abs() < 1e-6);

        let stats = bridge.stats();
        assert_eq!(stats.stale_responses, 1);
        // Two fresh buffers while the first pair was in flight, no more after.
        assert_eq!(stats.buffer_allocations, 2);

        let mut again = frame(&[0.1, 0.0], 2);
        bridge.submit(&mut again).unwrap();
        assert_eq!(bridge.stats().buffer_allocations, 2);
    }

    #[test]
    fn test_worker_late_fatal_result_disables_bridge() {
        let transform = MockTransform::new(1)
            .with_delay_at(0, Duration::from_millis(100))
            .with_fatal_from(0);
        let mut bridge = worker_bridge(transform, Duration::from_millis(20));

        assert!(matches!(
            bridge.submit(&mut frame(&[0.0], 0)),
            Err(ClearstreamError::Transform(TransformError::FrameFailed(_)))
        ));
        std::thread::sleep(Duration::from_millis(150));

        assert!(matches!(
            bridge.submit(&mut frame(&[0.0], 1)),
            Err(ClearstreamError::Transform(TransformError::Fatal(_)))
        ));
        assert!(bridge.failure().is_some());
        assert_eq!(bridge.stats().stale_responses, 1);
    }

    #[test]
    fn test_worker_fatal_result_disables_bridge() {
        let mut bridge = worker_bridge(MockTransform::new(1).with_fatal_from(0), Duration::from_secs(1));
        assert!(matches!(
            bridge.submit(&mut frame(&[0.0], 0)),
            Err(ClearstreamError::Transform(TransformError::Fatal(_)))
        ));
        assert!(bridge.failure().is_some());
    }

    #[test]
    fn test_worker_crash_is_fatal() {
        let mut bridge = FrameTransformBridge::new(
            Box::new(PanickingTransform),
            TransformMode::Worker,
            Duration::from_secs(1),
        )
        .unwrap();

        let mut f = frame(&[0.5, 0.5], 0);
        assert!(matches!(
            bridge.submit(&mut f),
            Err(ClearstreamError::Transform(TransformError::Fatal(_)))
        ));
        assert_eq!(f.samples, vec![0.5, 0.5]);
        assert!(bridge.submit(&mut f).is_err());
        // The panicked worker is reported when joined.
        assert!(bridge.shutdown(Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_shutdown_detaches_stuck_worker() {
        let transform = MockTransform::new(1).with_delay_at(0, Duration::from_millis(500));
        let mut bridge = worker_bridge(transform, Duration::from_millis(10));
        assert!(bridge.submit(&mut frame(&[0.0], 0)).is_err());

        let started = Instant::now();
        let result = bridge.shutdown(Duration::from_millis(20));
        assert!(matches!(result, Err(ClearstreamError::ResourceCleanup { .. })));
        assert!(started.elapsed() < Duration::from_millis(400));

        // Second shutdown has nothing left to stop.
        assert!(bridge.shutdown(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn test_submit_after_shutdown_is_fatal() {
        let mut bridge = worker_bridge(MockTransform::new(1), Duration::from_secs(1));
        bridge.shutdown(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            bridge.submit(&mut frame(&[0.0], 0)),
            Err(ClearstreamError::Transform(TransformError::Fatal(_)))
        ));
    }

    #[test]
    fn test_transform_mode_parsing() {
        assert_eq!("worker".parse::<TransformMode>().unwrap(), TransformMode::Worker);
        assert_eq!(" Inline ".parse::<TransformMode>().unwrap(), TransformMode::Inline);
        assert!("gpu".parse::<TransformMode>().is_err());
        assert_eq!(TransformMode::Worker.to_string(), "worker");
    }
}
