//! Worker-thread hosting of a transform.
//!
//! Requests move the bridge's input and output buffers to the worker and
//! responses move them back, so a buffer is only ever touched by one side.

use crate::error::TransformError;
use crate::pipeline::error::{ErrorReporter, StationError};
use crate::pipeline::station::Station;
use crate::transform::FrameTransform;
use std::sync::Arc;

/// One frame sent to the worker.
#[derive(Debug)]
pub struct TransformRequest {
    pub id: u64,
    pub input: Vec<f32>,
    pub output: Vec<f32>,
}

/// The worker's answer, carrying both buffers back.
#[derive(Debug)]
pub struct TransformResponse {
    pub id: u64,
    pub input: Vec<f32>,
    pub output: Vec<f32>,
    pub result: Result<Option<f32>, TransformError>,
}

/// Station wrapping a transform.
///
/// Every request is answered, failed or not. Per-frame failures are also
/// reported as recoverable station errors.
pub struct TransformStation {
    transform: Box<dyn FrameTransform>,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl TransformStation {
    pub fn new(transform: Box<dyn FrameTransform>, error_reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            transform,
            error_reporter,
        }
    }
}

impl Station for TransformStation {
    type Input = TransformRequest;
    type Output = TransformResponse;

    fn process(&mut self, request: TransformRequest) -> Result<Option<TransformResponse>, StationError> {
        let TransformRequest {
            id,
            input,
            mut output,
        } = request;
        let result = self.transform.process(&input, &mut output);
        if let Err(TransformError::FrameFailed(message)) = &result {
            self.error_reporter.report(
                self.name(),
                &StationError::Recoverable(format!("frame {id}: {message}")),
            );
        }
        Ok(Some(TransformResponse {
            id,
            input,
            output,
            result,
        }))
    }

    fn name(&self) -> &'static str {
        "transform"
    }

    fn shutdown(&mut self) {
        log::debug!("transform worker '{}' shutting down", self.transform.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::LogReporter;
    use crate::transform::MockTransform;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingReporter {
        errors: Mutex<Vec<String>>,
    }

    impl ErrorReporter for CollectingReporter {
        fn report(&self, station: &str, error: &StationError) {
            self.errors.lock().unwrap().push(format!("{station}: {error}"));
        }
    }

    fn request(id: u64, input: Vec<f32>) -> TransformRequest {
        let output = vec![0.0; input.len()];
        TransformRequest { id, input, output }
    }

    #[test]
    fn test_station_returns_buffers_with_result() {
        let mut station = TransformStation::new(
            Box::new(MockTransform::new(2).with_gain(2.0)),
            Arc::new(LogReporter),
        );
        let response = station
            .process(TransformRequest {
                id: 9,
                input: vec![0.1, 0.2],
                output: vec![0.0; 2],
            })
            .unwrap()
            .unwrap();

        assert_eq!(response.id, 9);
        assert_eq!(response.input, vec![0.1, 0.2]);
        assert_eq!(response.output, vec![0.2, 0.4]);
        assert_eq!(response.result, Ok(None));
    }

    #[test]
    fn test_station_passes_transform_errors_back() {
        let reporter = Arc::new(CollectingReporter::default());
        let mut station = TransformStation::new(
            Box::new(MockTransform::new(1).with_frame_failure_at(1)),
            Arc::clone(&reporter) as Arc<dyn ErrorReporter>,
        );

        let ok = station.process(request(0, vec![0.0])).unwrap().unwrap();
        assert!(ok.result.is_ok());
        assert!(reporter.errors.lock().unwrap().is_empty());

        let failed = station.process(request(1, vec![0.0])).unwrap().unwrap();
        assert!(matches!(failed.result, Err(TransformError::FrameFailed(_))));
        assert_eq!(failed.output.len(), 1);

        let errors = reporter.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("transform: Recoverable error: frame 1:"));
    }

    #[test]
    fn test_station_leaves_fatal_results_to_the_bridge() {
        let reporter = Arc::new(CollectingReporter::default());
        let mut station = TransformStation::new(
            Box::new(MockTransform::new(1).with_fatal_from(0)),
            Arc::clone(&reporter) as Arc<dyn ErrorReporter>,
        );

        let response = station.process(request(0, vec![0.0])).unwrap().unwrap();
        assert!(matches!(response.result, Err(TransformError::Fatal(_))));
        assert!(reporter.errors.lock().unwrap().is_empty());
    }
}
