use crate::defaults;
use crate::error::{ClearstreamError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pull interface over a capture device or file.
///
/// The stream manager drives a source from its capture thread: `start()` once,
/// then `read_samples()` in a loop, then `stop()`. Samples are mono 16-bit PCM
/// at `sample_rate()`.
pub trait AudioSource: Send {
    /// Start capturing audio from the source.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio from the source.
    fn stop(&mut self) -> Result<()>;

    /// Read the samples captured since the last call.
    ///
    /// An empty vector means nothing is ready yet, or for a finite source,
    /// that the source is exhausted.
    fn read_samples(&mut self) -> Result<Vec<i16>>;

    /// Rate of the samples returned by `read_samples`.
    fn sample_rate(&self) -> u32;

    /// Whether this source has a natural end (file, fixture).
    fn is_finite(&self) -> bool {
        false
    }
}

/// Mock audio source for testing
#[derive(Debug, Clone)]
pub struct MockAudioSource {
    is_started: bool,
    samples: Vec<i16>,
    sample_rate: u32,
    max_reads: Option<usize>,
    fail_reads_after: Option<usize>,
    reads: usize,
    should_fail_start: bool,
    should_fail_stop: bool,
    error_message: String,
    stop_calls: Arc<AtomicUsize>,
}

impl MockAudioSource {
    /// Create a new mock audio source with default settings
    pub fn new() -> Self {
        Self {
            is_started: false,
            samples: vec![0i16; defaults::FRAME_SIZE],
            sample_rate: defaults::SAMPLE_RATE,
            max_reads: None,
            fail_reads_after: None,
            reads: 0,
            should_fail_start: false,
            should_fail_stop: false,
            error_message: "mock audio error".to_string(),
            stop_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Configure the block returned by every read
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Make the source finite: after `reads` blocks it returns empty reads
    pub fn with_max_reads(mut self, reads: usize) -> Self {
        self.max_reads = Some(reads);
        self
    }

    /// Fail every read after the first `reads` successful ones
    pub fn with_read_failure_after(mut self, reads: usize) -> Self {
        self.fail_reads_after = Some(reads);
        self
    }

    /// Fail every read
    pub fn with_read_failure(self) -> Self {
        self.with_read_failure_after(0)
    }

    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    pub fn with_stop_failure(mut self) -> Self {
        self.should_fail_stop = true;
        self
    }

    /// Configure the error message for failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    pub fn is_started(&self) -> bool {
        self.is_started
    }

    /// Counter of `stop()` calls, shared with clones of this source.
    pub fn stop_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stop_calls)
    }

    fn device_error(&self) -> ClearstreamError {
        ClearstreamError::Device {
            message: self.error_message.clone(),
        }
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(self.device_error());
        }
        self.is_started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail_stop {
            return Err(self.device_error());
        }
        self.is_started = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if let Some(limit) = self.fail_reads_after
            && self.reads >= limit
        {
            return Err(self.device_error());
        }
        if let Some(limit) = self.max_reads
            && self.reads >= limit
        {
            return Ok(Vec::new());
        }
        self.reads += 1;
        Ok(self.samples.clone())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_finite(&self) -> bool {
        self.max_reads.is_some()
    }
}
