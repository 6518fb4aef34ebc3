//! Core station abstraction and runner.
//!
//! A station owns a piece of work that runs on its own thread, fed by one
//! channel and feeding another. The transform worker is hosted this way.

use crate::pipeline::error::{ErrorReporter, StationError};
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll interval while waiting for a thread to finish.
const JOIN_POLL: Duration = Duration::from_millis(5);

/// A processing station.
///
/// Each station receives input, processes it, and produces output.
/// Stations run in their own threads and are connected by channels.
pub trait Station: Send + 'static {
    /// The input type this station receives.
    type Input: Send + 'static;
    /// The output type this station produces.
    type Output: Send + 'static;

    /// Processes a single input item.
    ///
    /// Returns:
    /// - `Ok(Some(output))` - Successfully processed and produced output
    /// - `Ok(None)` - Successfully processed but no output (e.g., filtered)
    /// - `Err(StationError)` - Processing failed
    fn process(&mut self, input: Self::Input) -> Result<Option<Self::Output>, StationError>;

    /// Returns the name of this station for logging and error reporting.
    fn name(&self) -> &'static str;

    /// Called when the station is shutting down.
    fn shutdown(&mut self) {}
}

/// Runs a station in a dedicated thread.
pub struct StationRunner<S: Station> {
    handle: Option<JoinHandle<()>>,
    station_name: &'static str,
    _phantom: PhantomData<S>,
}

impl<S: Station> StationRunner<S> {
    /// Spawns a new station in a dedicated, named thread.
    ///
    /// The station runs until its input channel disconnects, its output
    /// channel disconnects, or it returns a fatal error.
    ///
    /// # Errors
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn(
        mut station: S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> std::io::Result<Self> {
        let station_name = station.name();

        let handle = thread::Builder::new()
            .name(format!("station-{station_name}"))
            .spawn(move || {
                Self::run_station(&mut station, input_rx, output_tx, error_reporter);
            })?;

        Ok(Self {
            handle: Some(handle),
            station_name,
            _phantom: PhantomData,
        })
    }

    fn run_station(
        station: &mut S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) {
        let station_name = station.name();

        while let Ok(input) = input_rx.recv() {
            match station.process(input) {
                Ok(Some(output)) => {
                    if output_tx.send(output).is_err() {
                        // Output channel closed, shutdown
                        break;
                    }
                }
                Ok(None) => {}
                Err(error @ StationError::Recoverable(_)) => {
                    error_reporter.report(station_name, &error);
                }
                Err(error @ StationError::Fatal(_)) => {
                    error_reporter.report(station_name, &error);
                    break;
                }
            }
        }

        station.shutdown();
    }

    /// True once the station thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the station thread to complete.
    pub fn join(mut self) -> Result<(), String> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|panic| {
                format!(
                    "Station '{}' thread panicked: {}",
                    self.station_name,
                    panic_message(panic.as_ref())
                )
            }),
            None => Ok(()),
        }
    }

    /// Waits at most `timeout` for the station thread, then detaches it.
    pub fn join_within(self, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return Err(format!(
                    "Station '{}' did not stop within {:?}, detaching",
                    self.station_name, timeout
                ));
            }
            thread::sleep(JOIN_POLL);
        }
        self.join()
    }

    /// Returns the name of the station.
    pub fn name(&self) -> &'static str {
        self.station_name
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}
