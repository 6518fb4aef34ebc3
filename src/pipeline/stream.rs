//! Stream lifecycle: one capture thread and processing graph per source.
//!
//! Each stream owns its source, its [`StreamProcessor`] and its transform
//! bridge. Nothing is shared between streams except the factory that creates
//! transforms.

use crate::audio::source::AudioSource;
use crate::config::Config;
use crate::defaults;
use crate::error::{ClearstreamError, Result};
use crate::pipeline::clock::{Clock, SystemClock};
use crate::pipeline::framer::FrameAssembler;
use crate::pipeline::processor::{StreamProcessor, StreamStats, StreamStatsSnapshot};
use crate::pipeline::sink::{CallbackSink, ChannelSink, ChunkSink};
use crate::pipeline::station::panic_message;
use crate::pipeline::types::{Chunk, StreamEvent};
use crate::transform::{FrameTransformBridge, TransformFactory};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type SharedSink = Arc<Mutex<Box<dyn ChunkSink>>>;

fn lock_sink(sink: &SharedSink) -> MutexGuard<'_, Box<dyn ChunkSink>> {
    match sink.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Caller's view of a running stream.
///
/// Chunks queue on [`chunks`](Self::chunks) until a callback is installed
/// with [`on_chunk`](Self::on_chunk).
#[derive(Clone)]
pub struct ProcessingHandle {
    id: String,
    chunks: Receiver<Chunk>,
    sink: SharedSink,
    stats: Arc<StreamStats>,
}

impl ProcessingHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Chunks not yet taken by a callback.
    pub fn chunks(&self) -> &Receiver<Chunk> {
        &self.chunks
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// True once the capture thread has flushed its last chunk and exited.
    pub fn is_finished(&self) -> bool {
        self.stats.is_finished()
    }

    /// Deliver every chunk to `callback`, starting with any already queued.
    pub fn on_chunk<F>(&self, mut callback: F)
    where
        F: FnMut(Chunk) + Send + 'static,
    {
        let mut sink = lock_sink(&self.sink);
        for chunk in self.chunks.try_iter() {
            callback(chunk);
        }
        *sink = Box::new(CallbackSink::new(callback));
    }

    /// Replace the stream's chunk sink. Queued chunks stay on the channel.
    pub fn set_sink(&self, sink: Box<dyn ChunkSink>) {
        *lock_sink(&self.sink) = sink;
    }

    /// Wait up to `timeout` for the stream to finish.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(defaults::POLL_INTERVAL_MS));
        }
        true
    }
}

struct StreamEntry {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    handle: ProcessingHandle,
}

/// Owns every stream's processing graph.
pub struct StreamManager {
    config: Config,
    clock: Arc<dyn Clock>,
    factory: Option<Arc<dyn TransformFactory>>,
    events: Option<Sender<StreamEvent>>,
    streams: HashMap<String, StreamEntry>,
}

impl StreamManager {
    /// # Errors
    /// The configuration's validation error.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock: Arc::new(SystemClock::new()),
            factory: None,
            events: None,
            streams: HashMap::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Send every stream's lifecycle events to `events`.
    pub fn with_events(mut self, events: Sender<StreamEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Transform factory for streams added from now on. `None` runs new
    /// streams in passthrough.
    pub fn set_transform_factory(&mut self, factory: Option<Arc<dyn TransformFactory>>) {
        self.factory = factory;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start processing `source` under `id`.
    ///
    /// An existing stream with the same id is torn down first. The source is
    /// started on the calling thread so start failures are reported here.
    ///
    /// # Errors
    /// - `InvalidParameter` for a zero `chunk_duration`.
    /// - The source's `start()` error.
    /// - `InvalidSampleRate` when the source reports rate 0.
    pub fn add_stream(
        &mut self,
        id: impl Into<String>,
        mut source: Box<dyn AudioSource>,
        chunk_duration: Duration,
    ) -> Result<ProcessingHandle> {
        let id = id.into();
        if chunk_duration.is_zero() {
            return Err(ClearstreamError::InvalidParameter {
                name: "chunk_duration".to_string(),
                message: "must be positive".to_string(),
            });
        }

        if let Some(previous) = self.streams.remove(&id) {
            log::info!("[{}] replacing existing stream", id);
            self.teardown(&id, previous);
        }

        source.start()?;
        let input_rate = source.sample_rate();

        let bridge = self.create_bridge(&id);
        let mut processor =
            match StreamProcessor::new(id.clone(), &self.config, input_rate, bridge, Arc::clone(&self.clock)) {
                Ok(processor) => processor,
                Err(e) => {
                    if let Err(stop_err) = source.stop() {
                        log_cleanup(&id, "stop source", &stop_err.to_string());
                    }
                    return Err(e);
                }
            };
        if let Some(events) = &self.events {
            processor = processor.with_events(events.clone());
        }

        let (chunk_tx, chunk_rx) = crossbeam_channel::unbounded();
        let sink: SharedSink = Arc::new(Mutex::new(Box::new(ChannelSink::new(chunk_tx))));
        let stats = processor.stats();
        let running = Arc::new(AtomicBool::new(true));

        let task = CaptureTask {
            id: id.clone(),
            source,
            assembler: FrameAssembler::new(self.config.engine.frame_size),
            processor,
            sink: Arc::clone(&sink),
            stats: Arc::clone(&stats),
            running: Arc::clone(&running),
            chunk_duration,
            events: self.events.clone(),
            bridge_timeout: self.config.transform_timeout(),
        };
        let thread = thread::Builder::new()
            .name(format!("capture-{id}"))
            .spawn(move || task.run())?;

        log::info!(
            "[{}] stream started at {} Hz, {:?} chunks",
            id,
            input_rate,
            chunk_duration
        );

        let handle = ProcessingHandle {
            id: id.clone(),
            chunks: chunk_rx,
            sink,
            stats,
        };
        self.streams.insert(
            id,
            StreamEntry {
                running,
                thread: Some(thread),
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    /// Transform bridge for a new stream, `None` for passthrough.
    fn create_bridge(&self, id: &str) -> Option<FrameTransformBridge> {
        let factory = self.factory.as_ref()?;
        let transform = match factory.create(self.config.engine.frame_size) {
            Ok(transform) => transform,
            Err(e) => {
                log::warn!("[{}] no transform, running in passthrough: {}", id, e);
                self.emit(StreamEvent::TransformFatal {
                    stream_id: id.to_string(),
                    message: e.to_string(),
                });
                return None;
            }
        };
        match FrameTransformBridge::new(
            transform,
            self.config.transform.mode,
            self.config.transform_timeout(),
        ) {
            Ok(bridge) => Some(bridge),
            Err(e) => {
                log::warn!("[{}] transform worker failed to start: {}", id, e);
                self.emit(StreamEvent::TransformFatal {
                    stream_id: id.to_string(),
                    message: e.to_string(),
                });
                None
            }
        }
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(events) = &self.events {
            events.send(event).ok();
        }
    }

    /// Stop and remove a stream. Returns false for an unknown id.
    pub fn remove_stream(&mut self, id: &str) -> bool {
        match self.streams.remove(id) {
            Some(entry) => {
                self.teardown(id, entry);
                true
            }
            None => false,
        }
    }

    /// Stop every stream. Failures are logged and do not stop the others.
    pub fn remove_all(&mut self) {
        let entries: Vec<(String, StreamEntry)> = self.streams.drain().collect();
        for (_, entry) in &entries {
            entry.running.store(false, Ordering::SeqCst);
        }
        for (id, entry) in entries {
            self.teardown(&id, entry);
        }
    }

    /// Signal the capture thread and wait a bounded time for it, then detach.
    fn teardown(&self, id: &str, mut entry: StreamEntry) {
        entry.running.store(false, Ordering::SeqCst);

        let Some(thread) = entry.thread.take() else {
            return;
        };
        let timeout = self.config.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(defaults::POLL_INTERVAL_MS);

        while !thread.is_finished() {
            if Instant::now() >= deadline {
                log_cleanup(
                    id,
                    "stop capture",
                    &format!("thread still running after {timeout:?}, detaching"),
                );
                // Dropping the JoinHandle detaches the thread.
                return;
            }
            thread::sleep(poll_interval);
        }
        if let Err(payload) = thread.join() {
            log_cleanup(id, "join capture", panic_message(payload.as_ref()));
        }
        log::debug!("[{}] stream removed", id);
    }

    /// Ids of all streams, sorted.
    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    /// Streams whose capture thread is still running.
    pub fn active_count(&self) -> usize {
        self.streams
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .count()
    }

    pub fn handle(&self, id: &str) -> Option<ProcessingHandle> {
        self.streams.get(id).map(|entry| entry.handle.clone())
    }

    pub fn stats(&self, id: &str) -> Option<StreamStatsSnapshot> {
        self.streams.get(id).map(|entry| entry.handle.stats())
    }

    /// Snapshots of every stream, sorted by id.
    pub fn all_stats(&self) -> Vec<(String, StreamStatsSnapshot)> {
        let mut all: Vec<_> = self
            .streams
            .iter()
            .map(|(id, entry)| (id.clone(), entry.handle.stats()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        if !self.streams.is_empty() {
            self.remove_all();
        }
    }
}

fn log_cleanup(id: &str, step: &str, detail: &str) {
    let error = ClearstreamError::ResourceCleanup {
        message: format!("{step}: {detail}"),
    };
    log::warn!("[{}] {}", id, error);
}

/// Everything the capture thread owns.
struct CaptureTask {
    id: String,
    source: Box<dyn AudioSource>,
    assembler: FrameAssembler,
    processor: StreamProcessor,
    sink: SharedSink,
    stats: Arc<StreamStats>,
    running: Arc<AtomicBool>,
    chunk_duration: Duration,
    events: Option<Sender<StreamEvent>>,
    bridge_timeout: Duration,
}

impl CaptureTask {
    fn run(mut self) {
        self.emit(StreamEvent::Started {
            stream_id: self.id.clone(),
        });

        let error = match panic::catch_unwind(AssertUnwindSafe(|| self.pump())) {
            Ok(error) => error,
            Err(payload) => Some(format!(
                "capture panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        let final_error = error.clone();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.flush(final_error))) {
            log::error!(
                "[{}] final chunk lost: {}",
                self.id,
                panic_message(payload.as_ref())
            );
        }
        self.release();
        self.stats.mark_finished();

        self.emit(StreamEvent::Ended {
            stream_id: self.id.clone(),
            error,
        });
    }

    /// Read and process until stopped. Returns the device error that ended
    /// the stream, if any.
    fn pump(&mut self) -> Option<String> {
        let poll_interval = Duration::from_millis(defaults::POLL_INTERVAL_MS);
        let finite = self.source.is_finite();
        let mut consecutive_errors: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            let block = match self.source.read_samples() {
                Ok(block) => {
                    consecutive_errors = 0;
                    block
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= defaults::MAX_CONSECUTIVE_READ_ERRORS {
                        log::error!(
                            "[{}] capture failed {} times in a row: {}",
                            self.id,
                            consecutive_errors,
                            e
                        );
                        return Some(format!("capture device lost: {e}"));
                    }
                    thread::sleep(poll_interval);
                    continue;
                }
            };

            if block.is_empty() {
                if finite {
                    log::debug!("[{}] source exhausted", self.id);
                    break;
                }
                thread::sleep(poll_interval);
                continue;
            }

            for mut frame in self.assembler.push(&block, Instant::now()) {
                self.processor.process(&mut frame);
                self.assembler.recycle(frame);
                if self.processor.should_roll(self.chunk_duration) {
                    let chunk = self.processor.roll();
                    self.deliver(chunk);
                }
            }
        }
        None
    }

    /// Process the partial frame and emit the last chunk.
    fn flush(&mut self, error: Option<String>) {
        if let Some((mut frame, valid)) = self.assembler.flush(Instant::now()) {
            self.processor.process_partial(&mut frame, valid);
        }

        let nothing_emitted = self.stats.snapshot().chunks_emitted == 0;
        if self.processor.pending_frames() > 0 || error.is_some() || nothing_emitted {
            let chunk = self.processor.finish(error);
            self.deliver(chunk);
        }
        lock_sink(&self.sink).finish();
    }

    fn deliver(&self, chunk: Chunk) {
        let index = chunk.index;
        let mut sink = lock_sink(&self.sink);
        if let Err(e) = sink.handle(chunk) {
            log::warn!("[{}] sink '{}' rejected chunk {}: {}", self.id, sink.name(), index, e);
        }
        drop(sink);
        self.emit(StreamEvent::ChunkEmitted {
            stream_id: self.id.clone(),
            index,
        });
    }

    /// Stop the source and the transform worker. Each step runs even if the
    /// other fails or panics.
    fn release(&mut self) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.source.stop())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_cleanup(&self.id, "stop source", &e.to_string()),
            Err(payload) => log_cleanup(&self.id, "stop source", panic_message(payload.as_ref())),
        }

        let timeout = self.bridge_timeout;
        match panic::catch_unwind(AssertUnwindSafe(|| self.processor.shutdown(timeout))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_cleanup(&self.id, "stop transform", &e.to_string()),
            Err(payload) => {
                log_cleanup(&self.id, "stop transform", panic_message(payload.as_ref()))
            }
        }
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(events) = &self.events {
            events.send(event).ok();
        }
    }
}
