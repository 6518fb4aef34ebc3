//! Engine state machine and consumer API.
//!
//! [`Engine`] is an explicit handle: it owns the stream manager, gates every
//! operation on its [`EngineState`], and reports diagnostics. Callers that
//! need to share it wrap it in an `Arc`.

use crate::audio::source::AudioSource;
use crate::config::Config;
use crate::error::{ClearstreamError, Result, TransformError};
use crate::pipeline::processor::StreamStatsSnapshot;
use crate::pipeline::station::panic_message;
use crate::pipeline::stream::{ProcessingHandle, StreamManager};
use crate::pipeline::types::{Chunk, StreamEvent};
use crate::transform::TransformFactory;
use crossbeam_channel::Receiver;
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Lifecycle state of an [`Engine`].
///
/// ```text
/// Uninitialized ──initialize──▶ Initializing ──ready──▶ Ready ──attach──▶ Processing
///                                   │                    ▲                  │
///                                   │                    └──detach (last)───┘
///                                   └──unavailable──▶ Degraded | Error
/// Ready / Processing / Error ──unavailable, passthrough viable──▶ Degraded
/// any live state ──fatal──▶ Error
/// any state ──destroy──▶ Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Processing,
    /// Running without the transform; audio passes through unsuppressed.
    Degraded,
    /// Unusable until initialized again.
    Error,
    Destroyed,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Initialize,
    TransformReady,
    TransformUnavailable { passthrough_viable: bool },
    StreamAttached,
    StreamDetached { remaining: usize },
    Fatal,
    Destroy,
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            EngineEvent::Initialize => "initialize",
            EngineEvent::TransformReady => "mark transform ready",
            EngineEvent::TransformUnavailable { .. } => "drop the transform",
            EngineEvent::StreamAttached => "attach a stream",
            EngineEvent::StreamDetached { .. } => "detach a stream",
            EngineEvent::Fatal => "fail",
            EngineEvent::Destroy => "destroy",
        };
        f.write_str(verb)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl EngineState {
    pub fn label(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initializing => "initializing",
            EngineState::Ready => "ready",
            EngineState::Processing => "processing",
            EngineState::Degraded => "degraded",
            EngineState::Error => "error",
            EngineState::Destroyed => "destroyed",
        }
    }

    /// States in which streams may be attached.
    pub fn accepts_streams(&self) -> bool {
        matches!(
            self,
            EngineState::Ready | EngineState::Processing | EngineState::Degraded
        )
    }

    /// Apply `event`, returning the next state.
    ///
    /// # Errors
    /// `InvalidState` when `event` is not allowed in this state.
    pub fn transition(self, event: &EngineEvent) -> Result<EngineState> {
        use EngineState::*;

        let next = match (self, event) {
            (_, EngineEvent::Destroy) => Some(Destroyed),
            (Destroyed, _) => None,
            (_, EngineEvent::Fatal) => Some(Error),

            (Uninitialized | Error, EngineEvent::Initialize) => Some(Initializing),
            (Initializing, EngineEvent::TransformReady) => Some(Ready),
            (
                Initializing | Ready | Processing | Error | Degraded,
                EngineEvent::TransformUnavailable { passthrough_viable },
            ) => Some(if *passthrough_viable { Degraded } else { Error }),

            (Ready | Processing, EngineEvent::StreamAttached) => Some(Processing),
            (Degraded, EngineEvent::StreamAttached) => Some(Degraded),

            (Processing, EngineEvent::StreamDetached { remaining: 0 }) => Some(Ready),
            (Processing, EngineEvent::StreamDetached { .. }) => Some(Processing),
            (Ready, EngineEvent::StreamDetached { .. }) => Some(Ready),
            (Degraded, EngineEvent::StreamDetached { .. }) => Some(Degraded),

            _ => None,
        };

        next.ok_or_else(|| ClearstreamError::InvalidState {
            from: self,
            event: event.to_string(),
        })
    }
}

/// Caller's handle to an attached stream.
#[derive(Clone)]
pub struct StreamHandle {
    id: String,
    processing: ProcessingHandle,
}

impl StreamHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Chunks not yet delivered to a callback.
    pub fn chunks(&self) -> &Receiver<Chunk> {
        self.processing.chunks()
    }

    pub fn is_finished(&self) -> bool {
        self.processing.is_finished()
    }

    /// Wait up to `timeout` for the stream to end on its own.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.processing.wait_finished(timeout)
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.processing.stats()
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle").field("id", &self.id).finish()
    }
}

/// Per-stream entry in [`Diagnostics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamDiagnostics {
    pub id: String,
    #[serde(flatten)]
    pub stats: StreamStatsSnapshot,
}

/// Engine status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub state: EngineState,
    /// Mean per-frame processing latency over running streams.
    pub latency_ms: f64,
    /// Bytes held in open chunks.
    pub memory_usage: usize,
    /// Streams still capturing.
    pub stream_count: usize,
    pub streams: Vec<StreamDiagnostics>,
    pub transform: Option<String>,
    pub last_error: Option<String>,
    pub uptime_secs: f64,
}

struct Inner {
    state: EngineState,
    manager: StreamManager,
    events: Receiver<StreamEvent>,
    transform: Option<String>,
    last_error: Option<String>,
}

impl Inner {
    fn apply(&mut self, event: EngineEvent) -> Result<EngineState> {
        let next = self.state.transition(&event)?;
        if next != self.state {
            log::info!("engine: {} -> {} ({})", self.state, next, event);
        }
        self.state = next;
        Ok(next)
    }

    /// Fold pending stream events into the engine state.
    fn pump(&mut self, allow_passthrough: bool) {
        let events: Vec<StreamEvent> = self.events.try_iter().collect();
        for event in events {
            match event {
                StreamEvent::TransformFatal { stream_id, message } => {
                    self.last_error = Some(format!("{stream_id}: {message}"));
                    if matches!(self.state, EngineState::Ready | EngineState::Processing) {
                        self.transform_lost(allow_passthrough);
                    }
                }
                StreamEvent::Ended {
                    stream_id,
                    error: Some(error),
                } => {
                    log::warn!("[{}] stream ended: {}", stream_id, error);
                    self.last_error = Some(format!("{stream_id}: {error}"));
                }
                StreamEvent::Started { .. }
                | StreamEvent::ChunkEmitted { .. }
                | StreamEvent::Ended { error: None, .. } => {}
            }
        }

        if self.state == EngineState::Processing {
            let remaining = self.manager.active_count();
            if remaining == 0 {
                self.apply(EngineEvent::StreamDetached { remaining }).ok();
            }
        }
    }

    fn transform_lost(&mut self, allow_passthrough: bool) {
        if self
            .apply(EngineEvent::TransformUnavailable {
                passthrough_viable: allow_passthrough,
            })
            .is_err()
        {
            return;
        }
        self.manager.set_transform_factory(None);
        self.transform = None;
        if !allow_passthrough {
            log::error!("engine: transform lost and passthrough disabled, stopping all streams");
            self.manager.remove_all();
        }
    }
}

pub struct Engine {
    config: Config,
    inner: Mutex<Inner>,
    initialized: Condvar,
    next_stream: AtomicU64,
    created_at: Instant,
}

impl Engine {
    /// # Errors
    /// The configuration's validation error.
    pub fn new(config: Config) -> Result<Self> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let manager = StreamManager::new(config.clone())?.with_events(events_tx);
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                state: EngineState::Uninitialized,
                manager,
                events: events_rx,
                transform: None,
                last_error: None,
            }),
            initialized: Condvar::new(),
            next_stream: AtomicU64::new(0),
            created_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> EngineState {
        let mut inner = self.lock();
        inner.pump(self.config.engine.allow_passthrough);
        inner.state
    }

    /// Bring the engine up with `factory` as the transform source.
    ///
    /// The factory is tried once by creating a transform. When that fails
    /// the engine goes to `Degraded` (passthrough allowed) or `Error`.
    ///
    /// Calls made while an initialization is in flight wait for it and
    /// report its outcome. Calls on an initialized engine report the current
    /// state without doing anything. `Error` may be initialized again.
    ///
    /// # Errors
    /// `InvalidState` on a destroyed engine.
    pub fn initialize(&self, factory: Arc<dyn TransformFactory>) -> Result<EngineState> {
        let mut inner = self.lock();
        loop {
            match inner.state {
                EngineState::Uninitialized | EngineState::Error => break,
                EngineState::Initializing => {
                    inner = match self.initialized.wait(inner) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                EngineState::Destroyed => {
                    return Err(ClearstreamError::InvalidState {
                        from: EngineState::Destroyed,
                        event: EngineEvent::Initialize.to_string(),
                    });
                }
                current => return Ok(current),
            }
        }
        inner.apply(EngineEvent::Initialize)?;
        drop(inner);

        let frame_size = self.config.engine.frame_size;
        log::debug!("engine: creating transform '{}'", factory.name());
        // A panicking factory must still leave `Initializing` and wake waiters.
        let created = panic::catch_unwind(AssertUnwindSafe(|| factory.create(frame_size)))
            .unwrap_or_else(|payload| {
                Err(TransformError::Fatal(format!(
                    "transform factory panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        let mut inner = self.lock();
        let result = if inner.state != EngineState::Initializing {
            // Destroyed while the factory ran.
            Ok(inner.state)
        } else {
            match created {
                Ok(transform) => {
                    log::info!(
                        "engine: transform '{}' ready ({} samples/frame)",
                        transform.name(),
                        transform.frame_size()
                    );
                    inner.transform = Some(factory.name().to_string());
                    inner.last_error = None;
                    inner.manager.set_transform_factory(Some(factory));
                    inner.apply(EngineEvent::TransformReady)
                }
                Err(e) => {
                    log::warn!("engine: transform unavailable: {}", e);
                    inner.last_error = Some(e.to_string());
                    inner.transform = None;
                    inner.manager.set_transform_factory(None);
                    inner.apply(EngineEvent::TransformUnavailable {
                        passthrough_viable: self.config.engine.allow_passthrough,
                    })
                }
            }
        };
        drop(inner);
        self.initialized.notify_all();
        result
    }

    /// Attach a source under a generated id (`stream-0`, `stream-1`, ...).
    pub fn attach_stream(
        &self,
        source: Box<dyn AudioSource>,
        chunk_duration: Duration,
    ) -> Result<StreamHandle> {
        let id = format!("stream-{}", self.next_stream.fetch_add(1, Ordering::Relaxed));
        self.attach_stream_as(id, source, chunk_duration)
    }

    /// Attach a source under `id`, replacing any stream already using it.
    ///
    /// # Errors
    /// - `InvalidState` unless the engine is ready, processing or degraded.
    /// - Source start and parameter errors from the stream manager.
    pub fn attach_stream_as(
        &self,
        id: impl Into<String>,
        source: Box<dyn AudioSource>,
        chunk_duration: Duration,
    ) -> Result<StreamHandle> {
        let mut inner = self.lock();
        inner.pump(self.config.engine.allow_passthrough);
        if !inner.state.accepts_streams() {
            return Err(ClearstreamError::InvalidState {
                from: inner.state,
                event: EngineEvent::StreamAttached.to_string(),
            });
        }

        let id = id.into();
        let processing = inner.manager.add_stream(id.clone(), source, chunk_duration)?;
        inner.apply(EngineEvent::StreamAttached)?;
        Ok(StreamHandle { id, processing })
    }

    /// Stop a stream, flushing its final chunk.
    ///
    /// # Errors
    /// `StreamNotFound` when the stream was already detached.
    pub fn detach_stream(&self, handle: &StreamHandle) -> Result<()> {
        let mut inner = self.lock();
        if !inner.manager.remove_stream(&handle.id) {
            return Err(ClearstreamError::StreamNotFound {
                id: handle.id.clone(),
            });
        }
        let remaining = inner.manager.active_count();
        if inner.state != EngineState::Destroyed {
            inner.apply(EngineEvent::StreamDetached { remaining })?;
        }
        inner.pump(self.config.engine.allow_passthrough);
        Ok(())
    }

    /// Deliver the stream's chunks, queued ones first, to `callback`.
    ///
    /// # Errors
    /// `StreamNotFound` when the stream is not attached.
    pub fn on_chunk<F>(&self, handle: &StreamHandle, callback: F) -> Result<()>
    where
        F: FnMut(Chunk) + Send + 'static,
    {
        let inner = self.lock();
        if !inner.manager.contains(&handle.id) {
            return Err(ClearstreamError::StreamNotFound {
                id: handle.id.clone(),
            });
        }
        drop(inner);
        handle.processing.on_chunk(callback);
        Ok(())
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let mut inner = self.lock();
        inner.pump(self.config.engine.allow_passthrough);

        let streams: Vec<StreamDiagnostics> = inner
            .manager
            .all_stats()
            .into_iter()
            .map(|(id, stats)| StreamDiagnostics { id, stats })
            .collect();
        let running: Vec<&StreamDiagnostics> =
            streams.iter().filter(|s| !s.stats.finished).collect();
        let latency_ms = if running.is_empty() {
            0.0
        } else {
            running.iter().map(|s| s.stats.avg_latency_ms).sum::<f64>() / running.len() as f64
        };

        Diagnostics {
            state: inner.state,
            latency_ms,
            memory_usage: streams.iter().map(|s| s.stats.buffered_bytes).sum(),
            stream_count: running.len(),
            transform: inner.transform.clone(),
            last_error: inner.last_error.clone(),
            uptime_secs: self.created_at.elapsed().as_secs_f64(),
            streams,
        }
    }

    /// Report an unrecoverable failure from outside the pipeline. Streams
    /// are stopped and the engine needs to be initialized again.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.lock();
        if inner.apply(EngineEvent::Fatal).is_ok() {
            log::error!("engine failed: {}", message);
            inner.last_error = Some(message);
            inner.manager.remove_all();
        }
    }

    /// Stop every stream and enter the terminal state. Idempotent.
    pub fn destroy(&self) {
        let mut inner = self.lock();
        if inner.state == EngineState::Destroyed {
            return;
        }
        inner.manager.remove_all();
        inner.apply(EngineEvent::Destroy).ok();
        drop(inner);
        self.initialized.notify_all();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.destroy();
    }
}
