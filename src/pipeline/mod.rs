//! Stream processing pipeline.
//!
//! Each stream runs on its own capture thread: frames are assembled from the
//! source, pushed through the [`processor::StreamProcessor`] chain and
//! gathered into chunks. The transform may run on a worker station reached
//! through bounded crossbeam channels.

pub mod chunk_processor;
pub mod clock;
pub mod error;
pub mod framer;
pub mod latency;
pub mod processor;
pub mod sink;
pub mod station;
pub mod stream;
pub mod types;

pub use chunk_processor::ChunkProcessor;
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ErrorReporter, LogReporter, StationError};
pub use framer::FrameAssembler;
pub use latency::{LatencyStats, LatencyTracker};
pub use processor::{StreamProcessor, StreamStats, StreamStatsSnapshot};
pub use sink::{CallbackSink, ChannelSink, ChunkSink, CollectorSink};
pub use station::{Station, StationRunner};
pub use stream::{ProcessingHandle, StreamManager};
pub use types::{
    AudioFrame, Chunk, ProcessedFrame, ProcessingMetrics, StreamEvent, VoiceActivityPoint,
    VoiceSegment,
};
