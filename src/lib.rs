//! clearstream - real-time streaming audio enhancement
//!
//! Noise suppression, automatic gain control, resampling and voice-activity
//! chunking for live and file audio streams.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod transform;

// Core traits (source → transform → sink)
pub use audio::source::AudioSource;
pub use pipeline::sink::{CallbackSink, ChannelSink, ChunkSink, CollectorSink};
pub use transform::{FrameTransform, TransformFactory};

// Engine
pub use engine::{Diagnostics, Engine, EngineState, StreamHandle};

// Data
pub use pipeline::types::{Chunk, ProcessingMetrics, VoiceActivityPoint, VoiceSegment};

// Error handling
pub use error::{ClearstreamError, Result, TransformError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
