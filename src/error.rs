//! Error types for clearstream.

use crate::engine::EngineState;
use thiserror::Error;

/// Failure reported by a frame transform.
///
/// `FrameFailed` covers a single frame: the frame is passed through and the
/// stream keeps going. `Fatal` means the transform cannot be used any more.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Transform failed on frame: {0}")]
    FrameFailed(String),

    #[error("Transform unusable: {0}")]
    Fatal(String),
}

impl TransformError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransformError::Fatal(_))
    }
}

#[derive(Error, Debug)]
pub enum ClearstreamError {
    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Invalid parameter {name}: {message}")]
    InvalidParameter { name: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio errors
    #[error("Invalid sample rate: {rate}")]
    InvalidSampleRate { rate: u32 },

    #[error("Empty audio input")]
    EmptyInput,

    #[error("Frame size mismatch: expected {expected} samples, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio format mismatch: expected {expected}, got {actual}")]
    AudioFormatMismatch { expected: String, actual: String },

    #[error("Audio device error: {message}")]
    Device { message: String },

    // Transform errors
    #[error(transparent)]
    Transform(#[from] TransformError),

    // Lifecycle errors
    #[error("Cannot {event} while engine is {from}")]
    InvalidState { from: EngineState, event: String },

    #[error("Stream not found: {id}")]
    StreamNotFound { id: String },

    #[error("Resource cleanup failed: {message}")]
    ResourceCleanup { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ClearstreamError {
    /// Shorthand for a `ConfigInvalidValue` error.
    pub fn invalid_config(key: impl Into<String>, message: impl Into<String>) -> Self {
        ClearstreamError::ConfigInvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// True for errors raised by validating configuration or parameters.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ClearstreamError::ConfigInvalidValue { .. }
                | ClearstreamError::InvalidParameter { .. }
                | ClearstreamError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClearstreamError>;
