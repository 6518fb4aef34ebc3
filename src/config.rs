//! Configuration file, environment overrides and validation.

use crate::audio::agc::AgcConfig;
use crate::audio::segment::SegmentConfig;
use crate::defaults;
use crate::error::{ClearstreamError, Result};
use crate::transform::bridge::TransformMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSettings,
    pub agc: AgcConfig,
    pub vad: VadSettings,
    pub transform: TransformSettings,
}

/// Stream framing and timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Samples per transform frame.
    pub frame_size: usize,
    /// Capture rate `frame_size` is chosen for. Sources report their own
    /// rate; a different one is flagged in the stream stats.
    pub sample_rate: u32,
    /// Rate of the emitted PCM.
    pub target_sample_rate: u32,
    /// Seconds of audio per chunk.
    pub chunk_duration_secs: f64,
    /// Bounded wait for a stream's threads on teardown.
    pub shutdown_timeout_ms: u64,
    /// Keep streams running without the transform when it is unavailable.
    pub allow_passthrough: bool,
}

/// Voice activity segmentation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadSettings {
    pub threshold: f32,
    pub hangover_secs: f64,
    pub merge_gap_secs: f64,
    pub min_segment_secs: f64,
    pub score_source: VoiceScoreSource,
}

/// Transform hosting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransformSettings {
    pub mode: TransformMode,
    /// Wait for one response in worker mode.
    pub timeout_ms: u64,
}

/// Where per-frame voice scores come from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VoiceScoreSource {
    /// The transform's score, energy VAD when it reports none.
    #[default]
    Transform,
    /// Always the energy VAD.
    Energy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            frame_size: defaults::FRAME_SIZE,
            sample_rate: defaults::SAMPLE_RATE,
            target_sample_rate: defaults::TARGET_SAMPLE_RATE,
            chunk_duration_secs: defaults::CHUNK_DURATION_SECS,
            shutdown_timeout_ms: defaults::SHUTDOWN_TIMEOUT_MS,
            allow_passthrough: true,
        }
    }
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            hangover_secs: defaults::VAD_HANGOVER_SECS,
            merge_gap_secs: defaults::VAD_MERGE_GAP_SECS,
            min_segment_secs: defaults::VAD_MIN_SEGMENT_SECS,
            score_source: VoiceScoreSource::Transform,
        }
    }
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            mode: TransformMode::Inline,
            timeout_ms: defaults::TRANSFORM_TIMEOUT_MS,
        }
    }
}

impl VadSettings {
    /// Segment detector parameters for points spaced `frame_time` seconds apart.
    pub fn segment_config(&self, frame_time: f64) -> SegmentConfig {
        SegmentConfig {
            threshold: self.threshold,
            hangover_time: self.hangover_secs,
            frame_time,
            min_segment_duration: self.min_segment_secs,
            merge_gap: self.merge_gap_secs,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file, or defaults if the file doesn't exist
    ///
    /// Invalid TOML and other I/O errors are still returned.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                log::debug!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - CLEARSTREAM_FRAME_SIZE → engine.frame_size
    /// - CLEARSTREAM_CHUNK_SECS → engine.chunk_duration_secs
    /// - CLEARSTREAM_TARGET_RATE → engine.target_sample_rate
    /// - CLEARSTREAM_TRANSFORM_MODE → transform.mode
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(frame_size) = env_parse("CLEARSTREAM_FRAME_SIZE") {
            self.engine.frame_size = frame_size;
        }

        if let Some(secs) = env_parse("CLEARSTREAM_CHUNK_SECS") {
            self.engine.chunk_duration_secs = secs;
        }

        if let Some(rate) = env_parse("CLEARSTREAM_TARGET_RATE") {
            self.engine.target_sample_rate = rate;
        }

        if let Some(mode) = env_parse("CLEARSTREAM_TRANSFORM_MODE") {
            self.transform.mode = mode;
        }

        self
    }

    /// Check every value, failing on the first one out of range.
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.frame_size == 0 || engine.frame_size > defaults::MAX_FRAME_SIZE {
            return Err(ClearstreamError::invalid_config(
                "engine.frame_size",
                format!("must be within 1..={}", defaults::MAX_FRAME_SIZE),
            ));
        }
        if engine.sample_rate == 0 {
            return Err(ClearstreamError::invalid_config(
                "engine.sample_rate",
                "must be positive",
            ));
        }
        if engine.target_sample_rate == 0 {
            return Err(ClearstreamError::invalid_config(
                "engine.target_sample_rate",
                "must be positive",
            ));
        }
        if !(engine.chunk_duration_secs > 0.0
            && engine.chunk_duration_secs <= defaults::MAX_CHUNK_DURATION_SECS)
        {
            return Err(ClearstreamError::invalid_config(
                "engine.chunk_duration_secs",
                format!("must be within (0, {}]", defaults::MAX_CHUNK_DURATION_SECS),
            ));
        }
        if engine.shutdown_timeout_ms == 0 {
            return Err(ClearstreamError::invalid_config(
                "engine.shutdown_timeout_ms",
                "must be positive",
            ));
        }

        self.agc.validate()?;

        let vad = &self.vad;
        if !(0.0..=1.0).contains(&vad.threshold) {
            return Err(ClearstreamError::invalid_config(
                "vad.threshold",
                "must be within [0, 1]",
            ));
        }
        for (key, value) in [
            ("vad.hangover_secs", vad.hangover_secs),
            ("vad.merge_gap_secs", vad.merge_gap_secs),
            ("vad.min_segment_secs", vad.min_segment_secs),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(ClearstreamError::invalid_config(key, "must be non-negative"));
            }
        }

        if self.transform.timeout_ms == 0 {
            return Err(ClearstreamError::invalid_config(
                "transform.timeout_ms",
                "must be positive",
            ));
        }
        Ok(())
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.engine.chunk_duration_secs.max(0.0))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.shutdown_timeout_ms)
    }

    pub fn transform_timeout(&self) -> Duration {
        Duration::from_millis(self.transform.timeout_ms)
    }

    /// Serialize to TOML, as written by `config init`.
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/clearstream/config.toml on Linux, `None` when the
    /// platform has no config directory.
    #[cfg(feature = "cli")]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("clearstream").join("config.toml"))
    }
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = std::env::var(key).ok()?;
    if value.trim().is_empty() {
        return None;
    }
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            log::warn!("ignoring {}={:?}: {}", key, value, e);
            None
        }
    }
}
