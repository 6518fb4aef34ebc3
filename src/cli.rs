//! Command-line interface for clearstream
//!
//! Provides argument parsing using clap derive macros.

use crate::transform::bridge::TransformMode;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Real-time audio enhancement: noise suppression, gain control and voice-activity chunking
#[derive(Parser, Debug)]
#[command(name = "clearstream", version, about)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Verbose output (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Options shared by the processing commands.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Chunk duration (default from config). Examples: 10s, 500ms, 1m
    #[arg(long, short = 'c', value_name = "DURATION", value_parser = parse_duration)]
    pub chunk: Option<Duration>,

    /// Where the transform runs: inline or worker
    #[arg(long, value_name = "MODE")]
    pub mode: Option<TransformMode>,

    /// Skip noise suppression (gain control, resampling and VAD still run)
    #[arg(long)]
    pub passthrough: bool,

    /// Print one JSON object per chunk instead of the summary table
    #[arg(long)]
    pub json: bool,

    /// Write each chunk's audio as a WAV file into this directory
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process a WAV file and report its chunks
    Process {
        /// Input WAV file (16-bit int or 32-bit float)
        input: PathBuf,

        #[command(flatten)]
        options: ProcessOptions,
    },

    /// Process live microphone input until Ctrl-C
    Live {
        /// Audio input device (see `clearstream devices`)
        #[arg(long, value_name = "DEVICE")]
        device: Option<String>,

        #[command(flatten)]
        options: ProcessOptions,
    },

    /// List available audio input devices
    Devices,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime` (`10s`, `500ms`,
/// `1m30s`); a bare number is taken as seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        if secs > 0.0 && secs.is_finite() {
            return Ok(Duration::from_secs_f64(secs));
        }
        return Err(format!("duration must be positive, got {s}"));
    }
    let duration = humantime::parse_duration(s).map_err(|e| e.to_string())?;
    if duration.is_zero() {
        return Err("duration must be positive".to_string());
    }
    Ok(duration)
}
