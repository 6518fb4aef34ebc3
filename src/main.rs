use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser};
use clearstream::audio::WavAudioSource;
use clearstream::audio::wav::write_wav;
use clearstream::cli::{Cli, Commands, ConfigAction, ProcessOptions};
use clearstream::config::Config;
use clearstream::engine::{Engine, EngineState};
use clearstream::pipeline::Chunk;
use clearstream::transform::{PassthroughFactory, TransformFactory};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How often the chunk loop checks whether a file stream has ended.
const RECV_POLL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    log::debug!("clearstream {}", clearstream::version_string());

    match cli.command {
        Commands::Process { input, options } => {
            let config = load_config(cli.config.as_deref(), &options)?;
            run_process(config, &input, &options)?;
        }
        Commands::Live { device, options } => {
            let config = load_config(cli.config.as_deref(), &options)?;
            run_live(config, device.as_deref(), &options).await?;
        }
        Commands::Devices => {
            list_audio_devices()?;
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "clearstream",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// RUST_LOG wins over the `-v` count.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/clearstream/config.toml)
/// 3. Built-in defaults
///
/// Environment variables and command-line options are applied on top.
fn load_config(custom_path: Option<&Path>, options: &ProcessOptions) -> Result<Config> {
    let mut config = read_config(custom_path)?.with_env_overrides();

    if let Some(chunk) = options.chunk {
        config.engine.chunk_duration_secs = chunk.as_secs_f64();
    }
    if let Some(mode) = options.mode {
        config.transform.mode = mode;
    }
    config.validate()?;
    Ok(config)
}

fn read_config(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return Config::load(path);
    }
    match Config::default_path() {
        Some(path) => Config::load_or_default(&path),
        None => Ok(Config::default()),
    }
}

fn transform_factory(passthrough: bool) -> Arc<dyn TransformFactory> {
    if passthrough {
        return Arc::new(PassthroughFactory);
    }
    #[cfg(feature = "rnnoise")]
    {
        Arc::new(clearstream::transform::RnnoiseFactory)
    }
    #[cfg(not(feature = "rnnoise"))]
    {
        log::warn!("built without the `rnnoise` feature, noise suppression is disabled");
        Arc::new(PassthroughFactory)
    }
}

fn start_engine(config: Config, options: &ProcessOptions) -> Result<Engine> {
    let engine = Engine::new(config)?;
    let state = engine.initialize(transform_factory(options.passthrough))?;
    match state {
        EngineState::Degraded => {
            eprintln!(
                "{}",
                "Noise suppression unavailable, continuing in passthrough".yellow()
            );
        }
        EngineState::Error => {
            let reason = engine
                .diagnostics()
                .last_error
                .unwrap_or_else(|| "transform unavailable".to_string());
            bail!("Engine failed to initialize: {}", reason);
        }
        _ => log::info!("engine {}", state),
    }
    Ok(engine)
}

/// Process a WAV file to completion, reporting every chunk.
fn run_process(config: Config, input: &Path, options: &ProcessOptions) -> Result<()> {
    let source = WavAudioSource::open(input)
        .with_context(|| format!("Failed to load WAV file {}", input.display()))?;
    log::info!(
        "{}: {:.2}s at {} Hz",
        input.display(),
        source.duration_secs(),
        clearstream::audio::AudioSource::sample_rate(&source)
    );

    let chunk_duration = config.chunk_duration();
    let engine = start_engine(config, options)?;
    let handle = engine.attach_stream(Box::new(source), chunk_duration)?;
    let mut reporter = ChunkReporter::new(options)?;

    loop {
        match handle.chunks().recv_timeout(RECV_POLL) {
            Ok(chunk) => reporter.report(&chunk)?,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) if handle.is_finished() => {
                for chunk in handle.chunks().try_iter() {
                    reporter.report(&chunk)?;
                }
                break;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    let stats = handle.stats();
    let diagnostics = engine.diagnostics();
    if !options.json {
        println!(
            "{} {} chunks, {} frames ({} dropped), {:.2} ms/frame{}",
            "Done:".green().bold(),
            reporter.count,
            stats.frames_processed,
            stats.frames_dropped,
            stats.avg_latency_ms,
            if stats.passthrough { ", passthrough" } else { "" }
        );
    }
    if let Some(error) = diagnostics.last_error {
        bail!("Stream failed: {}", error);
    }
    Ok(())
}

/// Process live capture until Ctrl-C.
#[cfg(feature = "cpal-audio")]
async fn run_live(config: Config, device: Option<&str>, options: &ProcessOptions) -> Result<()> {
    use clearstream::audio::capture::CpalAudioSource;

    let source = CpalAudioSource::new(device)?;
    let chunk_duration = config.chunk_duration();
    let engine = start_engine(config, options)?;
    let handle = engine.attach_stream(Box::new(source), chunk_duration)?;

    let mut reporter = ChunkReporter::new(options)?;
    engine.on_chunk(&handle, move |chunk| {
        if let Err(e) = reporter.report(&chunk) {
            log::error!("failed to report chunk {}: {:#}", chunk.id, e);
        }
    })?;

    eprintln!("{}", "Listening, press Ctrl-C to stop".dimmed());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    engine.detach_stream(&handle)?;
    let stats = handle.stats();
    eprintln!(
        "{} {} chunks, {} frames ({} dropped)",
        "Stopped:".green().bold(),
        stats.chunks_emitted,
        stats.frames_processed,
        stats.frames_dropped
    );
    Ok(())
}

#[cfg(not(feature = "cpal-audio"))]
async fn run_live(_config: Config, _device: Option<&str>, _options: &ProcessOptions) -> Result<()> {
    bail!("Live capture requires building with the `cpal-audio` feature")
}

/// List available audio input devices.
#[cfg(feature = "cpal-audio")]
fn list_audio_devices() -> Result<()> {
    let devices = clearstream::audio::capture::list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

#[cfg(not(feature = "cpal-audio"))]
fn list_audio_devices() -> Result<()> {
    bail!("Device listing requires building with the `cpal-audio` feature")
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let config_path = custom_path.map(PathBuf::from).or_else(Config::default_path);

    match action {
        ConfigAction::Show => {
            let config = read_config(custom_path)?.with_env_overrides();
            print!("{}", config.to_toml_string()?);
        }
        ConfigAction::Path => match config_path {
            Some(path) => println!("{}", path.display()),
            None => bail!("Could not determine a configuration directory"),
        },
        ConfigAction::Init { force } => {
            let Some(path) = config_path else {
                bail!("Could not determine a configuration directory");
            };
            if path.exists() && !force {
                eprintln!(
                    "Config already exists at {} (use --force to overwrite)",
                    path.display()
                );
                std::process::exit(1);
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(&path, Config::default().to_toml_string()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default config to {}", path.display());
        }
    }
    Ok(())
}

/// Prints chunks and optionally saves their audio.
struct ChunkReporter {
    json: bool,
    output_dir: Option<PathBuf>,
    count: usize,
}

impl ChunkReporter {
    fn new(options: &ProcessOptions) -> Result<Self> {
        if let Some(dir) = &options.output_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(Self {
            json: options.json,
            output_dir: options.output_dir.clone(),
            count: 0,
        })
    }

    fn report(&mut self, chunk: &Chunk) -> Result<()> {
        self.count += 1;

        if let Some(dir) = &self.output_dir {
            let path = dir.join(format!("{}.wav", chunk.id));
            write_wav(&path, &chunk.samples, chunk.sample_rate)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        if self.json {
            println!("{}", serde_json::to_string(chunk)?);
            return Ok(());
        }

        let span = format!(
            "[{:>3}] {:>7.2}s - {:>7.2}s",
            chunk.index, chunk.start_time, chunk.end_time
        );
        let detail = format!(
            "vad {:.2}  voice {:>3.0}%  segments {:<2}  {} -> {} bytes  -{:.0}% noise",
            chunk.average_vad,
            chunk.voice_ratio() * 100.0,
            chunk.segments.len(),
            chunk.original_size,
            chunk.processed_size,
            chunk.metrics.noise_reduction_percent
        );
        if chunk.is_valid {
            println!("{}  {}", span.cyan(), detail);
        } else {
            println!(
                "{}  {}  {}",
                span.red(),
                detail,
                chunk
                    .error_message
                    .as_deref()
                    .unwrap_or("invalid chunk")
                    .red()
            );
        }
        Ok(())
    }
}
