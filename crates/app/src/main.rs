use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use beatlight_core::{
    render::spawn_frame_clock, AnimationControl, AnimationHandle, AppConfig, AudioProcessor,
    BeatAnalysis, CommandMapper, DetectorKind, Dispatcher, EventBus, FeatureFrame, InputModule,
    LoggingAnimator, SampleAcquisition, SyntheticAdc,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            seconds,
            config,
            bpm,
            press_every,
        } => run_live(load_config(config.as_deref())?, seconds, bpm, press_every),
        Commands::Analyze {
            input,
            output,
            config,
            detector,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(detector) = detector {
                config.detector.kind = detector.into();
            }
            run_analyze(&config, &input, output.as_deref())
        }
        Commands::Config => {
            println!("{}", AppConfig::default().to_json_pretty()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(AppConfig::live_defaults()),
    }
}

fn run_live(config: AppConfig, seconds: f32, bpm: f32, press_every: Option<f32>) -> anyhow::Result<()> {
    let run_duration = duration_arg("--seconds", seconds, 0.0)?;
    let press_period = press_every
        .map(|secs| duration_arg("--press-every", secs, 0.2))
        .transpose()?;
    let sample_rate_hz = config.sampling.sample_rate_hz();
    tracing::info!(
        seconds,
        bpm,
        sample_rate_hz,
        detector = ?config.detector.kind,
        "starting live pipeline"
    );

    let origin = Instant::now();
    let bus = Arc::new(EventBus::new(config.queues)?);
    bus.initialize();

    let mut processing = Dispatcher::new("processing", bus.clone());
    let processor_stats = AudioProcessor::new(bus.clone(), config.clone()).attach(&mut processing);

    let animation =
        AnimationHandle::new(AnimationControl::new(&config.render, LoggingAnimator::new())?);
    let mut render = Dispatcher::new("render", bus.clone());
    animation.attach(&mut render);
    render.on::<FeatureFrame, _>(|feature| {
        tracing::trace!(energy = feature.energy, flux = feature.flux, "feature");
    });

    let mut commands = Dispatcher::new("input", bus.clone());
    CommandMapper::new(bus.clone(), &config.input).attach(&mut commands);

    let dispatchers = [processing.spawn()?, render.spawn()?, commands.spawn()?];
    let clock = spawn_frame_clock(bus.clone(), config.render.fps_target, origin)?;

    let mut acquisition = SampleAcquisition::new(SyntheticAdc::new(sample_rate_hz, bpm));
    acquisition.initialize(config.sampling.interval_us)?;
    acquisition.start_publishing(bus.clone(), origin)?;
    let sampler = acquisition.spawn()?;

    let mut input = InputModule::new(bus.clone(), &config.input, origin);
    let deadline = origin
        .checked_add(run_duration)
        .context("--seconds is too large")?;
    let mut next_press = press_period.and_then(|period| origin.checked_add(period));
    while Instant::now() < deadline {
        match next_press {
            Some(at) if Instant::now() >= at => {
                input.on_level(true);
                thread::sleep(Duration::from_millis(100));
                input.on_level(false);
                next_press = press_period.and_then(|period| at.checked_add(period));
            }
            _ => thread::sleep(Duration::from_millis(10)),
        }
    }

    sampler.stop();
    clock.stop();
    for handle in dispatchers {
        handle.stop();
    }

    let (accepted, suppressed, frames, current) = animation.with(|control| {
        (
            control.accepted_beats(),
            control.suppressed_beats(),
            control.frame_count(),
            control.current_name().to_owned(),
        )
    });
    tracing::info!(
        audio_frames = processor_stats.frames(),
        beats = processor_stats.beats(),
        accepted,
        suppressed,
        render_frames = frames,
        animation = %current,
        "live pipeline stopped"
    );
    Ok(())
}

/// Converts a seconds argument, raising it to `min` and rejecting values that
/// do not fit a `Duration`.
fn duration_arg(flag: &str, secs: f32, min: f32) -> anyhow::Result<Duration> {
    anyhow::ensure!(!secs.is_nan(), "{flag} must be a number of seconds, got NaN");
    Duration::try_from_secs_f32(secs.max(min))
        .with_context(|| format!("{flag} must be a finite number of seconds, got {secs}"))
}

fn run_analyze(config: &AppConfig, input: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    tracing::info!(?input, ?output, detector = ?config.detector.kind, "running offline analysis");

    let (samples, sample_rate) = load_wav_mono(input)?;
    let mut analysis = BeatAnalysis::new(config, sample_rate)?;
    analysis.push_samples(&samples)?;
    let report = analysis.finish();
    let json = serde_json::to_string_pretty(&report)?;

    match output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

/// Decodes a WAV file and mixes all channels down to one.
fn load_wav_mono(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .with_context(|| format!("failed to decode {}", path.display()))?,
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<_, _>>()
                .with_context(|| format!("failed to decode {}", path.display()))?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat detection pipeline host runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the threaded pipeline against a synthetic signal.
    Run {
        /// How long to run before shutting down.
        #[arg(short, long, default_value_t = 10.0)]
        seconds: f32,
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Tempo of the synthetic kick drum.
        #[arg(long, default_value_t = 120.0)]
        bpm: f32,
        /// Simulate a short button press every this many seconds.
        #[arg(long)]
        press_every: Option<f32>,
    },
    /// Detect beats in a WAV file and write them as JSON.
    Analyze {
        /// Path to the WAV file that should be analysed.
        input: PathBuf,
        /// Output path for the report. Printed to stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Overrides the configured detector.
        #[arg(short, long, value_enum)]
        detector: Option<Detector>,
    },
    /// Print the default configuration as JSON.
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Detector {
    Variance,
    Onset,
    Envelope,
}

impl From<Detector> for DetectorKind {
    fn from(detector: Detector) -> Self {
        match detector {
            Detector::Variance => DetectorKind::Variance,
            Detector::Onset => DetectorKind::Onset,
            Detector::Envelope => DetectorKind::Envelope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_arg_clamps_to_minimum() {
        assert_eq!(duration_arg("--seconds", -3.0, 0.0).unwrap(), Duration::ZERO);
        assert_eq!(
            duration_arg("--press-every", 0.05, 0.2).unwrap(),
            Duration::from_secs_f32(0.2)
        );
    }

    #[test]
    fn duration_arg_rejects_unbounded_values() {
        let err = duration_arg("--seconds", f32::INFINITY, 0.0).unwrap_err();
        assert!(err.to_string().contains("--seconds"));
        assert!(duration_arg("--press-every", f32::NAN, 0.2).is_err());
    }
}
