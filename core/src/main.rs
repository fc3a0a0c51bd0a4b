//! POSEFUSE: replay and simulation harness for the posefuse localization core.
//!
//! - `replay`: run the estimator over a CSV of recorded observations and export the poses.
//! - `simulate`: generate a seeded synthetic scenario, run the estimator over it and export the
//!   poses (and optionally the generated observations).
//! - `config`: write a default estimator configuration as a starting point.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use posefuse::Pose;
use posefuse::config::EstimatorConfig;
use posefuse::ingest::RawObservation;
use posefuse::sim::{ObservationRecord, PoseRecord, ScenarioConfig, ScenarioGenerator, replay};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Replay and simulation harness for the posefuse localization core."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(about = "Run the estimator over recorded observations")]
    Replay(ReplayArgs),
    #[command(about = "Run the estimator over a synthetic scenario")]
    Simulate(SimulateArgs),
    #[command(about = "Write a default configuration file (TOML/JSON/YAML by extension)")]
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    /// Observation CSV (timestamp, sensor_id, kind, v0..v5, c0..c5)
    #[arg(short, long)]
    input: PathBuf,
    /// Pose CSV output
    #[arg(short, long)]
    output: PathBuf,
    /// Estimator configuration (TOML/JSON/YAML); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Also write every pose as fixed-size binary records
    #[arg(long)]
    records: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Pose CSV output
    #[arg(short, long)]
    output: PathBuf,
    /// Scenario length in seconds
    #[arg(long, default_value_t = 30.0)]
    duration: f64,
    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Write the generated observations to this CSV
    #[arg(long)]
    observations: Option<PathBuf>,
    /// Start of an observation dropout window (s)
    #[arg(long, requires = "dropout_end")]
    dropout_start: Option<f64>,
    /// End of an observation dropout window (s)
    #[arg(long, requires = "dropout_start")]
    dropout_end: Option<f64>,
    /// Probability of corrupting an observation with NaN
    #[arg(long, default_value_t = 0.0)]
    corruption: f64,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Output path; the extension selects the format
    #[arg(short, long)]
    output: PathBuf,
}

/// Initialize the logger with the specified configuration
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<EstimatorConfig> {
    match path {
        Some(p) => EstimatorConfig::from_file(p)
            .with_context(|| format!("failed to load configuration from {}", p.display())),
        None => Ok(EstimatorConfig::default()),
    }
}

fn write_poses(poses: &[Pose], path: &Path) -> Result<()> {
    let records: Vec<PoseRecord> = poses.iter().map(PoseRecord::from).collect();
    PoseRecord::to_csv(&records, path)
        .with_context(|| format!("failed to write poses to {}", path.display()))?;
    let valid = poses.iter().filter(|p| p.valid).count();
    info!(
        "Wrote {} poses ({} valid) to {}",
        poses.len(),
        valid,
        path.display()
    );
    if let Some(last) = poses.last() {
        info!("Final {}", last);
    }
    Ok(())
}

fn write_records(poses: &[Pose], path: &Path) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for pose in poses {
        file.write_all(&pose.to_record())?;
    }
    info!("Wrote {} binary pose records to {}", poses.len(), path.display());
    Ok(())
}

fn run_replay(args: &ReplayArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    let records = ObservationRecord::from_csv(&args.input)
        .with_context(|| format!("failed to read observations from {}", args.input.display()))?;
    if records.is_empty() {
        warn!("No observations in {}", args.input.display());
    }
    let observations: Vec<RawObservation> = records.iter().map(ObservationRecord::to_raw).collect();
    info!(
        "Replaying {} observations from {}",
        observations.len(),
        args.input.display()
    );
    let poses = replay(&config, &observations)?;
    write_poses(&poses, &args.output)?;
    if let Some(path) = &args.records {
        write_records(&poses, path)?;
    }
    Ok(())
}

fn run_simulate(args: &SimulateArgs) -> Result<()> {
    if !(args.duration.is_finite() && args.duration > 0.0) {
        bail!("duration must be positive, got {}", args.duration);
    }
    if !(0.0..=1.0).contains(&args.corruption) {
        bail!("corruption must be a probability, got {}", args.corruption);
    }
    let scenario = ScenarioConfig {
        dropout: args.dropout_start.zip(args.dropout_end),
        corruption_probability: args.corruption,
        ..ScenarioConfig::default()
    };
    let mut generator = ScenarioGenerator::new(scenario, args.seed);
    let config = generator.estimator_config();
    let observations = generator.generate(args.duration);
    info!(
        "Generated {} observations over {:.1} s (seed {})",
        observations.len(),
        args.duration,
        args.seed
    );
    if let Some(path) = &args.observations {
        let records: Vec<ObservationRecord> =
            observations.iter().map(ObservationRecord::from).collect();
        ObservationRecord::to_csv(&records, path)
            .with_context(|| format!("failed to write observations to {}", path.display()))?;
    }
    let poses = replay(&config, &observations)?;
    if let Some(last) = poses.last() {
        let truth = generator.truth(last.timestamp);
        info!(
            "Final position error: {:.3} m",
            (last.position - truth.position).norm()
        );
    }
    write_poses(&poses, &args.output)
}

fn run_config(args: &ConfigArgs) -> Result<()> {
    EstimatorConfig::default()
        .to_file(&args.output)
        .with_context(|| format!("failed to write configuration to {}", args.output.display()))?;
    info!("Wrote default configuration to {}", args.output.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    match &cli.command {
        Command::Replay(args) => run_replay(args),
        Command::Simulate(args) => run_simulate(args),
        Command::Config(args) => run_config(args),
    }
}
