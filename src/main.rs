//! CLI entry point for scope-daq
//!
//! Acquires triggered waveforms and writes them as:
//! - `fetch`: one HDF5 file per run with growable per-channel datasets
//! - `crunch`: per-channel pedestal/signal statistics (`<prefix>.ch<N>.crunch`)
//! - `traces`: per-channel raw traces (`<prefix>.ch<N>.traces`)
//!
//! `settings` prints the instrument configuration as JSON.
//!
//! # Usage
//!
//! ```bash
//! scope-daq fetch cosmics -n 5000 --runs 3
//! scope-daq crunch led_scan -n 10000 -s 10 --pe 200 --ws 200 --we 600
//! scope-daq traces dark -n 1000 --time
//! ```
//!
//! Ctrl-C stops after the current trigger; everything acquired so far is kept.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use scope_daq::acquisition::{AcquisitionSession, OutputRequest, RunPlan, SessionReport};
use scope_daq::config::ScopeDaqConfig;
use scope_daq::data::hdf5_store::Hdf5Store;
use scope_daq::data::raw::RAW_EXTENSION;
use scope_daq::data::statistics::{StatisticsWindows, STATISTICS_EXTENSION};
use scope_daq::hardware::{MockScope, Oscilloscope};
use scope_daq::logging::{self, LoggingConfig};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "scope-daq", version)]
#[command(about = "Triggered waveform acquisition from a network oscilloscope", long_about = None)]
struct Cli {
    /// Configuration file (default: config/scope_daq.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Output filename prefix
    prefix: PathBuf,

    /// Number of events to capture in total
    #[arg(short = 'n', default_value_t = 1000)]
    events: u64,

    /// Number of sequential events to capture per trigger
    #[arg(short = 's', default_value_t = 1)]
    sequence: usize,

    /// Append a time string to the filename
    #[arg(long)]
    time: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store full traces in HDF5 files
    Fetch {
        #[command(flatten)]
        run: RunArgs,

        /// Number of runs, each in its own time-stamped file
        #[arg(short = 'r', long = "runs", default_value_t = 1)]
        runs: u32,
    },

    /// Store pedestal and signal window statistics
    Crunch {
        #[command(flatten)]
        run: RunArgs,

        /// Pedestal start index
        #[arg(long)]
        ps: Option<usize>,

        /// Pedestal end index
        #[arg(long)]
        pe: Option<usize>,

        /// Window start index
        #[arg(long)]
        ws: Option<usize>,

        /// Window end index
        #[arg(long)]
        we: Option<usize>,

        /// Load resistance in ohms
        #[arg(long)]
        load: Option<f64>,
    },

    /// Store raw traces with per-trace headers
    Traces {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Print the instrument settings
    Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ScopeDaqConfig::load_from(path),
        None => ScopeDaqConfig::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    config.validate().context("Invalid configuration")?;
    logging::init(LoggingConfig::from_config(&config).map_err(anyhow::Error::msg)?)
        .map_err(anyhow::Error::msg)?;

    let scope = build_scope(&config)?;
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current trigger");
            interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Fetch { run, runs } => fetch(scope.as_ref(), &config, run, runs, &cancel).await,
        Commands::Crunch {
            run,
            ps,
            pe,
            ws,
            we,
            load,
        } => {
            let defaults = config.statistics;
            let windows = StatisticsWindows {
                ped_start: ps.unwrap_or(defaults.ped_start),
                ped_end: pe.unwrap_or(defaults.ped_end),
                win_start: ws.unwrap_or(defaults.win_start),
                win_end: we.unwrap_or(defaults.win_end),
                load_ohms: load.unwrap_or(defaults.load_ohms),
            };
            let prefix = output_prefix(&run.prefix, run.time);
            announce_outputs(&prefix, STATISTICS_EXTENSION);
            let output = OutputRequest::Statistics { prefix, windows };
            acquire(scope.as_ref(), &config, &run, output, &cancel).await?;
            Ok(())
        }
        Commands::Traces { run } => {
            let prefix = output_prefix(&run.prefix, run.time);
            announce_outputs(&prefix, RAW_EXTENSION);
            let output = OutputRequest::Raw { prefix };
            acquire(scope.as_ref(), &config, &run, output, &cancel).await?;
            Ok(())
        }
        Commands::Settings => print_settings(scope.as_ref()).await,
    }
}

fn build_scope(config: &ScopeDaqConfig) -> Result<Box<dyn Oscilloscope>> {
    match config.instrument.driver.as_str() {
        "simulated" => Ok(Box::new(MockScope::with_config(
            config.instrument.mock_config(),
        ))),
        other => bail!(
            "Unsupported instrument driver '{}'. Available: simulated",
            other
        ),
    }
}

/// `<prefix>_<asctime with dashes>` when requested.
fn output_prefix(prefix: &Path, with_time: bool) -> PathBuf {
    if !with_time {
        return prefix.to_path_buf();
    }
    let stamp = chrono::Local::now()
        .format("%a %b %e %H:%M:%S %Y")
        .to_string()
        .replace(' ', "-");
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("_{}", stamp));
    PathBuf::from(name)
}

/// `<prefix>.ch<N>.<ext>` as shown to the user.
fn output_pattern(prefix: &Path, extension: &str) -> String {
    format!("{}.ch<N>.{}", prefix.display(), extension)
}

fn announce_outputs(prefix: &Path, extension: &str) {
    println!("{}", "-".repeat(65));
    println!("Saving to files {}", output_pattern(prefix, extension));
    println!("{}", "-".repeat(65));
}

async fn fetch(
    scope: &dyn Oscilloscope,
    config: &ScopeDaqConfig,
    run: RunArgs,
    runs: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    if runs < 1 {
        bail!("Please specify a number >= 1 for number of runs");
    }
    let stamped = runs > 1 || run.time;

    for index in 0..runs {
        if cancel.is_cancelled() {
            info!("Skipping remaining {} runs", runs - index);
            break;
        }
        let mut filename = output_prefix(&run.prefix, stamped).into_os_string();
        filename.push(".h5");
        let filename = PathBuf::from(filename);
        println!("{}", "-".repeat(65));
        println!("Saving to file {}", filename.display());
        println!("{}", "-".repeat(65));

        let store = Hdf5Store::create_file(&filename, config.storage.compression_level)
            .with_context(|| format!("Failed to create {}", filename.display()))?;
        let report = acquire(scope, config, &run, OutputRequest::Tabular(Box::new(store)), cancel).await?;
        if report.acquisition.events_completed > 0 {
            println!("Wrote to file '{}'.", filename.display());
        }
    }
    Ok(())
}

async fn acquire(
    scope: &dyn Oscilloscope,
    config: &ScopeDaqConfig,
    run: &RunArgs,
    output: OutputRequest,
    cancel: &CancellationToken,
) -> Result<SessionReport> {
    let plan = RunPlan {
        target_events: run.events,
        requested_sequence: run.sequence,
        require_exact_sequence: config.acquisition.require_exact_sequence,
        retry_delay: config.acquisition.retry_delay(),
    };
    let result = AcquisitionSession::new(scope, plan)
        .with_cancellation(cancel.clone())
        .with_progress(|completed, target| {
            eprint!("\rfetching event: {}/{}", completed, target);
            let _ = std::io::stderr().flush();
        })
        .run(output)
        .await;
    eprintln!();
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if let Some(completed) = e.events_completed() {
                println!("Completed {} events before the failure.", completed);
            }
            return Err(anyhow::Error::new(e).context("Acquisition failed"));
        }
    };

    if report.acquisition.cancelled {
        println!("User interrupted fetch early");
    }
    if report.acquisition.events_completed > 0 {
        println!(
            "Completed {} events in {:.3} seconds.",
            report.acquisition.events_completed,
            report.elapsed.as_secs_f64()
        );
        println!(
            "Averaged {:.5} seconds per acquisition.",
            report.seconds_per_acquisition()
        );
    }
    Ok(report)
}

async fn print_settings(scope: &dyn Oscilloscope) -> Result<()> {
    scope.connect().await.context("Failed to connect")?;
    scope.clear().await?;
    let settings = scope.read_settings().await?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    scope.clear().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_channel_outputs_are_announced_by_pattern() {
        assert_eq!(
            output_pattern(Path::new("led_scan"), STATISTICS_EXTENSION),
            "led_scan.ch<N>.crunch"
        );
        assert_eq!(
            output_pattern(Path::new("runs/dark"), RAW_EXTENSION),
            "runs/dark.ch<N>.traces"
        );
    }

    #[test]
    fn untimed_prefix_is_unchanged() {
        assert_eq!(output_prefix(Path::new("cosmics"), false), PathBuf::from("cosmics"));
        let stamped = output_prefix(Path::new("cosmics"), true);
        let name = stamped.to_string_lossy();
        assert!(name.starts_with("cosmics_"));
        assert!(!name.contains(' '));
    }
}
