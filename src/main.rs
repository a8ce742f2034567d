//! CLI Entry Point for colorcal
//!
//! ```bash
//! colorcal probe /dev/ttyUSB0
//! colorcal calibrate usb --mode emissive
//! colorcal read /dev/serial/by-id/usb-SMCUBE --mode reflective --count 5 --json
//! colorcal simulate --mode reflective
//! colorcal cache clear
//! ```
//!
//! Ctrl-C raises the session abort flag; whatever is running unwinds with
//! `UserAbort` and the link is released.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colorcal::config::AppConfig;
use colorcal::host::ConsoleHost;
use colorcal::logging;
use colorcal_core::abort::AbortFlag;
use colorcal_core::calibration::{CalibrationRequest, CalibrationType};
use colorcal_core::capabilities::{Mode, Operation};
use colorcal_core::data::CalibratedReading;
use colorcal_hardware::probe::{probe_and_open_link, SystemOpener};
use colorcal_hardware::{CalibrationCache, Instrument, SimulationScript};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "colorcal")]
#[command(about = "Colorimeter calibration and measurement", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = colorcal::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the instrument at a path
    Probe {
        /// Serial path, by-id name, `usb` or `usb:VVVV:PPPP`
        path: Option<String>,
    },

    /// Run calibrations, prompting on the console
    Calibrate {
        /// Serial path, by-id name, `usb` or `usb:VVVV:PPPP`
        path: Option<String>,

        /// Measurement mode to calibrate for
        #[arg(long, default_value = "emissive")]
        mode: Mode,

        /// Which calibrations to run
        #[arg(long, value_enum, default_value_t = Which::Needed)]
        which: Which,
    },

    /// Take readings
    Read {
        /// Serial path, by-id name, `usb` or `usb:VVVV:PPPP`
        path: Option<String>,

        /// Measurement mode
        #[arg(long, default_value = "emissive")]
        mode: Mode,

        /// Number of readings
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Print readings as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Calibrate and read against the simulated instrument
    Simulate {
        /// Measurement mode
        #[arg(long, default_value = "emissive")]
        mode: Mode,

        /// Number of readings
        #[arg(long, default_value_t = 3)]
        count: u32,
    },

    /// Manage stored calibrations
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete every stored calibration
    Clear {
        /// Cache directory (defaults to the configured or platform directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Which {
    /// Only what the mode still needs
    Needed,
    /// Everything the mode supports
    All,
}

impl From<Which> for CalibrationRequest {
    fn from(which: Which) -> Self {
        match which {
            Which::Needed => CalibrationRequest::Needed,
            Which::All => CalibrationRequest::All,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    logging::init(&config.logging)?;

    let abort = AbortFlag::new();
    watch_ctrl_c(abort.clone());

    match cli.command {
        Commands::Probe { path } => probe(&config, &port(&config, path), &abort).await,
        Commands::Calibrate { path, mode, which } => {
            let mut instrument = open(&config, &port(&config, path), abort).await?;
            let result = calibrate(&mut instrument, mode, which.into()).await;
            instrument.close().await?;
            result
        }
        Commands::Read {
            path,
            mode,
            count,
            json,
        } => {
            let mut instrument = open(&config, &port(&config, path), abort).await?;
            let result = read(&mut instrument, mode, count, json).await;
            instrument.close().await?;
            result
        }
        Commands::Simulate { mode, count } => simulate(&config, mode, count).await,
        Commands::Cache {
            action: CacheAction::Clear { dir },
        } => clear_cache(&config, dir).await,
    }
}

fn watch_ctrl_c(abort: AbortFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, aborting");
            abort.trigger();
        }
    });
}

fn port(config: &AppConfig, path: Option<String>) -> String {
    path.unwrap_or_else(|| config.instrument.port.clone())
}

async fn probe(config: &AppConfig, path: &str, abort: &AbortFlag) -> Result<()> {
    let (kind, _link) = probe_and_open_link(&SystemOpener, path, &config.session, abort)
        .await
        .with_context(|| format!("Probing {path}"))?;
    println!("{path}: {kind}");
    Ok(())
}

async fn open(config: &AppConfig, path: &str, abort: AbortFlag) -> Result<Instrument> {
    let mut instrument = match config.instrument.kind {
        Some(kind) => {
            let opener = SystemOpener;
            let device = colorcal_hardware::port_resolver::DevicePath::parse(path)
                .with_context(|| format!("Invalid device path {path}"))?;
            let link = colorcal_hardware::LinkOpener::open(&opener, &device, &config.session)
                .await
                .with_context(|| format!("Opening {path}"))?;
            Instrument::open(kind, link, &config.session, abort).await
        }
        None => Instrument::probe_and_open_with(&SystemOpener, path, &config.session, abort).await,
    }
    .with_context(|| format!("Opening instrument at {path}"))?;
    instrument.set_host(Some(Arc::new(ConsoleHost::stdin())));

    let id = instrument.identity();
    eprintln!(
        "{} {} (firmware {}, serial {})",
        instrument.instrument_type(),
        id.model,
        id.firmware,
        id.serial
    );
    Ok(instrument)
}

async fn calibrate(instrument: &mut Instrument, mode: Mode, request: CalibrationRequest) -> Result<()> {
    instrument.set_mode(mode).await.context("Selecting mode")?;
    let summary = instrument
        .calibrate_request(request)
        .await
        .context("Calibration failed")?;
    if summary.completed.is_empty() && summary.skipped.is_empty() {
        eprintln!("Nothing to calibrate in {mode} mode");
    } else {
        eprintln!(
            "Calibrated: {}",
            describe(summary.completed).unwrap_or_else(|| "none".into())
        );
        if let Some(skipped) = describe(summary.skipped) {
            eprintln!("Skipped: {skipped}");
        }
    }
    Ok(())
}

async fn read(instrument: &mut Instrument, mode: Mode, count: u32, json: bool) -> Result<()> {
    instrument.set_mode(mode).await.context("Selecting mode")?;
    if !instrument.needed_and_available_calibrations().0.non_deferrable().is_empty() {
        instrument
            .calibrate()
            .await
            .context("Calibration required before reading")?;
    }
    for _ in 0..count {
        let reading = instrument.read_sample(mode).await.context("Reading failed")?;
        print_reading(&reading, json)?;
    }
    if instrument.supports(Operation::ReadTemperature) {
        let celsius = instrument.read_temperature().await?;
        eprintln!("Sensor temperature {celsius:.1} °C");
    }
    Ok(())
}

fn print_reading(reading: &CalibratedReading, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(reading)?);
    } else {
        let xyz = reading.xyz();
        println!(
            "X {:.4}  Y {:.4}  Z {:.4}  ({:?}, {} samples)",
            xyz.x,
            xyz.y,
            xyz.z,
            reading.confidence(),
            reading.samples()
        );
    }
    Ok(())
}

fn describe(kinds: CalibrationType) -> Option<String> {
    let labels: Vec<&str> = kinds.iter().map(CalibrationType::label).collect();
    (!labels.is_empty()).then(|| labels.join(", "))
}

async fn simulate(config: &AppConfig, mode: Mode, count: u32) -> Result<()> {
    let script = SimulationScript {
        sensor_covered: true,
        luminance: vec![100.0, 98.2, 97.9],
        ..Default::default()
    };
    let mut instrument = Instrument::simulated(script, &config.session)
        .await
        .context("Starting simulation")?;
    watch_ctrl_c(instrument.abort_flag());
    instrument.set_host(Some(Arc::new(ConsoleHost::stdin())));

    let result = async {
        calibrate(&mut instrument, mode, CalibrationRequest::Needed).await?;
        read(&mut instrument, mode, count, false).await
    }
    .await;
    instrument.close().await?;
    result
}

async fn clear_cache(config: &AppConfig, dir: Option<PathBuf>) -> Result<()> {
    let dir = dir.or_else(|| config.session.calibration.cache_dir.clone());
    let cache = CalibrationCache::at_or_default(dir.as_deref())
        .context("No cache directory available on this platform")?;
    let removed = cache.clear().await?;
    println!("Removed {removed} calibration(s) from {}", cache.dir().display());
    Ok(())
}
