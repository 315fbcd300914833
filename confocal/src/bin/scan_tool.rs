//! Confocal scan tool.
//!
//! Runs scans against the simulated bench and writes the products to an
//! output directory:
//! - `scan`: one ramp or step scan, optionally locating and re-centering on
//!   a feature
//! - `drift`: periodic drift scans, writing a drift log at the end
//!
//! Settings come from an optional JSON file (`--config`) holding `scan`
//! ([`ScanConfig`]) and `centroid` ([`CentroidSettings`]) sections, with
//! command-line overrides applied on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use confocal::{
    CenteringMethod, CentroidSettings, DriftCorrector, ScanAxisPair, ScanConfig, ScanController,
    ScanEvent, ScanHardware, ScanMode, ScanObservers, ScanRequest, ScanSession, SessionPurpose,
    TickOutcome,
};
use hardware::sim::{SimulatedBench, SimulatedSample, SimulatedSpot};
use hardware::{Axis, StagePosition};
use serde::Deserialize;
use shared::DirectorySink;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Where the simulated focus starts (µm)
const SIM_START: f64 = 50.0;

/// Confocal scan acquisition and centroid tool
#[derive(Parser, Debug)]
#[command(name = "scan_tool")]
#[command(about = "Scan acquisition and feature centroiding on the simulated confocal bench")]
#[command(version)]
struct Args {
    /// JSON settings file with optional `scan` and `centroid` sections
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output directory for images and logs
    #[arg(short, long, global = true, default_value = "scan_output")]
    output: PathBuf,

    /// Laser line whose shutter is opened during scans
    #[arg(long, global = true, default_value = "532")]
    channel: String,

    /// Axis pair, fast axis first (xy, xz, yx, yz)
    #[arg(long, global = true, default_value = "xy")]
    axes: ScanAxisPair,

    /// Scan mode (ramp or step)
    #[arg(long, global = true, default_value = "ramp")]
    mode: ScanMode,

    /// Fast-axis range override (µm)
    #[arg(long, global = true)]
    range_x: Option<f64>,

    /// Slow-axis range override (µm)
    #[arg(long, global = true)]
    range_y: Option<f64>,

    /// Fast-axis pixel count override
    #[arg(long, global = true)]
    nx: Option<usize>,

    /// Slow-axis pixel count override
    #[arg(long, global = true)]
    ny: Option<usize>,

    /// Centering method override (center_of_mass, gaussian_fit, two_peak_gaussian_fit)
    #[arg(long, global = true, value_parser = parse_method)]
    method: Option<CenteringMethod>,

    /// Pause between controller ticks in milliseconds
    #[arg(long, global = true, default_value = "1")]
    tick_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single scan
    Scan {
        /// Locate the feature in the combined image
        #[arg(long)]
        centroid: bool,

        /// Move onto the located feature after the scan
        #[arg(long)]
        recenter: bool,

        /// Offset of the simulated spot from the start position (µm)
        #[arg(long, num_args = 2, allow_negative_numbers = true, default_values_t = [0.2, -0.15])]
        spot_offset: Vec<f64>,
    },

    /// Track feature drift with repeated scans
    Drift {
        /// Total monitoring time in seconds
        #[arg(long, default_value = "120")]
        total_s: f64,

        /// Time between drift scans in seconds
        #[arg(long, default_value = "40")]
        interval_s: f64,

        /// Simulated sample drift per cycle (µm)
        #[arg(long, num_args = 2, allow_negative_numbers = true, default_values_t = [0.01, -0.005])]
        drift_per_cycle: Vec<f64>,
    },
}

fn parse_method(s: &str) -> Result<CenteringMethod, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| format!("Invalid centering method {s}: {e}"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    scan: ScanConfig,
    centroid: CentroidSettings,
}

fn load_settings(path: Option<&Path>) -> Result<SettingsFile> {
    let Some(path) = path else {
        return Ok(SettingsFile::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse settings in {}", path.display()))
}

fn apply_overrides(args: &Args, settings: &mut SettingsFile) {
    let scan = &mut settings.scan;
    if let Some(v) = args.range_x {
        scan.range_x = v;
    }
    if let Some(v) = args.range_y {
        scan.range_y = v;
    }
    if let Some(v) = args.nx {
        scan.nx = v;
    }
    if let Some(v) = args.ny {
        scan.ny = v;
    }
    if let Some(method) = args.method {
        settings.centroid.method = method;
    }
}

fn build_bench(
    config: &ScanConfig,
    axes: ScanAxisPair,
    spot_offset: (f64, f64),
) -> SimulatedBench {
    let start = StagePosition::new(SIM_START, SIM_START, SIM_START);
    let spot_at = start
        .with(axes.fast(), start.get(axes.fast()) + spot_offset.0)
        .with(axes.slow(), start.get(axes.slow()) + spot_offset.1);
    let sample = SimulatedSample::new(
        0.05,
        vec![SimulatedSpot::bright(spot_at.x, spot_at.y, spot_at.z, 1.0, 0.25)],
    );
    SimulatedBench::new(
        sample,
        start,
        config.channels.photodiode.clone(),
        config.channels.trigger.clone(),
    )
}

fn build_session(
    args: &Args,
    settings: &SettingsFile,
    bench: &SimulatedBench,
    observers: ScanObservers,
) -> Result<ScanSession> {
    let hardware = ScanHardware {
        stage: Box::new(bench.stage()),
        digitizer: Box::new(bench.digitizer()),
        shutter: Box::new(bench.shutter()),
    };
    let mut controller = ScanController::new(hardware, observers)
        .with_sink(Box::new(DirectorySink::new(&args.output)));
    controller.configure(settings.scan.clone(), args.axes, args.mode)?;
    controller.set_centroid_settings(settings.centroid.clone())?;
    Ok(ScanSession::new(controller).with_tick_interval(Duration::from_millis(args.tick_ms)))
}

fn report_position(bench: &SimulatedBench) {
    let position = bench.position();
    let summary: Vec<String> = Axis::iter()
        .map(|axis| format!("{axis}={:.4}", position.get(axis)))
        .collect();
    info!("Final stage position: {}", summary.join(" "));
}

fn pair(values: &[f64], flag: &str) -> Result<(f64, f64)> {
    match values {
        [a, b] => Ok((*a, *b)),
        _ => bail!("{flag} takes exactly two values"),
    }
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    if !(value.is_finite() && value > 0.0) {
        bail!("{what} must be a positive number of seconds, got {value}");
    }
    Ok(Duration::from_secs_f64(value))
}

async fn run_scan(
    args: &Args,
    settings: &SettingsFile,
    centroid: bool,
    recenter: bool,
    spot_offset: (f64, f64),
) -> Result<()> {
    let bench = build_bench(&settings.scan, args.axes, spot_offset);
    let observers = ScanObservers::new();
    observers.register_callback(|event| {
        if let ScanEvent::PartialImage { completed, .. } = event {
            debug!("{completed} lines/points acquired");
        }
    });
    let mut session = build_session(args, settings, &bench, observers)?;

    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping scan");
            stop.stop();
        }
    });

    let mut request = ScanRequest::new(args.channel.clone(), SessionPurpose::None);
    if recenter {
        request = request.with_recenter();
    } else if centroid {
        request = request.with_centroid();
    }

    match session.run_scan(request).await? {
        TickOutcome::Completed(completion) => {
            match &completion.centroid {
                Some(Ok(result)) => {
                    for (i, feature) in result.features().enumerate() {
                        info!(
                            "Feature {i}: pixel ({:.2}, {:.2}), stage ({:.4}, {:.4})",
                            feature.x_pixel, feature.y_pixel, feature.x_physical, feature.y_physical
                        );
                    }
                }
                Some(Err(e)) => warn!("No centroid: {e}"),
                None => {}
            }
            info!("Scan finished in {:.2?}", completion.elapsed);
        }
        TickOutcome::Stopped => info!("Scan stopped"),
        other => warn!("Scan ended unexpectedly: {other:?}"),
    }
    report_position(&bench);
    Ok(())
}

async fn run_drift(
    args: &Args,
    settings: &SettingsFile,
    total_s: f64,
    interval_s: f64,
    drift_per_cycle: (f64, f64),
) -> Result<()> {
    let total = seconds(total_s, "Total duration")?;
    let interval = seconds(interval_s, "Refresh interval")?;
    let bench = build_bench(&settings.scan, args.axes, (0.0, 0.0));

    let observers = ScanObservers::new();
    let drifting = bench.clone();
    let (dx, dy) = drift_per_cycle;
    observers.register_purpose_callback(SessionPurpose::Drift, move |_| {
        drifting.shift_sample(dx, dy);
    });

    let mut drift = DriftCorrector::new(observers.clone())
        .with_sink(Box::new(DirectorySink::new(&args.output)));
    let mut session = build_session(args, settings, &bench, observers)?;

    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping drift monitoring");
            stop.stop();
        }
    });

    let series = session
        .run_drift(&mut drift, &args.channel, total, interval)
        .await?;
    for sample in &series {
        info!(
            "t={:7.1}s dx={:+.4} dy={:+.4}",
            sample.elapsed_s, sample.x_drift, sample.y_drift
        );
    }
    report_position(&bench);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut settings = load_settings(args.config.as_deref())?;
    apply_overrides(&args, &mut settings);
    info!("Writing products to {}", args.output.display());

    match &args.command {
        Command::Scan {
            centroid,
            recenter,
            spot_offset,
        } => {
            let offset = pair(spot_offset, "--spot-offset")?;
            run_scan(&args, &settings, *centroid, *recenter, offset).await
        }
        Command::Drift {
            total_s,
            interval_s,
            drift_per_cycle,
        } => {
            let per_cycle = pair(drift_per_cycle, "--drift-per-cycle")?;
            run_drift(&args, &settings, *total_s, *interval_s, per_cycle).await
        }
    }
}
