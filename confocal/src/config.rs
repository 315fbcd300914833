//! Scan geometry, timing and centroid settings.
//!
//! Everything here is plain serde data so a settings file can be loaded as
//! JSON and overridden from the command line. Unknown fields are rejected;
//! missing fields fall back to the bench defaults.

use std::time::Duration;

use hardware::{AnalogChannel, Axis};
use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::error::ConfigError;

/// Default digitizer rate for ramp lines (Hz).
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 100_000.0;
/// Default number of single sweeps per second.
pub const DEFAULT_RAMP_FREQUENCY_HZ: f64 = 10.0;
/// Default samples averaged per step-mode point.
pub const DEFAULT_SAMPLES_PER_POINT: usize = 10;
/// Default digitizer rate for step-mode points (Hz).
pub const DEFAULT_STEP_SAMPLE_RATE_HZ: f64 = 10_000.0;

/// Scan axes as `(fast, slow)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ScanAxisPair {
    #[default]
    XY,
    XZ,
    YX,
    YZ,
}

impl ScanAxisPair {
    /// Axis swept within a line.
    pub fn fast(self) -> Axis {
        match self {
            ScanAxisPair::XY | ScanAxisPair::XZ => Axis::X,
            ScanAxisPair::YX | ScanAxisPair::YZ => Axis::Y,
        }
    }

    /// Axis stepped between lines.
    pub fn slow(self) -> Axis {
        match self {
            ScanAxisPair::XY => Axis::Y,
            ScanAxisPair::XZ | ScanAxisPair::YZ => Axis::Z,
            ScanAxisPair::YX => Axis::X,
        }
    }

    /// Short label used in file names, e.g. `"x_y"`.
    pub fn label(self) -> &'static str {
        match self {
            ScanAxisPair::XY => "x_y",
            ScanAxisPair::XZ => "x_z",
            ScanAxisPair::YX => "y_x",
            ScanAxisPair::YZ => "y_z",
        }
    }
}

impl std::fmt::Display for ScanAxisPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.fast(), self.slow())
    }
}

impl std::str::FromStr for ScanAxisPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s
            .chars()
            .filter(|c| !matches!(c, '/' | '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match compact.as_str() {
            "xy" => Ok(ScanAxisPair::XY),
            "xz" => Ok(ScanAxisPair::XZ),
            "yx" => Ok(ScanAxisPair::YX),
            "yz" => Ok(ScanAxisPair::YZ),
            _ => Err(format!("Invalid axis pair: {s}, expected one of xy, xz, yx, yz")),
        }
    }
}

/// Line acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Continuous go/return sweep per line, demultiplexed by trigger edges
    #[default]
    Ramp,
    /// Move, settle and sample at every grid point
    Step,
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanMode::Ramp => write!(f, "ramp"),
            ScanMode::Step => write!(f, "step"),
        }
    }
}

impl std::str::FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ramp" => Ok(ScanMode::Ramp),
            "step" => Ok(ScanMode::Step),
            _ => Err(format!("Invalid scan mode: {s}, expected ramp or step")),
        }
    }
}

/// Visiting order of step-mode grid points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepOrder {
    /// Row by row, fast axis inner
    #[default]
    Raster,
    /// Outward from the grid center
    Spiral,
}

impl StepOrder {
    /// Grid points as `(row, col)` in visiting order. Every point appears once.
    pub fn points(self, rows: usize, cols: usize) -> Vec<(usize, usize)> {
        match self {
            StepOrder::Raster => (0..rows)
                .flat_map(|row| (0..cols).map(move |col| (row, col)))
                .collect(),
            StepOrder::Spiral => spiral_points(rows, cols),
        }
    }
}

fn spiral_points(rows: usize, cols: usize) -> Vec<(usize, usize)> {
    let total = rows * cols;
    let mut points = Vec::with_capacity(total);
    if total == 0 {
        return points;
    }

    let (mut row, mut col) = (((rows - 1) / 2) as i64, ((cols - 1) / 2) as i64);
    let directions = [(0i64, 1i64), (1, 0), (0, -1), (-1, 0)];
    let mut run = 1;
    let mut dir = 0;

    let in_grid = |r: i64, c: i64| r >= 0 && c >= 0 && (r as usize) < rows && (c as usize) < cols;
    points.push((row as usize, col as usize));

    while points.len() < total {
        for _ in 0..2 {
            let (dr, dc) = directions[dir % 4];
            for _ in 0..run {
                row += dr;
                col += dc;
                if in_grid(row, col) {
                    points.push((row as usize, col as usize));
                }
            }
            dir += 1;
        }
        run += 1;
    }
    points
}

/// Analog inputs used by the scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelMap {
    pub photodiode: AnalogChannel,
    pub trigger: AnalogChannel,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            photodiode: AnalogChannel::new("Dev1/ai0"),
            trigger: AnalogChannel::new("Dev1/ai1"),
        }
    }
}

/// Step-mode sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepSettings {
    /// Samples averaged per point (`Nph`)
    pub samples_per_point: usize,
    pub sample_rate_hz: f64,
    pub order: StepOrder,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            samples_per_point: DEFAULT_SAMPLES_PER_POINT,
            sample_rate_hz: DEFAULT_STEP_SAMPLE_RATE_HZ,
            order: StepOrder::Raster,
        }
    }
}

/// Bounded on-target polling after each commanded move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettleSettings {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for SettleSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            poll_interval_ms: 10,
        }
    }
}

impl SettleSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Derived ramp-mode parameters for one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampParameters {
    /// Scanned (triggered) span
    pub range: f64,
    /// Idle margin on each end, `range / 6`
    pub extra_margin: f64,
    /// `range + 2 * extra_margin`
    pub range_total: f64,
    /// Single sweeps per second
    pub frequency_hz: f64,
    /// Samples per go/return line, `2 * floor(sample_rate / frequency)`
    pub samples: usize,
}

impl RampParameters {
    /// Expected samples inside one trigger window.
    pub fn segment_samples(&self) -> usize {
        ((self.samples / 2) as f64 * self.range / self.range_total).floor() as usize
    }
}

/// Scan geometry and timing.
///
/// `x` is the fast (first) axis of the [`ScanAxisPair`], `y` the slow one.
/// Images are `(ny, nx)`: one row per slow-axis line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    pub range_x: f64,
    pub range_y: f64,
    pub nx: usize,
    pub ny: usize,
    pub sample_rate_hz: f64,
    pub ramp_frequency_hz: f64,
    /// Fraction of each sweep the wave generator may use for acceleration
    pub speed_fraction: f64,
    pub step: StepSettings,
    pub settle: SettleSettings,
    pub channels: ChannelMap,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            range_x: 2.0,
            range_y: 2.0,
            nx: 34,
            ny: 34,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            ramp_frequency_hz: DEFAULT_RAMP_FREQUENCY_HZ,
            speed_fraction: 0.05,
            step: StepSettings::default(),
            settle: SettleSettings::default(),
            channels: ChannelMap::default(),
        }
    }
}

/// Round to 3 decimals, the pitch resolution used for stage coordinates.
fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

impl ScanConfig {
    /// Geometry with default timing.
    pub fn new(range_x: f64, range_y: f64, nx: usize, ny: usize) -> Self {
        Self {
            range_x,
            range_y,
            nx,
            ny,
            ..Self::default()
        }
    }

    /// Check invariants for `mode`.
    pub fn validate(&self, mode: ScanMode) -> Result<(), ConfigError> {
        for (axis, value) in [("fast", self.range_x), ("slow", self.range_y)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidRange { axis, value });
            }
        }
        if self.nx == 0 {
            return Err(ConfigError::InvalidPixelCount { axis: "fast" });
        }
        if self.ny == 0 {
            return Err(ConfigError::InvalidPixelCount { axis: "slow" });
        }
        for (axis, range, pixels, pitch) in [
            ("fast", self.range_x, self.nx, self.pixel_pitch_x()),
            ("slow", self.range_y, self.ny, self.pixel_pitch_y()),
        ] {
            if pitch <= 0.0 {
                return Err(ConfigError::PitchUnderflow {
                    axis,
                    range,
                    pixels,
                });
            }
        }
        if !(0.0..0.5).contains(&self.speed_fraction) {
            return Err(ConfigError::InvalidSetting(format!(
                "speed fraction {} outside [0, 0.5)",
                self.speed_fraction
            )));
        }
        if self.settle.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidSetting(
                "on-target poll interval must be non-zero".to_string(),
            ));
        }

        match mode {
            ScanMode::Ramp => {
                if !(self.sample_rate_hz > 0.0 && self.ramp_frequency_hz > 0.0) {
                    return Err(ConfigError::InvalidRate(format!(
                        "{} Hz sampling at {} Hz ramp",
                        self.sample_rate_hz, self.ramp_frequency_hz
                    )));
                }
                let ramp = self.ramp_parameters();
                if ramp.samples < 2 {
                    return Err(ConfigError::InvalidRate(format!(
                        "ramp at {} Hz leaves no samples at {} Hz",
                        self.ramp_frequency_hz, self.sample_rate_hz
                    )));
                }
                let segment = ramp.segment_samples();
                if segment < self.nx {
                    return Err(ConfigError::RampUndersampled {
                        segment,
                        pixels: self.nx,
                    });
                }
            }
            ScanMode::Step => {
                if self.step.samples_per_point == 0 {
                    return Err(ConfigError::InvalidSetting(
                        "step mode needs at least one sample per point".to_string(),
                    ));
                }
                if self.step.sample_rate_hz <= 0.0 {
                    return Err(ConfigError::InvalidRate(format!(
                        "{} Hz step sampling",
                        self.step.sample_rate_hz
                    )));
                }
            }
        }
        Ok(())
    }

    /// Idle margin on each end of the fast axis.
    pub fn extra_margin_x(&self) -> f64 {
        self.range_x / 6.0
    }

    /// Idle margin on each end of the slow axis.
    pub fn extra_margin_y(&self) -> f64 {
        self.range_y / 6.0
    }

    pub fn range_total_x(&self) -> f64 {
        self.range_x + 2.0 * self.extra_margin_x()
    }

    pub fn range_total_y(&self) -> f64 {
        self.range_y + 2.0 * self.extra_margin_y()
    }

    /// Fast-axis ramp parameters.
    pub fn ramp_parameters(&self) -> RampParameters {
        let per_sweep = (self.sample_rate_hz / self.ramp_frequency_hz).floor();
        let samples = if per_sweep.is_finite() && per_sweep > 0.0 {
            2 * per_sweep as usize
        } else {
            0
        };
        RampParameters {
            range: self.range_x,
            extra_margin: self.extra_margin_x(),
            range_total: self.range_total_x(),
            frequency_hz: self.ramp_frequency_hz,
            samples,
        }
    }

    /// Fast-axis pixel pitch, rounded to 3 decimals.
    pub fn pixel_pitch_x(&self) -> f64 {
        round3(self.range_x / self.nx as f64)
    }

    /// Slow-axis pixel pitch, rounded to 3 decimals.
    pub fn pixel_pitch_y(&self) -> f64 {
        round3(self.range_y / self.ny as f64)
    }

    /// Stage coordinates of pixel `(xo, yo)` for a scan centered on `origin`.
    ///
    /// `x = origin.0 - range_x/2 + dx/2 + xo*dx`, likewise for `y`.
    pub fn coordinates_position(&self, origin: (f64, f64), xo: f64, yo: f64) -> (f64, f64) {
        let (dx, dy) = (self.pixel_pitch_x(), self.pixel_pitch_y());
        (
            origin.0 - self.range_x / 2.0 + dx / 2.0 + xo * dx,
            origin.1 - self.range_y / 2.0 + dy / 2.0 + yo * dy,
        )
    }

    /// Inverse of [`coordinates_position`](Self::coordinates_position).
    pub fn pixel_of(&self, origin: (f64, f64), x: f64, y: f64) -> (f64, f64) {
        let (dx, dy) = (self.pixel_pitch_x(), self.pixel_pitch_y());
        (
            (x - origin.0 + self.range_x / 2.0 - dx / 2.0) / dx,
            (y - origin.1 + self.range_y / 2.0 - dy / 2.0) / dy,
        )
    }
}

/// Which image values count as the feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanImagePolarity {
    /// Bright feature
    #[default]
    Maximum,
    /// Dark feature
    Minimum,
    /// Pick per image from the mean level
    Choose,
    /// One bright and one dark feature
    TwoFeatureMinMax,
}

/// Feature localization algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CenteringMethod {
    #[default]
    CenterOfMass,
    GaussianFit,
    TwoPeakGaussianFit,
}

/// Centroid estimation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CentroidSettings {
    pub polarity: ScanImagePolarity,
    pub method: CenteringMethod,
    /// Normalized pixels below this are zeroed before localization
    pub threshold: f64,
    /// `Choose` seeks a minimum when `mean > choose_threshold * max`
    pub choose_threshold: f64,
    /// Minimum distance between the two peaks (pixels)
    pub min_peak_separation: f64,
    pub max_iterations: usize,
}

impl Default for CentroidSettings {
    fn default() -> Self {
        Self {
            polarity: ScanImagePolarity::Maximum,
            method: CenteringMethod::CenterOfMass,
            threshold: 0.3,
            choose_threshold: 0.3,
            min_peak_separation: 3.0,
            max_iterations: 100,
        }
    }
}

impl CentroidSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(ConfigError::InvalidSetting(format!(
                "centroid threshold {} outside [0, 1)",
                self.threshold
            )));
        }
        if !(self.choose_threshold.is_finite() && self.choose_threshold >= 0.0) {
            return Err(ConfigError::InvalidSetting(format!(
                "choose threshold {}",
                self.choose_threshold
            )));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidSetting(
                "Gaussian fit needs at least one iteration".to_string(),
            ));
        }
        Ok(())
    }
}
