//! Piezo stage interface.
//!
//! The confocal stage is a 3-axis closed-loop piezo scanner. Scans use two
//! of its axes at a time: one driven continuously by the controller's wave
//! generator (ramp mode) or point by point (step mode), the other stepped
//! once per line.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{HardwareError, HardwareResult};

/// Physical stage axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// Lowercase axis identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            _ => Err(format!("Invalid axis: {s}, expected x, y or z")),
        }
    }
}

/// Stage position in physical units (µm).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl StagePosition {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Position of a single axis.
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Copy with one axis replaced.
    pub fn with(mut self, axis: Axis, value: f64) -> Self {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
        self
    }
}

/// Symmetric go/return linear ramp executed by the stage's wave generator.
///
/// One waveform cycle is one scan line: the axis sweeps from
/// `center - total_range/2` to `center + total_range/2` and back. The
/// outer `margin` on each end absorbs the turnaround; the controller's
/// trigger output is asserted only while the axis is inside the central
/// `active_range`, once per direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampWaveform {
    /// Center of the sweep
    pub center: f64,
    /// Span over which the trigger line is high
    pub active_range: f64,
    /// Settling margin added on each end
    pub margin: f64,
    /// Number of wave table points for one go/return cycle
    pub points: usize,
    /// Fraction of each sweep the controller may spend speeding up / slowing down
    pub speed_fraction: f64,
}

impl RampWaveform {
    /// Ramp over `active_range` with the standard `active_range / 6` margins.
    pub fn new(center: f64, active_range: f64, points: usize, speed_fraction: f64) -> Self {
        Self {
            center,
            active_range,
            margin: active_range / 6.0,
            points,
            speed_fraction,
        }
    }

    /// Full travel including both margins.
    pub fn total_range(&self) -> f64 {
        self.active_range + 2.0 * self.margin
    }

    /// Position where each cycle starts and ends.
    pub fn start(&self) -> f64 {
        self.center - self.total_range() / 2.0
    }

    /// Commanded position at `phase` in `[0, 1)` of the cycle.
    ///
    /// The first half of the cycle is the forward sweep, the second half
    /// the return sweep.
    pub fn position_at(&self, phase: f64) -> f64 {
        let phase = phase.rem_euclid(1.0);
        let total = self.total_range();
        if phase < 0.5 {
            self.start() + 2.0 * phase * total
        } else {
            self.start() + total - 2.0 * (phase - 0.5) * total
        }
    }

    /// Whether the trigger output is high at `phase`.
    pub fn trigger_at(&self, phase: f64) -> bool {
        (self.position_at(phase) - self.center).abs() <= self.active_range / 2.0
    }

    /// Wave table point ranges `[start, end)` where the trigger is high,
    /// forward sweep first.
    pub fn trigger_windows(&self) -> [(usize, usize); 2] {
        let half = self.points / 2;
        let lead = ((self.margin / self.total_range()) * half as f64).round() as usize;
        [
            (lead, half - lead),
            (half + lead, self.points - lead),
        ]
    }

    /// Wave table positions for one cycle.
    pub fn table(&self) -> Vec<f64> {
        (0..self.points)
            .map(|i| self.position_at(i as f64 / self.points as f64))
            .collect()
    }
}

/// Interface for the scanning stage.
///
/// Abstracts the piezo controller so the scan engine can run against real
/// hardware or the simulated bench.
pub trait StageInterface: Send {
    /// Command one or more axes to absolute positions.
    ///
    /// Returns once the command is accepted; use
    /// [`wait_on_target`](Self::wait_on_target) to wait for settling.
    fn move_to(&mut self, targets: &[(Axis, f64)]) -> HardwareResult<()>;

    /// Current measured position of all axes.
    fn current_position(&mut self) -> HardwareResult<StagePosition>;

    /// On-target state for each requested axis, in request order.
    fn is_on_target(&mut self, axes: &[Axis]) -> HardwareResult<Vec<bool>>;

    /// Load a ramp waveform into the wave generator driving `axis`.
    fn program_ramp_waveform(&mut self, axis: Axis, waveform: &RampWaveform)
        -> HardwareResult<()>;

    /// Run one cycle of the waveform previously programmed for `axis`.
    fn start_waveform(&mut self, axis: Axis) -> HardwareResult<()>;

    /// Poll [`is_on_target`](Self::is_on_target) until every axis settles
    /// or `timeout` expires.
    fn wait_on_target(
        &mut self,
        axes: &[Axis],
        timeout: Duration,
        poll_interval: Duration,
    ) -> HardwareResult<()> {
        let start = Instant::now();
        loop {
            let on_target = self.is_on_target(axes)?;
            if on_target.iter().all(|&v| v) {
                trace!("Axes {:?} on target after {:?}", axes, start.elapsed());
                return Ok(());
            }

            if start.elapsed() > timeout {
                let pending: Vec<String> = axes
                    .iter()
                    .zip(on_target)
                    .filter(|(_, ok)| !ok)
                    .map(|(axis, _)| axis.to_string())
                    .collect();
                return Err(HardwareError::Timeout {
                    what: format!("on-target on axes [{}]", pending.join(", ")),
                    elapsed_ms: start.elapsed().as_millis(),
                });
            }

            std::thread::sleep(poll_interval);
        }
    }
}
