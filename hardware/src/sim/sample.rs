//! Synthetic sample for the simulated bench.

use serde::{Deserialize, Serialize};

use crate::stage::StagePosition;

/// A point-like feature: 3D Gaussian intensity profile.
///
/// Negative `amplitude` produces a dark feature on the background.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedSpot {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub amplitude: f64,
    /// Lateral Gaussian sigma
    pub sigma: f64,
    /// Axial Gaussian sigma
    pub sigma_z: f64,
}

impl SimulatedSpot {
    /// Bright spot in the focal plane `z`.
    pub fn bright(x: f64, y: f64, z: f64, amplitude: f64, sigma: f64) -> Self {
        Self {
            x,
            y,
            z,
            amplitude,
            sigma,
            sigma_z: 3.0 * sigma,
        }
    }

    fn intensity(&self, p: &StagePosition) -> f64 {
        let dx = p.x - self.x;
        let dy = p.y - self.y;
        let dz = p.z - self.z;
        let lateral = (dx * dx + dy * dy) / (2.0 * self.sigma * self.sigma);
        let axial = (dz * dz) / (2.0 * self.sigma_z * self.sigma_z);
        self.amplitude * (-(lateral + axial)).exp()
    }
}

/// Photodiode signal as a function of focal-spot position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatedSample {
    /// Constant photodiode level (V)
    pub background: f64,
    pub spots: Vec<SimulatedSpot>,
}

impl SimulatedSample {
    pub fn new(background: f64, spots: Vec<SimulatedSpot>) -> Self {
        Self { background, spots }
    }

    /// Photodiode voltage with the focus at `position`.
    pub fn intensity(&self, position: &StagePosition) -> f64 {
        self.background
            + self
                .spots
                .iter()
                .map(|spot| spot.intensity(position))
                .sum::<f64>()
    }

    /// Move every feature by `(dx, dy)`, emulating sample drift.
    pub fn shift(&mut self, dx: f64, dy: f64) {
        for spot in &mut self.spots {
            spot.x += dx;
            spot.y += dy;
        }
    }
}
