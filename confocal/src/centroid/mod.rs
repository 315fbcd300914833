//! Feature localization in scan images.
//!
//! Pipeline: normalize for the configured polarity, zero everything below
//! the threshold, then locate with one of:
//!
//! - center of mass of the thresholded image
//! - a single 2D Gaussian fit on the normalized (unthresholded) image,
//!   seeded at the center of mass
//! - two separated local maxima, each refined by its own Gaussian fit
//!
//! Pixel positions are converted to stage coordinates with the scan's
//! pixel pitch and the stage position the scan was centered on.

pub mod gaussian;
pub mod moments;
pub mod normalize;
pub mod peaks;

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CenteringMethod, CentroidSettings, ScanConfig};
use crate::error::CentroidError;

pub use gaussian::{fit_gaussian, Gaussian2d, GaussianFit};
pub use moments::{center_of_mass, moments, Moments};
pub use normalize::{normalize, threshold};
pub use peaks::{two_peaks, Peak};

/// One located feature.
///
/// `x` is along the fast axis (image columns), `y` along the slow axis (rows).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CentroidEstimate {
    pub x_physical: f64,
    pub y_physical: f64,
    pub x_pixel: f64,
    pub y_pixel: f64,
}

/// Result for one scan: a primary feature and, for the two-peak method, a
/// second one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CentroidResult {
    pub primary: CentroidEstimate,
    pub secondary: Option<CentroidEstimate>,
}

impl CentroidResult {
    /// All located features, primary first.
    pub fn features(&self) -> impl Iterator<Item = &CentroidEstimate> {
        std::iter::once(&self.primary).chain(self.secondary.iter())
    }
}

/// Half-width of the fit window around each peak in two-peak mode.
fn fit_window_radius(settings: &CentroidSettings) -> usize {
    (settings.min_peak_separation.ceil() as usize).max(3)
}

/// Seed a Gaussian from the moments of the thresholded image.
fn seed_from(
    filtered: ArrayView2<f64>,
    normalized: ArrayView2<f64>,
) -> Result<Gaussian2d, CentroidError> {
    let m = moments(filtered)?;
    let row = (m.y.round() as usize).min(normalized.nrows() - 1);
    let col = (m.x.round() as usize).min(normalized.ncols() - 1);
    Ok(Gaussian2d {
        amplitude: normalized[[row, col]].max(0.1),
        x0: m.x,
        y0: m.y,
        sigma_x: m.m_xx.sqrt().max(0.5),
        sigma_y: m.m_yy.sqrt().max(0.5),
        offset: 0.0,
    })
}

/// Normalizes, thresholds and locates features in scan images.
#[derive(Debug, Clone, Default)]
pub struct CentroidEstimator {
    settings: CentroidSettings,
}

impl CentroidEstimator {
    pub fn new(settings: CentroidSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CentroidSettings {
        &self.settings
    }

    /// Feature positions in pixels as `(x, y)`, primary first.
    pub fn locate(&self, image: ArrayView2<f64>) -> Result<Vec<(f64, f64)>, CentroidError> {
        let settings = &self.settings;
        let normalized = normalize(image, settings.polarity, settings.choose_threshold)?;
        let filtered = threshold(&normalized, settings.threshold);

        match settings.method {
            CenteringMethod::CenterOfMass => {
                let (x, y) = center_of_mass(filtered.view())
                    .map_err(|_| CentroidError::NothingAboveThreshold(settings.threshold))?;
                Ok(vec![(x, y)])
            }
            CenteringMethod::GaussianFit => {
                let seed = seed_from(filtered.view(), normalized.view())
                    .map_err(|_| CentroidError::NothingAboveThreshold(settings.threshold))?;
                let fit = fit_gaussian(normalized.view(), seed, settings.max_iterations)?;
                Ok(vec![(fit.model.x0, fit.model.y0)])
            }
            CenteringMethod::TwoPeakGaussianFit => {
                let (first, second) = two_peaks(filtered.view(), settings.min_peak_separation)?;
                let radius = fit_window_radius(settings);
                [first, second]
                    .iter()
                    .map(|peak| self.refine_peak(&normalized, &filtered, peak, radius))
                    .collect()
            }
        }
    }

    /// Gaussian fit in a window around `peak`, in full-image pixels.
    fn refine_peak(
        &self,
        normalized: &Array2<f64>,
        filtered: &Array2<f64>,
        peak: &Peak,
        radius: usize,
    ) -> Result<(f64, f64), CentroidError> {
        let (rows, cols) = normalized.dim();
        let r0 = peak.row.saturating_sub(radius);
        let c0 = peak.col.saturating_sub(radius);
        let r1 = (peak.row + radius + 1).min(rows);
        let c1 = (peak.col + radius + 1).min(cols);

        let window = normalized.slice(s![r0..r1, c0..c1]);
        let seed = seed_from(filtered.slice(s![r0..r1, c0..c1]), window)?;
        let fit = fit_gaussian(window, seed, self.settings.max_iterations)?;
        debug!(
            "Peak at ({}, {}) refined to ({:.3}, {:.3})",
            peak.col,
            peak.row,
            fit.model.x0 + c0 as f64,
            fit.model.y0 + r0 as f64
        );
        Ok((fit.model.x0 + c0 as f64, fit.model.y0 + r0 as f64))
    }

    /// Locate features and convert them to stage coordinates for a scan of
    /// `config` centered on `origin` (fast, slow).
    pub fn estimate(
        &self,
        image: ArrayView2<f64>,
        config: &ScanConfig,
        origin: (f64, f64),
    ) -> Result<CentroidResult, CentroidError> {
        let to_estimate = |(x_pixel, y_pixel): (f64, f64)| {
            let (x_physical, y_physical) = config.coordinates_position(origin, x_pixel, y_pixel);
            CentroidEstimate {
                x_physical,
                y_physical,
                x_pixel,
                y_pixel,
            }
        };

        let mut located = self.locate(image)?.into_iter().map(to_estimate);
        let primary = located.next().ok_or(CentroidError::EmptyImage)?;
        Ok(CentroidResult {
            primary,
            secondary: located.next(),
        })
    }
}
