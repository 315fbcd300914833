//! Intensity-weighted image moments.

use ndarray::ArrayView2;

use crate::error::CentroidError;

/// First and second moments of a non-negative image.
///
/// `x` runs along columns (fast axis), `y` along rows (slow axis).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    /// Total weight
    pub flux: f64,
    pub x: f64,
    pub y: f64,
    /// Second central moment along x
    pub m_xx: f64,
    /// Second central moment along y
    pub m_yy: f64,
}

/// Moments of `image`, treating negative pixels as zero.
pub fn moments(image: ArrayView2<f64>) -> Result<Moments, CentroidError> {
    let mut flux = 0.0;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    for ((row, col), &v) in image.indexed_iter() {
        let w = v.max(0.0);
        flux += w;
        sum_x += w * col as f64;
        sum_y += w * row as f64;
    }
    if flux <= 0.0 {
        return Err(CentroidError::NothingAboveThreshold(0.0));
    }
    let (x, y) = (sum_x / flux, sum_y / flux);

    let mut m_xx = 0.0;
    let mut m_yy = 0.0;
    for ((row, col), &v) in image.indexed_iter() {
        let w = v.max(0.0);
        m_xx += w * (col as f64 - x).powi(2);
        m_yy += w * (row as f64 - y).powi(2);
    }

    Ok(Moments {
        flux,
        x,
        y,
        m_xx: m_xx / flux,
        m_yy: m_yy / flux,
    })
}

/// Weighted pixel centroid `(x, y)` of a thresholded image.
///
/// Always inside `[0, ncols) x [0, nrows)`.
pub fn center_of_mass(image: ArrayView2<f64>) -> Result<(f64, f64), CentroidError> {
    let m = moments(image)?;
    Ok((m.x, m.y))
}
