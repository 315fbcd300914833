//! Local maxima search for the two-feature fit.

use ndarray::ArrayView2;

use crate::error::CentroidError;

/// A local maximum at pixel `(row, col)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

impl Peak {
    fn distance(&self, other: &Peak) -> f64 {
        let dr = self.row as f64 - other.row as f64;
        let dc = self.col as f64 - other.col as f64;
        (dr * dr + dc * dc).sqrt()
    }
}

/// Positive pixels not exceeded by any of their 8 neighbours, brightest first.
pub fn local_maxima(image: ArrayView2<f64>) -> Vec<Peak> {
    let (rows, cols) = image.dim();
    let mut peaks = Vec::new();
    for ((row, col), &value) in image.indexed_iter() {
        if value <= 0.0 {
            continue;
        }
        let mut is_max = true;
        'neighbours: for r in row.saturating_sub(1)..=(row + 1).min(rows - 1) {
            for c in col.saturating_sub(1)..=(col + 1).min(cols - 1) {
                if (r, c) != (row, col) && image[[r, c]] > value {
                    is_max = false;
                    break 'neighbours;
                }
            }
        }
        if is_max {
            peaks.push(Peak { row, col, value });
        }
    }
    peaks.sort_by(|a, b| b.value.total_cmp(&a.value));
    peaks
}

/// The brightest peak and the brightest one at least `min_separation`
/// pixels away from it.
pub fn two_peaks(
    image: ArrayView2<f64>,
    min_separation: f64,
) -> Result<(Peak, Peak), CentroidError> {
    let peaks = local_maxima(image);
    let first = *peaks
        .first()
        .ok_or(CentroidError::NothingAboveThreshold(0.0))?;
    let second = peaks
        .iter()
        .skip(1)
        .find(|p| p.distance(&first) >= min_separation)
        .copied()
        .ok_or(CentroidError::NoSecondPeak { min_separation })?;
    Ok((first, second))
}
