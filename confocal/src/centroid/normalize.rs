//! Image normalization and thresholding ahead of feature localization.

use ndarray::{Array2, ArrayView2};
use tracing::debug;

use crate::config::ScanImagePolarity;
use crate::error::CentroidError;

fn min_max(image: ArrayView2<f64>) -> Result<(f64, f64), CentroidError> {
    if image.is_empty() {
        return Err(CentroidError::EmptyImage);
    }
    if image.iter().any(|v| !v.is_finite()) {
        return Err(CentroidError::NonFinite);
    }
    let min = image.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = image.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == min {
        return Err(CentroidError::FlatImage(max));
    }
    Ok((min, max))
}

/// `(Z - min) / (max - min)`.
pub fn normalize_unit(image: ArrayView2<f64>) -> Result<Array2<f64>, CentroidError> {
    let (min, max) = min_max(image)?;
    Ok(image.mapv(|v| (v - min) / (max - min)))
}

/// Map `image` so the sought feature(s) are the bright part of `[0, 1]`.
///
/// - `Maximum`: unit normalization
/// - `Minimum`: `|Zn - 1|`
/// - `Choose`: `Minimum` when the normalized mean exceeds
///   `choose_threshold * max`, else `Maximum`
/// - `TwoFeatureMinMax`: `|Z - mean| / (max - mean)`
///
/// A flat image is an error, never NaN.
pub fn normalize(
    image: ArrayView2<f64>,
    polarity: ScanImagePolarity,
    choose_threshold: f64,
) -> Result<Array2<f64>, CentroidError> {
    match polarity {
        ScanImagePolarity::Maximum => normalize_unit(image),
        ScanImagePolarity::Minimum => Ok(normalize_unit(image)?.mapv(|v| (v - 1.0).abs())),
        ScanImagePolarity::Choose => {
            let unit = normalize_unit(image)?;
            // Normalized max is 1
            let mean = unit.mean().unwrap_or(0.0);
            if mean > choose_threshold {
                debug!("Mean level {mean:.3} above {choose_threshold}, seeking minimum");
                Ok(unit.mapv(|v| (v - 1.0).abs()))
            } else {
                Ok(unit)
            }
        }
        ScanImagePolarity::TwoFeatureMinMax => {
            let (_, max) = min_max(image)?;
            let mean = image.mean().unwrap_or(0.0);
            Ok(image.mapv(|v| (v - mean).abs() / (max - mean)))
        }
    }
}

/// Zero every pixel below `threshold`.
pub fn threshold(image: &Array2<f64>, threshold: f64) -> Array2<f64> {
    image.mapv(|v| if v < threshold { 0.0 } else { v })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_unit_range() {
        let image = array![[2.0, 4.0], [6.0, 10.0]];
        let norm = normalize(image.view(), ScanImagePolarity::Maximum, 0.3).unwrap();
        assert_relative_eq!(norm[[0, 0]], 0.0);
        assert_relative_eq!(norm[[0, 1]], 0.25);
        assert_relative_eq!(norm[[1, 1]], 1.0);
    }

    #[test]
    fn test_minimum_inverts() {
        let image = array![[2.0, 4.0], [6.0, 10.0]];
        let norm = normalize(image.view(), ScanImagePolarity::Minimum, 0.3).unwrap();
        assert_relative_eq!(norm[[0, 0]], 1.0);
        assert_relative_eq!(norm[[1, 1]], 0.0);
    }

    #[test]
    fn test_choose_follows_background() {
        let mut dark = Array2::from_elem((5, 5), 1.0);
        dark[[2, 2]] = 0.0;
        let norm = normalize(dark.view(), ScanImagePolarity::Choose, 0.3).unwrap();
        assert_relative_eq!(norm[[2, 2]], 1.0);
        assert_relative_eq!(norm[[0, 0]], 0.0);

        let mut bright = Array2::from_elem((5, 5), 0.2);
        bright[[1, 3]] = 3.0;
        let norm = normalize(bright.view(), ScanImagePolarity::Choose, 0.3).unwrap();
        assert_relative_eq!(norm[[1, 3]], 1.0);
    }

    #[test]
    fn test_two_feature_folds_around_mean() {
        let mut image = Array2::from_elem((4, 4), 1.0);
        image[[0, 0]] = 2.0;
        image[[3, 3]] = 0.0;
        let norm = normalize(image.view(), ScanImagePolarity::TwoFeatureMinMax, 0.3).unwrap();
        assert_relative_eq!(norm[[0, 0]], 1.0);
        assert_relative_eq!(norm[[3, 3]], 1.0);
        assert_relative_eq!(norm[[1, 1]], 0.0);
    }

    #[test]
    fn test_flat_and_bad_images() {
        let flat = Array2::from_elem((3, 3), 0.7);
        for polarity in [
            ScanImagePolarity::Maximum,
            ScanImagePolarity::Minimum,
            ScanImagePolarity::Choose,
            ScanImagePolarity::TwoFeatureMinMax,
        ] {
            assert_eq!(
                normalize(flat.view(), polarity, 0.3),
                Err(CentroidError::FlatImage(0.7))
            );
        }
        let empty = Array2::<f64>::zeros((0, 4));
        assert_eq!(
            normalize_unit(empty.view()),
            Err(CentroidError::EmptyImage)
        );
        let nan = array![[0.0, f64::NAN]];
        assert_eq!(normalize_unit(nan.view()), Err(CentroidError::NonFinite));
    }

    #[test]
    fn test_threshold_zeroes_low_pixels() {
        let image = array![[0.1, 0.3], [0.29, 0.9]];
        let filtered = threshold(&image, 0.3);
        assert_eq!(filtered, array![[0.0, 0.3], [0.0, 0.9]]);
    }
}
