//! 2D Gaussian least-squares fit.
//!
//! Model: `a * exp(-(dx²/2sx² + dy²/2sy²)) + b` with `dx = col - x0`,
//! `dy = row - y0`. Solved with Levenberg-Marquardt using an analytic
//! Jacobian and adaptive damping.

use nalgebra::{SMatrix, SVector};
use ndarray::ArrayView2;
use tracing::trace;

use crate::error::CentroidError;

type Params = SVector<f64, 6>;
type Normal = SMatrix<f64, 6, 6>;

const MIN_SIGMA: f64 = 0.2;

/// Axis-aligned 2D Gaussian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gaussian2d {
    pub amplitude: f64,
    pub x0: f64,
    pub y0: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub offset: f64,
}

impl Gaussian2d {
    fn to_params(self) -> Params {
        Params::from([
            self.amplitude,
            self.x0,
            self.y0,
            self.sigma_x,
            self.sigma_y,
            self.offset,
        ])
    }

    fn from_params(p: &Params) -> Self {
        Self {
            amplitude: p[0],
            x0: p[1],
            y0: p[2],
            sigma_x: p[3],
            sigma_y: p[4],
            offset: p[5],
        }
    }

    /// Model value and gradient at pixel `(col, row)`.
    fn eval(&self, col: f64, row: f64) -> (f64, Params) {
        let dx = col - self.x0;
        let dy = row - self.y0;
        let sx2 = self.sigma_x * self.sigma_x;
        let sy2 = self.sigma_y * self.sigma_y;
        let e = (-(dx * dx / (2.0 * sx2) + dy * dy / (2.0 * sy2))).exp();
        let ae = self.amplitude * e;
        let grad = Params::from([
            e,
            ae * dx / sx2,
            ae * dy / sy2,
            ae * dx * dx / (sx2 * self.sigma_x),
            ae * dy * dy / (sy2 * self.sigma_y),
            1.0,
        ]);
        (ae + self.offset, grad)
    }

    /// Model value at pixel `(col, row)`.
    pub fn value(&self, col: f64, row: f64) -> f64 {
        self.eval(col, row).0
    }
}

/// Adaptive Levenberg-Marquardt damping.
///
/// Good steps (actual reduction close to predicted) decrease lambda, bad
/// steps increase it.
struct AdaptiveLm {
    lambda: f64,
    factor: f64,
    min_lambda: f64,
    max_lambda: f64,
}

impl AdaptiveLm {
    fn new() -> Self {
        Self {
            lambda: 1e-3,
            factor: 10.0,
            min_lambda: 1e-9,
            max_lambda: 1e9,
        }
    }

    /// `rho` is actual over predicted cost reduction.
    fn update(&mut self, rho: f64) {
        if rho > 0.75 {
            self.lambda = (self.lambda / self.factor).max(self.min_lambda);
        } else if rho > 0.25 {
            self.lambda = (self.lambda / self.factor.sqrt()).max(self.min_lambda);
        } else if rho < 0.0 {
            self.reject_step();
        }
    }

    fn reject_step(&mut self) {
        self.lambda = (self.lambda * self.factor).min(self.max_lambda);
    }

    fn is_stuck(&self) -> bool {
        self.lambda >= self.max_lambda * 0.99
    }
}

/// Outcome of a fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    pub model: Gaussian2d,
    pub iterations: usize,
    /// Sum of squared residuals
    pub cost: f64,
}

fn normal_equations(image: ArrayView2<f64>, model: &Gaussian2d) -> (Normal, Params, f64) {
    let mut jtj = Normal::zeros();
    let mut jtr = Params::zeros();
    let mut cost = 0.0;
    for ((row, col), &z) in image.indexed_iter() {
        let (m, grad) = model.eval(col as f64, row as f64);
        let r = z - m;
        cost += r * r;
        jtj += grad * grad.transpose();
        jtr += grad * r;
    }
    (jtj, jtr, cost)
}

fn cost_of(image: ArrayView2<f64>, model: &Gaussian2d) -> f64 {
    image
        .indexed_iter()
        .map(|((row, col), &z)| {
            let r = z - model.value(col as f64, row as f64);
            r * r
        })
        .sum()
}

/// Fit a single Gaussian to `image` starting from `seed`.
///
/// Returns the best model found within `max_iterations`. Fails only if the
/// solution leaves the image or goes non-finite.
pub fn fit_gaussian(
    image: ArrayView2<f64>,
    seed: Gaussian2d,
    max_iterations: usize,
) -> Result<GaussianFit, CentroidError> {
    let mut lm = AdaptiveLm::new();
    let mut params = seed.to_params();
    let mut model = seed;
    let (mut jtj, mut jtr, mut cost) = normal_equations(image, &model);
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;

        let mut damped = jtj;
        for i in 0..6 {
            damped[(i, i)] += lm.lambda * jtj[(i, i)].max(1e-12);
        }
        let Some(step) = damped.cholesky().map(|c| c.solve(&jtr)) else {
            lm.reject_step();
            if lm.is_stuck() {
                break;
            }
            continue;
        };

        let candidate = params + step;
        if candidate[3] < MIN_SIGMA || candidate[4] < MIN_SIGMA {
            lm.reject_step();
            if lm.is_stuck() {
                break;
            }
            continue;
        }

        let candidate_model = Gaussian2d::from_params(&candidate);
        let new_cost = cost_of(image, &candidate_model);
        // Predicted reduction of the linearized model
        let predicted = step.dot(&(jtr * 2.0 - jtj * step));
        let actual = cost - new_cost;
        let rho = if predicted > 0.0 { actual / predicted } else { -1.0 };

        if actual > 0.0 {
            params = candidate;
            model = candidate_model;
            let converged = actual <= 1e-12 * cost.max(1e-300) || step.norm() < 1e-9;
            (jtj, jtr, cost) = normal_equations(image, &model);
            lm.update(rho);
            if converged {
                break;
            }
        } else {
            lm.reject_step();
            if lm.is_stuck() {
                break;
            }
        }
    }

    trace!(
        "Gaussian fit: ({:.3}, {:.3}) sigma ({:.3}, {:.3}) after {iterations} iterations, cost {cost:.3e}",
        model.x0,
        model.y0,
        model.sigma_x,
        model.sigma_y
    );

    let (rows, cols) = image.dim();
    let inside = model.x0 >= -0.5
        && model.y0 >= -0.5
        && model.x0 <= cols as f64 - 0.5
        && model.y0 <= rows as f64 - 0.5;
    if !params.iter().all(|v| v.is_finite()) || !inside {
        return Err(CentroidError::FitDiverged { iterations });
    }

    Ok(GaussianFit {
        model,
        iterations,
        cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn render(model: &Gaussian2d, rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(r, c)| model.value(c as f64, r as f64))
    }

    #[test]
    fn test_recovers_noisy_spot() {
        let truth = Gaussian2d {
            amplitude: 1.0,
            x0: 12.3,
            y0: 15.7,
            sigma_x: 2.0,
            sigma_y: 2.5,
            offset: 0.05,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let image = render(&truth, 34, 34).mapv(|v| v + rng.random_range(-0.01..0.01));

        let seed = Gaussian2d {
            amplitude: 0.8,
            x0: 13.0,
            y0: 15.0,
            sigma_x: 1.5,
            sigma_y: 1.5,
            offset: 0.0,
        };
        let fit = fit_gaussian(image.view(), seed, 100).unwrap();
        assert_relative_eq!(fit.model.x0, 12.3, epsilon = 0.02);
        assert_relative_eq!(fit.model.y0, 15.7, epsilon = 0.02);
        assert_relative_eq!(fit.model.sigma_x, 2.0, epsilon = 0.05);
        assert_relative_eq!(fit.model.sigma_y, 2.5, epsilon = 0.05);
        assert!(fit.iterations <= 100);
    }

    #[test]
    fn test_exact_data_converges_quickly() {
        let truth = Gaussian2d {
            amplitude: 2.0,
            x0: 5.5,
            y0: 4.25,
            sigma_x: 1.2,
            sigma_y: 1.2,
            offset: 0.0,
        };
        let image = render(&truth, 10, 12);
        let seed = Gaussian2d {
            x0: 6.0,
            y0: 4.0,
            sigma_x: 1.0,
            sigma_y: 1.0,
            ..truth
        };
        let fit = fit_gaussian(image.view(), seed, 100).unwrap();
        assert_relative_eq!(fit.model.x0, 5.5, epsilon = 1e-6);
        assert_relative_eq!(fit.model.y0, 4.25, epsilon = 1e-6);
        assert!(fit.cost < 1e-12);
    }

    #[test]
    fn test_single_iteration_returns_partial_fit() {
        let truth = Gaussian2d {
            amplitude: 1.0,
            x0: 8.0,
            y0: 8.0,
            sigma_x: 2.0,
            sigma_y: 2.0,
            offset: 0.0,
        };
        let image = render(&truth, 16, 16);
        let seed = Gaussian2d { x0: 7.0, ..truth };
        let fit = fit_gaussian(image.view(), seed, 1).unwrap();
        assert_eq!(fit.iterations, 1);
        assert!((fit.model.x0 - 8.0).abs() < 1.0);
    }
}
