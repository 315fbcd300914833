//! Bidirectional scan image assembly.

use ndarray::{s, Array2, ArrayView1, ArrayView2};

/// Reverse `image` along the fast axis (columns).
pub fn mirror(image: ArrayView2<f64>) -> Array2<f64> {
    image.slice(s![.., ..;-1]).to_owned()
}

/// `forward + mirror(backward)`.
///
/// The backward pass is stored in acquisition order, i.e. spatially
/// reversed, so mirroring lines it up with the forward pass.
pub fn combine(forward: ArrayView2<f64>, backward: ArrayView2<f64>) -> Array2<f64> {
    &forward + &mirror(backward)
}

/// Forward and backward image buffers for one scan.
///
/// Shape is `(rows, cols)` = `(N_slow, N_fast)` and never changes while a
/// scan is running.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanImage {
    forward: Array2<f64>,
    backward: Array2<f64>,
}

impl ScanImage {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            forward: Array2::zeros((rows, cols)),
            backward: Array2::zeros((rows, cols)),
        }
    }

    /// `(rows, cols)`.
    pub fn dim(&self) -> (usize, usize) {
        self.forward.dim()
    }

    /// Zero both buffers, resizing only if the geometry changed.
    pub fn reset(&mut self, rows: usize, cols: usize) {
        if self.dim() == (rows, cols) {
            self.forward.fill(0.0);
            self.backward.fill(0.0);
        } else {
            *self = Self::new(rows, cols);
        }
    }

    /// Store a ramp line's binned profiles in `row`.
    ///
    /// # Panics
    /// If `row` is out of bounds or a profile length differs from the column count.
    pub fn store_line(&mut self, row: usize, gone: ArrayView1<f64>, back: ArrayView1<f64>) {
        self.forward.row_mut(row).assign(&gone);
        self.backward.row_mut(row).assign(&back);
    }

    /// Store a step-mode sample. Step scans only fill the forward buffer.
    pub fn store_point(&mut self, row: usize, col: usize, value: f64) {
        self.forward[[row, col]] = value;
    }

    pub fn forward(&self) -> &Array2<f64> {
        &self.forward
    }

    pub fn backward(&self) -> &Array2<f64> {
        &self.backward
    }

    /// `forward + mirror(backward)` over the whole buffer.
    pub fn combined(&self) -> Array2<f64> {
        combine(self.forward.view(), self.backward.view())
    }
}
