//! Persistence of scan products.
//!
//! Scan images are written as whitespace-separated text matrices (one image
//! row per line) with a 16-bit PNG preview alongside. Drift logs are written
//! as whitespace-separated `time x_drift y_drift` rows.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use image::{ImageBuffer, Luma};
use log::{debug, info};
use ndarray::Array2;
use thiserror::Error;

/// Errors raised while persisting scan products.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid path hint '{0}'")]
    InvalidHint(String),

    #[error("Cannot persist an empty {0}")]
    Empty(&'static str),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Destination for scan images and drift logs.
///
/// `path_hint` is a relative, extension-less name such as `"scan/x_y"`; the
/// sink decides the final location and returns it.
pub trait PersistenceSink: Send {
    /// Persist a 2D intensity image.
    fn save_image(&mut self, image: &Array2<f64>, path_hint: &str) -> PersistResult<PathBuf>;

    /// Persist a `(time, x_drift, y_drift)` series.
    fn save_time_series(&mut self, rows: &[[f64; 3]], path_hint: &str)
        -> PersistResult<PathBuf>;
}

fn check_hint(path_hint: &str) -> PersistResult<()> {
    let path = Path::new(path_hint);
    let relative = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if path_hint.is_empty() || !relative {
        return Err(PersistError::InvalidHint(path_hint.to_string()));
    }
    Ok(())
}

/// Writes products under a root directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
    timestamped: bool,
    png_preview: bool,
}

impl DirectorySink {
    /// Sink writing under `root`, with timestamped names and PNG previews.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timestamped: true,
            png_preview: true,
        }
    }

    /// Disable the `YYYYMMDD_HHMMSS_` file name prefix.
    pub fn without_timestamp(mut self) -> Self {
        self.timestamped = false;
        self
    }

    /// Disable the PNG preview written next to each image.
    pub fn without_png(mut self) -> Self {
        self.png_preview = false;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn base_path(&self, path_hint: &str) -> PersistResult<PathBuf> {
        check_hint(path_hint)?;
        let hint = Path::new(path_hint);
        let name = hint
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PersistError::InvalidHint(path_hint.to_string()))?;
        let name = if self.timestamped {
            format!("{}_{name}", Local::now().format("%Y%m%d_%H%M%S"))
        } else {
            name.to_string()
        };

        let dir = match hint.parent() {
            Some(parent) => self.root.join(parent),
            None => self.root.clone(),
        };
        fs::create_dir_all(&dir)?;
        Ok(dir.join(name))
    }
}

/// Write `image` as a whitespace-separated text matrix.
pub fn write_text_matrix(image: &Array2<f64>, path: &Path) -> PersistResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for row in image.rows() {
        let line: Vec<String> = row.iter().map(|v| format!("{v:.9e}")).collect();
        writeln!(writer, "{}", line.join(" "))?;
    }
    writer.flush()?;
    Ok(())
}

/// Write `image` as a 16-bit grayscale PNG scaled to its own min/max.
///
/// A flat image is written as all zeros.
pub fn write_png16(image: &Array2<f64>, path: &Path) -> PersistResult<()> {
    let (rows, cols) = image.dim();
    let min = image.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = image.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;

    let buffer = ImageBuffer::<Luma<u16>, Vec<u16>>::from_fn(cols as u32, rows as u32, |x, y| {
        let v = image[[y as usize, x as usize]];
        let scaled = if span > 0.0 && v.is_finite() {
            ((v - min) / span * u16::MAX as f64).round() as u16
        } else {
            0
        };
        Luma([scaled])
    });
    buffer.save(path)?;
    Ok(())
}

impl PersistenceSink for DirectorySink {
    fn save_image(&mut self, image: &Array2<f64>, path_hint: &str) -> PersistResult<PathBuf> {
        if image.is_empty() {
            return Err(PersistError::Empty("image"));
        }
        let base = self.base_path(path_hint)?;
        let text_path = base.with_extension("txt");
        write_text_matrix(image, &text_path)?;

        if self.png_preview {
            write_png16(image, &base.with_extension("png"))?;
        }
        info!("Saved {}x{} image to {}", image.nrows(), image.ncols(), text_path.display());
        Ok(text_path)
    }

    fn save_time_series(
        &mut self,
        rows: &[[f64; 3]],
        path_hint: &str,
    ) -> PersistResult<PathBuf> {
        if rows.is_empty() {
            return Err(PersistError::Empty("time series"));
        }
        let path = self.base_path(path_hint)?.with_extension("txt");
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "# time x_drift y_drift")?;
        for [t, x, y] in rows {
            writeln!(writer, "{t:.6} {x:.9e} {y:.9e}")?;
        }
        writer.flush()?;
        debug!("Saved {} drift samples to {}", rows.len(), path.display());
        Ok(path)
    }
}

/// A product captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SavedProduct {
    Image { path_hint: String, image: Array2<f64> },
    TimeSeries { path_hint: String, rows: Vec<[f64; 3]> },
}

impl SavedProduct {
    pub fn path_hint(&self) -> &str {
        match self {
            SavedProduct::Image { path_hint, .. } => path_hint,
            SavedProduct::TimeSeries { path_hint, .. } => path_hint,
        }
    }
}

/// In-memory sink. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    saved: Arc<Mutex<Vec<SavedProduct>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything saved so far, oldest first.
    pub fn products(&self) -> Vec<SavedProduct> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Saved images only.
    pub fn images(&self) -> Vec<Array2<f64>> {
        self.products()
            .into_iter()
            .filter_map(|p| match p {
                SavedProduct::Image { image, .. } => Some(image),
                SavedProduct::TimeSeries { .. } => None,
            })
            .collect()
    }

    /// Saved time series only.
    pub fn time_series(&self) -> Vec<Vec<[f64; 3]>> {
        self.products()
            .into_iter()
            .filter_map(|p| match p {
                SavedProduct::TimeSeries { rows, .. } => Some(rows),
                SavedProduct::Image { .. } => None,
            })
            .collect()
    }

    fn push(&self, product: SavedProduct) {
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(product);
    }
}

impl PersistenceSink for RecordingSink {
    fn save_image(&mut self, image: &Array2<f64>, path_hint: &str) -> PersistResult<PathBuf> {
        check_hint(path_hint)?;
        self.push(SavedProduct::Image {
            path_hint: path_hint.to_string(),
            image: image.clone(),
        });
        Ok(PathBuf::from(path_hint))
    }

    fn save_time_series(
        &mut self,
        rows: &[[f64; 3]],
        path_hint: &str,
    ) -> PersistResult<PathBuf> {
        check_hint(path_hint)?;
        self.push(SavedProduct::TimeSeries {
            path_hint: path_hint.to_string(),
            rows: rows.to_vec(),
        });
        Ok(PathBuf::from(path_hint))
    }
}
