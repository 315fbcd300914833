//! Analog acquisition interface.
//!
//! The photodiode and the stage's trigger output are wired to analog inputs
//! of a multifunction digitizer. Each read is a short-lived task: opened
//! right before the read and closed right after. [`AcquisitionTask`] wraps
//! that lifecycle so the handle is released on every path, including early
//! returns and panics.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::HardwareResult;

/// Physical analog input, e.g. `"Dev1/ai0"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalogChannel(pub String);

impl AnalogChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AnalogChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle to an open acquisition task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

/// Interface for the analog digitizer.
pub trait AcquisitionInterface: Send {
    /// Configure a finite acquisition of `sample_count` samples per channel.
    fn open_task(
        &mut self,
        channels: &[AnalogChannel],
        sample_rate_hz: f64,
        sample_count: usize,
    ) -> HardwareResult<TaskHandle>;

    /// Read `n` samples per channel.
    ///
    /// Returns a `(channels, n)` array with rows in the order the channels
    /// were given to [`open_task`](Self::open_task).
    fn read(&mut self, task: TaskHandle, n: usize) -> HardwareResult<Array2<f64>>;

    /// Release the task.
    fn close(&mut self, task: TaskHandle) -> HardwareResult<()>;
}

/// Scoped acquisition task.
///
/// Closes the underlying task when dropped. Call [`close`](Self::close)
/// explicitly to observe close errors.
pub struct AcquisitionTask<'a, A: AcquisitionInterface + ?Sized> {
    device: &'a mut A,
    handle: TaskHandle,
    open: bool,
    sample_count: usize,
}

impl<'a, A: AcquisitionInterface + ?Sized> AcquisitionTask<'a, A> {
    /// Open a task on `device`.
    pub fn open(
        device: &'a mut A,
        channels: &[AnalogChannel],
        sample_rate_hz: f64,
        sample_count: usize,
    ) -> HardwareResult<Self> {
        let handle = device.open_task(channels, sample_rate_hz, sample_count)?;
        trace!(
            "Opened task {:?}: {} channels, {} samples @ {} Hz",
            handle,
            channels.len(),
            sample_count,
            sample_rate_hz
        );
        Ok(Self {
            device,
            handle,
            open: true,
            sample_count,
        })
    }

    /// Read the full configured sample count.
    pub fn read_all(&mut self) -> HardwareResult<Array2<f64>> {
        self.read(self.sample_count)
    }

    /// Read `n` samples per channel.
    pub fn read(&mut self, n: usize) -> HardwareResult<Array2<f64>> {
        self.device.read(self.handle, n)
    }

    /// Close the task, returning any close error.
    pub fn close(mut self) -> HardwareResult<()> {
        self.open = false;
        self.device.close(self.handle)
    }
}

impl<A: AcquisitionInterface + ?Sized> Drop for AcquisitionTask<'_, A> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.device.close(self.handle) {
                warn!("Failed to close acquisition task {:?}: {e}", self.handle);
            }
        }
    }
}
