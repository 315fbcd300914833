//! Hardware abstractions for the confocal scanning bench.
//!
//! The scan engine never talks to vendor SDKs directly. It drives three
//! narrow interfaces that a deployment implements on top of whatever piezo
//! controller, digitizer and shutter hardware is installed:
//!
//! - [`StageInterface`] - closed-loop piezo stage with a wave generator
//! - [`AcquisitionInterface`] - analog input tasks (photodiode + trigger)
//! - [`ShutterInterface`] - per-laser optical shutters
//!
//! # Features
//!
//! - `sim` (default) - [`sim::SimulatedBench`], an in-memory bench that
//!   implements all three interfaces over a synthetic sample. Used by the
//!   test suites and by `scan_tool` when no hardware is attached.

pub mod acquisition;
pub mod error;
pub mod shutter;
pub mod stage;

#[cfg(feature = "sim")]
pub mod sim;

pub use acquisition::{AcquisitionInterface, AcquisitionTask, AnalogChannel, TaskHandle};
pub use error::{HardwareError, HardwareResult};
pub use shutter::ShutterInterface;
pub use stage::{Axis, RampWaveform, StageInterface, StagePosition};
