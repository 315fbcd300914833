use thiserror::Error;

use crate::stage::Axis;

/// Errors reported by stage, digitizer and shutter implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    /// A bounded wait (on-target, acquisition) did not resolve in time.
    #[error("timeout after {elapsed_ms} ms waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// Time spent waiting
        elapsed_ms: u128,
    },

    /// The stage does not drive the requested axis.
    #[error("axis {0} is not available on this stage")]
    UnsupportedAxis(Axis),

    /// Commanded position is outside the travel range.
    #[error("position {position:.3} on axis {axis} outside travel range [{min:.3}, {max:.3}]")]
    OutOfRange {
        axis: Axis,
        position: f64,
        min: f64,
        max: f64,
    },

    /// `start_waveform` called before a waveform was programmed.
    #[error("no ramp waveform programmed for axis {0}")]
    NoWaveform(Axis),

    /// Task handle is not (or no longer) open.
    #[error("acquisition task {0} is not open")]
    UnknownTask(u64),

    /// Acquisition parameters the device cannot honour.
    #[error("invalid acquisition request: {0}")]
    InvalidRequest(String),

    /// Any other device-reported failure.
    #[error("device error: {0}")]
    Device(String),
}

/// Result type for hardware operations.
pub type HardwareResult<T> = Result<T, HardwareError>;
