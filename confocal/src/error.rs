use hardware::HardwareError;
use thiserror::Error;

use crate::config::{ScanAxisPair, ScanMode};

/// Rejected scan geometry or timing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("scan range on the {axis} axis must be positive and finite, got {value}")]
    InvalidRange { axis: &'static str, value: f64 },

    #[error("pixel count on the {axis} axis must be at least 1")]
    InvalidPixelCount { axis: &'static str },

    #[error(
        "{pixels} pixels over {range} on the {axis} axis gives a pitch below the 0.001 resolution"
    )]
    PitchUnderflow {
        axis: &'static str,
        range: f64,
        pixels: usize,
    },

    #[error("invalid rate: {0}")]
    InvalidRate(String),

    #[error(
        "ramp undersampled: {segment} samples per sweep for {pixels} pixels, \
         raise the sample rate or lower the ramp frequency"
    )]
    RampUndersampled { segment: usize, pixels: usize },

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

/// Trigger demultiplexing failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DemuxError {
    /// Fewer trigger edges than the go/return pairing needs.
    #[error("missing {which} edge ({rising} rising, {falling} falling in {len} samples)")]
    MissingEdge {
        which: &'static str,
        rising: usize,
        falling: usize,
        len: usize,
    },

    #[error("profile of {len} samples cannot be averaged into {bins} bins")]
    TooShort { len: usize, bins: usize },

    #[error("intensity and trigger lengths differ: {samples} vs {trigger}")]
    LengthMismatch { samples: usize, trigger: usize },

    #[error("expected {expected} channels in acquisition block, got {got}")]
    ChannelCount { expected: usize, got: usize },
}

/// Centroid estimation failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CentroidError {
    #[error("image is flat (min == max == {0})")]
    FlatImage(f64),

    #[error("image is empty")]
    EmptyImage,

    #[error("image contains non-finite values")]
    NonFinite,

    #[error("no pixels above threshold {0}")]
    NothingAboveThreshold(f64),

    #[error("no second peak at least {min_separation} px from the first")]
    NoSecondPeak { min_separation: f64 },

    #[error("Gaussian fit diverged after {iterations} iterations")]
    FitDiverged { iterations: usize },

    #[error("no centroid was computed for this scan")]
    NotComputed,
}

/// Drift cycle bookkeeping failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriftError {
    #[error("drift monitoring is not running")]
    NotMonitoring,

    #[error("no drift cycle in progress")]
    NoCycleInProgress,

    #[error("all {cycles} drift cycles already recorded")]
    ScheduleComplete { cycles: usize },

    #[error(transparent)]
    Centroid(#[from] CentroidError),
}

/// Failure while acquiring one line or point.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LineError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Demux(#[from] DemuxError),
}

/// Scan controller errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("scan not configured")]
    NotConfigured,

    /// `start()` while a scan is active; the running scan is unaffected.
    #[error("scan already active ({state})")]
    Busy { state: String },

    #[error("{mode} scan on {axis_pair} failed at line {index}: {source}")]
    Line {
        axis_pair: ScanAxisPair,
        mode: ScanMode,
        index: usize,
        #[source]
        source: LineError,
    },

    #[error("hardware error: {0}")]
    Hardware(#[from] HardwareError),
}
