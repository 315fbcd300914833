//! Scan acquisition and centroid estimation for a scanning confocal
//! microscope.
//!
//! A scan rasters the laser focus over a 2D region by moving a piezo stage
//! and digitizing a photodiode. Two modes are supported:
//!
//! - **Ramp**: the fast axis sweeps back and forth under the stage's wave
//!   generator while a trigger line marks the go and return segments; each
//!   slow-axis line yields a forward and a backward profile.
//! - **Step**: the stage settles at every pixel and a fixed number of
//!   samples is averaged.
//!
//! The [`controller::ScanController`] runs a scan as a tick-driven state
//! machine, assembling forward, backward and combined images
//! ([`image::ScanImage`]). Completed images can be passed to the
//! [`centroid::CentroidEstimator`] to locate one or two features, and the
//! [`drift::DriftCorrector`] repeats scans on a schedule to follow slow
//! sample drift. [`session::ScanSession`] drives both from a tokio runtime.
//!
//! Observers subscribe to [`callback::ScanEvent`]s through
//! [`callback::ScanObservers`].

pub mod callback;
pub mod centroid;
pub mod config;
pub mod controller;
pub mod demux;
pub mod drift;
pub mod error;
pub mod image;
pub mod line_scan;
pub mod session;

pub use callback::{CallbackId, DriftSample, ScanEvent, ScanObservers, SessionPurpose};
pub use centroid::{CentroidEstimate, CentroidEstimator, CentroidResult};
pub use config::{
    CenteringMethod, CentroidSettings, ScanAxisPair, ScanConfig, ScanImagePolarity, ScanMode,
    StepOrder,
};
pub use controller::{
    ScanCompletion, ScanController, ScanHardware, ScanRequest, ScanState, TickOutcome,
};
pub use drift::{DriftAction, DriftCorrector, DriftProgress};
pub use error::{CentroidError, ConfigError, DemuxError, DriftError, LineError, ScanError};
pub use image::ScanImage;
pub use session::{ScanSession, StopHandle};
