//! Scan controller state machine.
//!
//! One scan is a sequence of ticks:
//!
//! ```text
//! Idle --start--> Configuring --> RunningLine{0} --> Advancing{1} --> RunningLine{1} ...
//!                                 RunningLine{last} --> Finalizing --> Idle
//! any running state --stop--> Stopping --> Idle
//! ```
//!
//! Ramp scans acquire one slow-axis line per `RunningLine` tick; step scans
//! acquire one grid point per tick. Every tick does a bounded amount of
//! hardware work so the caller's loop is never blocked for a whole scan.
//! The shutter is opened by `start()` and closed on every way out: normal
//! completion, `stop()` and errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hardware::{AcquisitionInterface, Axis, ShutterInterface, StageInterface, StagePosition};
use ndarray::Array2;
use shared::PersistenceSink;
use tracing::{debug, info, warn};

use crate::callback::{ScanEvent, ScanObservers, SessionPurpose};
use crate::centroid::{CentroidEstimator, CentroidResult};
use crate::config::{CentroidSettings, ScanAxisPair, ScanConfig, ScanMode};
use crate::error::{CentroidError, LineError, ScanError};
use crate::image::ScanImage;
use crate::line_scan::{configure_ramp_waveform, ramp_line, sample_point, settle_at};

/// Tag a failure with the scan it interrupted.
fn line_failure(geometry: &ScanGeometry, index: usize, source: impl Into<LineError>) -> ScanError {
    ScanError::Line {
        axis_pair: geometry.axis_pair,
        mode: geometry.mode,
        index,
        source: source.into(),
    }
}

/// Hardware owned by the controller.
pub struct ScanHardware {
    pub stage: Box<dyn StageInterface>,
    pub digitizer: Box<dyn AcquisitionInterface>,
    pub shutter: Box<dyn ShutterInterface>,
}

/// Controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    /// No scan active
    Idle,
    /// Shutter open, hardware being prepared for line 0
    Configuring,
    /// Next tick acquires line (ramp) or point (step) `index`
    RunningLine { index: usize },
    /// Next tick moves to line or point `next`
    Advancing { next: usize },
    /// All data acquired, next tick produces the final products
    Finalizing,
    /// Cancel requested, next tick restores the stage
    Stopping,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Idle => write!(f, "idle"),
            ScanState::Configuring => write!(f, "configuring"),
            ScanState::RunningLine { index } => write!(f, "running line {index}"),
            ScanState::Advancing { next } => write!(f, "advancing to {next}"),
            ScanState::Finalizing => write!(f, "finalizing"),
            ScanState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Validated geometry for the next scans.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanGeometry {
    pub config: ScanConfig,
    pub axis_pair: ScanAxisPair,
    pub mode: ScanMode,
}

/// Parameters of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    /// Laser line whose shutter is opened for the scan
    pub channel: String,
    pub purpose: SessionPurpose,
    /// Run centroid estimation for standalone scans
    pub estimate_centroid: bool,
    /// Move to the primary centroid after a standalone scan
    pub auto_recenter: bool,
}

impl ScanRequest {
    pub fn new(channel: impl Into<String>, purpose: SessionPurpose) -> Self {
        Self {
            channel: channel.into(),
            purpose,
            estimate_centroid: false,
            auto_recenter: false,
        }
    }

    pub fn with_centroid(mut self) -> Self {
        self.estimate_centroid = true;
        self
    }

    pub fn with_recenter(mut self) -> Self {
        self.estimate_centroid = true;
        self.auto_recenter = true;
        self
    }

    /// Every purpose except a plain standalone scan consumes a centroid.
    pub fn wants_centroid(&self) -> bool {
        self.estimate_centroid || self.purpose != SessionPurpose::None
    }
}

/// Products of a completed scan.
#[derive(Debug, Clone)]
pub struct ScanCompletion {
    pub purpose: SessionPurpose,
    pub axis_pair: ScanAxisPair,
    pub mode: ScanMode,
    pub combined: Arc<Array2<f64>>,
    pub forward: Arc<Array2<f64>>,
    pub backward: Arc<Array2<f64>>,
    /// `None` when no centroid was requested
    pub centroid: Option<Result<CentroidResult, CentroidError>>,
    /// Stage position when the scan started
    pub origin: StagePosition,
    /// Where the stage was left
    pub final_position: StagePosition,
    pub elapsed: Duration,
}

impl ScanCompletion {
    /// The centroid, if one was requested and found.
    pub fn centroid_result(&self) -> Option<&CentroidResult> {
        self.centroid.as_ref().and_then(|c| c.as_ref().ok())
    }
}

/// Result of one [`ScanController::tick`].
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Nothing to do
    Idle,
    /// Scan in progress; the state the next tick will run
    Running(ScanState),
    /// Scan finished normally
    Completed(Box<ScanCompletion>),
    /// Scan cancelled; stage restored, no completion
    Stopped,
}

/// Scan acquisition state machine.
pub struct ScanController {
    hardware: ScanHardware,
    geometry: Option<ScanGeometry>,
    estimator: CentroidEstimator,
    observers: ScanObservers,
    sink: Option<Box<dyn PersistenceSink>>,
    state: ScanState,
    image: ScanImage,
    request: Option<ScanRequest>,
    origin: StagePosition,
    started_at: Option<Instant>,
    step_points: Vec<(usize, usize)>,
    /// Last line or point index reached, for error and stop reports
    last_index: usize,
    scan_stop_signalled: bool,
}

impl ScanController {
    pub fn new(hardware: ScanHardware, observers: ScanObservers) -> Self {
        Self {
            hardware,
            geometry: None,
            estimator: CentroidEstimator::default(),
            observers,
            sink: None,
            state: ScanState::Idle,
            image: ScanImage::new(0, 0),
            request: None,
            origin: StagePosition::default(),
            started_at: None,
            step_points: Vec::new(),
            last_index: 0,
            scan_stop_signalled: true,
        }
    }

    /// Persist scan products through `sink`.
    pub fn with_sink(mut self, sink: Box<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ScanState::Idle
    }

    pub fn geometry(&self) -> Option<&ScanGeometry> {
        self.geometry.as_ref()
    }

    pub fn observers(&self) -> &ScanObservers {
        &self.observers
    }

    /// Current (possibly partial) image buffers.
    pub fn image(&self) -> &ScanImage {
        &self.image
    }

    /// Whether the last scan has finished, by completion or stop.
    pub fn scan_stop_signalled(&self) -> bool {
        self.scan_stop_signalled
    }

    /// Validate and store the geometry used by the next `start()`.
    pub fn configure(
        &mut self,
        config: ScanConfig,
        axis_pair: ScanAxisPair,
        mode: ScanMode,
    ) -> Result<(), ScanError> {
        if !self.is_idle() {
            return Err(ScanError::Busy {
                state: self.state.to_string(),
            });
        }
        config.validate(mode)?;
        let ramp = config.ramp_parameters();
        debug!(
            "Configured {mode} scan on {axis_pair}: {}x{} px over {:.3}x{:.3}, margin {:.3}, Nramp {}",
            config.nx, config.ny, config.range_x, config.range_y, ramp.extra_margin, ramp.samples
        );
        self.geometry = Some(ScanGeometry {
            config,
            axis_pair,
            mode,
        });
        Ok(())
    }

    /// Replace the centroid settings.
    pub fn set_centroid_settings(&mut self, settings: CentroidSettings) -> Result<(), ScanError> {
        settings.validate()?;
        self.estimator = CentroidEstimator::new(settings);
        Ok(())
    }

    /// Open the shutter, clear the image and begin a scan.
    ///
    /// Rejected while another scan is active; the running scan is not
    /// affected.
    pub fn start(&mut self, request: ScanRequest) -> Result<(), ScanError> {
        if !self.is_idle() {
            return Err(ScanError::Busy {
                state: self.state.to_string(),
            });
        }
        let geometry = self.geometry.as_ref().ok_or(ScanError::NotConfigured)?;
        let (rows, cols) = (geometry.config.ny, geometry.config.nx);
        self.step_points = match geometry.mode {
            ScanMode::Ramp => Vec::new(),
            ScanMode::Step => geometry.config.step.order.points(rows, cols),
        };

        self.origin = self
            .hardware
            .stage
            .current_position()
            .map_err(|e| line_failure(geometry, 0, e))?;
        self.hardware
            .shutter
            .open(&request.channel)
            .map_err(|e| line_failure(geometry, 0, e))?;
        self.image.reset(rows, cols);
        self.started_at = Some(Instant::now());
        self.last_index = 0;
        self.scan_stop_signalled = false;

        info!(
            "Starting {} scan on {} ({:?}), {}x{} px, shutter {}",
            geometry.mode, geometry.axis_pair, request.purpose, cols, rows, request.channel
        );
        self.request = Some(request);
        self.state = ScanState::Configuring;
        Ok(())
    }

    /// Ask the running scan to stop at the next tick.
    pub fn request_stop(&mut self) {
        if !self.is_idle() {
            self.state = ScanState::Stopping;
        }
    }

    /// Stop now: close the shutter, restore the stage, skip centroiding.
    pub fn stop(&mut self) -> Result<(), ScanError> {
        if self.is_idle() {
            return Ok(());
        }
        self.request_stop();
        self.tick().map(|_| ())
    }

    /// Run one step of the state machine.
    pub fn tick(&mut self) -> Result<TickOutcome, ScanError> {
        let Some(geometry) = self.geometry.clone() else {
            return Ok(TickOutcome::Idle);
        };

        match self.state.clone() {
            ScanState::Idle => Ok(TickOutcome::Idle),
            ScanState::Configuring => {
                self.guard(&geometry, 0, |c, g| c.prepare(g))?;
                self.state = ScanState::RunningLine { index: 0 };
                Ok(TickOutcome::Running(self.state.clone()))
            }
            ScanState::RunningLine { index } => {
                self.last_index = index;
                self.guard(&geometry, index, |c, g| c.acquire(g, index))?;
                self.publish_partial(&geometry, index + 1);

                self.state = if index + 1 < self.acquisition_count(&geometry) {
                    ScanState::Advancing { next: index + 1 }
                } else {
                    ScanState::Finalizing
                };
                Ok(TickOutcome::Running(self.state.clone()))
            }
            ScanState::Advancing { next } => {
                self.last_index = next;
                self.guard(&geometry, next, |c, g| c.move_to_index(g, next))?;
                self.state = ScanState::RunningLine { index: next };
                Ok(TickOutcome::Running(self.state.clone()))
            }
            ScanState::Finalizing => {
                let completion = self.finalize(&geometry)?;
                Ok(TickOutcome::Completed(Box::new(completion)))
            }
            ScanState::Stopping => {
                self.finish_stop(&geometry)?;
                Ok(TickOutcome::Stopped)
            }
        }
    }

    /// Run ticks until the scan leaves the running states.
    pub fn run_to_completion(&mut self) -> Result<TickOutcome, ScanError> {
        loop {
            match self.tick()? {
                TickOutcome::Running(_) => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    fn acquisition_count(&self, geometry: &ScanGeometry) -> usize {
        match geometry.mode {
            ScanMode::Ramp => geometry.config.ny,
            ScanMode::Step => self.step_points.len(),
        }
    }

    /// Run `step`; on error abort the scan and wrap the error with context.
    fn guard<F>(&mut self, geometry: &ScanGeometry, index: usize, step: F) -> Result<(), ScanError>
    where
        F: FnOnce(&mut Self, &ScanGeometry) -> Result<(), LineError>,
    {
        match step(self, geometry) {
            Ok(()) => Ok(()),
            Err(source) => {
                let err = line_failure(geometry, index, source);
                warn!("Aborting scan: {err}");
                self.release(geometry);
                self.emit_aborted(geometry, index, &err);
                Err(err)
            }
        }
    }

    fn emit_aborted(&self, geometry: &ScanGeometry, index: usize, err: &ScanError) {
        self.observers.emit(&ScanEvent::ScanAborted {
            axis_pair: geometry.axis_pair,
            mode: geometry.mode,
            index,
            reason: err.to_string(),
        });
    }

    /// Stage targets `(fast, slow)` for line/point `index`.
    fn targets(&self, geometry: &ScanGeometry, index: usize) -> Vec<(Axis, f64)> {
        let (fast, slow) = (geometry.axis_pair.fast(), geometry.axis_pair.slow());
        let origin = (self.origin.get(fast), self.origin.get(slow));
        match geometry.mode {
            ScanMode::Ramp => {
                let (_, y) = geometry
                    .config
                    .coordinates_position(origin, 0.0, index as f64);
                vec![(slow, y)]
            }
            ScanMode::Step => {
                let (row, col) = self.step_points[index];
                let (x, y) = geometry
                    .config
                    .coordinates_position(origin, col as f64, row as f64);
                vec![(fast, x), (slow, y)]
            }
        }
    }

    fn prepare(&mut self, geometry: &ScanGeometry) -> Result<(), LineError> {
        if geometry.mode == ScanMode::Ramp {
            configure_ramp_waveform(
                self.hardware.stage.as_mut(),
                geometry.axis_pair.fast(),
                &geometry.config.ramp_parameters(),
                geometry.config.speed_fraction,
            )?;
        }
        self.move_to_index(geometry, 0)
    }

    fn move_to_index(&mut self, geometry: &ScanGeometry, index: usize) -> Result<(), LineError> {
        let targets = self.targets(geometry, index);
        settle_at(
            self.hardware.stage.as_mut(),
            &targets,
            &geometry.config.settle,
        )?;
        Ok(())
    }

    fn acquire(&mut self, geometry: &ScanGeometry, index: usize) -> Result<(), LineError> {
        let config = &geometry.config;
        match geometry.mode {
            ScanMode::Ramp => {
                let ramp = config.ramp_parameters();
                let profile = ramp_line(
                    self.hardware.stage.as_mut(),
                    self.hardware.digitizer.as_mut(),
                    geometry.axis_pair.fast(),
                    &config.channels,
                    config.sample_rate_hz,
                    ramp.samples,
                    config.nx,
                )?;
                self.image
                    .store_line(index, profile.gone.view(), profile.back.view());
                debug!("Line {index}/{} acquired", config.ny);
            }
            ScanMode::Step => {
                let value = sample_point(
                    self.hardware.digitizer.as_mut(),
                    &config.channels,
                    &config.step,
                )?;
                let (row, col) = self.step_points[index];
                self.image.store_point(row, col, value);
            }
        }
        Ok(())
    }

    fn publish_partial(&self, geometry: &ScanGeometry, completed: usize) {
        self.observers.emit(&ScanEvent::PartialImage {
            axis_pair: geometry.axis_pair,
            mode: geometry.mode,
            completed,
            combined: Arc::new(self.image.combined()),
        });
    }

    fn close_shutter(&mut self) {
        if let Some(request) = &self.request {
            if let Err(e) = self.hardware.shutter.close(&request.channel) {
                warn!("Failed to close shutter {}: {e}", request.channel);
            }
        }
        self.scan_stop_signalled = true;
    }

    /// Return the scan axes to where they started.
    fn return_axes(&mut self, geometry: &ScanGeometry) {
        let (fast, slow) = (geometry.axis_pair.fast(), geometry.axis_pair.slow());
        let home = [(fast, self.origin.get(fast)), (slow, self.origin.get(slow))];
        if let Err(e) = settle_at(self.hardware.stage.as_mut(), &home, &geometry.config.settle) {
            warn!("Failed to return {fast}/{slow} to scan start: {e}");
        }
    }

    /// Close the shutter, go back to idle and return the axes.
    ///
    /// Used on the stop and error paths; failures are logged, not
    /// propagated, so cleanup always runs to the end.
    fn release(&mut self, geometry: &ScanGeometry) {
        self.close_shutter();
        self.state = ScanState::Idle;
        self.return_axes(geometry);
    }

    fn finish_stop(&mut self, geometry: &ScanGeometry) -> Result<(), ScanError> {
        let index = self.last_index;
        self.release(geometry);
        info!("Scan stopped at index {index}");
        self.observers.emit(&ScanEvent::ScanStopped {
            axis_pair: geometry.axis_pair,
            mode: geometry.mode,
            index,
        });
        Ok(())
    }

    fn finalize(&mut self, geometry: &ScanGeometry) -> Result<ScanCompletion, ScanError> {
        let request = self.request.clone().ok_or(ScanError::NotConfigured)?;
        self.close_shutter();
        self.state = ScanState::Idle;

        let combined = Arc::new(self.image.combined());
        let forward = Arc::new(self.image.forward().clone());
        let backward = Arc::new(self.image.backward().clone());

        let (fast, slow) = (geometry.axis_pair.fast(), geometry.axis_pair.slow());
        let origin = (self.origin.get(fast), self.origin.get(slow));
        let centroid = request.wants_centroid().then(|| {
            self.estimator
                .estimate(combined.view(), &geometry.config, origin)
        });
        match &centroid {
            Some(Ok(result)) => {
                for (feature, estimate) in result.features().enumerate() {
                    info!(
                        "Feature {feature} at pixel ({:.2}, {:.2}) = stage ({:.4}, {:.4})",
                        estimate.x_pixel, estimate.y_pixel, estimate.x_physical, estimate.y_physical
                    );
                    self.observers.emit(&ScanEvent::CentroidUpdated {
                        feature,
                        estimate: *estimate,
                    });
                }
            }
            Some(Err(e)) => warn!("Centroid estimation failed: {e}"),
            None => {}
        }

        let hint = format!("scan_{}", geometry.axis_pair.label());
        match request.purpose {
            SessionPurpose::None => {
                self.persist(&combined, &hint);
                let target = centroid
                    .as_ref()
                    .and_then(|c| c.as_ref().ok())
                    .filter(|_| request.auto_recenter)
                    .map(|c| c.primary);
                match target {
                    Some(estimate) => {
                        if let Err(e) =
                            self.recenter(geometry, estimate.x_physical, estimate.y_physical)
                        {
                            warn!("Re-centering failed, returning to scan start: {e}");
                            self.return_axes(geometry);
                        }
                    }
                    None => {
                        self.return_axes(geometry);
                    }
                }
            }
            SessionPurpose::Printing
            | SessionPurpose::DimersCenter
            | SessionPurpose::DimersPree
            | SessionPurpose::DimersPost => {
                if let Some(channel) = request.purpose.channel() {
                    info!("Handing {} image to {channel}", geometry.axis_pair);
                }
                self.return_axes(geometry);
            }
            SessionPurpose::Drift => {
                self.persist(&combined, &format!("drift/{hint}"));
                self.return_axes(geometry);
            }
        }
        let final_position = match self.hardware.stage.current_position() {
            Ok(position) => position,
            Err(e) => {
                let err = line_failure(geometry, self.last_index, e);
                warn!("Scan data acquired but final position unknown: {err}");
                self.emit_aborted(geometry, self.last_index, &err);
                return Err(err);
            }
        };

        let elapsed = self.started_at.map(|t| t.elapsed()).unwrap_or_default();
        info!(
            "{} scan on {} complete in {:.2?}",
            geometry.mode, geometry.axis_pair, elapsed
        );
        self.observers.emit(&ScanEvent::ScanComplete {
            purpose: request.purpose,
            axis_pair: geometry.axis_pair,
            mode: geometry.mode,
            combined: combined.clone(),
            forward: forward.clone(),
            backward: backward.clone(),
            centroid: centroid.as_ref().and_then(|c| c.as_ref().ok()).copied(),
        });

        Ok(ScanCompletion {
            purpose: request.purpose,
            axis_pair: geometry.axis_pair,
            mode: geometry.mode,
            combined,
            forward,
            backward,
            centroid,
            origin: self.origin,
            final_position,
            elapsed,
        })
    }

    /// Move the scan axes onto `(x, y)` instead of returning to the start.
    fn recenter(&mut self, geometry: &ScanGeometry, x: f64, y: f64) -> Result<(), ScanError> {
        let (fast, slow) = (geometry.axis_pair.fast(), geometry.axis_pair.slow());
        settle_at(
            self.hardware.stage.as_mut(),
            &[(fast, x), (slow, y)],
            &geometry.config.settle,
        )?;
        info!("Re-centered {fast}/{slow} on ({x:.4}, {y:.4})");
        Ok(())
    }

    fn persist(&mut self, image: &Array2<f64>, hint: &str) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.save_image(image, hint) {
                warn!("Failed to persist scan image '{hint}': {e}");
            }
        }
    }
}
