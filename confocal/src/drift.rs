//! Long-term drift monitoring.
//!
//! The corrector schedules `N = floor(total / interval)` scan + centroid
//! cycles, the first one immediately, and records where the feature is
//! relative to where it was in the first cycle. It is purely observational:
//! the stage is returned to the scan start after every cycle.
//!
//! Time is passed in by the caller as the elapsed duration since an
//! arbitrary epoch, so the schedule can be driven by a real clock, a tokio
//! clock or a test.

use std::sync::Arc;
use std::time::Duration;

use shared::PersistenceSink;
use tracing::{debug, info, warn};

use crate::callback::{DriftSample, ScanEvent, ScanObservers};
use crate::controller::ScanCompletion;
use crate::error::{CentroidError, ConfigError, DriftError};

/// File name hint for the flushed drift log.
pub const DRIFT_LOG_HINT: &str = "drift/drift_log";

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftAction {
    /// Not monitoring (never started, finished or stopped)
    Idle,
    /// Start a drift scan now
    StartScan,
    /// A cycle is in progress; report it with [`DriftCorrector::record`]
    AwaitingScan,
    /// Nothing to do until the given time
    WaitUntil(Duration),
}

/// State after a recorded cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftProgress {
    /// More cycles scheduled
    Continuing(DriftSample),
    /// That was the last cycle; call [`DriftCorrector::stop`] to flush
    Finished(DriftSample),
}

#[derive(Debug, Clone)]
struct Schedule {
    interval: Duration,
    cycles: usize,
    started_at: Duration,
    next_due: Duration,
    cycle_started_at: Option<Duration>,
}

/// Periodic drift supervisor.
pub struct DriftCorrector {
    schedule: Option<Schedule>,
    reference: Option<(f64, f64)>,
    series: Vec<DriftSample>,
    observers: ScanObservers,
    sink: Option<Box<dyn PersistenceSink>>,
}

impl DriftCorrector {
    pub fn new(observers: ScanObservers) -> Self {
        Self {
            schedule: None,
            reference: None,
            series: Vec::new(),
            observers,
            sink: None,
        }
    }

    /// Flush drift logs to `sink` on stop.
    pub fn with_sink(mut self, sink: Box<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn is_active(&self) -> bool {
        self.schedule.is_some()
    }

    /// Samples recorded since the last start.
    pub fn series(&self) -> &[DriftSample] {
        &self.series
    }

    /// Cycles still to run, including one in progress.
    pub fn remaining_cycles(&self) -> usize {
        self.schedule
            .as_ref()
            .map(|s| s.cycles.saturating_sub(self.series.len()))
            .unwrap_or(0)
    }

    /// Begin monitoring at `now`. Returns the number of scheduled cycles.
    ///
    /// Restarting discards the previous series without flushing it.
    pub fn start(
        &mut self,
        total: Duration,
        interval: Duration,
        now: Duration,
    ) -> Result<usize, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidSetting(
                "drift refresh interval must be non-zero".to_string(),
            ));
        }
        let cycles = (total.as_secs_f64() / interval.as_secs_f64()).floor() as usize;
        if cycles == 0 {
            return Err(ConfigError::InvalidSetting(format!(
                "drift duration {total:?} is shorter than the refresh interval {interval:?}"
            )));
        }

        info!("Drift monitoring: {cycles} cycles every {interval:?}");
        self.series.clear();
        self.reference = None;
        self.schedule = Some(Schedule {
            interval,
            cycles,
            started_at: now,
            next_due: now,
            cycle_started_at: None,
        });
        Ok(cycles)
    }

    /// Next action at time `now`.
    pub fn poll(&mut self, now: Duration) -> DriftAction {
        let Some(schedule) = self.schedule.as_mut() else {
            return DriftAction::Idle;
        };
        if schedule.cycle_started_at.is_some() {
            return DriftAction::AwaitingScan;
        }
        if self.series.len() >= schedule.cycles {
            return DriftAction::Idle;
        }
        if now >= schedule.next_due {
            schedule.cycle_started_at = Some(now);
            DriftAction::StartScan
        } else {
            DriftAction::WaitUntil(schedule.next_due)
        }
    }

    /// Record the completed drift scan of the current cycle at `now`.
    ///
    /// Drift is reported relative to the first cycle's centroid. A scan
    /// without a centroid is an error and leaves the cycle unrecorded.
    /// Only a cycle handed out by [`poll`](Self::poll) can be recorded.
    pub fn record(
        &mut self,
        completion: &ScanCompletion,
        now: Duration,
    ) -> Result<DriftProgress, DriftError> {
        let Some(schedule) = self.schedule.as_mut() else {
            return Err(DriftError::NotMonitoring);
        };
        if self.series.len() >= schedule.cycles {
            return Err(DriftError::ScheduleComplete {
                cycles: schedule.cycles,
            });
        }
        let cycle_start = schedule
            .cycle_started_at
            .take()
            .ok_or(DriftError::NoCycleInProgress)?;
        schedule.next_due = cycle_start + schedule.interval;

        let estimate = match &completion.centroid {
            Some(Ok(result)) => result.primary,
            Some(Err(e)) => return Err(e.clone().into()),
            None => return Err(CentroidError::NotComputed.into()),
        };
        let position = (estimate.x_physical, estimate.y_physical);
        let reference = *self.reference.get_or_insert(position);

        let sample = DriftSample {
            elapsed_s: now.saturating_sub(schedule.started_at).as_secs_f64(),
            x_drift: position.0 - reference.0,
            y_drift: position.1 - reference.1,
        };
        self.series.push(sample);
        debug!(
            "Drift sample {}/{}: t={:.1}s dx={:.4} dy={:.4}",
            self.series.len(),
            schedule.cycles,
            sample.elapsed_s,
            sample.x_drift,
            sample.y_drift
        );
        let finished = self.series.len() >= schedule.cycles;

        self.observers.emit(&ScanEvent::DriftSeriesUpdated {
            series: Arc::new(self.series.clone()),
        });

        Ok(if finished {
            DriftProgress::Finished(sample)
        } else {
            DriftProgress::Continuing(sample)
        })
    }

    /// Cancel remaining cycles, flush the series to persistence and reset.
    ///
    /// Returns the flushed series.
    pub fn stop(&mut self) -> Vec<DriftSample> {
        if self.schedule.take().is_none() && self.series.is_empty() {
            return Vec::new();
        }
        let series = std::mem::take(&mut self.series);
        self.reference = None;

        if let (Some(sink), false) = (self.sink.as_mut(), series.is_empty()) {
            let rows: Vec<[f64; 3]> = series.iter().map(DriftSample::as_row).collect();
            if let Err(e) = sink.save_time_series(&rows, DRIFT_LOG_HINT) {
                warn!("Failed to flush drift log: {e}");
            }
        }
        info!("Drift monitoring stopped after {} samples", series.len());
        series
    }
}
