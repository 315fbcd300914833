//! Async driver for the scan controller.
//!
//! [`ScanSession`] owns a [`ScanController`] and runs its ticks on the
//! caller's tokio runtime (a current-thread runtime is enough), sleeping
//! between ticks so other tasks get to run. A [`StopHandle`] can be cloned
//! out of the session and used from any task to cancel the scan or drift
//! monitoring in progress; it takes effect between ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::callback::{DriftSample, SessionPurpose};
use crate::controller::{ScanController, ScanRequest, TickOutcome};
use crate::drift::{DriftAction, DriftCorrector};
use crate::error::ScanError;

/// Default pause between controller ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Cancels a running scan or drift loop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Resolves once `stop()` has been called.
    async fn stopped(&self) {
        while !self.is_stopped() {
            self.notify.notified().await;
        }
    }
}

/// Runs scans and drift monitoring as async loops over controller ticks.
pub struct ScanSession {
    controller: ScanController,
    tick_interval: Duration,
    stop: StopHandle,
}

impl ScanSession {
    pub fn new(controller: ScanController) -> Self {
        Self {
            controller,
            tick_interval: DEFAULT_TICK_INTERVAL,
            stop: StopHandle::new(),
        }
    }

    /// Pause between ticks. Zero yields to the runtime instead of sleeping.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn controller(&self) -> &ScanController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut ScanController {
        &mut self.controller
    }

    /// Run one scan until it completes, is stopped or fails.
    pub async fn run_scan(&mut self, request: ScanRequest) -> Result<TickOutcome, ScanError> {
        self.stop.reset();
        self.drive(request).await
    }

    async fn drive(&mut self, request: ScanRequest) -> Result<TickOutcome, ScanError> {
        self.controller.start(request)?;
        loop {
            if self.stop.is_stopped() {
                self.controller.request_stop();
            }
            match self.controller.tick()? {
                TickOutcome::Running(_) => self.pause().await,
                outcome => return Ok(outcome),
            }
        }
    }

    async fn pause(&self) {
        if self.tick_interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.tick_interval).await;
        }
    }

    /// Monitor drift for `total`, one drift scan every `interval`.
    ///
    /// The series is flushed through the corrector's sink when monitoring
    /// ends and returned to the caller. A failed drift scan or a cycle
    /// without a usable centroid ends monitoring early with the samples
    /// collected so far; scan failures reach observers as `ScanAborted`.
    /// Only a rejected schedule is returned as an error.
    pub async fn run_drift(
        &mut self,
        drift: &mut DriftCorrector,
        channel: &str,
        total: Duration,
        interval: Duration,
    ) -> Result<Vec<DriftSample>, ScanError> {
        self.stop.reset();
        let stop = self.stop.clone();
        let epoch = Instant::now();
        drift.start(total, interval, Duration::ZERO)?;

        loop {
            if stop.is_stopped() {
                info!("Drift monitoring cancelled");
                break;
            }
            match drift.poll(epoch.elapsed()) {
                DriftAction::Idle => break,
                DriftAction::StartScan => {
                    let request = ScanRequest::new(channel, SessionPurpose::Drift);
                    match self.drive(request).await {
                        Ok(TickOutcome::Completed(completion)) => {
                            if let Err(e) = drift.record(&completion, epoch.elapsed()) {
                                warn!("Drift cycle failed: {e}");
                                break;
                            }
                        }
                        Ok(_) => break,
                        Err(e) => {
                            warn!("Drift scan failed, ending monitoring: {e}");
                            break;
                        }
                    }
                }
                DriftAction::WaitUntil(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(epoch + due) => {}
                        _ = stop.stopped() => {}
                    }
                }
                DriftAction::AwaitingScan => {
                    warn!("Drift cycle left unrecorded");
                    break;
                }
            }
        }
        Ok(drift.stop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_handle_wakes_waiter() {
        let handle = StopHandle::new();
        let remote = handle.clone();
        let waiter = tokio::spawn(async move { remote.stopped().await });
        tokio::task::yield_now().await;
        handle.stop();
        waiter.await.unwrap();
        assert!(handle.is_stopped());

        handle.reset();
        assert!(!handle.is_stopped());
    }
}
