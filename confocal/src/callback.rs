//! Scan events and the observer registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::centroid::{CentroidEstimate, CentroidResult};
use crate::config::{ScanAxisPair, ScanMode};

/// What a scan is for. Decides what happens after it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPurpose {
    /// Standalone scan: persist the image, optionally re-center
    #[default]
    None,
    /// Hand the image and centroid to the printing workflow
    Printing,
    /// Dimer workflow: centering scan
    DimersCenter,
    /// Dimer workflow: scan before an exposure
    DimersPree,
    /// Dimer workflow: scan after an exposure
    DimersPost,
    /// One cycle of drift monitoring
    Drift,
}

impl SessionPurpose {
    /// Downstream consumer channel, for purposes that have one.
    pub fn channel(self) -> Option<&'static str> {
        match self {
            SessionPurpose::None | SessionPurpose::Drift => None,
            SessionPurpose::Printing => Some("printing"),
            SessionPurpose::DimersCenter => Some("dimers:center_scan"),
            SessionPurpose::DimersPree => Some("dimers:pree_scan"),
            SessionPurpose::DimersPost => Some("dimers:post_scan"),
        }
    }
}

/// One `(elapsed_s, x_drift, y_drift)` drift measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftSample {
    pub elapsed_s: f64,
    pub x_drift: f64,
    pub y_drift: f64,
}

impl DriftSample {
    pub fn as_row(&self) -> [f64; 3] {
        [self.elapsed_s, self.x_drift, self.y_drift]
    }
}

/// Events emitted by the scan controller and drift corrector.
///
/// Images are wrapped in `Arc` so observers can keep them cheaply.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// Image state after a line (ramp) or point (step)
    PartialImage {
        axis_pair: ScanAxisPair,
        mode: ScanMode,
        /// Lines (ramp) or points (step) acquired so far
        completed: usize,
        combined: Arc<Array2<f64>>,
    },
    /// Final products of a completed scan
    ScanComplete {
        purpose: SessionPurpose,
        axis_pair: ScanAxisPair,
        mode: ScanMode,
        combined: Arc<Array2<f64>>,
        forward: Arc<Array2<f64>>,
        backward: Arc<Array2<f64>>,
        centroid: Option<CentroidResult>,
    },
    /// One located feature; `feature` is 0 for the primary one
    CentroidUpdated {
        feature: usize,
        estimate: CentroidEstimate,
    },
    /// Drift series after a new sample
    DriftSeriesUpdated { series: Arc<Vec<DriftSample>> },
    /// Scan ended on an error
    ScanAborted {
        axis_pair: ScanAxisPair,
        mode: ScanMode,
        index: usize,
        reason: String,
    },
    /// Scan cancelled through `stop()`
    ScanStopped {
        axis_pair: ScanAxisPair,
        mode: ScanMode,
        index: usize,
    },
}

/// Callback ID for registration/deregistration
pub type CallbackId = u64;

/// Callback function type
pub type ScanCallback = Arc<dyn Fn(&ScanEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    callbacks: HashMap<CallbackId, (Option<SessionPurpose>, ScanCallback)>,
    next_id: CallbackId,
}

/// Shared observer registry. Clones refer to the same set of callbacks.
#[derive(Clone, Default)]
pub struct ScanObservers {
    inner: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for ScanObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanObservers")
            .field("callbacks", &self.callback_count())
            .finish()
    }
}

impl ScanObservers {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, purpose: Option<SessionPurpose>, callback: ScanCallback) -> CallbackId {
        let mut registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.callbacks.insert(id, (purpose, callback));
        id
    }

    /// Register a callback for every event
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&ScanEvent) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(callback))
    }

    /// Register a callback for completions of scans run for `purpose` only.
    pub fn register_purpose_callback<F>(&self, purpose: SessionPurpose, callback: F) -> CallbackId
    where
        F: Fn(&ScanEvent) + Send + Sync + 'static,
    {
        self.insert(Some(purpose), Arc::new(callback))
    }

    /// Deregister a callback
    pub fn deregister_callback(&self, id: CallbackId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .callbacks
            .remove(&id)
            .is_some()
    }

    /// Get the number of registered callbacks
    pub fn callback_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .callbacks
            .len()
    }

    /// Emit an event to all matching callbacks.
    ///
    /// Callbacks run outside the registry lock and may register or
    /// deregister callbacks themselves.
    pub fn emit(&self, event: &ScanEvent) {
        let targets: Vec<ScanCallback> = {
            let registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let mut ids: Vec<_> = registry.callbacks.keys().copied().collect();
            ids.sort_unstable();
            ids.iter()
                .filter_map(|id| registry.callbacks.get(id))
                .filter(|(filter, _)| match (filter, event) {
                    (None, _) => true,
                    (Some(purpose), ScanEvent::ScanComplete { purpose: p, .. }) => purpose == p,
                    (Some(_), _) => false,
                })
                .map(|(_, cb)| cb.clone())
                .collect()
        };
        for callback in targets {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strum::IntoEnumIterator;

    fn completion(purpose: SessionPurpose) -> ScanEvent {
        let image = Arc::new(Array2::zeros((2, 2)));
        ScanEvent::ScanComplete {
            purpose,
            axis_pair: ScanAxisPair::XY,
            mode: ScanMode::Ramp,
            combined: image.clone(),
            forward: image.clone(),
            backward: image,
            centroid: None,
        }
    }

    #[test]
    fn test_channels() {
        let with_channel: Vec<_> = SessionPurpose::iter()
            .filter_map(|p| p.channel())
            .collect();
        assert_eq!(
            with_channel,
            vec![
                "printing",
                "dimers:center_scan",
                "dimers:pree_scan",
                "dimers:post_scan"
            ]
        );
    }

    #[test]
    fn test_callback_registration() {
        let observers = ScanObservers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let id = observers.register_callback(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(observers.callback_count(), 1);

        observers.emit(&completion(SessionPurpose::None));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(observers.deregister_callback(id));
        assert!(!observers.deregister_callback(id));
        observers.emit(&completion(SessionPurpose::None));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_purpose_callbacks_only_see_their_completions() {
        let observers = ScanObservers::new();
        let printing = Arc::new(AtomicUsize::new(0));
        let printing_clone = printing.clone();
        observers.register_purpose_callback(SessionPurpose::Printing, move |_| {
            printing_clone.fetch_add(1, Ordering::SeqCst);
        });

        observers.emit(&completion(SessionPurpose::DimersPost));
        observers.emit(&ScanEvent::ScanStopped {
            axis_pair: ScanAxisPair::XY,
            mode: ScanMode::Step,
            index: 0,
        });
        assert_eq!(printing.load(Ordering::SeqCst), 0);

        observers.emit(&completion(SessionPurpose::Printing));
        assert_eq!(printing.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_deregister_itself() {
        let observers = ScanObservers::new();
        let handle = observers.clone();
        let id = Arc::new(Mutex::new(None));
        let id_clone = id.clone();
        let registered = observers.register_callback(move |_| {
            if let Some(id) = *id_clone.lock().unwrap() {
                handle.deregister_callback(id);
            }
        });
        *id.lock().unwrap() = Some(registered);

        observers.emit(&completion(SessionPurpose::None));
        assert_eq!(observers.callback_count(), 0);
    }
}
