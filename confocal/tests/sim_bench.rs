//! End-to-end scans against the simulated bench.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use approx::assert_relative_eq;
use confocal::config::SettleSettings;
use confocal::{
    CenteringMethod, CentroidSettings, DemuxError, DriftCorrector, LineError, ScanAxisPair,
    ScanConfig, ScanController, ScanError, ScanEvent, ScanHardware, ScanMode, ScanObservers,
    ScanRequest, ScanSession, SessionPurpose, TickOutcome,
};
use hardware::sim::{SimulatedBench, SimulatedSample, SimulatedSpot};
use hardware::{Axis, HardwareError, StagePosition};
use shared::{RecordingSink, SavedProduct};

const START: f64 = 50.0;
const SHUTTER: &str = "532";

fn start() -> StagePosition {
    StagePosition::new(START, START, START)
}

fn bench_with_spot(dx: f64, dy: f64) -> SimulatedBench {
    let config = ScanConfig::default();
    SimulatedBench::new(
        SimulatedSample::new(
            0.05,
            vec![SimulatedSpot::bright(START + dx, START + dy, START, 1.0, 0.25)],
        ),
        start(),
        config.channels.photodiode,
        config.channels.trigger,
    )
}

fn controller(bench: &SimulatedBench, observers: ScanObservers) -> ScanController {
    ScanController::new(
        ScanHardware {
            stage: Box::new(bench.stage()),
            digitizer: Box::new(bench.digitizer()),
            shutter: Box::new(bench.shutter()),
        },
        observers,
    )
}

/// 16x16 ramp scan over 1 µm with a short ramp table.
fn small_ramp_config() -> ScanConfig {
    ScanConfig {
        sample_rate_hz: 20_000.0,
        ..ScanConfig::new(1.0, 1.0, 16, 16)
    }
}

fn event_names(observers: &ScanObservers) -> Arc<Mutex<Vec<&'static str>>> {
    let names = Arc::new(Mutex::new(Vec::new()));
    let names_clone = names.clone();
    observers.register_callback(move |event| {
        let name = match event {
            ScanEvent::PartialImage { .. } => "partial",
            ScanEvent::ScanComplete { .. } => "complete",
            ScanEvent::CentroidUpdated { .. } => "centroid",
            ScanEvent::DriftSeriesUpdated { .. } => "drift",
            ScanEvent::ScanAborted { .. } => "aborted",
            ScanEvent::ScanStopped { .. } => "stopped",
        };
        names_clone.lock().unwrap().push(name);
    });
    names
}

fn assert_released(bench: &SimulatedBench) {
    assert!(!bench.is_shutter_open(SHUTTER));
    assert_eq!(bench.open_task_count(), 0);
}

#[test]
fn test_ramp_scan_locates_spot() {
    let bench = bench_with_spot(0.2, -0.15);
    let observers = ScanObservers::new();
    let events = event_names(&observers);
    let mut controller = controller(&bench, observers);
    controller
        .configure(ScanConfig::default(), ScanAxisPair::XY, ScanMode::Ramp)
        .unwrap();
    controller
        .start(ScanRequest::new(SHUTTER, SessionPurpose::None).with_centroid())
        .unwrap();

    let TickOutcome::Completed(completion) = controller.run_to_completion().unwrap() else {
        panic!("scan did not complete");
    };
    assert_eq!(completion.combined.dim(), (34, 34));
    let centroid = completion.centroid_result().unwrap();
    assert_relative_eq!(centroid.primary.x_physical, START + 0.2, epsilon = 0.05);
    assert_relative_eq!(centroid.primary.y_physical, START - 0.15, epsilon = 0.05);

    // Forward and mirrored backward images see the spot in the same place
    let forward_peak = argmax(&completion.forward);
    let backward_peak = argmax(&confocal::image::mirror(completion.backward.view()));
    assert!(forward_peak.0 == backward_peak.0);
    assert!(forward_peak.1.abs_diff(backward_peak.1) <= 1);

    assert_eq!(completion.final_position, start());
    assert_eq!(bench.position(), start());
    assert_eq!(bench.tasks_opened(), 34);
    assert_released(&bench);

    let events = events.lock().unwrap();
    assert_eq!(events.iter().filter(|e| **e == "partial").count(), 34);
    assert_eq!(events[events.len() - 2..], ["centroid", "complete"]);
}

fn argmax(image: &ndarray::Array2<f64>) -> (usize, usize) {
    image
        .indexed_iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx)
        .unwrap()
}

#[test]
fn test_step_scan_gaussian_fit() {
    let bench = bench_with_spot(0.1, -0.05);
    let mut controller = controller(&bench, ScanObservers::new());
    controller
        .configure(ScanConfig::new(1.0, 1.0, 12, 12), ScanAxisPair::XY, ScanMode::Step)
        .unwrap();
    controller
        .set_centroid_settings(CentroidSettings {
            method: CenteringMethod::GaussianFit,
            ..Default::default()
        })
        .unwrap();
    controller
        .start(ScanRequest::new(SHUTTER, SessionPurpose::None).with_centroid())
        .unwrap();

    let TickOutcome::Completed(completion) = controller.run_to_completion().unwrap() else {
        panic!("scan did not complete");
    };
    let centroid = completion.centroid_result().unwrap();
    assert_relative_eq!(centroid.primary.x_physical, START + 0.1, epsilon = 0.01);
    assert_relative_eq!(centroid.primary.y_physical, START - 0.05, epsilon = 0.01);

    // Step mode has no return sweep
    assert_eq!(completion.forward, completion.combined);
    assert_eq!(bench.tasks_opened(), 144);
    assert_eq!(bench.position(), start());
    assert_released(&bench);
}

#[test]
fn test_auto_recenter_moves_onto_feature() {
    let bench = bench_with_spot(0.12, 0.08);
    let mut controller = controller(&bench, ScanObservers::new());
    controller
        .configure(ScanConfig::new(1.0, 1.0, 12, 12), ScanAxisPair::XY, ScanMode::Step)
        .unwrap();
    controller
        .start(ScanRequest::new(SHUTTER, SessionPurpose::None).with_recenter())
        .unwrap();

    let TickOutcome::Completed(completion) = controller.run_to_completion().unwrap() else {
        panic!("scan did not complete");
    };
    let position = bench.position();
    assert_relative_eq!(position.x, START + 0.12, epsilon = 0.03);
    assert_relative_eq!(position.y, START + 0.08, epsilon = 0.03);
    assert_eq!(position.z, START);
    assert_eq!(completion.final_position, position);
}

#[tokio::test]
async fn test_stop_mid_scan_restores_stage() {
    let bench = bench_with_spot(0.0, 0.0);
    let observers = ScanObservers::new();
    let events = event_names(&observers);
    let mut session =
        ScanSession::new(controller(&bench, observers.clone())).with_tick_interval(Duration::ZERO);
    session
        .controller_mut()
        .configure(small_ramp_config(), ScanAxisPair::YZ, ScanMode::Ramp)
        .unwrap();

    let stop = session.stop_handle();
    observers.register_callback(move |event| {
        if let ScanEvent::PartialImage { completed: 3, .. } = event {
            stop.stop();
        }
    });

    let outcome = session
        .run_scan(ScanRequest::new(SHUTTER, SessionPurpose::None).with_centroid())
        .await
        .unwrap();
    assert!(matches!(outcome, TickOutcome::Stopped));
    assert!(session.controller().is_idle());
    assert!(session.controller().scan_stop_signalled());

    let events = events.lock().unwrap();
    assert!(!events.contains(&"complete"));
    assert!(!events.contains(&"centroid"));
    assert_eq!(events.last(), Some(&"stopped"));
    assert_eq!(bench.position(), start());
    assert_released(&bench);
}

#[test]
fn test_trigger_dropout_aborts_scan() {
    let bench = bench_with_spot(0.0, 0.0);
    bench.set_trigger_dropout(true);
    let observers = ScanObservers::new();
    let events = event_names(&observers);
    let mut controller = controller(&bench, observers);
    controller
        .configure(small_ramp_config(), ScanAxisPair::XY, ScanMode::Ramp)
        .unwrap();
    controller
        .start(ScanRequest::new(SHUTTER, SessionPurpose::None))
        .unwrap();

    let err = controller.run_to_completion().unwrap_err();
    match err {
        ScanError::Line {
            axis_pair,
            mode,
            index,
            source: LineError::Demux(DemuxError::MissingEdge { rising, falling, .. }),
        } => {
            assert_eq!(axis_pair, ScanAxisPair::XY);
            assert_eq!(mode, ScanMode::Ramp);
            assert_eq!(index, 0);
            assert_eq!((rising, falling), (0, 0));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(controller.is_idle());
    assert_eq!(*events.lock().unwrap(), vec!["aborted"]);
    assert_eq!(bench.position(), start());
    assert_released(&bench);

    // The controller accepts a new scan once the fault clears
    bench.set_trigger_dropout(false);
    controller
        .start(ScanRequest::new(SHUTTER, SessionPurpose::None))
        .unwrap();
    assert!(matches!(
        controller.run_to_completion().unwrap(),
        TickOutcome::Completed(_)
    ));
}

#[test]
fn test_stuck_axis_times_out() {
    let bench = bench_with_spot(0.0, 0.0);
    bench.set_stuck_axis(Some(Axis::Y));
    let mut controller = controller(&bench, ScanObservers::new());
    let config = ScanConfig {
        settle: SettleSettings {
            timeout_ms: 20,
            poll_interval_ms: 2,
        },
        ..ScanConfig::new(1.0, 1.0, 4, 4)
    };
    controller
        .configure(config, ScanAxisPair::XY, ScanMode::Step)
        .unwrap();
    controller
        .start(ScanRequest::new(SHUTTER, SessionPurpose::None))
        .unwrap();

    let err = controller.run_to_completion().unwrap_err();
    assert!(matches!(
        err,
        ScanError::Line {
            index: 0,
            source: LineError::Hardware(HardwareError::Timeout { .. }),
            ..
        }
    ));
    assert!(controller.is_idle());
    assert_eq!(bench.tasks_opened(), 0);
    assert_released(&bench);
}

#[test]
fn test_undersampled_ramp_rejected() {
    let bench = bench_with_spot(0.0, 0.0);
    let mut controller = controller(&bench, ScanObservers::new());
    let config = ScanConfig {
        sample_rate_hz: 500.0,
        ..ScanConfig::new(1.0, 1.0, 64, 8)
    };
    let err = controller
        .configure(config, ScanAxisPair::XY, ScanMode::Ramp)
        .unwrap_err();
    assert!(matches!(
        err,
        ScanError::Config(confocal::ConfigError::RampUndersampled { pixels: 64, .. })
    ));
}

#[test]
fn test_purposes_route_products() {
    let bench = bench_with_spot(0.05, 0.05);
    let observers = ScanObservers::new();
    let printing = Arc::new(Mutex::new(Vec::new()));
    let printing_clone = printing.clone();
    observers.register_purpose_callback(SessionPurpose::Printing, move |event| {
        if let ScanEvent::ScanComplete { centroid, .. } = event {
            printing_clone.lock().unwrap().push(*centroid);
        }
    });

    let sink = RecordingSink::new();
    let mut controller =
        controller(&bench, observers).with_sink(Box::new(sink.clone()));
    controller
        .configure(ScanConfig::new(1.0, 1.0, 8, 8), ScanAxisPair::XZ, ScanMode::Step)
        .unwrap();

    for purpose in [
        SessionPurpose::None,
        SessionPurpose::Printing,
        SessionPurpose::DimersPost,
        SessionPurpose::Drift,
    ] {
        controller
            .start(ScanRequest::new(SHUTTER, purpose))
            .unwrap();
        let TickOutcome::Completed(completion) = controller.run_to_completion().unwrap() else {
            panic!("{purpose:?} scan did not complete");
        };
        assert_eq!(completion.purpose, purpose);
        // Standalone scans only centroid on request
        assert_eq!(completion.centroid.is_some(), purpose != SessionPurpose::None);
        assert_eq!(bench.position(), start());
    }

    let printing = printing.lock().unwrap();
    assert_eq!(printing.len(), 1);
    assert!(printing[0].is_some());

    let hints: Vec<String> = sink
        .products()
        .iter()
        .map(|p| p.path_hint().to_string())
        .collect();
    assert_eq!(hints, vec!["scan_x_z", "drift/scan_x_z"]);
    assert!(sink
        .products()
        .iter()
        .all(|p| matches!(p, SavedProduct::Image { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_drift_monitoring_runs_three_cycles() {
    let bench = bench_with_spot(0.0, 0.0);
    let observers = ScanObservers::new();
    let drifting = bench.clone();
    observers.register_purpose_callback(SessionPurpose::Drift, move |_| {
        drifting.shift_sample(0.02, -0.01);
    });

    let sink = RecordingSink::new();
    let mut drift = DriftCorrector::new(observers.clone()).with_sink(Box::new(sink.clone()));
    let mut session = ScanSession::new(controller(&bench, observers));
    session
        .controller_mut()
        .configure(small_ramp_config(), ScanAxisPair::XY, ScanMode::Ramp)
        .unwrap();

    let series = session
        .run_drift(
            &mut drift,
            SHUTTER,
            Duration::from_secs(120),
            Duration::from_secs(40),
        )
        .await
        .unwrap();

    assert_eq!(series.len(), 3);
    assert!(series.windows(2).all(|w| w[0].elapsed_s < w[1].elapsed_s));
    assert!(series[0].elapsed_s < 1.0);
    assert!((40.0..41.0).contains(&series[1].elapsed_s));
    assert!((80.0..81.0).contains(&series[2].elapsed_s));

    assert_relative_eq!(series[0].x_drift, 0.0);
    assert_relative_eq!(series[0].y_drift, 0.0);
    assert_relative_eq!(series[1].x_drift, 0.02, epsilon = 0.015);
    assert_relative_eq!(series[2].x_drift, 0.04, epsilon = 0.015);
    assert_relative_eq!(series[2].y_drift, -0.02, epsilon = 0.015);

    let logs = sink.time_series();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].len(), 3);
    assert!(!drift.is_active());
    assert_eq!(bench.position(), start());
    assert_released(&bench);
}

#[tokio::test(start_paused = true)]
async fn test_drift_stop_flushes_partial_series() {
    let bench = bench_with_spot(0.0, 0.0);
    let observers = ScanObservers::new();
    let sink = RecordingSink::new();
    let mut drift = DriftCorrector::new(observers.clone()).with_sink(Box::new(sink.clone()));
    let mut session = ScanSession::new(controller(&bench, observers.clone()));
    session
        .controller_mut()
        .configure(small_ramp_config(), ScanAxisPair::XY, ScanMode::Ramp)
        .unwrap();

    // Stop while waiting for the second cycle
    let stop = session.stop_handle();
    observers.register_callback(move |event| {
        if let ScanEvent::DriftSeriesUpdated { series } = event {
            if series.len() == 1 {
                stop.stop();
            }
        }
    });

    let series = session
        .run_drift(
            &mut drift,
            SHUTTER,
            Duration::from_secs(600),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(sink.time_series().len(), 1);
    assert_released(&bench);
}

#[tokio::test(start_paused = true)]
async fn test_drift_scan_failure_keeps_collected_samples() {
    let bench = bench_with_spot(0.0, 0.0);
    let observers = ScanObservers::new();
    let sink = RecordingSink::new();
    let mut drift = DriftCorrector::new(observers.clone()).with_sink(Box::new(sink.clone()));
    let mut session = ScanSession::new(controller(&bench, observers.clone()));
    session
        .controller_mut()
        .configure(small_ramp_config(), ScanAxisPair::XY, ScanMode::Ramp)
        .unwrap();

    // Lose the trigger line after the first sample
    let faulty = bench.clone();
    observers.register_callback(move |event| {
        if let ScanEvent::DriftSeriesUpdated { series } = event {
            if series.len() == 1 {
                faulty.set_trigger_dropout(true);
            }
        }
    });
    let names = event_names(&observers);

    let series = session
        .run_drift(
            &mut drift,
            SHUTTER,
            Duration::from_secs(120),
            Duration::from_secs(40),
        )
        .await
        .unwrap();

    assert_eq!(series.len(), 1);
    let logs = sink.time_series();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].len(), 1);
    assert!(names.lock().unwrap().contains(&"aborted"));
    assert!(!drift.is_active());
    assert_eq!(bench.position(), start());
    assert_released(&bench);
}
