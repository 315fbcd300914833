//! Single-line and single-point acquisition.
//!
//! These are the only places that talk to the digitizer. Each acquisition
//! is a scoped [`AcquisitionTask`], so the task is released on every path.

use hardware::{
    AcquisitionInterface, AcquisitionTask, Axis, HardwareError, RampWaveform, StageInterface,
};
use tracing::{debug, trace};

use crate::config::{ChannelMap, RampParameters, SettleSettings, StepSettings};
use crate::demux::{demux_block, LineProfile};
use crate::error::LineError;

/// Program a go/return ramp over `ramp.range_total` centered on the current
/// position of `axis`.
pub fn configure_ramp_waveform(
    stage: &mut dyn StageInterface,
    axis: Axis,
    ramp: &RampParameters,
    speed_fraction: f64,
) -> Result<RampWaveform, HardwareError> {
    let center = stage.current_position()?.get(axis);
    let waveform = RampWaveform {
        center,
        active_range: ramp.range,
        margin: ramp.extra_margin,
        points: ramp.samples,
        speed_fraction,
    };
    stage.program_ramp_waveform(axis, &waveform)?;
    debug!(
        "Ramp waveform on {axis}: center {center:.3}, range {:.3} (+{:.3} margins), {} points",
        ramp.range, ramp.extra_margin, ramp.samples
    );
    Ok(waveform)
}

/// Run one programmed ramp cycle on `axis` and return the binned profiles.
pub fn ramp_line(
    stage: &mut dyn StageInterface,
    digitizer: &mut dyn AcquisitionInterface,
    axis: Axis,
    channels: &ChannelMap,
    sample_rate_hz: f64,
    samples: usize,
    bins: usize,
) -> Result<LineProfile, LineError> {
    let inputs = [channels.photodiode.clone(), channels.trigger.clone()];
    let mut task = AcquisitionTask::open(digitizer, &inputs, sample_rate_hz, samples)?;
    stage.start_waveform(axis)?;
    let block = task.read_all()?;
    task.close()?;

    let profile = demux_block(block.view())?;
    trace!(
        "Demuxed ramp line: {} gone / {} back samples",
        profile.gone.len(),
        profile.back.len()
    );
    Ok(profile.binned(bins)?)
}

/// Command `targets` and wait until every moved axis reports on-target.
pub fn settle_at(
    stage: &mut dyn StageInterface,
    targets: &[(Axis, f64)],
    settle: &SettleSettings,
) -> Result<(), HardwareError> {
    stage.move_to(targets)?;
    let axes: Vec<Axis> = targets.iter().map(|(axis, _)| *axis).collect();
    stage.wait_on_target(&axes, settle.timeout(), settle.poll_interval())
}

/// Mean photodiode level over `step.samples_per_point` samples.
pub fn sample_point(
    digitizer: &mut dyn AcquisitionInterface,
    channels: &ChannelMap,
    step: &StepSettings,
) -> Result<f64, HardwareError> {
    let inputs = [channels.photodiode.clone()];
    let mut task = AcquisitionTask::open(
        digitizer,
        &inputs,
        step.sample_rate_hz,
        step.samples_per_point,
    )?;
    let block = task.read_all()?;
    task.close()?;

    block
        .row(0)
        .mean()
        .ok_or_else(|| HardwareError::Device("digitizer returned no samples".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use approx::assert_relative_eq;
    use hardware::sim::{SimulatedBench, SimulatedSample, SimulatedSpot};
    use hardware::StagePosition;

    fn bench(config: &ScanConfig) -> SimulatedBench {
        SimulatedBench::new(
            SimulatedSample::new(0.1, vec![SimulatedSpot::bright(50.0, 50.0, 50.0, 1.0, 0.3)]),
            StagePosition::new(50.0, 50.0, 50.0),
            config.channels.photodiode.clone(),
            config.channels.trigger.clone(),
        )
    }

    fn fast_config() -> ScanConfig {
        let mut config = ScanConfig::new(2.0, 2.0, 20, 20);
        config.sample_rate_hz = 20_000.0;
        config
    }

    #[test]
    fn test_ramp_line_profiles_are_mirror_images() {
        let config = fast_config();
        let bench = bench(&config);
        let mut stage = bench.stage();
        let mut digitizer = bench.digitizer();
        let ramp = config.ramp_parameters();

        let waveform = configure_ramp_waveform(&mut stage, Axis::X, &ramp, 0.0).unwrap();
        assert_relative_eq!(waveform.center, 50.0);

        let profile = ramp_line(
            &mut stage,
            &mut digitizer,
            Axis::X,
            &config.channels,
            config.sample_rate_hz,
            ramp.samples,
            config.nx,
        )
        .unwrap();
        assert_eq!(profile.gone.len(), 20);
        assert_eq!(profile.back.len(), 20);

        // Spot in the middle of the line for both directions
        let peak_gone = profile.gone.iter().cloned().fold(f64::MIN, f64::max);
        assert!(profile.gone[9] > 0.9 * peak_gone || profile.gone[10] > 0.9 * peak_gone);
        for i in 0..20 {
            assert_relative_eq!(profile.gone[i], profile.back[19 - i], epsilon = 0.05);
        }
        assert_eq!(bench.open_task_count(), 0);
    }

    #[test]
    fn test_ramp_line_trigger_dropout_releases_task() {
        let config = fast_config();
        let bench = bench(&config);
        bench.set_trigger_dropout(true);
        let mut stage = bench.stage();
        let mut digitizer = bench.digitizer();
        let ramp = config.ramp_parameters();
        configure_ramp_waveform(&mut stage, Axis::X, &ramp, 0.0).unwrap();

        let err = ramp_line(
            &mut stage,
            &mut digitizer,
            Axis::X,
            &config.channels,
            config.sample_rate_hz,
            ramp.samples,
            config.nx,
        )
        .unwrap_err();
        assert!(matches!(err, LineError::Demux(_)));
        assert_eq!(bench.open_task_count(), 0);
        assert_eq!(bench.tasks_opened(), 1);
    }

    #[test]
    fn test_ramp_line_without_waveform_releases_task() {
        let config = fast_config();
        let bench = bench(&config);
        let mut stage = bench.stage();
        let mut digitizer = bench.digitizer();

        let err = ramp_line(
            &mut stage,
            &mut digitizer,
            Axis::Y,
            &config.channels,
            config.sample_rate_hz,
            1000,
            config.nx,
        )
        .unwrap_err();
        assert_eq!(err, LineError::Hardware(HardwareError::NoWaveform(Axis::Y)));
        assert_eq!(bench.open_task_count(), 0);
    }

    #[test]
    fn test_sample_point_reads_mean_where_settled() {
        let config = fast_config();
        let bench = bench(&config);
        let mut stage = bench.stage();
        let mut digitizer = bench.digitizer();

        settle_at(&mut stage, &[(Axis::X, 50.0), (Axis::Y, 50.0)], &config.settle).unwrap();
        let value = sample_point(&mut digitizer, &config.channels, &config.step).unwrap();
        assert_relative_eq!(value, 1.1, epsilon = 1e-9);

        settle_at(&mut stage, &[(Axis::X, 55.0)], &config.settle).unwrap();
        let off = sample_point(&mut digitizer, &config.channels, &config.step).unwrap();
        assert_relative_eq!(off, 0.1, epsilon = 1e-6);
        assert_relative_eq!(bench.position().x, 55.0);
        assert_eq!(bench.open_task_count(), 0);
    }

    #[test]
    fn test_settle_timeout() {
        let mut config = fast_config();
        config.settle.timeout_ms = 20;
        config.settle.poll_interval_ms = 1;
        let bench = bench(&config);
        bench.set_stuck_axis(Some(Axis::Y));
        let mut stage = bench.stage();

        let err = settle_at(&mut stage, &[(Axis::Y, 49.0)], &config.settle).unwrap_err();
        assert!(matches!(err, HardwareError::Timeout { .. }));
        assert_eq!(bench.tasks_opened(), 0);
    }
}
