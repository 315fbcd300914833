//! Simulated confocal bench.
//!
//! [`SimulatedBench`] holds a single shared bench state. Its
//! [`stage`](SimulatedBench::stage), [`digitizer`](SimulatedBench::digitizer)
//! and [`shutter`](SimulatedBench::shutter) handles implement the hardware
//! traits against that state, so a ramp waveform started on the stage is
//! what the digitizer "sees" on its next read. The bench also records task
//! and shutter bookkeeping so tests can check that nothing is left open.
//!
//! Fault injection:
//! - [`set_stuck_axis`](SimulatedBench::set_stuck_axis) - axis never reports on-target
//! - [`set_trigger_dropout`](SimulatedBench::set_trigger_dropout) - trigger line stays low
//! - [`set_readout_fault`](SimulatedBench::set_readout_fault) - position readout fails
//! - [`set_shutter_fault`](SimulatedBench::set_shutter_fault) - shutters refuse to open

mod sample;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use ndarray::Array2;
use tracing::{debug, trace};

pub use sample::{SimulatedSample, SimulatedSpot};

use crate::acquisition::{AcquisitionInterface, AnalogChannel, TaskHandle};
use crate::error::{HardwareError, HardwareResult};
use crate::shutter::ShutterInterface;
use crate::stage::{Axis, RampWaveform, StageInterface, StagePosition};

/// Trigger line high level (V).
pub const TRIGGER_HIGH_VOLTS: f64 = 5.0;

/// Default travel range of each simulated axis (µm).
pub const DEFAULT_TRAVEL: (f64, f64) = (0.0, 100.0);

#[derive(Debug)]
struct OpenTask {
    channels: Vec<AnalogChannel>,
}

#[derive(Debug)]
struct BenchState {
    position: StagePosition,
    travel: (f64, f64),
    stuck_axis: Option<Axis>,
    waveforms: HashMap<Axis, RampWaveform>,
    running_waveform: Option<Axis>,
    sample: SimulatedSample,
    photodiode: AnalogChannel,
    trigger: AnalogChannel,
    trigger_dropout: bool,
    readout_fault: bool,
    shutter_fault: bool,
    tasks: HashMap<u64, OpenTask>,
    next_task_id: u64,
    tasks_opened: usize,
    open_shutters: HashSet<String>,
    shutter_operations: usize,
    moves: Vec<Vec<(Axis, f64)>>,
}

/// Shared simulated bench.
#[derive(Debug, Clone)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedBench {
    /// Bench with the focus at `start` over `sample`.
    ///
    /// `photodiode` and `trigger` name the analog inputs the digitizer
    /// wires to the detector and to the stage trigger output.
    pub fn new(
        sample: SimulatedSample,
        start: StagePosition,
        photodiode: AnalogChannel,
        trigger: AnalogChannel,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState {
                position: start,
                travel: DEFAULT_TRAVEL,
                stuck_axis: None,
                waveforms: HashMap::new(),
                running_waveform: None,
                sample,
                photodiode,
                trigger,
                trigger_dropout: false,
                readout_fault: false,
                shutter_fault: false,
                tasks: HashMap::new(),
                next_task_id: 1,
                tasks_opened: 0,
                open_shutters: HashSet::new(),
                shutter_operations: 0,
                moves: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stage handle.
    pub fn stage(&self) -> SimulatedStage {
        SimulatedStage {
            bench: self.clone(),
        }
    }

    /// Digitizer handle.
    pub fn digitizer(&self) -> SimulatedDigitizer {
        SimulatedDigitizer {
            bench: self.clone(),
        }
    }

    /// Shutter handle.
    pub fn shutter(&self) -> SimulatedShutter {
        SimulatedShutter {
            bench: self.clone(),
        }
    }

    /// Current focus position.
    pub fn position(&self) -> StagePosition {
        self.lock().position
    }

    /// Every accepted move command, oldest first.
    pub fn move_history(&self) -> Vec<Vec<(Axis, f64)>> {
        self.lock().moves.clone()
    }

    /// Set the travel range applied to all axes.
    pub fn set_travel(&self, min: f64, max: f64) {
        self.lock().travel = (min, max);
    }

    /// Make `axis` never report on-target (or clear with `None`).
    pub fn set_stuck_axis(&self, axis: Option<Axis>) {
        self.lock().stuck_axis = axis;
    }

    /// Hold the trigger line low during ramps.
    pub fn set_trigger_dropout(&self, dropout: bool) {
        self.lock().trigger_dropout = dropout;
    }

    /// Fail every position readout.
    pub fn set_readout_fault(&self, fault: bool) {
        self.lock().readout_fault = fault;
    }

    /// Fail every shutter open.
    pub fn set_shutter_fault(&self, fault: bool) {
        self.lock().shutter_fault = fault;
    }

    /// Replace the sample.
    pub fn set_sample(&self, sample: SimulatedSample) {
        self.lock().sample = sample;
    }

    /// Move every sample feature by `(dx, dy)`.
    pub fn shift_sample(&self, dx: f64, dy: f64) {
        self.lock().sample.shift(dx, dy);
    }

    /// Tasks currently open.
    pub fn open_task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Tasks opened since creation.
    pub fn tasks_opened(&self) -> usize {
        self.lock().tasks_opened
    }

    /// Whether the shutter for `channel` is open.
    pub fn is_shutter_open(&self, channel: &str) -> bool {
        self.lock().open_shutters.contains(channel)
    }

    /// Open and close calls since creation.
    pub fn shutter_operations(&self) -> usize {
        self.lock().shutter_operations
    }
}

/// Simulated piezo stage.
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    bench: SimulatedBench,
}

impl StageInterface for SimulatedStage {
    fn move_to(&mut self, targets: &[(Axis, f64)]) -> HardwareResult<()> {
        let mut state = self.bench.lock();
        let (min, max) = state.travel;
        for &(axis, position) in targets {
            if !(min..=max).contains(&position) {
                return Err(HardwareError::OutOfRange {
                    axis,
                    position,
                    min,
                    max,
                });
            }
        }

        for &(axis, position) in targets {
            if state.stuck_axis != Some(axis) {
                state.position = state.position.with(axis, position);
            }
        }
        trace!("Sim stage move {:?}", targets);
        state.moves.push(targets.to_vec());
        Ok(())
    }

    fn current_position(&mut self) -> HardwareResult<StagePosition> {
        let state = self.bench.lock();
        if state.readout_fault {
            return Err(HardwareError::Device("position readout failed".to_string()));
        }
        Ok(state.position)
    }

    fn is_on_target(&mut self, axes: &[Axis]) -> HardwareResult<Vec<bool>> {
        let state = self.bench.lock();
        Ok(axes
            .iter()
            .map(|&axis| state.stuck_axis != Some(axis))
            .collect())
    }

    fn program_ramp_waveform(
        &mut self,
        axis: Axis,
        waveform: &RampWaveform,
    ) -> HardwareResult<()> {
        let mut state = self.bench.lock();
        let (min, max) = state.travel;
        let start = waveform.start();
        let end = start + waveform.total_range();
        if start < min || end > max {
            return Err(HardwareError::OutOfRange {
                axis,
                position: if start < min { start } else { end },
                min,
                max,
            });
        }
        debug!(
            "Sim stage: ramp on axis {axis} over [{start:.3}, {end:.3}], {} points",
            waveform.points
        );
        state.waveforms.insert(axis, waveform.clone());
        Ok(())
    }

    fn start_waveform(&mut self, axis: Axis) -> HardwareResult<()> {
        let mut state = self.bench.lock();
        if !state.waveforms.contains_key(&axis) {
            return Err(HardwareError::NoWaveform(axis));
        }
        state.running_waveform = Some(axis);
        Ok(())
    }
}

/// Simulated digitizer.
///
/// While a ramp is running, a read covers exactly one waveform cycle and
/// consumes it; otherwise every sample sees the focus at rest.
#[derive(Debug, Clone)]
pub struct SimulatedDigitizer {
    bench: SimulatedBench,
}

impl AcquisitionInterface for SimulatedDigitizer {
    fn open_task(
        &mut self,
        channels: &[AnalogChannel],
        sample_rate_hz: f64,
        sample_count: usize,
    ) -> HardwareResult<TaskHandle> {
        if channels.is_empty() {
            return Err(HardwareError::InvalidRequest("no channels".to_string()));
        }
        if sample_rate_hz <= 0.0 || sample_count == 0 {
            return Err(HardwareError::InvalidRequest(format!(
                "{sample_count} samples @ {sample_rate_hz} Hz"
            )));
        }

        let mut state = self.bench.lock();
        let id = state.next_task_id;
        state.next_task_id += 1;
        state.tasks_opened += 1;
        state.tasks.insert(
            id,
            OpenTask {
                channels: channels.to_vec(),
            },
        );
        Ok(TaskHandle(id))
    }

    fn read(&mut self, task: TaskHandle, n: usize) -> HardwareResult<Array2<f64>> {
        let mut state = self.bench.lock();
        let channels = state
            .tasks
            .get(&task.0)
            .map(|t| t.channels.clone())
            .ok_or(HardwareError::UnknownTask(task.0))?;

        let ramp = state
            .running_waveform
            .take()
            .and_then(|axis| state.waveforms.get(&axis).map(|w| (axis, w.clone())));

        let mut data = Array2::<f64>::zeros((channels.len(), n));
        for k in 0..n {
            let (position, trigger) = match &ramp {
                Some((axis, waveform)) => {
                    let phase = k as f64 / n as f64;
                    let position = state.position.with(*axis, waveform.position_at(phase));
                    let high = waveform.trigger_at(phase) && !state.trigger_dropout;
                    (position, if high { TRIGGER_HIGH_VOLTS } else { 0.0 })
                }
                None => (state.position, 0.0),
            };
            let intensity = state.sample.intensity(&position);

            for (row, channel) in channels.iter().enumerate() {
                data[[row, k]] = if *channel == state.photodiode {
                    intensity
                } else if *channel == state.trigger {
                    trigger
                } else {
                    0.0
                };
            }
        }
        Ok(data)
    }

    fn close(&mut self, task: TaskHandle) -> HardwareResult<()> {
        self.bench
            .lock()
            .tasks
            .remove(&task.0)
            .map(|_| ())
            .ok_or(HardwareError::UnknownTask(task.0))
    }
}

/// Simulated shutter bank.
#[derive(Debug, Clone)]
pub struct SimulatedShutter {
    bench: SimulatedBench,
}

impl ShutterInterface for SimulatedShutter {
    fn open(&mut self, channel: &str) -> HardwareResult<()> {
        let mut state = self.bench.lock();
        if state.shutter_fault {
            return Err(HardwareError::Device(format!("shutter {channel} did not open")));
        }
        state.open_shutters.insert(channel.to_string());
        state.shutter_operations += 1;
        Ok(())
    }

    fn close(&mut self, channel: &str) -> HardwareResult<()> {
        let mut state = self.bench.lock();
        state.open_shutters.remove(channel);
        state.shutter_operations += 1;
        Ok(())
    }
}
