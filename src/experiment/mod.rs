//! Experiment requests and orchestration.
//!
//! An [`ExperimentRequest`] is plain data: which instruments to use and the parameters of
//! one of the supported experiment kinds. [`ExperimentOrchestrator`] resolves the
//! instruments, optionally waits for a temperature, runs the measurement phase and
//! reports one terminal status.
//!
//! Every request is validated in full before any instrument is touched.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dialect::Sr830;
use crate::error::{DaqError, DaqResult};
use crate::instrument::LockInSettings;
use crate::measurement::{LockInOutput, MeasureType, SourceSpec};
use crate::stabilizer::StabilizationTarget;
use crate::sweep::{fixed_step_points, SweepPlan};
use crate::timed_logger::{TimeAxis, TimedLogger};

pub mod orchestrator;
pub mod targets;

pub use orchestrator::{
    ExperimentOrchestrator, InstrumentRegistry, OrchestratorSettings, RunHandle, RunReport,
};
pub use targets::{
    AcTarget, DcTarget, FrequencyTarget, HarmonicTarget, ImpedanceProbe, LockInBiasTarget,
    LockInProbe, PulsedTarget, SmuProbe,
};

/// AUX output channel used as the DC bias in lock-in-only AC I-V.
pub const BIAS_AUX_CHANNEL: u8 = 1;

/// Pulse timing for pulsed I-V.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseSettings {
    /// Pulse on-time.
    pub width: Duration,
    /// Off-time after each pulse before measuring.
    pub delay: Duration,
}

impl PulseSettings {
    /// Reject a zero pulse width.
    pub fn validate(&self) -> DaqResult<()> {
        if self.width.is_zero() {
            return Err(DaqError::Configuration(
                "pulse width must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Experiment kinds and their parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Experiment {
    /// DC I-V sweep on a source-measure unit.
    IvSweep {
        /// Source-measure unit id.
        smu: String,
        /// Setpoints to step through.
        plan: SweepPlan,
        /// Source function, compliance and delay.
        source: SourceSpec,
    },
    /// Pulsed I-V sweep; needs a 2636B-class unit.
    PulsedIvSweep {
        /// Source-measure unit id.
        smu: String,
        /// Setpoints to step through.
        plan: SweepPlan,
        /// Source function, compliance and delay.
        source: SourceSpec,
        /// Pulse timing.
        pulse: PulseSettings,
    },
    /// DC bias from a source-measure unit, lock-in read at each step.
    AcIvSweep {
        /// Source-measure unit id.
        smu: String,
        /// Lock-in amplifier id.
        lockin: String,
        /// Setpoints to step through.
        plan: SweepPlan,
        /// Source function, compliance and delay.
        source: SourceSpec,
        /// Lock-in configuration applied before the run.
        settings: LockInSettings,
        /// Lock-in output pair to record.
        output: LockInOutput,
    },
    /// Lock-in AUX output swept as the bias; setpoints are volts.
    LockInOnlyAcIv {
        /// Lock-in amplifier id.
        lockin: String,
        /// Setpoints to step through.
        plan: SweepPlan,
        /// Lock-in configuration applied before the run.
        settings: LockInSettings,
        /// Lock-in output pair to record.
        output: LockInOutput,
    },
    /// Reference frequency stepped by `step_hz` from `start_hz` to `stop_hz`.
    FrequencySweep {
        /// Lock-in amplifier id.
        lockin: String,
        /// First reference frequency.
        start_hz: f64,
        /// Last reference frequency, inclusive.
        stop_hz: f64,
        /// Frequency increment.
        step_hz: f64,
        /// Lock-in configuration applied before the run.
        settings: LockInSettings,
        /// Lock-in output pair to record.
        output: LockInOutput,
    },
    /// Reference set to `base_hz * n` for `n` in `1..=max_harmonic`; x is `n`.
    HarmonicDetection {
        /// Lock-in amplifier id.
        lockin: String,
        /// Fundamental reference frequency.
        base_hz: f64,
        /// Highest harmonic; `base_hz * max_harmonic` must be a valid reference.
        max_harmonic: u32,
        /// Lock-in configuration applied before the run.
        settings: LockInSettings,
        /// Lock-in output pair to record.
        output: LockInOutput,
    },
    /// Impedance `amplitude / I` logged against time in seconds.
    ImpedanceVsTime {
        /// Lock-in amplifier id.
        lockin: String,
        /// Time between readings.
        interval: Duration,
        /// Total logging time.
        duration: Duration,
        /// Lock-in configuration applied before the run.
        settings: LockInSettings,
    },
    /// Both lock-in channels logged against time in seconds.
    AcSignalLogging {
        /// Lock-in amplifier id.
        lockin: String,
        /// Time between readings.
        interval: Duration,
        /// Total logging time.
        duration: Duration,
        /// Lock-in configuration applied before the run.
        settings: LockInSettings,
        /// Lock-in output pair to record.
        output: LockInOutput,
    },
    /// Fixed source value, measurement logged against time in milliseconds.
    TimeLogging {
        /// Source-measure unit id.
        smu: String,
        /// Source function, compliance and delay.
        source: SourceSpec,
        /// Quantity to measure.
        measure: MeasureType,
        /// Time between readings.
        interval: Duration,
        /// Total logging time.
        duration: Duration,
    },
}

impl Experiment {
    /// Label used for the run.
    pub fn name(&self) -> &'static str {
        match self {
            Experiment::IvSweep { .. } => "iv_sweep",
            Experiment::PulsedIvSweep { .. } => "pulsed_iv_sweep",
            Experiment::AcIvSweep { .. } => "ac_iv_sweep",
            Experiment::LockInOnlyAcIv { .. } => "lock_in_only_ac_iv",
            Experiment::FrequencySweep { .. } => "frequency_sweep",
            Experiment::HarmonicDetection { .. } => "harmonic_detection",
            Experiment::ImpedanceVsTime { .. } => "impedance_vs_time",
            Experiment::AcSignalLogging { .. } => "ac_signal_logging",
            Experiment::TimeLogging { .. } => "time_logging",
        }
    }

    /// Source-measure unit the experiment drives, if any.
    pub fn smu(&self) -> Option<&str> {
        match self {
            Experiment::IvSweep { smu, .. }
            | Experiment::PulsedIvSweep { smu, .. }
            | Experiment::AcIvSweep { smu, .. }
            | Experiment::TimeLogging { smu, .. } => Some(smu),
            _ => None,
        }
    }

    /// Lock-in the experiment reads, if any.
    pub fn lockin(&self) -> Option<&str> {
        match self {
            Experiment::AcIvSweep { lockin, .. }
            | Experiment::LockInOnlyAcIv { lockin, .. }
            | Experiment::FrequencySweep { lockin, .. }
            | Experiment::HarmonicDetection { lockin, .. }
            | Experiment::ImpedanceVsTime { lockin, .. }
            | Experiment::AcSignalLogging { lockin, .. } => Some(lockin),
            _ => None,
        }
    }

    /// Lock-in settings applied before the measurement phase, if any.
    pub fn lockin_settings(&self) -> Option<&LockInSettings> {
        match self {
            Experiment::AcIvSweep { settings, .. }
            | Experiment::LockInOnlyAcIv { settings, .. }
            | Experiment::FrequencySweep { settings, .. }
            | Experiment::HarmonicDetection { settings, .. }
            | Experiment::ImpedanceVsTime { settings, .. }
            | Experiment::AcSignalLogging { settings, .. } => Some(settings),
            _ => None,
        }
    }

    /// Check every parameter without touching hardware.
    pub fn validate(&self) -> DaqResult<()> {
        if let Some(settings) = self.lockin_settings() {
            settings.commands()?;
        }
        match self {
            Experiment::IvSweep { plan, source, .. } => validate_sourced_plan(plan, source),
            Experiment::PulsedIvSweep {
                plan,
                source,
                pulse,
                ..
            } => {
                validate_sourced_plan(plan, source)?;
                pulse.validate()
            }
            Experiment::AcIvSweep { plan, source, .. } => validate_sourced_plan(plan, source),
            Experiment::LockInOnlyAcIv { plan, .. } => {
                plan.validate()?;
                Sr830.aux_output(BIAS_AUX_CHANNEL, plan.start)?;
                Sr830.aux_output(BIAS_AUX_CHANNEL, plan.stop)?;
                Ok(())
            }
            Experiment::FrequencySweep {
                start_hz,
                stop_hz,
                step_hz,
                ..
            } => {
                Sr830.frequency(*start_hz)?;
                Sr830.frequency(*stop_hz)?;
                fixed_step_points(*start_hz, *stop_hz, *step_hz).map(|_| ())
            }
            Experiment::HarmonicDetection {
                base_hz,
                max_harmonic,
                ..
            } => {
                if *max_harmonic == 0 {
                    return Err(DaqError::Configuration(
                        "harmonic detection needs at least the first harmonic".to_string(),
                    ));
                }
                Sr830.frequency(*base_hz)?;
                Sr830.frequency(*base_hz * f64::from(*max_harmonic))?;
                Ok(())
            }
            Experiment::ImpedanceVsTime {
                interval, duration, ..
            }
            | Experiment::AcSignalLogging {
                interval, duration, ..
            } => TimedLogger::new(*interval, *duration, TimeAxis::Seconds).map(|_| ()),
            Experiment::TimeLogging {
                source,
                interval,
                duration,
                ..
            } => {
                source.validate()?;
                TimedLogger::new(*interval, *duration, TimeAxis::Milliseconds).map(|_| ())
            }
        }
    }
}

fn validate_sourced_plan(plan: &SweepPlan, source: &SourceSpec) -> DaqResult<()> {
    plan.validate()?;
    source.validate()?;
    if plan.source_type != source.source_type {
        return Err(DaqError::Configuration(format!(
            "sweep sources {:?} but the source is configured for {:?}",
            plan.source_type, source.source_type
        )));
    }
    Ok(())
}

/// Temperature the run waits for before its electrical phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureGate {
    /// Temperature controller id.
    pub controller: String,
    /// Setpoint, tolerance and settle timeout.
    pub target: StabilizationTarget,
}

/// One experiment to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRequest {
    /// What to run.
    pub experiment: Experiment,
    /// Wait for this temperature first.
    #[serde(default)]
    pub temperature_gate: Option<TemperatureGate>,
}

impl ExperimentRequest {
    /// Request without a temperature gate.
    pub fn new(experiment: Experiment) -> Self {
        Self {
            experiment,
            temperature_gate: None,
        }
    }

    /// Gate the run on `target` read from `controller`.
    pub fn with_temperature_gate(
        mut self,
        controller: impl Into<String>,
        target: StabilizationTarget,
    ) -> Self {
        self.temperature_gate = Some(TemperatureGate {
            controller: controller.into(),
            target,
        });
        self
    }

    /// Validate the experiment and its gate without touching hardware.
    pub fn validate(&self) -> DaqResult<()> {
        self.experiment.validate()?;
        if let Some(gate) = &self.temperature_gate {
            gate.target.validate()?;
        }
        Ok(())
    }
}
