//! Experiment orchestration.
//!
//! [`ExperimentOrchestrator`] owns the per-run state machine:
//!
//! ```text
//! Idle -> [TemperatureGating] -> Measuring -> Completed | Cancelled | Failed
//! ```
//!
//! Instruments are taken from an [`InstrumentRegistry`] of shared sessions and held for
//! the phase that needs them, so the telemetry poller resumes as soon as gating is done.
//! Every run ends with exactly one terminal status, and every output the run switched on
//! is switched off again whatever the outcome.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::targets::{
    ac_settle, AcTarget, DcTarget, FrequencyTarget, HarmonicTarget, ImpedanceProbe,
    LockInBiasTarget, LockInProbe, PulsedTarget, SmuProbe,
};
use super::{Experiment, ExperimentRequest, TemperatureGate};
use crate::adapters::{simulated_instrument, Adapter, VisaAdapter};
use crate::config::EngineConfig;
use crate::dialect::{InstrumentFamily, InstrumentKind, LakeShoreModel, SmuDialect};
use crate::error::{DaqError, DaqResult};
use crate::instrument::{LockInAmplifier, LockInSettings, SourceMeter, TemperatureController};
use crate::measurement::{MeasurementSample, Quantity, SourceSpec};
use crate::run::{CancellationFlag, ExperimentRun, PhaseOutcome, RunEvent, RunState, RunStatus};
use crate::session::{InstrumentHandle, InstrumentSession, SessionGuard, SharedSession};
use crate::stabilizer::{StabilizationOutcome, TemperatureStabilizer};
use crate::sweep::{fixed_step_points, SweepController, SweepPoint};
use crate::timed_logger::{TimeAxis, TimedLogger};
use crate::validator::{RecoveryPolicy, ResponseValidator};

/// One registered instrument.
#[derive(Clone)]
pub struct RegisteredInstrument {
    /// Shared session to the instrument.
    pub session: SharedSession,
    /// Source-measure channel (`a`/`b`) for 2636B units.
    pub channel: Option<String>,
}

/// Instruments available to runs, by id.
#[derive(Clone, Default)]
pub struct InstrumentRegistry {
    instruments: HashMap<String, RegisteredInstrument>,
}

impl InstrumentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under `id`, replacing any previous entry.
    pub fn insert(&mut self, id: impl Into<String>, session: SharedSession, channel: Option<String>) {
        self.instruments
            .insert(id.into(), RegisteredInstrument { session, channel });
    }

    /// Look up `id`.
    pub fn get(&self, id: &str) -> DaqResult<&RegisteredInstrument> {
        self.instruments.get(id).ok_or_else(|| {
            DaqError::Configuration(format!("no instrument registered as '{id}'"))
        })
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.instruments.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// First registered instrument of `family`, by sorted id.
    pub fn first_of(&self, family: InstrumentFamily) -> Option<&str> {
        self.ids()
            .into_iter()
            .find(|id| self.instruments[*id].session.kind().family() == family)
    }

    /// Number of registered instruments.
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Open a session to every enabled instrument in `config`.
    ///
    /// With `simulate` each instrument is replaced by a stateful simulation; otherwise
    /// the VISA transport is used. Each instrument is identified once after opening.
    pub async fn connect(config: &EngineConfig, simulate: bool) -> DaqResult<Self> {
        let mut registry = Self::new();
        for definition in config.enabled_instruments() {
            let adapter: Box<dyn Adapter> = if simulate {
                Box::new(simulated_instrument(definition.kind).with_name(&definition.resource))
            } else {
                Box::new(
                    VisaAdapter::new(&definition.resource)
                        .with_timeout(config.session_timeout())
                        .with_line_terminator(&config.session.line_terminator)
                        .connect()
                        .await?,
                )
            };
            let mut session = InstrumentSession::new(
                InstrumentHandle::new(&definition.resource, definition.kind),
                adapter,
                config.session_timeout(),
            );
            let identity = session.identify().await?;
            info!(
                id = %definition.id,
                kind = %definition.kind,
                resource = %definition.resource,
                identity = %identity,
                "instrument connected"
            );
            registry.insert(
                &definition.id,
                SharedSession::new(session),
                definition.channel.clone(),
            );
        }
        Ok(registry)
    }
}

/// Timing and recovery settings for runs.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// How long a run waits for a busy instrument.
    pub acquire_wait: Duration,
    /// Settle between a source step and a lock-in read.
    pub lockin_settle: Duration,
    /// Temperature gate poll interval.
    pub stabilizer_poll: Duration,
    /// Wait after an SMU reset.
    pub reset_settle: Duration,
    /// Stale-banner recovery policy for every query.
    pub recovery: RecoveryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for OrchestratorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            acquire_wait: Duration::from_millis(config.session.acquire_wait_ms),
            lockin_settle: Duration::from_millis(config.lockin.settle_ms),
            stabilizer_poll: Duration::from_millis(config.stabilizer.poll_interval_ms),
            reset_settle: Duration::from_millis(config.session.reset_settle_ms),
            recovery: config.recovery_policy(),
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Experiment kind label.
    pub experiment: String,
    /// Terminal state.
    pub status: RunStatus,
    /// Samples in recording order.
    pub samples: Vec<MeasurementSample>,
}

/// Handle to a run executing on its own task.
pub struct RunHandle {
    run_cancel: CancellationFlag,
    events: mpsc::UnboundedReceiver<RunEvent>,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    /// Request cancellation; the run stops at its next checked boundary.
    pub fn cancel(&self) {
        self.run_cancel.cancel();
    }

    /// A clone of the run's cancellation flag.
    pub fn cancellation(&self) -> CancellationFlag {
        self.run_cancel.clone()
    }

    /// Next event, or `None` once the run has finished and every event was read.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// The event receiver.
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<RunEvent> {
        &mut self.events
    }

    /// Wait for the run to finish.
    pub async fn join(self) -> DaqResult<RunReport> {
        self.task
            .await
            .map_err(|e| DaqError::TaskFailed(format!("experiment run: {e}")))
    }
}

/// Runs experiment requests against registered instruments.
#[derive(Clone)]
pub struct ExperimentOrchestrator {
    registry: Arc<InstrumentRegistry>,
    settings: OrchestratorSettings,
    validator: ResponseValidator,
}

impl ExperimentOrchestrator {
    /// Build an orchestrator; fails when the recovery policy is invalid.
    pub fn new(registry: InstrumentRegistry, settings: OrchestratorSettings) -> DaqResult<Self> {
        let validator = ResponseValidator::new(settings.recovery.clone())?;
        Ok(Self {
            registry: Arc::new(registry),
            settings,
            validator,
        })
    }

    /// Registered instruments.
    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    /// Run timing and recovery settings.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run `request` on a new task.
    pub fn spawn(&self, request: ExperimentRequest) -> RunHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationFlag::new();
        let orchestrator = self.clone();
        let run_cancel = cancel.clone();
        let task =
            tokio::spawn(async move { orchestrator.execute(request, cancel, Some(tx)).await });
        RunHandle {
            run_cancel,
            events: rx,
            task,
        }
    }

    /// Run `request` to completion on the current task.
    ///
    /// Never fails: errors end the run with [`RunStatus::Failed`].
    pub async fn execute(
        &self,
        request: ExperimentRequest,
        cancel: CancellationFlag,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> RunReport {
        let mut run = ExperimentRun::new(request.experiment.name(), cancel).with_events(events);
        info!(run_id = %run.id(), experiment = %run.label(), "experiment run started");

        let status = match self.drive(&request, &mut run).await {
            Ok(PhaseOutcome::Completed) => RunStatus::Completed,
            Ok(PhaseOutcome::Cancelled) => RunStatus::Cancelled,
            Err(err) => {
                error!(run_id = %run.id(), error = %err, "experiment run failed");
                RunStatus::Failed {
                    cause: err.to_string(),
                }
            }
        };
        run.finish(&status);
        info!(
            run_id = %run.id(),
            status = ?status,
            samples = run.samples().len(),
            "experiment run finished"
        );

        RunReport {
            run_id: run.id(),
            experiment: run.label().to_string(),
            status,
            samples: run.into_samples(),
        }
    }

    async fn drive(
        &self,
        request: &ExperimentRequest,
        run: &mut ExperimentRun,
    ) -> DaqResult<PhaseOutcome> {
        request.validate()?;
        self.check_instruments(request)?;
        let owner = format!("run-{}", run.id());

        if let Some(gate) = &request.temperature_gate {
            run.transition(RunState::TemperatureGating);
            if self.gate(gate, &owner, run).await? == StabilizationOutcome::Cancelled {
                return Ok(PhaseOutcome::Cancelled);
            }
        }
        if run.is_cancelled() {
            return Ok(PhaseOutcome::Cancelled);
        }

        run.transition(RunState::Measuring);
        self.measure(&request.experiment, &owner, run).await
    }

    /// Resolve every instrument the request names and check its type.
    fn check_instruments(&self, request: &ExperimentRequest) -> DaqResult<()> {
        if let Some(id) = request.experiment.smu() {
            let entry = self.registry.get(id)?;
            let dialect = SmuDialect::for_kind(entry.session.kind(), entry.channel.as_deref())?;
            if matches!(request.experiment, Experiment::PulsedIvSweep { .. })
                && !dialect.supports_pulse()
            {
                return Err(DaqError::Configuration(format!(
                    "instrument '{id}' ({}) cannot source pulses",
                    entry.session.kind()
                )));
            }
        }
        if let Some(id) = request.experiment.lockin() {
            let kind = self.registry.get(id)?.session.kind();
            if kind != InstrumentKind::Sr830 {
                return Err(DaqError::Configuration(format!(
                    "instrument '{id}' ({kind}) is not a lock-in amplifier"
                )));
            }
        }
        if let Some(gate) = &request.temperature_gate {
            let model = LakeShoreModel::for_kind(self.registry.get(&gate.controller)?.session.kind())?;
            model.validate_input(&gate.target.sensor_input)?;
            model.validate_loop(gate.target.control_loop)?;
        }
        Ok(())
    }

    async fn acquire(&self, id: &str, owner: &str, run: &mut ExperimentRun) -> DaqResult<SessionGuard> {
        let entry = self.registry.get(id)?;
        let guard = entry.session.acquire(owner, self.settings.acquire_wait).await?;
        run.add_instrument(guard.handle().clone());
        Ok(guard)
    }

    /// Write the setpoint and wait for the temperature. The controller is released on return.
    async fn gate(
        &self,
        gate: &TemperatureGate,
        owner: &str,
        run: &mut ExperimentRun,
    ) -> DaqResult<StabilizationOutcome> {
        let guard = self.acquire(&gate.controller, owner, run).await?;
        let model = LakeShoreModel::for_kind(guard.handle().kind)?;
        let mut controller = TemperatureController::new(guard, model, self.validator.clone());
        controller
            .set_setpoint(gate.target.control_loop, gate.target.temperature)
            .await?;
        TemperatureStabilizer::new(self.settings.stabilizer_poll)
            .wait(&mut controller, &gate.target, run.cancellation())
            .await
    }

    async fn source_meter(
        &self,
        id: &str,
        owner: &str,
        run: &mut ExperimentRun,
    ) -> DaqResult<SourceMeter<SessionGuard>> {
        let channel = self.registry.get(id)?.channel.clone();
        let guard = self.acquire(id, owner, run).await?;
        let dialect = SmuDialect::for_kind(guard.handle().kind, channel.as_deref())?;
        Ok(SourceMeter::new(guard, dialect, self.validator.clone())
            .with_reset_settle(self.settings.reset_settle))
    }

    /// Configure the unit; if that fails, make sure the output is off before returning.
    async fn configured_source_meter(
        &self,
        id: &str,
        source: &SourceSpec,
        owner: &str,
        run: &mut ExperimentRun,
    ) -> DaqResult<SourceMeter<SessionGuard>> {
        let mut smu = self.source_meter(id, owner, run).await?;
        if let Err(err) = smu.configure(source).await {
            if let Err(off_err) = smu.disable_output().await {
                warn!(error = %off_err, "could not switch output off after failed configuration");
            }
            return Err(err);
        }
        Ok(smu)
    }

    async fn lock_in(
        &self,
        id: &str,
        settings: &LockInSettings,
        owner: &str,
        run: &mut ExperimentRun,
    ) -> DaqResult<LockInAmplifier<SessionGuard>> {
        let guard = self.acquire(id, owner, run).await?;
        let mut lockin = LockInAmplifier::new(guard, self.validator.clone());
        lockin.configure(settings).await?;
        Ok(lockin)
    }

    async fn measure(
        &self,
        experiment: &Experiment,
        owner: &str,
        run: &mut ExperimentRun,
    ) -> DaqResult<PhaseOutcome> {
        match experiment {
            Experiment::IvSweep { smu, plan, source } => {
                run.set_plan(*plan);
                let smu = self.configured_source_meter(smu, source, owner, run).await?;
                let mut target = DcTarget::new(smu, plan.measure_type);
                SweepController::new(source.source_delay)
                    .run(plan.points(), &mut target, plan.measure_type.into(), run)
                    .await
            }
            Experiment::PulsedIvSweep {
                smu,
                plan,
                source,
                pulse,
            } => {
                run.set_plan(*plan);
                let smu = self.configured_source_meter(smu, source, owner, run).await?;
                let mut target = PulsedTarget::new(smu, plan.measure_type, *pulse);
                SweepController::new(Duration::ZERO)
                    .run(plan.points(), &mut target, plan.measure_type.into(), run)
                    .await
            }
            Experiment::AcIvSweep {
                smu,
                lockin,
                plan,
                source,
                settings,
                output,
            } => {
                run.set_plan(*plan);
                let lockin = self.lock_in(lockin, settings, owner, run).await?;
                let smu = self.configured_source_meter(smu, source, owner, run).await?;
                let mut target = AcTarget::new(smu, lockin, *output);
                SweepController::new(ac_settle(source.source_delay, self.settings.lockin_settle))
                    .run(plan.points(), &mut target, (*output).into(), run)
                    .await
            }
            Experiment::LockInOnlyAcIv {
                lockin,
                plan,
                settings,
                output,
            } => {
                run.set_plan(*plan);
                let lockin = self.lock_in(lockin, settings, owner, run).await?;
                let mut target = LockInBiasTarget::new(lockin, *output);
                SweepController::new(self.settings.lockin_settle)
                    .run(plan.points(), &mut target, (*output).into(), run)
                    .await
            }
            Experiment::FrequencySweep {
                lockin,
                start_hz,
                stop_hz,
                step_hz,
                settings,
                output,
            } => {
                let points = fixed_step_points(*start_hz, *stop_hz, *step_hz)?;
                let lockin = self.lock_in(lockin, settings, owner, run).await?;
                let mut target = FrequencyTarget::new(lockin, *output, settings.frequency_hz);
                SweepController::new(self.settings.lockin_settle)
                    .run(points, &mut target, (*output).into(), run)
                    .await
            }
            Experiment::HarmonicDetection {
                lockin,
                base_hz,
                max_harmonic,
                settings,
                output,
            } => {
                let points: Vec<SweepPoint> = (1..=*max_harmonic)
                    .enumerate()
                    .map(|(index, n)| SweepPoint {
                        cycle: 0,
                        index,
                        setpoint: f64::from(n),
                    })
                    .collect();
                let lockin = self.lock_in(lockin, settings, owner, run).await?;
                let mut target = HarmonicTarget::new(lockin, *output, *base_hz);
                SweepController::new(self.settings.lockin_settle)
                    .run(points, &mut target, (*output).into(), run)
                    .await
            }
            Experiment::ImpedanceVsTime {
                lockin,
                interval,
                duration,
                settings,
            } => {
                let logger = TimedLogger::new(*interval, *duration, TimeAxis::Seconds)?;
                let lockin = self.lock_in(lockin, settings, owner, run).await?;
                let mut probe = ImpedanceProbe::new(lockin, settings.amplitude_v);
                logger.run(&mut probe, Quantity::Impedance, run).await
            }
            Experiment::AcSignalLogging {
                lockin,
                interval,
                duration,
                settings,
                output,
            } => {
                let logger = TimedLogger::new(*interval, *duration, TimeAxis::Seconds)?;
                let lockin = self.lock_in(lockin, settings, owner, run).await?;
                let mut probe = LockInProbe::new(lockin, *output);
                logger.run(&mut probe, (*output).into(), run).await
            }
            Experiment::TimeLogging {
                smu,
                source,
                measure,
                interval,
                duration,
            } => {
                let logger = TimedLogger::new(*interval, *duration, TimeAxis::Milliseconds)?;
                let mut smu = self.configured_source_meter(smu, source, owner, run).await?;
                let logged = match smu.enable_output().await {
                    Ok(()) => {
                        let mut probe = SmuProbe::new(smu, *measure);
                        let result = logger.run(&mut probe, (*measure).into(), run).await;
                        smu = probe.into_inner();
                        result
                    }
                    Err(err) => Err(err),
                };
                let released = smu.disable_output().await;
                match (logged, released) {
                    (Ok(outcome), Ok(())) => Ok(outcome),
                    (Err(err), Err(off_err)) => {
                        error!(error = %off_err, "failed to switch output off after error");
                        Err(err)
                    }
                    (Err(err), Ok(())) | (Ok(_), Err(err)) => Err(err),
                }
            }
        }
    }
}
