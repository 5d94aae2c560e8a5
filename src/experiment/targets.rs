//! Instrument adapters for the sweep and logging engines.
//!
//! Sweep targets turn a setpoint into instrument writes and a reading; probes take one
//! reading for the timed logger. Each target's `release` puts its instrument back in a
//! safe state and is called by the sweep controller on every exit path.

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use super::{PulseSettings, BIAS_AUX_CHANNEL};
use crate::error::DaqResult;
use crate::instrument::{LockInAmplifier, SourceMeter};
use crate::measurement::{LockInOutput, MeasureType, Reading};
use crate::session::CommandChannel;
use crate::sweep::SweepTarget;
use crate::timed_logger::Probe;

/// Currents below this magnitude read as an open circuit.
pub const OPEN_CIRCUIT_CURRENT: f64 = 1e-12;

/// Turn a per-point parse failure into an absent reading.
fn recover_point(result: DaqResult<Reading>) -> DaqResult<Reading> {
    match result {
        Err(err) if err.is_point_recoverable() => {
            warn!(error = %err, "measurement failed, recording absent value");
            Ok(Reading::absent())
        }
        other => other,
    }
}

fn pair((value, secondary): (f64, f64)) -> Reading {
    Reading::pair(value, secondary)
}

/// DC sweep: set the level, switch the output on, measure.
pub struct DcTarget<C> {
    smu: SourceMeter<C>,
    measure: MeasureType,
}

impl<C: CommandChannel> DcTarget<C> {
    /// `smu` must already be configured.
    pub fn new(smu: SourceMeter<C>, measure: MeasureType) -> Self {
        Self { smu, measure }
    }
}

#[async_trait]
impl<C: CommandChannel> SweepTarget for DcTarget<C> {
    async fn apply(&mut self, setpoint: f64) -> DaqResult<()> {
        self.smu.set_level(setpoint).await?;
        self.smu.enable_output().await
    }

    async fn measure(&mut self) -> DaqResult<Reading> {
        Ok(Reading::single(self.smu.measure(self.measure).await?))
    }

    async fn release(&mut self) -> DaqResult<()> {
        self.smu.disable_output().await
    }
}

/// Pulsed sweep: set the level, fire one pulse and wait it out, then measure.
pub struct PulsedTarget<C> {
    smu: SourceMeter<C>,
    measure: MeasureType,
    pulse: PulseSettings,
}

impl<C: CommandChannel> PulsedTarget<C> {
    /// `smu` must already be configured for pulsing.
    pub fn new(smu: SourceMeter<C>, measure: MeasureType, pulse: PulseSettings) -> Self {
        Self {
            smu,
            measure,
            pulse,
        }
    }
}

#[async_trait]
impl<C: CommandChannel> SweepTarget for PulsedTarget<C> {
    async fn apply(&mut self, setpoint: f64) -> DaqResult<()> {
        self.smu.set_level(setpoint).await?;
        self.smu.enable_output().await?;
        self.smu
            .fire_pulse(self.pulse.width, self.pulse.delay)
            .await
    }

    async fn measure(&mut self) -> DaqResult<Reading> {
        Ok(Reading::single(self.smu.measure(self.measure).await?))
    }

    async fn release(&mut self) -> DaqResult<()> {
        self.smu.disable_output().await
    }
}

/// AC I-V: DC bias from the source-measure unit, both lock-in channels read per step.
pub struct AcTarget<S, L> {
    smu: SourceMeter<S>,
    lockin: LockInAmplifier<L>,
    output: LockInOutput,
}

impl<S: CommandChannel, L: CommandChannel> AcTarget<S, L> {
    /// Pair a configured source-measure unit with a configured lock-in.
    pub fn new(smu: SourceMeter<S>, lockin: LockInAmplifier<L>, output: LockInOutput) -> Self {
        Self {
            smu,
            lockin,
            output,
        }
    }
}

#[async_trait]
impl<S: CommandChannel, L: CommandChannel> SweepTarget for AcTarget<S, L> {
    async fn apply(&mut self, setpoint: f64) -> DaqResult<()> {
        self.smu.set_level(setpoint).await?;
        self.smu.enable_output().await
    }

    async fn measure(&mut self) -> DaqResult<Reading> {
        self.lockin.read(self.output).await.map(pair)
    }

    async fn release(&mut self) -> DaqResult<()> {
        self.smu.disable_output().await
    }
}

/// Lock-in-only AC I-V: the AUX output is the bias.
pub struct LockInBiasTarget<C> {
    lockin: LockInAmplifier<C>,
    output: LockInOutput,
}

impl<C: CommandChannel> LockInBiasTarget<C> {
    /// Bias through AUX output 1.
    pub fn new(lockin: LockInAmplifier<C>, output: LockInOutput) -> Self {
        Self { lockin, output }
    }
}

#[async_trait]
impl<C: CommandChannel> SweepTarget for LockInBiasTarget<C> {
    async fn apply(&mut self, setpoint: f64) -> DaqResult<()> {
        self.lockin.set_aux_output(BIAS_AUX_CHANNEL, setpoint).await
    }

    async fn measure(&mut self) -> DaqResult<Reading> {
        self.lockin.read(self.output).await.map(pair)
    }

    async fn release(&mut self) -> DaqResult<()> {
        self.lockin.set_aux_output(BIAS_AUX_CHANNEL, 0.0).await
    }
}

/// Frequency sweep: setpoints are reference frequencies in Hz.
pub struct FrequencyTarget<C> {
    lockin: LockInAmplifier<C>,
    output: LockInOutput,
    /// Reference restored on release.
    home_hz: f64,
}

impl<C: CommandChannel> FrequencyTarget<C> {
    /// `home_hz` is the reference frequency restored on release.
    pub fn new(lockin: LockInAmplifier<C>, output: LockInOutput, home_hz: f64) -> Self {
        Self {
            lockin,
            output,
            home_hz,
        }
    }
}

#[async_trait]
impl<C: CommandChannel> SweepTarget for FrequencyTarget<C> {
    async fn apply(&mut self, setpoint: f64) -> DaqResult<()> {
        self.lockin.set_frequency(setpoint).await
    }

    async fn measure(&mut self) -> DaqResult<Reading> {
        self.lockin.read(self.output).await.map(pair)
    }

    async fn release(&mut self) -> DaqResult<()> {
        self.lockin.set_frequency(self.home_hz).await
    }
}

/// Harmonic detection: setpoint `n` puts the reference at `base_hz * n`.
pub struct HarmonicTarget<C> {
    lockin: LockInAmplifier<C>,
    output: LockInOutput,
    base_hz: f64,
}

impl<C: CommandChannel> HarmonicTarget<C> {
    /// Harmonics of `base_hz`.
    pub fn new(lockin: LockInAmplifier<C>, output: LockInOutput, base_hz: f64) -> Self {
        Self {
            lockin,
            output,
            base_hz,
        }
    }
}

#[async_trait]
impl<C: CommandChannel> SweepTarget for HarmonicTarget<C> {
    async fn apply(&mut self, harmonic: f64) -> DaqResult<()> {
        self.lockin.set_frequency(self.base_hz * harmonic).await
    }

    async fn measure(&mut self) -> DaqResult<Reading> {
        self.lockin.read(self.output).await.map(pair)
    }

    async fn release(&mut self) -> DaqResult<()> {
        self.lockin.set_frequency(self.base_hz).await
    }
}

/// Reads one source-measure unit quantity per sample.
pub struct SmuProbe<C> {
    smu: SourceMeter<C>,
    measure: MeasureType,
}

impl<C: CommandChannel> SmuProbe<C> {
    /// Read `measure` from a configured unit.
    pub fn new(smu: SourceMeter<C>, measure: MeasureType) -> Self {
        Self { smu, measure }
    }

    /// Hand the driver back, e.g. to switch the output off.
    /// Hand the unit back, e.g. to switch its output off.
    pub fn into_inner(self) -> SourceMeter<C> {
        self.smu
    }
}

#[async_trait]
impl<C: CommandChannel> Probe for SmuProbe<C> {
    async fn sample(&mut self) -> DaqResult<Reading> {
        let result = self.smu.measure(self.measure).await.map(Reading::single);
        recover_point(result)
    }
}

/// Reads both lock-in channels per sample.
pub struct LockInProbe<C> {
    lockin: LockInAmplifier<C>,
    output: LockInOutput,
}

impl<C: CommandChannel> LockInProbe<C> {
    /// Read the `output` pair.
    pub fn new(lockin: LockInAmplifier<C>, output: LockInOutput) -> Self {
        Self { lockin, output }
    }
}

#[async_trait]
impl<C: CommandChannel> Probe for LockInProbe<C> {
    async fn sample(&mut self) -> DaqResult<Reading> {
        recover_point(self.lockin.read(self.output).await.map(pair))
    }
}

/// Impedance from the excitation amplitude and the in-phase current.
///
/// The primary value is `amplitude / I`, the secondary value is `I`.
pub struct ImpedanceProbe<C> {
    lockin: LockInAmplifier<C>,
    amplitude: f64,
}

impl<C: CommandChannel> ImpedanceProbe<C> {
    /// `amplitude` is the sine output amplitude in volts.
    pub fn new(lockin: LockInAmplifier<C>, amplitude: f64) -> Self {
        Self { lockin, amplitude }
    }
}

/// `amplitude / current`, infinite for an open circuit.
pub fn impedance(amplitude: f64, current: f64) -> f64 {
    if current.abs() < OPEN_CIRCUIT_CURRENT {
        f64::INFINITY
    } else {
        amplitude / current
    }
}

#[async_trait]
impl<C: CommandChannel> Probe for ImpedanceProbe<C> {
    async fn sample(&mut self) -> DaqResult<Reading> {
        let amplitude = self.amplitude;
        let result = self
            .lockin
            .read_xy()
            .await
            .map(|(current, _)| Reading::pair(impedance(amplitude, current), current));
        recover_point(result)
    }
}

/// Settle used between a source step and a lock-in read.
pub fn ac_settle(source_delay: Duration, lockin_settle: Duration) -> Duration {
    source_delay.max(lockin_settle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::dialect::{InstrumentKind, SmuDialect};
    use crate::measurement::SourceSpec;
    use crate::session::{InstrumentHandle, InstrumentSession};
    use crate::validator::{RecoveryPolicy, ResponseValidator};

    fn session(adapter: &MockAdapter, kind: InstrumentKind) -> InstrumentSession {
        InstrumentSession::new(
            InstrumentHandle::new("mock", kind),
            Box::new(adapter.clone()),
            Duration::from_millis(500),
        )
    }

    fn validator() -> ResponseValidator {
        ResponseValidator::new(RecoveryPolicy::default()).unwrap()
    }

    async fn configured_smu(adapter: &MockAdapter) -> SourceMeter<InstrumentSession> {
        let mut smu = SourceMeter::new(
            session(adapter, InstrumentKind::Keithley2450),
            SmuDialect::Scpi,
            validator(),
        )
        .with_reset_settle(Duration::ZERO);
        smu.configure(&SourceSpec::voltage(0.0, 0.01)).await.unwrap();
        adapter.clear_log();
        smu
    }

    #[test]
    fn test_impedance() {
        assert_eq!(impedance(0.1, 1e-4), 1000.0);
        assert_eq!(impedance(0.1, 5e-13), f64::INFINITY);
        assert_eq!(impedance(0.1, -1e-4), -1000.0);
    }

    #[test]
    fn test_ac_settle_takes_longer() {
        let ms = Duration::from_millis;
        assert_eq!(ac_settle(ms(100), ms(300)), ms(300));
        assert_eq!(ac_settle(ms(500), ms(300)), ms(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dc_target_commands() {
        let adapter = MockAdapter::new().on("MEAS:CURR?", "1e-3");
        let mut target = DcTarget::new(configured_smu(&adapter).await, MeasureType::Current);

        target.apply(0.5).await.unwrap();
        assert_eq!(target.measure().await.unwrap(), Reading::single(1e-3));
        target.release().await.unwrap();

        assert_eq!(
            adapter.call_log(),
            vec!["SOUR:VOLT 0.5", ":OUTP ON", "MEAS:CURR?", ":OUTP OFF"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bias_target_zeroes_aux_on_release() {
        let adapter = MockAdapter::new().on("OUTP? 1,2", "1e-4,2e-6");
        let mut target = LockInBiasTarget::new(
            LockInAmplifier::new(session(&adapter, InstrumentKind::Sr830), validator()),
            LockInOutput::XY,
        );
        target.apply(0.25).await.unwrap();
        assert_eq!(target.measure().await.unwrap(), Reading::pair(1e-4, 2e-6));
        target.release().await.unwrap();
        assert_eq!(adapter.writes_matching("AUXV"), vec!["AUXV 1,0.25", "AUXV 1,0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_harmonic_target_scales_reference() {
        let adapter = MockAdapter::new();
        let mut target = HarmonicTarget::new(
            LockInAmplifier::new(session(&adapter, InstrumentKind::Sr830), validator()),
            LockInOutput::XY,
            1000.0,
        );
        target.apply(3.0).await.unwrap();
        target.release().await.unwrap();
        assert_eq!(adapter.writes_matching("FREQ"), vec!["FREQ 3000", "FREQ 1000"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_records_absent_on_garbage() {
        let adapter = MockAdapter::new().on("MEAS:CURR?", "garbage#@!");
        let mut probe = SmuProbe::new(configured_smu(&adapter).await, MeasureType::Current);
        assert_eq!(probe.sample().await.unwrap(), Reading::absent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_impedance_probe() {
        let adapter = MockAdapter::new().on("OUTP? 1,2", "2e-4,0.0");
        let mut probe = ImpedanceProbe::new(
            LockInAmplifier::new(session(&adapter, InstrumentKind::Sr830), validator()),
            0.1,
        );
        let reading = probe.sample().await.unwrap();
        assert_eq!(reading.value, Some(500.0));
        assert_eq!(reading.secondary, Some(2e-4));
    }
}
