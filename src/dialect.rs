//! Command dialects.
//!
//! Every instrument type speaks through the same `write_command` / `query` interface; the
//! differences are pure string formatting, selected by the [`InstrumentKind`] tag and never
//! by probing the instrument at runtime.
//!
//! - [`SmuDialect::Scpi`]: Keithley 2450 (`SOUR:VOLT 0.5`, `MEAS:CURR?`)
//! - [`SmuDialect::Tsp`]: Keithley 2636B attribute assignment (`smua.source.levelv = 0.5`,
//!   `print(smua.measure.i())`)
//! - [`LakeShoreModel`]: LakeShore 335 / 325 temperature controllers
//! - [`Sr830`]: Stanford Research SR830 lock-in amplifier

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DaqError, DaqResult};
use crate::measurement::{MeasureType, SenseMode, SourceSpec, SourceType};
use crate::session::Capability;

/// Supported instrument types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    /// Keithley 2450 SourceMeter (SCPI).
    #[serde(rename = "keithley_2450")]
    Keithley2450,
    /// Keithley 2636B dual-channel SourceMeter (TSP).
    #[serde(rename = "keithley_2636b")]
    Keithley2636B,
    /// LakeShore 335 temperature controller (Kelvin interface).
    #[serde(rename = "lakeshore_335")]
    LakeShore335,
    /// LakeShore 325 temperature controller.
    #[serde(rename = "lakeshore_325")]
    LakeShore325,
    /// Stanford Research SR830 lock-in amplifier.
    #[serde(rename = "sr830")]
    Sr830,
}

/// Broad role of an instrument type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentFamily {
    /// Source-measure unit.
    SourceMeter,
    /// Temperature controller.
    TemperatureController,
    /// Lock-in amplifier.
    LockIn,
}

impl InstrumentKind {
    /// Every supported type.
    pub const ALL: [InstrumentKind; 5] = [
        InstrumentKind::Keithley2450,
        InstrumentKind::Keithley2636B,
        InstrumentKind::LakeShore335,
        InstrumentKind::LakeShore325,
        InstrumentKind::Sr830,
    ];

    /// Role of this type.
    pub fn family(self) -> InstrumentFamily {
        match self {
            InstrumentKind::Keithley2450 | InstrumentKind::Keithley2636B => {
                InstrumentFamily::SourceMeter
            }
            InstrumentKind::LakeShore335 | InstrumentKind::LakeShore325 => {
                InstrumentFamily::TemperatureController
            }
            InstrumentKind::Sr830 => InstrumentFamily::LockIn,
        }
    }

    /// Capability set of this type.
    pub fn capabilities(self) -> &'static [Capability] {
        match self.family() {
            InstrumentFamily::SourceMeter => {
                &[Capability::Source, Capability::Measure, Capability::Sense]
            }
            InstrumentFamily::TemperatureController => &[Capability::Source, Capability::Sense],
            InstrumentFamily::LockIn => &[Capability::Source, Capability::Measure],
        }
    }

    /// Configuration name of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            InstrumentKind::Keithley2450 => "keithley_2450",
            InstrumentKind::Keithley2636B => "keithley_2636b",
            InstrumentKind::LakeShore335 => "lakeshore_335",
            InstrumentKind::LakeShore325 => "lakeshore_325",
            InstrumentKind::Sr830 => "sr830",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentKind {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        InstrumentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                DaqError::Configuration(format!("unknown instrument type '{}'", s.trim()))
            })
    }
}

/// Source-measure unit command dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmuDialect {
    /// SCPI (Keithley 2450).
    Scpi,
    /// TSP attribute assignment on one channel (Keithley 2636B).
    Tsp {
        /// `smua` or `smub`.
        channel: String,
    },
}

impl SmuDialect {
    /// Select the dialect for `kind`; `channel` picks the 2636B channel (`a` or `b`).
    pub fn for_kind(kind: InstrumentKind, channel: Option<&str>) -> DaqResult<Self> {
        match kind {
            InstrumentKind::Keithley2450 => Ok(SmuDialect::Scpi),
            InstrumentKind::Keithley2636B => {
                let channel = match channel.map(|c| c.trim().to_ascii_lowercase()).as_deref() {
                    None | Some("a") | Some("smua") => "smua",
                    Some("b") | Some("smub") => "smub",
                    Some(other) => {
                        return Err(DaqError::Configuration(format!(
                            "2636B channel must be 'a' or 'b', got '{other}'"
                        )))
                    }
                };
                Ok(SmuDialect::Tsp {
                    channel: channel.to_string(),
                })
            }
            other => Err(DaqError::Configuration(format!(
                "{other} is not a source-measure unit"
            ))),
        }
    }

    /// Whether the dialect supports hardware-timed pulses.
    pub fn supports_pulse(&self) -> bool {
        matches!(self, SmuDialect::Tsp { .. })
    }

    /// Return the instrument to its power-on state.
    pub fn reset(&self) -> String {
        "*RST".to_string()
    }

    /// Select the source function.
    pub fn source_function(&self, source: SourceType) -> String {
        match (self, source) {
            (SmuDialect::Scpi, SourceType::Voltage) => "SOUR:FUNC VOLT".to_string(),
            (SmuDialect::Scpi, SourceType::Current) => "SOUR:FUNC CURR".to_string(),
            (SmuDialect::Tsp { channel }, SourceType::Voltage) => {
                format!("{channel}.source.func = {channel}.OUTPUT_DCVOLTS")
            }
            (SmuDialect::Tsp { channel }, SourceType::Current) => {
                format!("{channel}.source.func = {channel}.OUTPUT_DCAMPS")
            }
        }
    }

    /// Set the source level.
    pub fn source_level(&self, source: SourceType, value: f64) -> String {
        match (self, source) {
            (SmuDialect::Scpi, SourceType::Voltage) => format!("SOUR:VOLT {value}"),
            (SmuDialect::Scpi, SourceType::Current) => format!("SOUR:CURR {value}"),
            (SmuDialect::Tsp { channel }, SourceType::Voltage) => {
                format!("{channel}.source.levelv = {value}")
            }
            (SmuDialect::Tsp { channel }, SourceType::Current) => {
                format!("{channel}.source.leveli = {value}")
            }
        }
    }

    /// Set the compliance limit on the quantity not being sourced.
    pub fn compliance(&self, source: SourceType, limit: f64) -> String {
        match (self, source) {
            (SmuDialect::Scpi, SourceType::Voltage) => format!("SENS:CURR:PROT {limit}"),
            (SmuDialect::Scpi, SourceType::Current) => format!("SENS:VOLT:PROT {limit}"),
            (SmuDialect::Tsp { channel }, SourceType::Voltage) => {
                format!("{channel}.source.limiti = {limit}")
            }
            (SmuDialect::Tsp { channel }, SourceType::Current) => {
                format!("{channel}.source.limitv = {limit}")
            }
        }
    }

    /// Select the measured function (and autorange it).
    pub fn measure_function(&self, source: SourceType) -> String {
        match (self, source) {
            (SmuDialect::Scpi, SourceType::Voltage) => "SENS:FUNC \"CURR\"".to_string(),
            (SmuDialect::Scpi, SourceType::Current) => "SENS:FUNC \"VOLT\"".to_string(),
            (SmuDialect::Tsp { channel }, SourceType::Voltage) => {
                format!("{channel}.measure.autorangei = {channel}.AUTORANGE_ON")
            }
            (SmuDialect::Tsp { channel }, SourceType::Current) => {
                format!("{channel}.measure.autorangev = {channel}.AUTORANGE_ON")
            }
        }
    }

    /// Set the integration time in power-line cycles.
    pub fn nplc(&self, source: SourceType, nplc: f64) -> String {
        match (self, source) {
            (SmuDialect::Scpi, SourceType::Voltage) => format!("SENS:CURR:NPLC {nplc}"),
            (SmuDialect::Scpi, SourceType::Current) => format!("SENS:VOLT:NPLC {nplc}"),
            (SmuDialect::Tsp { channel }, _) => format!("{channel}.measure.nplc = {nplc}"),
        }
    }

    /// Select two- or four-wire sensing.
    pub fn sense_mode(&self, sense: SenseMode) -> String {
        match (self, sense) {
            (SmuDialect::Scpi, SenseMode::Local) => "SYST:RSEN OFF".to_string(),
            (SmuDialect::Scpi, SenseMode::Remote) => "SYST:RSEN ON".to_string(),
            (SmuDialect::Tsp { channel }, SenseMode::Local) => {
                format!("{channel}.sense = {channel}.SENSE_LOCAL")
            }
            (SmuDialect::Tsp { channel }, SenseMode::Remote) => {
                format!("{channel}.sense = {channel}.SENSE_REMOTE")
            }
        }
    }

    /// Instrument-side source delay; SCPI instruments wait on the host instead.
    pub fn source_delay(&self, delay: Duration) -> Option<String> {
        match self {
            SmuDialect::Scpi => None,
            SmuDialect::Tsp { channel } => Some(format!(
                "{channel}.source.delay = {}",
                delay.as_secs_f64()
            )),
        }
    }

    /// Configuration commands for `spec`, excluding output enable.
    ///
    /// The compliance limit always precedes any command that could energise the output.
    pub fn configure(&self, spec: &SourceSpec) -> Vec<String> {
        let mut commands = vec![
            self.source_function(spec.source_type),
            self.compliance(spec.source_type, spec.compliance_limit),
            self.source_level(spec.source_type, spec.value),
            self.measure_function(spec.source_type),
            self.nplc(spec.source_type, spec.nplc),
            self.sense_mode(spec.sense),
        ];
        commands.extend(self.source_delay(spec.source_delay));
        commands
    }

    /// Switch the output on or off.
    pub fn output(&self, on: bool) -> String {
        match (self, on) {
            (SmuDialect::Scpi, true) => ":OUTP ON".to_string(),
            (SmuDialect::Scpi, false) => ":OUTP OFF".to_string(),
            (SmuDialect::Tsp { channel }, true) => {
                format!("{channel}.source.output = {channel}.OUTPUT_ON")
            }
            (SmuDialect::Tsp { channel }, false) => {
                format!("{channel}.source.output = {channel}.OUTPUT_OFF")
            }
        }
    }

    /// Query returning one measured value.
    pub fn measure_query(&self, measure: MeasureType) -> String {
        match (self, measure) {
            (SmuDialect::Scpi, MeasureType::Current) => "MEAS:CURR?".to_string(),
            (SmuDialect::Scpi, MeasureType::Voltage) => "MEAS:VOLT?".to_string(),
            (SmuDialect::Scpi, MeasureType::Resistance) => "MEAS:RES?".to_string(),
            (SmuDialect::Tsp { channel }, MeasureType::Current) => {
                format!("print({channel}.measure.i())")
            }
            (SmuDialect::Tsp { channel }, MeasureType::Voltage) => {
                format!("print({channel}.measure.v())")
            }
            (SmuDialect::Tsp { channel }, MeasureType::Resistance) => {
                format!("print({channel}.measure.r())")
            }
        }
    }

    /// Set the pulse width.
    pub fn pulse_width(&self, width: Duration) -> DaqResult<String> {
        match self {
            SmuDialect::Tsp { channel } => Ok(format!(
                "{channel}.source.pulsewidth = {}",
                width.as_secs_f64()
            )),
            SmuDialect::Scpi => Err(self.pulse_unsupported()),
        }
    }

    /// Fire one pulse at the programmed level.
    pub fn pulse_trigger(&self) -> DaqResult<String> {
        match self {
            SmuDialect::Tsp { channel } => Ok(format!("{channel}.source.initiate()")),
            SmuDialect::Scpi => Err(self.pulse_unsupported()),
        }
    }

    fn pulse_unsupported(&self) -> DaqError {
        DaqError::Configuration("pulsed sweeps require a TSP source-measure unit".to_string())
    }
}

/// LakeShore temperature controller model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LakeShoreModel {
    /// Model 335: Kelvin interface, converted to and from °C.
    M335,
    /// Model 325: values passed through unchanged.
    M325,
}

const KELVIN_OFFSET: f64 = 273.15;

impl LakeShoreModel {
    /// Select the model for `kind`.
    pub fn for_kind(kind: InstrumentKind) -> DaqResult<Self> {
        match kind {
            InstrumentKind::LakeShore335 => Ok(LakeShoreModel::M335),
            InstrumentKind::LakeShore325 => Ok(LakeShoreModel::M325),
            other => Err(DaqError::Configuration(format!(
                "{other} is not a temperature controller"
            ))),
        }
    }

    /// Highest heater range code.
    pub fn max_heater_range(self) -> u8 {
        match self {
            LakeShoreModel::M335 => 3,
            LakeShoreModel::M325 => 2,
        }
    }

    /// Check a sensor input name (`A` or `B`).
    pub fn validate_input(self, input: &str) -> DaqResult<()> {
        match input {
            "A" | "B" => Ok(()),
            other => Err(DaqError::Configuration(format!(
                "sensor input must be 'A' or 'B', got '{other}'"
            ))),
        }
    }

    /// Check a control loop number.
    pub fn validate_loop(self, control_loop: u8) -> DaqResult<()> {
        if (1..=2).contains(&control_loop) {
            Ok(())
        } else {
            Err(DaqError::Configuration(format!(
                "control loop must be 1 or 2, got {control_loop}"
            )))
        }
    }

    /// Convert a raw instrument reading to °C.
    pub fn to_celsius(self, raw: f64) -> f64 {
        match self {
            LakeShoreModel::M335 => raw - KELVIN_OFFSET,
            LakeShoreModel::M325 => raw,
        }
    }

    /// Convert °C to the instrument's setpoint unit.
    pub fn from_celsius(self, celsius: f64) -> f64 {
        match self {
            LakeShoreModel::M335 => celsius + KELVIN_OFFSET,
            LakeShoreModel::M325 => celsius,
        }
    }

    /// Write a setpoint given in °C.
    pub fn setpoint(self, control_loop: u8, celsius: f64) -> String {
        match self {
            LakeShoreModel::M335 => {
                format!("SETP {control_loop},{:.3}", self.from_celsius(celsius))
            }
            LakeShoreModel::M325 => format!("SETP {control_loop},{celsius}"),
        }
    }

    /// Read back the setpoint.
    pub fn setpoint_query(self, control_loop: u8) -> String {
        format!("SETP? {control_loop}")
    }

    /// Read a sensor input.
    pub fn temperature_query(self, input: &str) -> String {
        format!("KRDG? {input}")
    }

    /// Select the heater range (0 = off).
    pub fn heater_range(self, control_loop: u8, code: u8) -> DaqResult<String> {
        if code > self.max_heater_range() {
            return Err(DaqError::Configuration(format!(
                "heater range {code} out of range 0..={}",
                self.max_heater_range()
            )));
        }
        Ok(format!("RANGE {control_loop},{code}"))
    }

    /// Read the heater range.
    pub fn heater_range_query(self, control_loop: u8) -> String {
        format!("RANGE? {control_loop}")
    }

    /// Set PID gains.
    pub fn pid(self, control_loop: u8, p: f64, i: f64, d: f64) -> String {
        format!("PID {control_loop},{p},{i},{d}")
    }

    /// Set manual heater output in percent.
    pub fn manual_output(self, control_loop: u8, percent: f64) -> DaqResult<String> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(DaqError::Configuration(format!(
                "manual output must be between 0 and 100 %, got {percent}"
            )));
        }
        Ok(format!("MOUT {control_loop},{percent}"))
    }

    /// Select closed-loop PID or open-loop control.
    pub fn control_mode(self, control_loop: u8, closed_loop: bool) -> String {
        match self {
            LakeShoreModel::M335 => {
                let mode = if closed_loop { 1 } else { 3 };
                format!("OUTMODE {control_loop},{mode},{control_loop},0")
            }
            LakeShoreModel::M325 => {
                let mode = if closed_loop { 1 } else { 3 };
                format!("CMODE {control_loop},{mode}")
            }
        }
    }
}

/// SR830 lock-in amplifier commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sr830;

impl Sr830 {
    /// Highest time-constant index (30 ks).
    pub const MAX_TIME_CONSTANT: u8 = 19;
    /// Highest sensitivity index (1 V).
    pub const MAX_SENSITIVITY: u8 = 26;

    /// Set the internal reference frequency in Hz.
    pub fn frequency(self, hz: f64) -> DaqResult<String> {
        if !(0.001..=102_000.0).contains(&hz) {
            return Err(DaqError::Configuration(format!(
                "reference frequency must be between 1 mHz and 102 kHz, got {hz}"
            )));
        }
        Ok(format!("FREQ {hz}"))
    }

    /// Set the sine output amplitude in volts rms.
    pub fn amplitude(self, volts: f64) -> DaqResult<String> {
        if !(0.004..=5.0).contains(&volts) {
            return Err(DaqError::Configuration(format!(
                "sine amplitude must be between 0.004 and 5 V, got {volts}"
            )));
        }
        Ok(format!("SLVL {volts}"))
    }

    /// Select the time constant by index.
    pub fn time_constant(self, index: u8) -> DaqResult<String> {
        if index > Self::MAX_TIME_CONSTANT {
            return Err(DaqError::Configuration(format!(
                "time constant index {index} out of range 0..={}",
                Self::MAX_TIME_CONSTANT
            )));
        }
        Ok(format!("OFLT {index}"))
    }

    /// Select the sensitivity by index.
    pub fn sensitivity(self, index: u8) -> DaqResult<String> {
        if index > Self::MAX_SENSITIVITY {
            return Err(DaqError::Configuration(format!(
                "sensitivity index {index} out of range 0..={}",
                Self::MAX_SENSITIVITY
            )));
        }
        Ok(format!("SENS {index}"))
    }

    /// Read X and Y together.
    pub fn read_xy(self) -> &'static str {
        "OUTP? 1,2"
    }

    /// Read the magnitude R.
    pub fn read_r(self) -> &'static str {
        "OUTP? 3"
    }

    /// Read the phase θ.
    pub fn read_theta(self) -> &'static str {
        "OUTP? 4"
    }

    /// Set an auxiliary DC output (1..=4) in volts.
    pub fn aux_output(self, channel: u8, volts: f64) -> DaqResult<String> {
        if !(1..=4).contains(&channel) {
            return Err(DaqError::Configuration(format!(
                "aux output channel must be 1..=4, got {channel}"
            )));
        }
        if !(-10.5..=10.5).contains(&volts) {
            return Err(DaqError::Configuration(format!(
                "aux output must be between -10.5 and 10.5 V, got {volts}"
            )));
        }
        Ok(format!("AUXV {channel},{volts}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tsp() -> SmuDialect {
        SmuDialect::for_kind(InstrumentKind::Keithley2636B, None).unwrap()
    }

    #[test]
    fn test_kind_round_trips_through_name() {
        for kind in InstrumentKind::ALL {
            assert_eq!(kind.as_str().parse::<InstrumentKind>().unwrap(), kind);
        }
        assert!("keithley_6221".parse::<InstrumentKind>().is_err());
    }

    #[test]
    fn test_scpi_commands() {
        let d = SmuDialect::Scpi;
        assert_eq!(d.source_level(SourceType::Voltage, 0.5), "SOUR:VOLT 0.5");
        assert_eq!(d.compliance(SourceType::Voltage, 0.001), "SENS:CURR:PROT 0.001");
        assert_eq!(d.measure_query(MeasureType::Current), "MEAS:CURR?");
        assert_eq!(d.output(true), ":OUTP ON");
        assert!(d.pulse_trigger().is_err());
    }

    #[test]
    fn test_tsp_commands() {
        let d = tsp();
        assert_eq!(d.source_level(SourceType::Voltage, -1.5), "smua.source.levelv = -1.5");
        assert_eq!(d.compliance(SourceType::Current, 10.0), "smua.source.limitv = 10");
        assert_eq!(d.measure_query(MeasureType::Current), "print(smua.measure.i())");
        assert_eq!(d.output(false), "smua.source.output = smua.OUTPUT_OFF");
        assert_eq!(d.pulse_trigger().unwrap(), "smua.source.initiate()");
        assert_eq!(
            d.pulse_width(Duration::from_millis(5)).unwrap(),
            "smua.source.pulsewidth = 0.005"
        );
    }

    #[test]
    fn test_tsp_channel_selection() {
        let d = SmuDialect::for_kind(InstrumentKind::Keithley2636B, Some("b")).unwrap();
        assert_eq!(d.output(true), "smub.source.output = smub.OUTPUT_ON");
        assert!(SmuDialect::for_kind(InstrumentKind::Keithley2636B, Some("c")).is_err());
        assert!(SmuDialect::for_kind(InstrumentKind::Sr830, None).is_err());
    }

    #[test]
    fn test_configure_writes_compliance_before_level() {
        for dialect in [SmuDialect::Scpi, tsp()] {
            let spec = SourceSpec::voltage(0.2, 1e-3);
            let commands = dialect.configure(&spec);
            let compliance = dialect.compliance(spec.source_type, spec.compliance_limit);
            let level = dialect.source_level(spec.source_type, spec.value);
            let c = commands.iter().position(|c| *c == compliance).unwrap();
            let l = commands.iter().position(|c| *c == level).unwrap();
            assert!(c < l);
            assert!(!commands.contains(&dialect.output(true)));
        }
    }

    #[test]
    fn test_lakeshore_335_converts_celsius() {
        let m = LakeShoreModel::M335;
        assert_eq!(m.setpoint(1, 25.0), "SETP 1,298.150");
        assert!((m.to_celsius(298.15) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_lakeshore_325_passes_through() {
        let m = LakeShoreModel::M325;
        assert_eq!(m.setpoint(1, 25.0), "SETP 1,25");
        assert_eq!(m.to_celsius(25.0), 25.0);
        assert_eq!(m.temperature_query("A"), "KRDG? A");
        assert!(m.heater_range(1, 3).is_err());
        assert_eq!(m.heater_range(1, 2).unwrap(), "RANGE 1,2");
    }

    #[test]
    fn test_sr830_index_validation() {
        let l = Sr830;
        assert_eq!(l.time_constant(19).unwrap(), "OFLT 19");
        assert!(l.time_constant(20).is_err());
        assert_eq!(l.sensitivity(26).unwrap(), "SENS 26");
        assert!(l.sensitivity(27).is_err());
        assert!(l.frequency(0.0).is_err());
        assert_eq!(l.aux_output(1, 0.25).unwrap(), "AUXV 1,0.25");
        assert!(l.aux_output(5, 0.0).is_err());
    }
}
