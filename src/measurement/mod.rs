//! Measurement vocabulary shared by drivers, engines and exporters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DaqError, DaqResult};

/// Quantity a source-measure unit drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    /// Source voltage, limit current.
    Voltage,
    /// Source current, limit voltage.
    Current,
}

/// Quantity a source-measure unit reads back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasureType {
    /// Current in amperes.
    Current,
    /// Voltage in volts.
    Voltage,
    /// Resistance in ohms.
    Resistance,
}

/// Which pair of lock-in outputs is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockInOutput {
    /// In-phase and quadrature components, read together.
    XY,
    /// Magnitude and phase, read separately.
    RTheta,
}

/// Wiring used for the measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SenseMode {
    /// Two-wire sensing.
    #[default]
    Local,
    /// Four-wire (Kelvin) sensing.
    Remote,
}

/// What the `y` value of a sample holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantity {
    /// SMU current.
    Current,
    /// SMU voltage.
    Voltage,
    /// SMU resistance.
    Resistance,
    /// Lock-in X, with Y as the secondary value.
    LockInXY,
    /// Lock-in R, with θ as the secondary value.
    LockInRTheta,
    /// Amplitude over lock-in current.
    Impedance,
}

impl From<MeasureType> for Quantity {
    fn from(measure: MeasureType) -> Self {
        match measure {
            MeasureType::Current => Quantity::Current,
            MeasureType::Voltage => Quantity::Voltage,
            MeasureType::Resistance => Quantity::Resistance,
        }
    }
}

impl From<LockInOutput> for Quantity {
    fn from(output: LockInOutput) -> Self {
        match output {
            LockInOutput::XY => Quantity::LockInXY,
            LockInOutput::RTheta => Quantity::LockInRTheta,
        }
    }
}

/// Source configuration for a source-measure unit.
///
/// The compliance limit is always written before output is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Driven quantity.
    pub source_type: SourceType,
    /// Initial (or fixed) level.
    pub value: f64,
    /// Current limit when sourcing voltage, voltage limit when sourcing current.
    pub compliance_limit: f64,
    /// Wait between setting a level and measuring.
    pub source_delay: Duration,
    /// Integration time in power-line cycles.
    pub nplc: f64,
    /// Two- or four-wire sensing.
    #[serde(default)]
    pub sense: SenseMode,
}

impl SourceSpec {
    /// Voltage source with a current compliance limit.
    pub fn voltage(value: f64, current_limit: f64) -> Self {
        Self {
            source_type: SourceType::Voltage,
            value,
            compliance_limit: current_limit,
            source_delay: Duration::from_millis(100),
            nplc: 1.0,
            sense: SenseMode::Local,
        }
    }

    /// Current source with a voltage compliance limit.
    pub fn current(value: f64, voltage_limit: f64) -> Self {
        Self {
            source_type: SourceType::Current,
            value,
            compliance_limit: voltage_limit,
            ..Self::voltage(value, voltage_limit)
        }
    }

    /// Set the source delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.source_delay = delay;
        self
    }

    /// Set the integration time.
    pub fn with_nplc(mut self, nplc: f64) -> Self {
        self.nplc = nplc;
        self
    }

    /// Set the sense mode.
    pub fn with_sense(mut self, sense: SenseMode) -> Self {
        self.sense = sense;
        self
    }

    /// Reject limits and integration times no instrument accepts.
    pub fn validate(&self) -> DaqResult<()> {
        if !self.value.is_finite() {
            return Err(DaqError::Configuration(format!(
                "source value must be finite, got {}",
                self.value
            )));
        }
        if !(self.compliance_limit.is_finite() && self.compliance_limit > 0.0) {
            return Err(DaqError::Configuration(format!(
                "compliance limit must be positive, got {}",
                self.compliance_limit
            )));
        }
        if !(0.001..=25.0).contains(&self.nplc) {
            return Err(DaqError::Configuration(format!(
                "NPLC must be between 0.001 and 25, got {}",
                self.nplc
            )));
        }
        Ok(())
    }
}

/// Result of one measurement attempt: a primary value and an optional second channel.
///
/// An absent primary value marks a point whose reply could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Reading {
    /// Primary measured value.
    pub value: Option<f64>,
    /// Second channel (lock-in Y or θ).
    pub secondary: Option<f64>,
}

impl Reading {
    /// A single-valued reading.
    pub fn single(value: f64) -> Self {
        Self {
            value: Some(value),
            secondary: None,
        }
    }

    /// A dual-channel reading.
    pub fn pair(value: f64, secondary: f64) -> Self {
        Self {
            value: Some(value),
            secondary: Some(secondary),
        }
    }

    /// A point that produced no value.
    pub fn absent() -> Self {
        Self::default()
    }
}

/// One recorded point of an experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// Position in the run's recording order.
    pub index: usize,
    /// Sweep cycle the point belongs to (0 for timed logging).
    pub cycle: usize,
    /// Setpoint, frequency or elapsed time.
    pub x: f64,
    /// Measured value, absent on a per-point failure.
    pub y: Option<f64>,
    /// Second channel of dual reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y2: Option<f64>,
    /// What `y` holds.
    pub quantity: Quantity,
    /// UTC time the point was recorded.
    pub timestamp: DateTime<Utc>,
}
